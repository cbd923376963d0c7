// commands/mod.rs
use crate::{
    color::Hsbk,
    devices::{Light, RelayLevel},
    error::AppError,
    manager::{multizone_effect_packet, multizone_effect_stop_packet},
    models::AppState,
    transport::MoveDirection,
    utils::{ColorRanges, random_color_dataset},
};
use async_trait::async_trait;
use serde::{Deserialize, de::DeserializeOwned};
use std::{marker::PhantomData, sync::Arc, time::Duration};
use tracing::debug;
use utoipa::ToSchema;
use validator::{Validate, ValidationError};

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, state: Arc<AppState>, device_id: &str) -> Result<(), AppError>;
}

pub trait CommandFactory: Sync {
    fn name(&self) -> &'static str;
    fn create(&self, payload: &serde_json::Value) -> Result<Box<dyn CommandHandler>, AppError>;
}

inventory::collect!(&'static dyn CommandFactory);

/// Builds a handler by deserializing and validating the payload itself.
pub struct PayloadFactory<P> {
    name: &'static str,
    payload: PhantomData<fn() -> P>,
}

impl<P> PayloadFactory<P> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            payload: PhantomData,
        }
    }
}

impl<P> CommandFactory for PayloadFactory<P>
where
    P: DeserializeOwned + Validate + CommandHandler + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn create(&self, payload: &serde_json::Value) -> Result<Box<dyn CommandHandler>, AppError> {
        let command: P = serde_json::from_value(payload.clone())?;
        command.validate()?;
        Ok(Box::new(command))
    }
}

pub fn find(name: &str) -> Option<&'static dyn CommandFactory> {
    inventory::iter::<&'static dyn CommandFactory>
        .into_iter()
        .copied()
        .find(|factory| factory.name() == name)
}

pub fn names() -> Vec<&'static str> {
    let mut names: Vec<_> = inventory::iter::<&'static dyn CommandFactory>
        .into_iter()
        .map(|factory| factory.name())
        .collect();
    names.sort_unstable();
    names
}

/// Validates, then runs the named command against one device.
pub async fn dispatch(
    state: Arc<AppState>,
    device_id: &str,
    name: &str,
    payload: &serde_json::Value,
) -> Result<(), AppError> {
    let factory = find(name).ok_or(AppError::UnsupportedCommand)?;
    let handler = factory.create(payload)?;
    debug!(device = %device_id, command = name, "Dispatching command");
    handler.execute(state, device_id).await
}

fn ready_device(state: &AppState, device_id: &str) -> Result<Arc<Light>, AppError> {
    let light = state.manager.device(device_id).ok_or(AppError::DeviceNotFound)?;
    if !light.is_ready() || !light.is_online() {
        return Err(AppError::NotReady);
    }
    Ok(light)
}

fn transition(duration_ms: Option<u64>) -> Option<Duration> {
    duration_ms.map(Duration::from_millis)
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct SetPower {
    pub on: bool,
    pub duration_ms: Option<u64>,
}

#[async_trait]
impl CommandHandler for SetPower {
    async fn execute(&self, state: Arc<AppState>, device_id: &str) -> Result<(), AppError> {
        ready_device(&state, device_id)?.set_on_off(self.on, transition(self.duration_ms));
        Ok(())
    }
}

static SET_POWER: PayloadFactory<SetPower> = PayloadFactory::new("set_power");

inventory::submit! {
    &SET_POWER as &'static dyn CommandFactory
}

/// Any mix of colour axes; each lands in the same debounce window. Dim,
/// saturation and temperature are normalized, temperature 0 being the
/// coldest end of the light's range.
#[derive(Debug, Deserialize, Validate, ToSchema)]
#[validate(schema(function = "check_axes"))]
pub struct SetColor {
    #[validate(range(min = 0.0, max = 1.0))]
    pub dim: Option<f64>,
    #[validate(range(min = 0.0, max = 360.0))]
    pub hue: Option<f64>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub saturation: Option<f64>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub temperature: Option<f64>,
    pub duration_ms: Option<u64>,
}

fn check_axes(color: &SetColor) -> Result<(), ValidationError> {
    if color.dim.is_none() && color.hue.is_none() && color.saturation.is_none() && color.temperature.is_none() {
        return Err(ValidationError::new("color_axes").with_message("no colour axis given".into()));
    }
    Ok(())
}

#[async_trait]
impl CommandHandler for SetColor {
    async fn execute(&self, state: Arc<AppState>, device_id: &str) -> Result<(), AppError> {
        let light = ready_device(&state, device_id)?;
        let duration = transition(self.duration_ms);
        if let Some(hue) = self.hue {
            light.set_light_color(hue, duration);
        }
        if let Some(saturation) = self.saturation {
            light.set_light_saturation(saturation, duration);
        }
        if let Some(temperature) = self.temperature {
            light.set_light_temperature(temperature, duration);
        }
        if let Some(dim) = self.dim {
            light.set_dim_level(dim, duration);
        }
        Ok(())
    }
}

static SET_COLOR: PayloadFactory<SetColor> = PayloadFactory::new("set_color");

inventory::submit! {
    &SET_COLOR as &'static dyn CommandFactory
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct SetColorHex {
    #[validate(length(min = 3, max = 7))]
    pub hex: String,
    pub duration_ms: Option<u64>,
}

#[async_trait]
impl CommandHandler for SetColorHex {
    async fn execute(&self, state: Arc<AppState>, device_id: &str) -> Result<(), AppError> {
        ready_device(&state, device_id)?.set_light_color_hex(&self.hex, transition(self.duration_ms))
    }
}

static SET_COLOR_HEX: PayloadFactory<SetColorHex> = PayloadFactory::new("set_color_hex");

inventory::submit! {
    &SET_COLOR_HEX as &'static dyn CommandFactory
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct SetColorMode {
    pub color: bool,
    pub duration_ms: Option<u64>,
}

#[async_trait]
impl CommandHandler for SetColorMode {
    async fn execute(&self, state: Arc<AppState>, device_id: &str) -> Result<(), AppError> {
        ready_device(&state, device_id)?.set_color_mode(self.color, transition(self.duration_ms));
        Ok(())
    }
}

static SET_COLOR_MODE: PayloadFactory<SetColorMode> = PayloadFactory::new("set_color_mode");

inventory::submit! {
    &SET_COLOR_MODE as &'static dyn CommandFactory
}

/// Either `on` for a plain switch or `level` in `[0, 1]`.
#[derive(Debug, Deserialize, Validate, ToSchema)]
#[validate(schema(function = "check_relay"))]
pub struct SetRelay {
    #[validate(range(max = 3))]
    pub index: u8,
    pub on: Option<bool>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub level: Option<f64>,
    pub duration_ms: Option<u64>,
}

fn check_relay(relay: &SetRelay) -> Result<(), ValidationError> {
    match (relay.on, relay.level) {
        (Some(_), None) | (None, Some(_)) => Ok(()),
        _ => Err(ValidationError::new("relay_level").with_message("exactly one of on or level is required".into())),
    }
}

#[async_trait]
impl CommandHandler for SetRelay {
    async fn execute(&self, state: Arc<AppState>, device_id: &str) -> Result<(), AppError> {
        let light = ready_device(&state, device_id)?;
        if self.index >= light.relays_count() {
            return Err(AppError::UnsupportedCommand);
        }
        let level = match (self.on, self.level) {
            (_, Some(level)) => RelayLevel::Level(level),
            (on, None) => RelayLevel::Switch(on.unwrap_or_default()),
        };
        light.set_relay(self.index, level, transition(self.duration_ms));
        Ok(())
    }
}

static SET_RELAY: PayloadFactory<SetRelay> = PayloadFactory::new("set_relay");

inventory::submit! {
    &SET_RELAY as &'static dyn CommandFactory
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct SetInfrared {
    pub level: u8,
}

#[async_trait]
impl CommandHandler for SetInfrared {
    async fn execute(&self, state: Arc<AppState>, device_id: &str) -> Result<(), AppError> {
        ready_device(&state, device_id)?.set_infrared(self.level).await
    }
}

static SET_INFRARED: PayloadFactory<SetInfrared> = PayloadFactory::new("set_infrared");

inventory::submit! {
    &SET_INFRARED as &'static dyn CommandFactory
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct SetHev {
    pub enable: bool,
    /// Seconds; the device default applies when unset.
    #[validate(range(min = 1, max = 86400))]
    pub duration_secs: Option<u64>,
}

#[async_trait]
impl CommandHandler for SetHev {
    async fn execute(&self, state: Arc<AppState>, device_id: &str) -> Result<(), AppError> {
        ready_device(&state, device_id)?
            .set_hev_active(self.enable, self.duration_secs.map(Duration::from_secs))
            .await
    }
}

static SET_HEV: PayloadFactory<SetHev> = PayloadFactory::new("set_hev");

inventory::submit! {
    &SET_HEV as &'static dyn CommandFactory
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct SetName {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
}

#[async_trait]
impl CommandHandler for SetName {
    async fn execute(&self, state: Arc<AppState>, device_id: &str) -> Result<(), AppError> {
        ready_device(&state, device_id)?.set_name(&self.name).await
    }
}

static SET_NAME: PayloadFactory<SetName> = PayloadFactory::new("set_name");

inventory::submit! {
    &SET_NAME as &'static dyn CommandFactory
}

/// Paints zones `start..=end` of a multizone light directly.
#[derive(Debug, Deserialize, Validate, ToSchema)]
#[validate(schema(function = "check_zone_span"))]
pub struct SetZoneColor {
    pub start: u8,
    pub end: u8,
    #[validate(range(min = 0.0, max = 360.0))]
    pub hue: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub saturation: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub brightness: f64,
    #[validate(range(min = 1500, max = 9000))]
    pub kelvin: u16,
    pub duration_ms: Option<u64>,
    #[serde(default = "apply_now")]
    pub apply: bool,
}

fn apply_now() -> bool {
    true
}

fn check_zone_span(zone: &SetZoneColor) -> Result<(), ValidationError> {
    if zone.start > zone.end {
        return Err(ValidationError::new("zone_span").with_message("start must not exceed end".into()));
    }
    Ok(())
}

#[async_trait]
impl CommandHandler for SetZoneColor {
    async fn execute(&self, state: Arc<AppState>, device_id: &str) -> Result<(), AppError> {
        let light = ready_device(&state, device_id)?;
        if !light.capabilities().multizone {
            return Err(AppError::UnsupportedCommand);
        }
        let color = Hsbk {
            hue: self.hue,
            saturation: self.saturation,
            brightness: self.brightness,
            kelvin: self.kelvin,
        };
        let duration = transition(self.duration_ms).unwrap_or_else(|| light.default_transition());
        state
            .manager
            .set_zone_color(&light, self.start, self.end, color, duration, self.apply)
            .await;
        Ok(())
    }
}

static SET_ZONE_COLOR: PayloadFactory<SetZoneColor> = PayloadFactory::new("set_zone_color");

inventory::submit! {
    &SET_ZONE_COLOR as &'static dyn CommandFactory
}

/// Starts the firmware move effect, or stops it when `direction` is unset.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct SetZoneEffect {
    pub direction: Option<MoveDirection>,
    #[serde(default = "default_speed")]
    #[validate(range(min = 1))]
    pub speed_ms: u64,
}

fn default_speed() -> u64 {
    1000
}

#[async_trait]
impl CommandHandler for SetZoneEffect {
    async fn execute(&self, state: Arc<AppState>, device_id: &str) -> Result<(), AppError> {
        let light = ready_device(&state, device_id)?;
        if !light.capabilities().multizone {
            return Err(AppError::UnsupportedCommand);
        }
        let packet = match self.direction {
            Some(direction) => multizone_effect_packet(direction, Duration::from_millis(self.speed_ms)),
            None => multizone_effect_stop_packet(),
        };
        state.manager.send_command(&light, packet).await;
        Ok(())
    }
}

static SET_ZONE_EFFECT: PayloadFactory<SetZoneEffect> = PayloadFactory::new("set_zone_effect");

inventory::submit! {
    &SET_ZONE_EFFECT as &'static dyn CommandFactory
}

/// Picks a colour inside the given bounds. Hue in degrees, saturation and
/// dim in percent.
#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
#[serde(default)]
pub struct SetRandomColor {
    #[validate(range(min = 0.0, max = 360.0))]
    pub hue_min: Option<f64>,
    #[validate(range(min = 0.0, max = 360.0))]
    pub hue_max: Option<f64>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub saturation_min: Option<f64>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub saturation_max: Option<f64>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub dim_min: Option<f64>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub dim_max: Option<f64>,
    pub duration_min_ms: Option<u64>,
    pub duration_max_ms: Option<u64>,
}

#[async_trait]
impl CommandHandler for SetRandomColor {
    async fn execute(&self, state: Arc<AppState>, device_id: &str) -> Result<(), AppError> {
        let light = ready_device(&state, device_id)?;
        let ranges = ColorRanges {
            hue_min: self.hue_min,
            hue_max: self.hue_max,
            saturation_min: self.saturation_min,
            saturation_max: self.saturation_max,
            dim_min: self.dim_min,
            dim_max: self.dim_max,
            duration_min: transition(self.duration_min_ms),
            duration_max: transition(self.duration_max_ms),
        };
        let pick = random_color_dataset(&ranges, light.default_transition());
        debug!(device = %device_id, ?pick, "Random colour");
        light.set_light_color(pick.hue, Some(pick.duration));
        light.set_light_saturation(pick.saturation / 100.0, Some(pick.duration));
        light.set_dim_level(pick.dim / 100.0, Some(pick.duration));
        Ok(())
    }
}

static SET_RANDOM_COLOR: PayloadFactory<SetRandomColor> = PayloadFactory::new("set_random_color");

inventory::submit! {
    &SET_RANDOM_COLOR as &'static dyn CommandFactory
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_write_command_is_registered() {
        assert_eq!(
            names(),
            vec![
                "set_color",
                "set_color_hex",
                "set_color_mode",
                "set_hev",
                "set_infrared",
                "set_name",
                "set_power",
                "set_random_color",
                "set_relay",
                "set_zone_color",
                "set_zone_effect",
            ]
        );
    }

    #[test]
    fn payloads_are_validated_on_create() {
        let color = find("set_color").unwrap();
        assert!(color.create(&json!({ "dim": 0.4 })).is_ok());
        assert!(color.create(&json!({ "hue": 200.0, "saturation": 0.5, "duration_ms": 100 })).is_ok());
        assert!(matches!(color.create(&json!({ "dim": 1.5 })), Err(AppError::Validation(_))));
        assert!(matches!(color.create(&json!({ "lvl": 0.4 })), Err(AppError::Validation(_))));

        let relay = find("set_relay").unwrap();
        assert!(relay.create(&json!({ "index": 1, "on": true })).is_ok());
        assert!(relay.create(&json!({ "index": 1 })).is_err());
        assert!(relay.create(&json!({ "index": 1, "on": true, "level": 0.5 })).is_err());
        assert!(relay.create(&json!({ "index": 7, "on": true })).is_err());

        assert!(find("set_name").unwrap().create(&json!({ "name": "" })).is_err());
        let zones = find("set_zone_color").unwrap();
        let paint = json!({ "start": 4, "end": 2, "hue": 10.0, "saturation": 100.0, "brightness": 50.0, "kelvin": 3500 });
        assert!(zones.create(&paint).is_err());
        assert!(find("set_random_color").unwrap().create(&json!({})).is_ok());
        assert!(find("self_destruct").is_none());
    }
}
