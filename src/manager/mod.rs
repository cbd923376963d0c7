// manager/mod.rs
//! Device registry and the shared controller context every light consults.

mod error_rate;

pub use error_rate::{ERROR_WINDOW, ErrorOp, ErrorRates};

use dashmap::DashMap;
use serde::Serialize;
use std::{
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    catalog::{ProductCatalog, TemperatureRange},
    color::{Hsbk, HwColor},
    config::{ControllerSettings, KelvinMode, OperationMode},
    devices::{Light, status::Policy},
    error::AppError,
    events::EventBus,
    transport::{MoveDirection, Packet, Transport, TransportEvent, Waveform},
    utils::{random_number, scale_to_u16},
};

/// Policy, error counters and collaborators shared by every light.
pub struct ControllerContext {
    settings: RwLock<ControllerSettings>,
    errors: ErrorRates,
    transport: Arc<dyn Transport>,
    catalog: Arc<dyn ProductCatalog>,
}

impl ControllerContext {
    pub fn new(
        settings: ControllerSettings,
        transport: Arc<dyn Transport>,
        catalog: Arc<dyn ProductCatalog>,
    ) -> Self {
        Self {
            settings: RwLock::new(settings),
            errors: ErrorRates::new(),
            transport,
            catalog,
        }
    }

    pub fn settings(&self) -> ControllerSettings {
        self.settings.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut ControllerSettings)) {
        f(&mut self.settings.write().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn policy(&self) -> Policy {
        let settings = self.settings();
        Policy {
            operation_mode: settings.operation_mode,
            kelvin_mode: settings.kelvin_mode,
            default_transition: settings.default_transition(),
        }
    }

    pub fn debounce_window(&self) -> Duration {
        self.settings().debounce_window()
    }

    pub fn default_transition(&self) -> Duration {
        self.settings().default_transition()
    }

    pub fn catalog(&self) -> Arc<dyn ProductCatalog> {
        Arc::clone(&self.catalog)
    }

    pub fn errors(&self) -> &ErrorRates {
        &self.errors
    }

    pub fn record_error(&self, op: ErrorOp) {
        self.errors.record(op);
    }

    /// Fire-and-forget dispatch. Failures are resent while the light stays
    /// online, up to `command_retries` times.
    pub async fn send_command(&self, light: &Light, packet: Packet) {
        let settings = self.settings();
        let delay = Duration::from_millis(settings.command_retry_delay_ms);
        let mut attempt: u32 = 0;
        loop {
            match self.transport.send(light.id(), packet.clone()).await {
                Ok(()) => return,
                Err(err) => {
                    error!(device = %light.id(), ?packet, %err, "sending command packet failed");
                    if !light.is_online() {
                        return;
                    }
                    if attempt >= settings.command_retries {
                        warn!(device = %light.id(), attempts = attempt + 1, "giving up on command packet");
                        return;
                    }
                    attempt += 1;
                    warn!(device = %light.id(), attempt, "retrying command packet");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Registry-level lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "device_id", rename_all = "snake_case")]
pub enum ManagerEvent {
    Discovered(String),
    Online(String),
    Offline(String),
}

pub struct Manager {
    context: Arc<ControllerContext>,
    devices: DashMap<String, Arc<Light>>,
    order: Mutex<Vec<String>>,
    events: EventBus<ManagerEvent>,
    discovery: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(
        settings: ControllerSettings,
        transport: Arc<dyn Transport>,
        catalog: Arc<dyn ProductCatalog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            context: Arc::new(ControllerContext::new(settings, transport, catalog)),
            devices: DashMap::new(),
            order: Mutex::new(Vec::new()),
            events: EventBus::new(),
            discovery: Mutex::new(None),
        })
    }

    pub fn context(&self) -> &Arc<ControllerContext> {
        &self.context
    }

    /// Starts listening for lights. Calling it again restarts the listener.
    pub async fn discover(self: &Arc<Self>) -> Result<(), AppError> {
        let mut receiver = self.context.transport.start_discovery().await?;
        info!("Discovery started");
        let manager = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let Some(manager) = manager.upgrade() else { break };
                manager.handle_transport_event(event);
            }
        });
        if let Some(previous) = self.discovery.lock().unwrap_or_else(PoisonError::into_inner).replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Discovered(link) => {
                let id = link.id().to_string();
                if self.devices.contains_key(&id) {
                    return;
                }
                info!(device = %id, address = %link.address(), "Discovered");
                let light = Arc::new(Light::new(link, Arc::clone(&self.context)));
                light.start_polling(self.poll_period());
                self.devices.insert(id.clone(), light);
                self.order.lock().unwrap_or_else(PoisonError::into_inner).push(id.clone());
                ::metrics::gauge!("lanlight_devices").set(self.devices.len() as f64);
                self.events.publish(ManagerEvent::Discovered(id));
            }
            TransportEvent::Online(id) => {
                if let Some(light) = self.device(&id) {
                    light.set_online(true);
                    self.events.publish(ManagerEvent::Online(id));
                }
            }
            TransportEvent::Offline(id) => {
                if let Some(light) = self.device(&id) {
                    light.set_online(false);
                    self.events.publish(ManagerEvent::Offline(id));
                }
            }
        }
    }

    /// Polling interval plus up to one second of jitter per known light.
    fn poll_period(&self) -> Duration {
        let base = self.context.settings().polling_interval();
        let spread = self.devices.len() as f64 * 1000.0;
        base + Duration::from_millis(random_number(0.0, spread, false) as u64)
    }

    pub fn device(&self, id: &str) -> Option<Arc<Light>> {
        self.devices.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Every light in discovery order.
    pub fn devices(&self) -> Vec<Arc<Light>> {
        self.order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|id| self.device(id))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub fn record_error(&self, op: ErrorOp) {
        self.context.record_error(op);
    }

    pub fn error_rate(&self, op: ErrorOp) -> usize {
        self.context.errors().rate(op)
    }

    pub fn error_rates(&self) -> Vec<(ErrorOp, usize)> {
        self.context.errors().snapshot()
    }

    pub fn settings(&self) -> ControllerSettings {
        self.context.settings()
    }

    pub fn set_operation_mode(&self, mode: OperationMode) {
        self.context.update_settings(|s| s.operation_mode = mode);
    }

    pub fn set_kelvin_mode(&self, mode: KelvinMode) {
        self.context.update_settings(|s| s.kelvin_mode = mode);
    }

    pub fn set_debounce_window(&self, window: Duration) {
        self.context.update_settings(|s| s.debounce_ms = window.as_millis() as u64);
    }

    pub fn set_default_transition(&self, duration: Duration) {
        self.context.update_settings(|s| s.default_transition_ms = duration.as_millis() as u64);
    }

    /// Only lights discovered afterwards pick up the new interval.
    pub fn set_polling_interval(&self, interval: Duration) {
        self.context.update_settings(|s| s.polling_interval_ms = interval.as_millis() as u64);
    }

    pub async fn send_command(&self, light: &Light, packet: Packet) {
        self.context.send_command(light, packet).await;
    }

    pub async fn set_zone_color(&self, light: &Light, start: u8, end: u8, color: Hsbk, duration: Duration, apply: bool) {
        light.set_zone_color(start, end, color, duration, apply).await;
    }
}

/// Wire colour from hue in degrees, saturation and brightness in percent and
/// a temperature normalized to the light's range.
pub fn hardware_color(hue: f64, saturation: f64, brightness: f64, temperature: f64, range: TemperatureRange) -> HwColor {
    HwColor {
        hue: scale_to_u16(0.0, 360.0, hue),
        saturation: scale_to_u16(0.0, 100.0, saturation),
        brightness: scale_to_u16(0.0, 100.0, brightness),
        kelvin: crate::devices::status::kelvin_for(range, temperature),
    }
}

pub fn waveform_packet(
    color: HwColor,
    period: Duration,
    cycles: f32,
    waveform: Waveform,
    skew_ratio: f32,
    transient: bool,
) -> Packet {
    Packet::SetWaveform {
        transient,
        color,
        period,
        cycles,
        skew_ratio,
        waveform,
    }
}

pub fn multizone_effect_packet(direction: MoveDirection, speed: Duration) -> Packet {
    Packet::SetMultiZoneEffect {
        moving: Some(direction),
        speed,
    }
}

pub fn multizone_effect_stop_packet() -> Packet {
    Packet::SetMultiZoneEffect {
        moving: None,
        speed: Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_color_uses_the_light_range() {
        let range = TemperatureRange { min: 2500, max: 9000 };
        let color = hardware_color(180.0, 100.0, 50.0, 0.0, range);
        assert_eq!(color.hue, 32768);
        assert_eq!(color.saturation, 65535);
        assert_eq!(color.brightness, 32768);
        assert_eq!(color.kelvin, 9000);
        assert_eq!(hardware_color(0.0, 0.0, 0.0, 1.0, range).kelvin, 2500);
    }

    #[test]
    fn stop_packet_has_no_motion() {
        assert_eq!(
            multizone_effect_stop_packet(),
            Packet::SetMultiZoneEffect {
                moving: None,
                speed: Duration::ZERO
            }
        );
    }
}
