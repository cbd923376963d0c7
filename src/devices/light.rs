// devices/light.rs
use serde::Serialize;
use std::{
    net::IpAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use super::{
    DeviceEvent,
    status::{
        self, FutureStatus, LightStatus, MAX_RELAYS, RELAY_FULL, ReadingContext, UpdatePlan, WriteGuards,
    },
};
use crate::{
    catalog::{Capabilities, EnergyUsage, SwitchLayout, TemperatureRange},
    color::Hsbk,
    error::AppError,
    events::EventBus,
    manager::{ControllerContext, ErrorOp},
    transport::{HevCycle, LightLink, Packet, TransportResult, Version},
    utils::{self, WIFI_SIGNAL_UNKNOWN, map_scale, scale_to_u16},
};

const WIFI_RESCAN_CYCLES: u8 = 5;

/// Self consumption of a pulled relay in watts.
const RELAY_CONSUMPTION: f64 = 0.3;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Target for a relay setter: a plain switch or a level in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RelayLevel {
    Switch(bool),
    Level(f64),
}

impl RelayLevel {
    fn raw(self) -> u16 {
        match self {
            RelayLevel::Switch(true) => RELAY_FULL,
            RelayLevel::Switch(false) => 0,
            RelayLevel::Level(level) => scale_to_u16(0.0, 1.0, level.clamp(0.0, 1.0)),
        }
    }
}

/// Germicidal (HEV) cycle state, in seconds.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HevStatus {
    pub toggle: bool,
    pub duration_default: u32,
    pub duration_current: u32,
    pub duration_remaining: u32,
    /// 0 success, 1 busy, 2..5 interrupted, 255 none.
    pub last_result: u8,
}

impl Default for HevStatus {
    fn default() -> Self {
        Self {
            toggle: false,
            duration_default: 0,
            duration_current: 0,
            duration_remaining: 0,
            last_result: 255,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WifiStatus {
    pub signal: f64,
    pub tx: u32,
    pub rx: u32,
    pub firmware: Option<Version>,
    #[serde(skip)]
    rescan_in: u8,
}

impl Default for WifiStatus {
    fn default() -> Self {
        Self {
            signal: WIFI_SIGNAL_UNKNOWN,
            tx: 0,
            rx: 0,
            firmware: None,
            rescan_in: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeviceSnapshot {
    pub id: String,
    pub address: String,
    pub name: Option<String>,
    pub online: bool,
    pub ready: bool,
    pub unsupported: bool,
    pub vendor_id: u32,
    pub product_id: u32,
    pub hardware_version: u32,
    pub firmware: Option<Version>,
    pub capabilities: Capabilities,
    pub on_off: bool,
    pub dim: f64,
    pub hue: f64,
    pub saturation: f64,
    pub temperature: f64,
    pub color_mode: bool,
    pub infrared: u8,
    pub zones_count: u8,
    pub relays: Vec<f64>,
    pub hev: HevStatus,
    pub wifi: WifiStatus,
    pub wifi_strength: u8,
    pub energy: Option<EnergyUsage>,
}

#[derive(Debug, Default)]
struct Identity {
    vendor_id: u32,
    product_id: u32,
    hardware_version: u32,
}

#[derive(Debug)]
struct LightState {
    status: LightStatus,
    future: FutureStatus,
    identity: Identity,
    capabilities: Capabilities,
    firmware: Option<Version>,
    wifi: WifiStatus,
    zones_count: u8,
    zones_known: bool,
    relays_count: u8,
    buttons_count: u8,
    energy: Option<EnergyUsage>,
    switch: Option<SwitchLayout>,
    hev: HevStatus,
    identity_complete: bool,
    light_data: bool,
    ready: bool,
    unsupported: bool,
    online: bool,
    in_flight_power: u32,
    in_flight_color: u32,
}

impl LightState {
    fn new() -> Self {
        Self {
            status: LightStatus::default(),
            future: FutureStatus::default(),
            identity: Identity::default(),
            capabilities: Capabilities {
                name: "?".to_string(),
                vendor_name: "?".to_string(),
                ..Default::default()
            },
            firmware: None,
            wifi: WifiStatus::default(),
            zones_count: 0,
            zones_known: false,
            relays_count: 0,
            buttons_count: 0,
            energy: None,
            switch: None,
            hev: HevStatus::default(),
            identity_complete: false,
            light_data: false,
            ready: false,
            unsupported: false,
            online: true,
            in_flight_power: 0,
            in_flight_color: 0,
        }
    }

    fn temperature_range(&self) -> TemperatureRange {
        self.capabilities.temperature_range.unwrap_or_default()
    }

    fn on_off(&self) -> bool {
        self.future.on_off.unwrap_or(self.status.on_off)
    }

    fn saturation(&self) -> f64 {
        self.future.saturation.unwrap_or(self.status.saturation)
    }

    fn overall_relays(&self) -> bool {
        self.status.relays[..self.relays_count as usize].iter().any(|&level| level > 0)
    }

    fn mark_light_data(&mut self) -> Option<DeviceEvent> {
        self.light_data = true;
        if !self.ready && self.identity_complete {
            self.ready = true;
            return Some(DeviceEvent::Ready);
        }
        None
    }
}

#[derive(Default)]
struct DebounceSlot {
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// One discovered hardware unit: confirmed and pending state, its poll loop
/// and its debounced write pipeline.
pub struct Light {
    id: String,
    address: IpAddr,
    link: Arc<dyn LightLink>,
    context: Arc<ControllerContext>,
    state: Mutex<LightState>,
    debounce: Mutex<DebounceSlot>,
    polling: Mutex<Option<JoinHandle<()>>>,
    events: EventBus<DeviceEvent>,
}

impl Light {
    pub fn new(link: Arc<dyn LightLink>, context: Arc<ControllerContext>) -> Self {
        info!(device = %link.id(), address = %link.address(), "Initializing light");
        Self {
            id: link.id().to_string(),
            address: link.address(),
            link,
            context,
            state: Mutex::new(LightState::new()),
            debounce: Mutex::new(DebounceSlot::default()),
            polling: Mutex::new(None),
            events: EventBus::new(),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LightState) -> R) -> R {
        f(&mut lock(&self.state))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub fn name(&self) -> Option<String> {
        self.with_state(|s| s.status.name.clone())
    }

    pub fn is_online(&self) -> bool {
        self.with_state(|s| s.online)
    }

    pub fn is_ready(&self) -> bool {
        self.with_state(|s| s.ready)
    }

    pub fn is_unsupported(&self) -> bool {
        self.with_state(|s| s.unsupported)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.with_state(|s| s.capabilities.clone())
    }

    pub fn supports_color(&self) -> bool {
        self.with_state(|s| s.capabilities.color)
    }

    pub fn supports_temperature(&self) -> bool {
        self.with_state(|s| s.capabilities.temperature_range.is_some())
    }

    pub fn temperature_range(&self) -> TemperatureRange {
        self.with_state(|s| s.temperature_range())
    }

    pub fn zones_count(&self) -> u8 {
        self.with_state(|s| s.zones_count)
    }

    pub fn firmware(&self) -> Option<Version> {
        self.with_state(|s| s.firmware)
    }

    pub fn energy(&self) -> Option<EnergyUsage> {
        self.with_state(|s| s.energy)
    }

    pub fn hev(&self) -> HevStatus {
        self.with_state(|s| s.hev.clone())
    }

    pub fn wifi(&self) -> WifiStatus {
        self.with_state(|s| s.wifi.clone())
    }

    pub fn wifi_strength(&self) -> u8 {
        utils::wifi_strength(self.with_state(|s| s.wifi.signal))
    }

    pub fn on_off(&self) -> bool {
        self.with_state(|s| s.on_off())
    }

    pub fn dim_level(&self) -> f64 {
        self.with_state(|s| s.future.dim.unwrap_or(s.status.dim))
    }

    pub fn hue(&self) -> f64 {
        self.with_state(|s| s.future.hue.unwrap_or(s.status.hue))
    }

    pub fn saturation(&self) -> f64 {
        self.with_state(|s| s.saturation())
    }

    pub fn temperature(&self) -> f64 {
        self.with_state(|s| s.future.temperature.unwrap_or(s.status.temperature))
    }

    pub fn infrared(&self) -> u8 {
        self.with_state(|s| s.status.infrared)
    }

    pub fn color_mode(&self) -> bool {
        self.with_state(|s| s.capabilities.color && s.status.saturation > 0.0)
    }

    pub fn relays_count(&self) -> u8 {
        self.with_state(|s| s.relays_count)
    }

    pub fn buttons_count(&self) -> u8 {
        self.with_state(|s| s.buttons_count)
    }

    /// Relay level in `[0, 1]`.
    pub fn relay_level(&self, index: usize) -> f64 {
        self.with_state(|s| {
            let raw = s.future.relays.get(index).copied().flatten();
            let raw = raw.or_else(|| s.status.relays.get(index).copied()).unwrap_or(0);
            map_scale(0.0, RELAY_FULL as f64, 0.0, 1.0, raw as f64)
        })
    }

    pub fn pulled_relays(&self) -> usize {
        self.with_state(|s| s.status.relays[..s.relays_count as usize].iter().filter(|&&level| level > 0).count())
    }

    pub fn relay_power_consumption(&self, index: usize) -> f64 {
        let pulled = self.with_state(|s| s.status.relays.get(index).is_some_and(|&level| level > 0));
        if pulled { RELAY_CONSUMPTION } else { 0.0 }
    }

    /// Watts drawn by a switch: its own consumption for the number of pulled
    /// relays plus what each relay adds.
    pub fn switch_energy_overall(&self) -> f64 {
        let pulled = self.pulled_relays();
        let base = self.with_state(|s| {
            s.switch
                .as_ref()
                .and_then(|layout| layout.levels.get(pulled).or(layout.levels.first()).copied())
                .unwrap_or(0.0)
        });
        base + (0..MAX_RELAYS).map(|idx| self.relay_power_consumption(idx)).sum::<f64>()
    }

    pub fn pending(&self) -> FutureStatus {
        self.with_state(|s| s.future.clone())
    }

    pub fn confirmed(&self) -> LightStatus {
        self.with_state(|s| s.status.clone())
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let wifi_strength = self.wifi_strength();
        self.with_state(|s| DeviceSnapshot {
            id: self.id.clone(),
            address: self.address.to_string(),
            name: s.status.name.clone(),
            online: s.online,
            ready: s.ready,
            unsupported: s.unsupported,
            vendor_id: s.identity.vendor_id,
            product_id: s.identity.product_id,
            hardware_version: s.identity.hardware_version,
            firmware: s.firmware,
            capabilities: s.capabilities.clone(),
            on_off: s.on_off(),
            dim: s.future.dim.unwrap_or(s.status.dim),
            hue: s.future.hue.unwrap_or(s.status.hue),
            saturation: s.saturation(),
            temperature: s.future.temperature.unwrap_or(s.status.temperature),
            color_mode: s.capabilities.color && s.status.saturation > 0.0,
            infrared: s.status.infrared,
            zones_count: s.zones_count,
            relays: s.status.relays[..s.relays_count as usize]
                .iter()
                .map(|&raw| map_scale(0.0, RELAY_FULL as f64, 0.0, 1.0, raw as f64))
                .collect(),
            hev: s.hev.clone(),
            wifi: s.wifi.clone(),
            wifi_strength,
            energy: s.energy,
        })
    }

    pub fn set_online(&self, online: bool) {
        self.with_state(|s| {
            s.online = online;
            if online {
                s.zones_known = false;
            }
        });
        if online {
            info!(device = %self.id, "Device came back online");
            self.events.publish(DeviceEvent::Online);
        } else {
            warn!(device = %self.id, "Device went offline");
            self.events.publish(DeviceEvent::Offline);
        }
    }

    // Debounced setters

    pub fn set_on_off(self: &Arc<Self>, on: bool, duration: Option<Duration>) {
        if self.with_state(|s| s.capabilities.relays) {
            self.set_all_relays(RelayLevel::Switch(on), duration);
            return;
        }
        self.stage(duration, |s| s.future.on_off = Some(on));
    }

    pub fn set_dim_level(self: &Arc<Self>, dim: f64, duration: Option<Duration>) {
        self.stage(duration, |s| s.future.dim = Some(dim.clamp(0.0, 1.0)));
    }

    /// Hue in degrees.
    pub fn set_light_color(self: &Arc<Self>, hue: f64, duration: Option<Duration>) {
        self.stage(duration, |s| s.future.hue = Some(hue.rem_euclid(360.0)));
    }

    pub fn set_light_saturation(self: &Arc<Self>, saturation: f64, duration: Option<Duration>) {
        let saturation = saturation.clamp(0.0, 1.0);
        self.stage(duration, |s| {
            s.future.saturation = Some(saturation);
            if saturation > 0.0 {
                s.status.saturation_cached = saturation;
            }
        });
    }

    pub fn set_light_temperature(self: &Arc<Self>, temperature: f64, duration: Option<Duration>) {
        let temperature = temperature.clamp(0.0, 1.0);
        self.stage(duration, |s| {
            s.future.temperature = Some(temperature);
            if s.status.saturation == 0.0 {
                s.status.temperature_cached = temperature;
            }
        });
    }

    pub fn set_light_color_hex(self: &Arc<Self>, hex: &str, duration: Option<Duration>) -> Result<(), AppError> {
        let color = Hsbk::from_hex(hex)?;
        self.set_light_color(color.hue, duration);
        self.set_light_saturation(color.saturation / 100.0, duration);
        self.set_dim_level(color.brightness / 100.0, duration);
        Ok(())
    }

    /// Switches between colour and white mode, restoring the cached
    /// saturation or temperature of the mode being entered.
    pub fn set_color_mode(self: &Arc<Self>, color: bool, duration: Option<Duration>) {
        let (supports_color, saturation, saturation_cached, temperature_cached) = self.with_state(|s| {
            (
                s.capabilities.color,
                s.saturation(),
                s.status.saturation_cached,
                s.status.temperature_cached,
            )
        });
        if !supports_color {
            return;
        }
        if color {
            if saturation == 0.0 {
                self.set_light_saturation(saturation_cached, duration);
            }
        } else {
            if saturation > 0.0 {
                self.set_light_saturation(0.0, duration);
            }
            self.set_light_temperature(temperature_cached, duration);
        }
    }

    pub fn set_relay(self: &Arc<Self>, index: u8, level: RelayLevel, duration: Option<Duration>) {
        if index >= self.relays_count() {
            debug!(device = %self.id, index, "ignoring relay the device does not have");
            return;
        }
        self.stage(duration, |s| s.future.relays[index as usize] = Some(level.raw()));
    }

    pub fn set_all_relays(self: &Arc<Self>, level: RelayLevel, duration: Option<Duration>) {
        let raw = level.raw();
        self.stage(duration, |s| {
            for slot in s.future.relays.iter_mut().take(s.relays_count as usize) {
                *slot = Some(raw);
            }
        });
    }

    fn stage(self: &Arc<Self>, duration: Option<Duration>, apply: impl FnOnce(&mut LightState)) {
        let accepted = self.with_state(|s| {
            if !s.ready || !s.online {
                s.future.clear();
                return false;
            }
            apply(s);
            s.future.record_duration(duration);
            true
        });
        if accepted {
            self.schedule_update();
        } else {
            warn!(device = %self.id, "Update command for non ready device, ignoring");
        }
    }

    /// Restarts the debounce window; the previous timer, if any, is dropped.
    fn schedule_update(self: &Arc<Self>) {
        let window = self.context.debounce_window();
        let weak = Arc::downgrade(self);
        let mut slot = lock(&self.debounce);
        slot.generation += 1;
        let generation = slot.generation;
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let Some(light) = weak.upgrade() else { return };
            {
                let mut slot = lock(&light.debounce);
                if slot.generation != generation {
                    return;
                }
                slot.timer = None;
            }
            light.execute_update().await;
        }));
    }

    async fn execute_update(self: &Arc<Self>) {
        let policy = self.context.policy();
        let plan = self.with_state(|s| {
            if !s.future.has_data() {
                return None;
            }
            if !s.online {
                s.future.clear();
                return None;
            }
            let plan = status::plan_update(&s.status, &s.future, &policy, s.temperature_range());
            s.future.clear();
            if plan.color.is_some() {
                s.in_flight_color += 1;
            }
            if plan.power.is_some() || !plan.relays.is_empty() {
                s.in_flight_power += 1;
            }
            Some(plan)
        });
        let Some(plan) = plan.filter(|plan| !plan.is_empty()) else {
            return;
        };

        let duration = plan.duration;
        let color_write = async {
            match plan.color {
                Some(command) => {
                    debug!(device = %self.id, ?command, ?duration, "color");
                    Some(self.link.color(command.hsbk(), duration).await)
                }
                None => None,
            }
        };
        let power_write = async {
            let power = match plan.power {
                Some(true) => Some(self.link.on(duration).await),
                Some(false) => Some(self.link.off(duration).await),
                None => None,
            };
            let mut relays = Vec::with_capacity(plan.relays.len());
            for &(index, level) in &plan.relays {
                relays.push((index, level, self.link.set_relay_power(index, level).await));
            }
            (power, relays)
        };
        let (color_result, (power_result, relay_results)) = tokio::join!(color_write, power_write);

        let (events, retry) = self.settle_update(&plan, color_result, power_result, relay_results);
        self.events.publish_all(events);
        if retry {
            self.schedule_update();
        }
    }

    fn settle_update(
        &self,
        plan: &UpdatePlan,
        color_result: Option<TransportResult<()>>,
        power_result: Option<TransportResult<()>>,
        relay_results: Vec<(u8, u16, TransportResult<()>)>,
    ) -> (Vec<DeviceEvent>, bool) {
        let backup = &plan.backup;
        let mut failed = FutureStatus::default();
        let mut events = Vec::new();
        let mut retry = false;

        let mut state = lock(&self.state);
        let s = &mut *state;

        if let (Some(command), Some(result)) = (plan.color, color_result) {
            s.in_flight_color = s.in_flight_color.saturating_sub(1);
            match result {
                Ok(()) => events.extend(status::apply_color(&mut s.status, &command, plan.touched)),
                Err(err) => {
                    error!(device = %self.id, %err, "color: updating device failed");
                    self.context.record_error(ErrorOp::Color);
                    failed.dim = backup.dim;
                    failed.hue = backup.hue;
                    failed.saturation = backup.saturation;
                    failed.temperature = backup.temperature;
                    retry = true;
                }
            }
        }

        if plan.power.is_some() || !plan.relays.is_empty() {
            s.in_flight_power = s.in_flight_power.saturating_sub(1);
        }
        if let (Some(on), Some(result)) = (plan.power, power_result) {
            match result {
                Ok(()) => events.extend(status::apply_power(&mut s.status, on)),
                Err(err) => {
                    error!(device = %self.id, %err, on, "onoff: updating device failed");
                    self.context.record_error(ErrorOp::OnOff);
                    failed.on_off = backup.on_off;
                    retry = true;
                }
            }
        }

        if !relay_results.is_empty() {
            let overall_before = s.overall_relays();
            for (index, level, result) in relay_results {
                match result {
                    Ok(()) => {
                        s.status.relays[index as usize] = level;
                        events.push(DeviceEvent::RelayLevel {
                            index,
                            level: map_scale(0.0, RELAY_FULL as f64, 0.0, 1.0, level as f64),
                        });
                    }
                    Err(err) => {
                        error!(device = %self.id, %err, index, "setRelayPower: updating device failed");
                        // Relays are the power axis of a switch.
                        self.context.record_error(ErrorOp::OnOff);
                        failed.relays[index as usize] = Some(level);
                        retry = true;
                    }
                }
            }
            let overall = s.overall_relays();
            s.status.on_off = overall;
            if overall != overall_before {
                events.push(DeviceEvent::RelayOverall(overall));
            }
        }

        if retry {
            failed.duration = backup.duration;
            s.future.restore_from(&failed);
        }
        (events, retry)
    }

    // Polling

    /// Polls right away, then every `period`, until the device turns out to be
    /// unsupported or is dropped.
    pub fn start_polling(self: &Arc<Self>, period: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(light) = weak.upgrade() else { break };
                if light.is_unsupported() {
                    warn!(device = %light.id, "Disabling status polling for unsupported device");
                    break;
                }
                light.poll().await;
            }
        });
        if let Some(previous) = lock(&self.polling).replace(handle) {
            previous.abort();
        }
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.polling).as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// One poll cycle.
    pub async fn poll(&self) {
        if !self.is_online() {
            return;
        }
        self.poll_identity().await;
        if self.is_unsupported() {
            return;
        }
        self.poll_wifi().await;

        let (ready, caps, zones_known) =
            self.with_state(|s| (s.identity_complete, s.capabilities.clone(), s.zones_known));
        if !ready {
            return;
        }
        if caps.multizone && !zones_known {
            self.poll_zones().await;
        }
        if caps.hev {
            self.poll_hev().await;
        }
        if caps.infrared {
            self.poll_infrared().await;
        }
        if caps.relays {
            self.poll_relays().await;
        } else {
            self.poll_state().await;
        }
    }

    async fn poll_identity(&self) {
        if self.firmware().is_none() {
            match self.link.get_firmware_version().await {
                Ok(version) => {
                    info!(device = %self.id, major = version.major, minor = version.minor, "getFirmwareVersion");
                    self.with_state(|s| s.firmware = Some(version));
                    self.events.publish(DeviceEvent::FirmwareInfo(version));
                }
                Err(err) => error!(device = %self.id, %err, "getFirmwareVersion failed"),
            }
        }

        let needs_hardware = self.with_state(|s| s.firmware.is_some() && s.identity.vendor_id == 0);
        if needs_hardware {
            match self.link.get_hardware_version().await {
                Ok(hardware) => self.resolve_product(hardware.vendor_id, hardware.product_id, hardware.version),
                Err(err) => error!(device = %self.id, %err, "getHardwareVersion failed"),
            }
        }

        if self.name().is_none() {
            match self.link.get_label().await {
                Ok(label) => self.with_state(|s| s.status.name = Some(label)),
                Err(err) => error!(device = %self.id, %err, "getLabel failed"),
            }
        }

        let became_ready = self.with_state(|s| {
            let complete = !s.identity_complete
                && s.status.name.is_some()
                && s.identity.vendor_id > 0
                && !s.unsupported
                && s.firmware.is_some();
            if complete {
                s.identity_complete = true;
            }
            complete
        });
        if became_ready {
            let caps = self.capabilities();
            info!(device = %self.id, product = %caps.name, name = ?self.name(), "Device identified");
        }
    }

    fn resolve_product(&self, vendor_id: u32, product_id: u32, hardware_version: u32) {
        let firmware = self.firmware().unwrap_or_default();
        let catalog = self.context.catalog();
        let capabilities = catalog.lookup_capabilities(vendor_id, product_id, firmware.major, firmware.minor);
        let energy = catalog.lookup_energy(vendor_id, product_id);
        let switch = catalog.lookup_switch(vendor_id, product_id);

        let mut events = Vec::new();
        self.with_state(|s| {
            s.identity = Identity {
                vendor_id,
                product_id,
                hardware_version,
            };
            match capabilities {
                Some(caps) => {
                    if let Some(layout) = switch.as_ref() {
                        if caps.relays {
                            s.relays_count = layout.relays.min(MAX_RELAYS as u8);
                        }
                        if caps.buttons {
                            s.buttons_count = layout.buttons;
                        }
                    }
                    s.capabilities = caps;
                }
                None => {
                    s.unsupported = true;
                    events.push(DeviceEvent::Unsupported { vendor_id, product_id });
                }
            }
            s.switch = switch;
            s.energy = energy;
        });

        if self.is_unsupported() {
            warn!(device = %self.id, vendor_id, product_id, "Unsupported device");
        }
        match energy {
            Some(energy) => {
                debug!(device = %self.id, usage_on = energy.usage_on, usage_off = energy.usage_off, "Found energy data");
                events.push(DeviceEvent::EnergySettings(energy));
            }
            None => warn!(device = %self.id, vendor_id, product_id, "No energy data available"),
        }
        self.events.publish_all(events);
    }

    async fn poll_wifi(&self) {
        let rescan = self.with_state(|s| {
            s.wifi.rescan_in = s.wifi.rescan_in.saturating_sub(1);
            if s.wifi.rescan_in == 0 {
                s.wifi.rescan_in = WIFI_RESCAN_CYCLES;
                true
            } else {
                false
            }
        });
        if rescan {
            match self.link.get_wifi_info().await {
                Ok(info) => {
                    self.with_state(|s| {
                        s.wifi.signal = info.signal;
                        s.wifi.tx = info.tx;
                        s.wifi.rx = info.rx;
                    });
                    self.events.publish(DeviceEvent::WifiInfo {
                        signal: info.signal,
                        strength: utils::wifi_strength(info.signal),
                    });
                }
                Err(err) => {
                    self.context.record_error(ErrorOp::GetWifiInfo);
                    error!(device = %self.id, %err, "getWifiInfo failed");
                }
            }
        }

        if self.with_state(|s| s.wifi.firmware.is_none()) {
            match self.link.get_wifi_version().await {
                Ok(version) => {
                    self.with_state(|s| s.wifi.firmware = Some(version));
                    self.events.publish(DeviceEvent::WifiFirmwareInfo(version));
                }
                Err(err) => error!(device = %self.id, %err, "getWifiVersion failed"),
            }
        }
    }

    async fn poll_zones(&self) {
        match self.link.get_color_zones(0, 255).await {
            Ok(count) => {
                let changed = self.with_state(|s| {
                    s.zones_known = true;
                    let changed = s.zones_count != count;
                    s.zones_count = count;
                    changed
                });
                if changed {
                    self.events.publish(DeviceEvent::ZonesCount(count));
                }
            }
            Err(err) => {
                self.context.record_error(ErrorOp::GetColorZones);
                error!(device = %self.id, %err, "getColorZones failed");
            }
        }
    }

    async fn poll_hev(&self) {
        match self.link.get_hev_cycle().await {
            Ok(cycle) => {
                let events = self.with_state(|s| apply_hev_cycle(&mut s.hev, cycle));
                self.events.publish_all(events);
            }
            Err(err) => error!(device = %self.id, %err, "getHevCycle failed"),
        }
        self.refresh_hev_result().await;
        match self.link.get_hev_cycle_configuration().await {
            Ok(duration) => {
                self.with_state(|s| s.hev.duration_default = duration);
                self.events.publish(DeviceEvent::HevConfig(duration));
            }
            Err(err) => error!(device = %self.id, %err, "getHevCycleConfiguration failed"),
        }
    }

    async fn refresh_hev_result(&self) {
        match self.link.get_last_hev_cycle_result().await {
            Ok(result) => {
                self.with_state(|s| s.hev.last_result = result);
                self.events.publish(DeviceEvent::HevResult(result));
            }
            Err(err) => error!(device = %self.id, %err, "getLastHevCycleResult failed"),
        }
    }

    async fn poll_infrared(&self) {
        match self.link.get_max_ir().await {
            Ok(level) => {
                let changed = self.with_state(|s| std::mem::replace(&mut s.status.infrared, level) != level);
                if changed {
                    self.events.publish(DeviceEvent::Infrared(level));
                }
            }
            Err(err) => error!(device = %self.id, %err, "getMaxIR failed"),
        }
    }

    async fn poll_relays(&self) {
        let count = self.relays_count();
        let mut events = Vec::new();
        let mut any_read = false;
        for index in 0..count {
            match self.link.get_relay_power(index).await {
                Ok(level) => {
                    any_read = true;
                    self.with_state(|s| {
                        let idx = index as usize;
                        if s.in_flight_power > 0 || s.future.relays[idx].is_some() {
                            return;
                        }
                        let before = s.overall_relays();
                        if s.status.relays[idx] != level {
                            s.status.relays[idx] = level;
                            events.push(DeviceEvent::RelayLevel {
                                index,
                                level: map_scale(0.0, RELAY_FULL as f64, 0.0, 1.0, level as f64),
                            });
                        }
                        let overall = s.overall_relays();
                        s.status.on_off = overall;
                        if overall != before {
                            events.push(DeviceEvent::RelayOverall(overall));
                        }
                    });
                }
                Err(err) => {
                    self.context.record_error(ErrorOp::GetRelayPower);
                    error!(device = %self.id, %err, index, "getRelayPower failed");
                }
            }
        }
        if any_read {
            events.extend(self.with_state(|s| s.mark_light_data()));
        }
        self.events.publish_all(events);
    }

    async fn poll_state(&self) {
        match self.link.get_state().await {
            Ok(reading) => {
                let events = self.with_state(|s| {
                    let context = ReadingContext {
                        supports_color: s.capabilities.color,
                        temperature_range: s.capabilities.temperature_range,
                    };
                    let guards = WriteGuards {
                        power_in_flight: s.in_flight_power > 0,
                        color_in_flight: s.in_flight_color > 0,
                        pending: s.future.has_data(),
                    };
                    let mut events = status::reconcile(&mut s.status, &reading, context, guards);
                    events.extend(s.mark_light_data());
                    events
                });
                self.events.publish_all(events);
            }
            Err(err) => {
                self.context.record_error(ErrorOp::GetState);
                error!(device = %self.id, %err, "getState failed");
            }
        }
    }

    // Direct writes

    /// Renames the hardware; labels are cut to 32 bytes.
    pub async fn set_name(&self, name: &str) -> Result<(), AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("name must not be empty".to_string()));
        }
        let label = utils::truncate_label(name);
        if self.name().as_deref() == Some(label) {
            return Ok(());
        }
        info!(device = %self.id, from = ?self.name(), to = label, "Renaming device");
        self.link.set_label(label).await?;
        self.with_state(|s| s.status.name = Some(label.to_string()));
        self.events.publish(DeviceEvent::Name(label.to_string()));
        Ok(())
    }

    pub async fn set_infrared(&self, level: u8) -> Result<(), AppError> {
        if !self.with_state(|s| s.capabilities.infrared) || self.infrared() == level {
            return Ok(());
        }
        self.link.set_max_ir(level).await.inspect_err(|err| {
            error!(device = %self.id, %err, level, "maxIR failed");
        })?;
        self.with_state(|s| s.status.infrared = level);
        self.events.publish(DeviceEvent::Infrared(level));
        Ok(())
    }

    /// Starts or stops a germicidal cycle. `duration` falls back to the
    /// device's configured default.
    pub async fn set_hev_active(&self, enable: bool, duration: Option<Duration>) -> Result<(), AppError> {
        if !self.with_state(|s| s.capabilities.hev) {
            return Ok(());
        }
        let seconds = duration.map_or(0, |d| d.as_secs().min(u32::MAX as u64) as u32);
        let cycle = self.link.set_hev_cycle(enable, seconds).await.inspect_err(|err| {
            error!(device = %self.id, %err, "setHevCycle failed");
        })?;
        let events = self.with_state(|s| apply_hev_cycle(&mut s.hev, cycle));
        self.events.publish_all(events);
        self.refresh_hev_result().await;
        Ok(())
    }

    /// Paints zones `start..=end` of a multizone device.
    pub async fn set_zone_color(&self, start: u8, end: u8, color: Hsbk, duration: Duration, apply: bool) {
        debug!(device = %self.id, start, end, ?color, ?duration, apply, "colorZones");
        if let Err(err) = self.link.color_zones(start, end, color, duration, apply).await {
            self.context.record_error(ErrorOp::ColorZones);
            error!(device = %self.id, %err, "colorZones failed");
        }
    }

    /// Colour write that bypasses the debounce pipeline and leaves confirmed
    /// state untouched.
    pub async fn direct_color(&self, color: Hsbk, duration: Duration) {
        if let Err(err) = self.link.color(color, duration).await {
            self.context.record_error(ErrorOp::Color);
            error!(device = %self.id, %err, "color: direct write failed");
        }
    }

    /// Overwrites confirmed colour state without touching the hardware.
    /// Saturation, dim and temperature are normalized; unset axes are kept.
    pub fn update_core_data(
        &self,
        hue: Option<f64>,
        saturation: Option<f64>,
        dim: Option<f64>,
        temperature: Option<f64>,
    ) {
        let mut events = Vec::new();
        self.with_state(|s| {
            if let Some(dim) = dim.filter(|&v| v != s.status.dim) {
                s.status.dim = dim;
                events.push(DeviceEvent::Dim(dim));
            }
            if let Some(saturation) = saturation.filter(|&v| v != s.status.saturation) {
                s.status.saturation = saturation;
                events.push(DeviceEvent::Saturation(saturation));
            }
            if let Some(hue) = hue.filter(|&v| v != s.status.hue) {
                s.status.hue = hue;
                events.push(DeviceEvent::Hue(hue));
            }
            if let Some(temperature) = temperature.filter(|&v| v != s.status.temperature) {
                s.status.temperature = temperature;
                events.push(DeviceEvent::Temperature(temperature));
            }
        });
        self.events.publish_all(events);
    }

    pub fn default_transition(&self) -> Duration {
        self.context.default_transition()
    }

    pub async fn send_packet(&self, packet: Packet) {
        self.context.send_command(self, packet).await;
    }
}

fn apply_hev_cycle(hev: &mut HevStatus, cycle: HevCycle) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    hev.duration_current = cycle.duration;
    hev.duration_remaining = cycle.remaining;
    let running = cycle.remaining > 0;
    if running != hev.toggle {
        hev.toggle = running;
        events.push(DeviceEvent::HevCycle(running));
    }
    events.push(DeviceEvent::HevCycleStatus {
        duration: cycle.duration,
        remaining: cycle.remaining,
    });
    events
}
