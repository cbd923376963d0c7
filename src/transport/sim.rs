// transport/sim.rs
//! In-memory LAN of virtual lights.
//!
//! Backs the integration tests and the server's simulated mode. Every write a
//! light receives is appended to its call log, and any operation can be made
//! to fail a given number of times.

use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    HardwareInfo, HevCycle, LightLink, LightReading, Packet, Transport, TransportEvent,
    TransportResult, Version, WifiInfo,
};
use crate::{color::Hsbk, config::SimulatedLightSettings, error::TransportError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    GetState,
    Color,
    Power,
    Label,
    HardwareVersion,
    FirmwareVersion,
    WifiInfo,
    RelayPower,
    ColorZones,
    Send,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SimCall {
    Color(Hsbk, Duration),
    On(Duration),
    Off(Duration),
    SetLabel(String),
    SetMaxIr(u8),
    ColorZones { start: u8, end: u8, color: Hsbk },
    SetHevCycle(bool, u32),
    SetRelayPower(u8, u16),
    Packet(Packet),
}

#[derive(Debug, Clone)]
struct SimState {
    label: String,
    power: bool,
    color: Hsbk,
    infrared: u8,
    firmware: Version,
    wifi_firmware: Version,
    hardware: HardwareInfo,
    wifi: WifiInfo,
    zones: u8,
    hev: HevCycle,
    hev_default: u32,
    hev_result: u8,
    relays: [u16; 4],
}

pub struct SimLight {
    id: String,
    address: IpAddr,
    state: Mutex<SimState>,
    failures: Mutex<HashMap<SimOp, u32>>,
    calls: Mutex<Vec<SimCall>>,
    latency: Duration,
}

impl SimLight {
    pub fn new(id: impl Into<String>, address: IpAddr) -> Self {
        Self {
            id: id.into(),
            address,
            state: Mutex::new(SimState {
                label: "Light".to_string(),
                power: false,
                color: Hsbk {
                    hue: 0.0,
                    saturation: 0.0,
                    brightness: 100.0,
                    kelvin: 3500,
                },
                infrared: 0,
                firmware: Version { major: 3, minor: 70 },
                wifi_firmware: Version { major: 1, minor: 2 },
                hardware: HardwareInfo {
                    vendor_id: 1,
                    product_id: 22,
                    version: 0,
                },
                wifi: WifiInfo {
                    signal: 10f64.powf(-6.5),
                    tx: 0,
                    rx: 0,
                },
                zones: 0,
                hev: HevCycle::default(),
                hev_default: 7200,
                hev_result: 255,
                relays: [0; 4],
            }),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            latency: Duration::from_millis(5),
        }
    }

    pub fn from_settings(settings: &SimulatedLightSettings) -> Result<Self, std::net::AddrParseError> {
        Ok(Self::new(settings.id.clone(), settings.address.parse()?)
            .with_label(&settings.label)
            .with_product(settings.vendor_id, settings.product_id))
    }

    pub fn with_label(self, label: &str) -> Self {
        lock(&self.state).label = label.to_string();
        self
    }

    pub fn with_product(self, vendor_id: u32, product_id: u32) -> Self {
        {
            let mut state = lock(&self.state);
            state.hardware.vendor_id = vendor_id;
            state.hardware.product_id = product_id;
        }
        self
    }

    pub fn with_firmware(self, major: u16, minor: u16) -> Self {
        lock(&self.state).firmware = Version { major, minor };
        self
    }

    pub fn with_zones(self, zones: u8) -> Self {
        lock(&self.state).zones = zones;
        self
    }

    pub fn with_color(self, color: Hsbk, power: bool) -> Self {
        {
            let mut state = lock(&self.state);
            state.color = color;
            state.power = power;
        }
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// The next `times` calls of `op` fail with a timeout.
    pub fn fail_next(&self, op: SimOp, times: u32) {
        *lock(&self.failures).entry(op).or_default() += times;
    }

    pub fn calls(&self) -> Vec<SimCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn power(&self) -> bool {
        lock(&self.state).power
    }

    pub fn color(&self) -> Hsbk {
        lock(&self.state).color
    }

    pub fn relay(&self, index: usize) -> u16 {
        lock(&self.state).relays[index]
    }

    /// Changes the hardware state as if someone used another controller.
    pub fn set_external(&self, color: Hsbk, power: bool) {
        let mut state = lock(&self.state);
        state.color = color;
        state.power = power;
    }

    fn record(&self, call: SimCall) {
        lock(&self.calls).push(call);
    }

    async fn simulate(&self, op: SimOp) -> TransportResult<()> {
        tokio::time::sleep(self.latency).await;
        let mut failures = lock(&self.failures);
        match failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                debug!(device = %self.id, ?op, "simulated failure");
                Err(TransportError::Timeout)
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl LightLink for SimLight {
    fn id(&self) -> &str {
        &self.id
    }

    fn address(&self) -> IpAddr {
        self.address
    }

    async fn get_state(&self) -> TransportResult<LightReading> {
        self.simulate(SimOp::GetState).await?;
        let state = lock(&self.state);
        Ok(LightReading {
            label: state.label.clone(),
            power: state.power,
            color: state.color,
        })
    }

    async fn color(&self, color: Hsbk, duration: Duration) -> TransportResult<()> {
        self.simulate(SimOp::Color).await?;
        lock(&self.state).color = color;
        self.record(SimCall::Color(color, duration));
        Ok(())
    }

    async fn on(&self, duration: Duration) -> TransportResult<()> {
        self.simulate(SimOp::Power).await?;
        lock(&self.state).power = true;
        self.record(SimCall::On(duration));
        Ok(())
    }

    async fn off(&self, duration: Duration) -> TransportResult<()> {
        self.simulate(SimOp::Power).await?;
        lock(&self.state).power = false;
        self.record(SimCall::Off(duration));
        Ok(())
    }

    async fn get_label(&self) -> TransportResult<String> {
        self.simulate(SimOp::Label).await?;
        Ok(lock(&self.state).label.clone())
    }

    async fn set_label(&self, label: &str) -> TransportResult<()> {
        self.simulate(SimOp::Label).await?;
        lock(&self.state).label = label.to_string();
        self.record(SimCall::SetLabel(label.to_string()));
        Ok(())
    }

    async fn get_max_ir(&self) -> TransportResult<u8> {
        self.simulate(SimOp::GetState).await?;
        Ok(lock(&self.state).infrared)
    }

    async fn set_max_ir(&self, level: u8) -> TransportResult<()> {
        self.simulate(SimOp::Color).await?;
        lock(&self.state).infrared = level;
        self.record(SimCall::SetMaxIr(level));
        Ok(())
    }

    async fn color_zones(
        &self,
        start: u8,
        end: u8,
        color: Hsbk,
        _duration: Duration,
        _apply: bool,
    ) -> TransportResult<()> {
        self.simulate(SimOp::ColorZones).await?;
        self.record(SimCall::ColorZones { start, end, color });
        Ok(())
    }

    async fn get_color_zones(&self, _start: u8, _end: u8) -> TransportResult<u8> {
        self.simulate(SimOp::ColorZones).await?;
        Ok(lock(&self.state).zones)
    }

    async fn set_hev_cycle(&self, enable: bool, duration_secs: u32) -> TransportResult<HevCycle> {
        self.simulate(SimOp::Power).await?;
        let mut state = lock(&self.state);
        let duration = if duration_secs == 0 { state.hev_default } else { duration_secs };
        state.hev = if enable {
            HevCycle {
                duration,
                remaining: duration,
            }
        } else {
            HevCycle::default()
        };
        self.record(SimCall::SetHevCycle(enable, duration_secs));
        Ok(state.hev)
    }

    async fn get_hev_cycle(&self) -> TransportResult<HevCycle> {
        self.simulate(SimOp::GetState).await?;
        Ok(lock(&self.state).hev)
    }

    async fn get_hev_cycle_configuration(&self) -> TransportResult<u32> {
        self.simulate(SimOp::GetState).await?;
        Ok(lock(&self.state).hev_default)
    }

    async fn get_last_hev_cycle_result(&self) -> TransportResult<u8> {
        self.simulate(SimOp::GetState).await?;
        Ok(lock(&self.state).hev_result)
    }

    async fn set_relay_power(&self, relay_index: u8, level: u16) -> TransportResult<()> {
        self.simulate(SimOp::RelayPower).await?;
        let mut state = lock(&self.state);
        if let Some(relay) = state.relays.get_mut(relay_index as usize) {
            *relay = level;
        }
        self.record(SimCall::SetRelayPower(relay_index, level));
        Ok(())
    }

    async fn get_relay_power(&self, relay_index: u8) -> TransportResult<u16> {
        self.simulate(SimOp::RelayPower).await?;
        lock(&self.state)
            .relays
            .get(relay_index as usize)
            .copied()
            .ok_or_else(|| TransportError::Rejected(format!("no relay {relay_index}")))
    }

    async fn get_wifi_info(&self) -> TransportResult<WifiInfo> {
        self.simulate(SimOp::WifiInfo).await?;
        Ok(lock(&self.state).wifi)
    }

    async fn get_wifi_version(&self) -> TransportResult<Version> {
        self.simulate(SimOp::WifiInfo).await?;
        Ok(lock(&self.state).wifi_firmware)
    }

    async fn get_firmware_version(&self) -> TransportResult<Version> {
        self.simulate(SimOp::FirmwareVersion).await?;
        Ok(lock(&self.state).firmware)
    }

    async fn get_hardware_version(&self) -> TransportResult<HardwareInfo> {
        self.simulate(SimOp::HardwareVersion).await?;
        Ok(lock(&self.state).hardware)
    }
}

/// The simulated network: announces its lights and routes packets to them.
#[derive(Default)]
pub struct SimLan {
    lights: DashMap<String, Arc<SimLight>>,
    order: Mutex<Vec<String>>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl SimLan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_light(&self, light: SimLight) -> Arc<SimLight> {
        let light = Arc::new(light);
        let id = light.id.clone();
        self.lights.insert(id.clone(), light.clone());
        lock(&self.order).push(id);
        self.announce(TransportEvent::Discovered(light.clone()));
        light
    }

    pub fn light(&self, id: &str) -> Option<Arc<SimLight>> {
        self.lights.get(id).map(|entry| entry.value().clone())
    }

    pub fn set_online(&self, id: &str, online: bool) {
        let event = if online {
            TransportEvent::Online(id.to_string())
        } else {
            TransportEvent::Offline(id.to_string())
        };
        self.announce(event);
    }

    fn announce(&self, event: TransportEvent) {
        if let Some(sender) = lock(&self.events).as_ref() {
            let _ = sender.try_send(event);
        }
    }
}

#[async_trait]
impl Transport for SimLan {
    async fn start_discovery(&self) -> TransportResult<mpsc::Receiver<TransportEvent>> {
        let (sender, receiver) = mpsc::channel(64);
        for id in lock(&self.order).iter() {
            if let Some(light) = self.lights.get(id) {
                let link: Arc<dyn LightLink> = light.value().clone();
                let _ = sender.try_send(TransportEvent::Discovered(link));
            }
        }
        *lock(&self.events) = Some(sender);
        Ok(receiver)
    }

    async fn send(&self, target: &str, packet: Packet) -> TransportResult<()> {
        let light = self.light(target).ok_or(TransportError::Unreachable)?;
        light.simulate(SimOp::Send).await?;
        light.record(SimCall::Packet(packet));
        Ok(())
    }
}
