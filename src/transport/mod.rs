// transport/mod.rs
//! Boundary to the device-protocol library.
//!
//! Packet encoding, discovery broadcasts and wire-level retries live behind
//! these traits; the controller only issues commands and reads replies.

#[cfg(any(test, feature = "sim"))]
pub mod sim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{net::IpAddr, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use utoipa::ToSchema;

use crate::{
    color::{Hsbk, HwColor},
    error::TransportError,
};

pub type TransportResult<T> = Result<T, TransportError>;

pub enum TransportEvent {
    Discovered(Arc<dyn LightLink>),
    Online(String),
    Offline(String),
}

/// Light state as reported by `get_state`. Hue in degrees, saturation and
/// brightness in percent.
#[derive(Debug, Clone, PartialEq)]
pub struct LightReading {
    pub label: String,
    pub power: bool,
    pub color: Hsbk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareInfo {
    pub vendor_id: u32,
    pub product_id: u32,
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WifiInfo {
    pub signal: f64,
    pub tx: u32,
    pub rx: u32,
}

/// Seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HevCycle {
    pub duration: u32,
    pub remaining: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Waveform {
    Saw,
    Sine,
    HalfSine,
    Triangle,
    Pulse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MoveDirection {
    Towards,
    Away,
}

/// Commands dispatched through [`Transport::send`] rather than a link method.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    SetWaveform {
        transient: bool,
        color: HwColor,
        period: Duration,
        cycles: f32,
        skew_ratio: f32,
        waveform: Waveform,
    },
    SetMultiZoneEffect {
        moving: Option<MoveDirection>,
        speed: Duration,
    },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts passive listening. Every light seen is announced once as
    /// `Discovered`; reachability changes follow as `Online`/`Offline`.
    async fn start_discovery(&self) -> TransportResult<mpsc::Receiver<TransportEvent>>;

    async fn send(&self, target: &str, packet: Packet) -> TransportResult<()>;
}

/// One discovered hardware unit.
#[async_trait]
pub trait LightLink: Send + Sync {
    fn id(&self) -> &str;
    fn address(&self) -> IpAddr;

    async fn get_state(&self) -> TransportResult<LightReading>;
    async fn color(&self, color: Hsbk, duration: Duration) -> TransportResult<()>;
    async fn on(&self, duration: Duration) -> TransportResult<()>;
    async fn off(&self, duration: Duration) -> TransportResult<()>;
    async fn get_label(&self) -> TransportResult<String>;
    async fn set_label(&self, label: &str) -> TransportResult<()>;
    async fn get_max_ir(&self) -> TransportResult<u8>;
    async fn set_max_ir(&self, level: u8) -> TransportResult<()>;
    async fn color_zones(
        &self,
        start: u8,
        end: u8,
        color: Hsbk,
        duration: Duration,
        apply: bool,
    ) -> TransportResult<()>;
    /// Number of zones reported by the device.
    async fn get_color_zones(&self, start: u8, end: u8) -> TransportResult<u8>;
    async fn set_hev_cycle(&self, enable: bool, duration_secs: u32) -> TransportResult<HevCycle>;
    async fn get_hev_cycle(&self) -> TransportResult<HevCycle>;
    async fn get_hev_cycle_configuration(&self) -> TransportResult<u32>;
    async fn get_last_hev_cycle_result(&self) -> TransportResult<u8>;
    async fn set_relay_power(&self, relay_index: u8, level: u16) -> TransportResult<()>;
    async fn get_relay_power(&self, relay_index: u8) -> TransportResult<u16>;
    async fn get_wifi_info(&self) -> TransportResult<WifiInfo>;
    async fn get_wifi_version(&self) -> TransportResult<Version>;
    async fn get_firmware_version(&self) -> TransportResult<Version>;
    async fn get_hardware_version(&self) -> TransportResult<HardwareInfo>;
}
