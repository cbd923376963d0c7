// devices/mod.rs
mod light;
pub mod status;

pub use light::{DeviceSnapshot, HevStatus, Light, RelayLevel, WifiStatus};

use serde::Serialize;
use utoipa::ToSchema;

use crate::{catalog::EnergyUsage, transport::Version};

/// Notifications published by a single light.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DeviceEvent {
    Online,
    Offline,
    Ready,
    Unsupported { vendor_id: u32, product_id: u32 },
    ZonesCount(u8),
    Infrared(u8),
    OnOff(bool),
    Name(String),
    Dim(f64),
    Temperature(f64),
    Saturation(f64),
    Hue(f64),
    ColorMode(bool),
    FirmwareInfo(Version),
    WifiFirmwareInfo(Version),
    WifiInfo { signal: f64, strength: u8 },
    EnergySettings(EnergyUsage),
    /// Relay level normalized to `[0, 1]`.
    RelayLevel { index: u8, level: f64 },
    RelayOverall(bool),
    HevCycle(bool),
    HevResult(u8),
    /// Seconds.
    HevCycleStatus { duration: u32, remaining: u32 },
    HevConfig(u32),
}
