// config/mod.rs
use config::Config;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub metrics: MetricsSettings,
    pub controller: ControllerSettings,
    pub catalog: CatalogSettings,
    pub transport: TransportSettings,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub address: String,
    pub max_connections: u32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8080".to_string(),
            max_connections: 64,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub port: u16,
}

/// How on/off state couples to brightness changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum OperationMode {
    Athom,
    #[default]
    #[serde(rename = "LIFX")]
    Lifx,
    Legacy,
}

/// Kelvin sent along with colour commands once saturation is above zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum KelvinMode {
    #[default]
    #[serde(rename = "LIFX")]
    Lifx,
    #[serde(rename = "ADOBE")]
    Adobe,
    #[serde(rename = "IGNORE")]
    Ignore,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub operation_mode: OperationMode,
    pub kelvin_mode: KelvinMode,
    pub polling_interval_ms: u64,
    pub debounce_ms: u64,
    pub default_transition_ms: u64,
    /// Resend attempts for fire-and-forget packets while the device stays online.
    pub command_retries: u32,
    pub command_retry_delay_ms: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            operation_mode: OperationMode::Lifx,
            kelvin_mode: KelvinMode::Lifx,
            polling_interval_ms: 10_000,
            debounce_ms: 50,
            default_transition_ms: 500,
            command_retries: 10,
            command_retry_delay_ms: 100,
        }
    }
}

impl ControllerSettings {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn default_transition(&self) -> Duration {
        Duration::from_millis(self.default_transition_ms)
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CatalogSettings {
    /// Products index in JSON; the embedded index is used when unset.
    pub products_path: Option<String>,
    pub effects_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct TransportSettings {
    /// Virtual lights served by the in-memory LAN instead of real hardware.
    pub simulated: Vec<SimulatedLightSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedLightSettings {
    pub id: String,
    pub label: String,
    pub address: String,
    pub vendor_id: u32,
    pub product_id: u32,
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let settings = Config::builder()
            .add_source(config::File::with_name("config/config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        settings.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_policy_names() {
        let raw = serde_json::json!({
            "operation_mode": "Athom",
            "kelvin_mode": "ADOBE",
            "debounce_ms": 75,
        });
        let controller: ControllerSettings = serde_json::from_value(raw).unwrap();
        assert_eq!(controller.operation_mode, OperationMode::Athom);
        assert_eq!(controller.kelvin_mode, KelvinMode::Adobe);
        assert_eq!(controller.debounce_window(), Duration::from_millis(75));
        assert_eq!(controller.polling_interval_ms, 10_000);
    }
}
