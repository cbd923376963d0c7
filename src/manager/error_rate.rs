// manager/error_rate.rs
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tokio::time::Instant;
use utoipa::ToSchema;

pub const ERROR_WINDOW: Duration = Duration::from_secs(60);

/// Operations whose failures are tracked for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
pub enum ErrorOp {
    #[serde(rename = "getState")]
    GetState,
    #[serde(rename = "getWifiInfo")]
    GetWifiInfo,
    #[serde(rename = "getColorZones")]
    GetColorZones,
    #[serde(rename = "colorZones")]
    ColorZones,
    #[serde(rename = "color")]
    Color,
    #[serde(rename = "onoff")]
    OnOff,
    #[serde(rename = "getRelayPower")]
    GetRelayPower,
}

impl ErrorOp {
    pub const ALL: [ErrorOp; 7] = [
        ErrorOp::GetState,
        ErrorOp::GetWifiInfo,
        ErrorOp::GetColorZones,
        ErrorOp::ColorZones,
        ErrorOp::Color,
        ErrorOp::OnOff,
        ErrorOp::GetRelayPower,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorOp::GetState => "getState",
            ErrorOp::GetWifiInfo => "getWifiInfo",
            ErrorOp::GetColorZones => "getColorZones",
            ErrorOp::ColorZones => "colorZones",
            ErrorOp::Color => "color",
            ErrorOp::OnOff => "onoff",
            ErrorOp::GetRelayPower => "getRelayPower",
        }
    }
}

impl fmt::Display for ErrorOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sliding-window failure counters. Observability only; nothing is throttled on them.
#[derive(Debug, Default)]
pub struct ErrorRates {
    records: Mutex<HashMap<ErrorOp, VecDeque<Instant>>>,
}

impl ErrorRates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, op: ErrorOp) {
        let now = Instant::now();
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let list = records.entry(op).or_default();
        list.push_back(now);
        prune(list, now);
        ::metrics::counter!("lanlight_device_errors_total", "op" => op.as_str()).increment(1);
    }

    /// Failures of `op` within the last minute.
    pub fn rate(&self, op: ErrorOp) -> usize {
        let now = Instant::now();
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .get_mut(&op)
            .map(|list| {
                prune(list, now);
                list.len()
            })
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<(ErrorOp, usize)> {
        ErrorOp::ALL.iter().map(|&op| (op, self.rate(op))).collect()
    }
}

fn prune(list: &mut VecDeque<Instant>, now: Instant) {
    while let Some(&oldest) = list.front() {
        if oldest + ERROR_WINDOW < now {
            list.pop_front();
        } else {
            break;
        }
    }
}
