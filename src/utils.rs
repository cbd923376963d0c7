// utils.rs
use super::models::AppState;
use rand::Rng;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Raw Wi-Fi signal a device reports before its first diagnostics sample.
pub const WIFI_SIGNAL_UNKNOWN: f64 = 200.0;

/// Maximum label length accepted by the hardware, in bytes.
pub const LABEL_MAX_BYTES: usize = 32;

pub async fn cleanup_client_connection(client_id: Uuid, state: &AppState) {
    state.clients.remove(&client_id);
    info!("Client {} disconnected", client_id);
}

/// Linear mapping of `value` from `[in_start, in_end]` onto `[out_start, out_end]`.
/// Either range may be descending.
pub fn map_scale(in_start: f64, in_end: f64, out_start: f64, out_end: f64, value: f64) -> f64 {
    out_start + (out_end - out_start) * (value - in_start) / (in_end - in_start)
}

/// Maps onto the 16-bit wire range, rounding half away from zero.
pub fn scale_to_u16(in_start: f64, in_end: f64, value: f64) -> u16 {
    map_scale(in_start, in_end, 0.0, 65535.0, value)
        .round()
        .clamp(0.0, 65535.0) as u16
}

/// Uniform draw from `[min, max)`; with `decimals` the result is rounded to two places.
/// A degenerate or inverted range yields `min`.
pub fn random_between<R: Rng + ?Sized>(rng: &mut R, min: f64, max: f64, decimals: bool) -> f64 {
    let value = if max > min { rng.gen_range(min..max) } else { min };
    if decimals {
        (value * 100.0).round() / 100.0
    } else {
        value
    }
}

pub fn random_number(min: f64, max: f64, decimals: bool) -> f64 {
    random_between(&mut rand::thread_rng(), min, max, decimals)
}

/// Bounds for [`random_color_dataset`]. Hue is in degrees, saturation and
/// dim in percent; unset bounds count as zero, unset durations as the default.
#[derive(Debug, Clone, Default)]
pub struct ColorRanges {
    pub hue_min: Option<f64>,
    pub hue_max: Option<f64>,
    pub saturation_min: Option<f64>,
    pub saturation_max: Option<f64>,
    pub dim_min: Option<f64>,
    pub dim_max: Option<f64>,
    pub duration_min: Option<Duration>,
    pub duration_max: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorDataset {
    pub hue: f64,
    pub saturation: f64,
    pub dim: f64,
    pub duration: Duration,
}

fn clamp_range(min: Option<f64>, max: Option<f64>, limit: f64) -> (f64, f64) {
    let min = min.unwrap_or(0.0).clamp(0.0, limit);
    let max = max.unwrap_or(0.0).clamp(0.0, limit).max(min);
    (min, max)
}

pub fn random_color_dataset(ranges: &ColorRanges, default_duration: Duration) -> ColorDataset {
    let pick_duration = |d: Option<Duration>| match d {
        Some(d) if !d.is_zero() => d,
        _ => default_duration,
    };
    let (hue_min, hue_max) = clamp_range(ranges.hue_min, ranges.hue_max, 360.0);
    let (sat_min, sat_max) = clamp_range(ranges.saturation_min, ranges.saturation_max, 100.0);
    let (dim_min, dim_max) = clamp_range(ranges.dim_min, ranges.dim_max, 100.0);
    let duration_min = pick_duration(ranges.duration_min).as_millis() as f64;
    let duration_max = pick_duration(ranges.duration_max).as_millis() as f64;

    let mut rng = rand::thread_rng();
    ColorDataset {
        hue: random_between(&mut rng, hue_min, hue_max, false),
        saturation: random_between(&mut rng, sat_min, sat_max, false),
        dim: random_between(&mut rng, dim_min, dim_max, false),
        duration: Duration::from_millis(random_between(&mut rng, duration_min, duration_max, false) as u64),
    }
}

/// Signal strength on a 0 to 4 scale from the device's raw Wi-Fi signal figure.
pub fn wifi_strength(signal: f64) -> u8 {
    if signal == WIFI_SIGNAL_UNKNOWN || !signal.is_finite() || signal <= 0.0 {
        return 0;
    }
    classify_signal((10.0 * signal.log10() + 0.5).floor() as i32)
}

/// Negative values are RSSI in dBm, the rest signal-to-noise ratios.
pub fn classify_signal(value: i32) -> u8 {
    if value < 0 {
        match value {
            v if v <= -80 => 1,
            v if v <= -70 => 2,
            v if v < -60 => 3,
            _ => 4,
        }
    } else {
        match value {
            4 | 5 => 1,
            7..=11 => 2,
            12..=16 => 3,
            v if v > 16 => 4,
            _ => 0,
        }
    }
}

/// Cuts `label` to at most [`LABEL_MAX_BYTES`] without splitting a character.
pub fn truncate_label(label: &str) -> &str {
    if label.len() <= LABEL_MAX_BYTES {
        return label;
    }
    let mut end = LABEL_MAX_BYTES;
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    &label[..end]
}
