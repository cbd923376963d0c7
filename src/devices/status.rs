// devices/status.rs
//! Confirmed and pending light state, and the pure transitions between them.

use std::time::Duration;
use tracing::warn;

use super::DeviceEvent;
use crate::{
    catalog::TemperatureRange,
    color::Hsbk,
    config::{KelvinMode, OperationMode},
    transport::LightReading,
    utils::map_scale,
};

pub const MAX_RELAYS: usize = 4;
pub const RELAY_FULL: u16 = 65535;

/// Brightness applied when a light is switched on from zero, so it is visibly lit.
pub const MIN_DIM: f64 = 0.01;

pub const KELVIN_LIFX: u16 = 3500;
pub const KELVIN_ADOBE: u16 = 6504;

/// Last state known to be on the hardware. Dim, saturation and temperature
/// are normalized to `[0, 1]`; hue is in degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct LightStatus {
    pub name: Option<String>,
    pub on_off: bool,
    pub dim: f64,
    pub hue: f64,
    pub saturation: f64,
    pub temperature: f64,
    /// Temperature seen while in white mode, restored when leaving colour mode.
    pub temperature_cached: f64,
    /// Last non-zero saturation, restored when entering colour mode.
    pub saturation_cached: f64,
    pub infrared: u8,
    pub relays: [u16; MAX_RELAYS],
}

impl Default for LightStatus {
    fn default() -> Self {
        Self {
            name: None,
            on_off: false,
            dim: 0.0,
            hue: 0.0,
            saturation: 0.0,
            temperature: 0.0,
            temperature_cached: 0.0,
            saturation_cached: 1.0,
            infrared: 0,
            relays: [0; MAX_RELAYS],
        }
    }
}

/// Not-yet-applied user intent, one optional override per axis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FutureStatus {
    pub on_off: Option<bool>,
    pub dim: Option<f64>,
    pub hue: Option<f64>,
    pub saturation: Option<f64>,
    pub temperature: Option<f64>,
    pub relays: [Option<u16>; MAX_RELAYS],
    pub duration: Option<Duration>,
}

impl FutureStatus {
    /// Coalesced writes use the longest transition any of them asked for.
    pub fn record_duration(&mut self, duration: Option<Duration>) {
        if let Some(duration) = duration {
            self.duration = Some(self.duration.map_or(duration, |d| d.max(duration)));
        }
    }

    pub fn has_color(&self) -> bool {
        self.dim.is_some() || self.hue.is_some() || self.saturation.is_some() || self.temperature.is_some()
    }

    pub fn has_relays(&self) -> bool {
        self.relays.iter().any(Option::is_some)
    }

    pub fn has_data(&self) -> bool {
        self.on_off.is_some() || self.has_color() || self.has_relays() || self.duration.is_some()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Puts a failed write back, without clobbering anything written since.
    pub fn restore_from(&mut self, backup: &FutureStatus) {
        self.on_off = self.on_off.or(backup.on_off);
        self.dim = self.dim.or(backup.dim);
        self.hue = self.hue.or(backup.hue);
        self.saturation = self.saturation.or(backup.saturation);
        self.temperature = self.temperature.or(backup.temperature);
        for (slot, saved) in self.relays.iter_mut().zip(backup.relays) {
            *slot = slot.or(saved);
        }
        if self.duration.is_none() {
            self.duration = backup.duration;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Policy {
    pub operation_mode: OperationMode,
    pub kelvin_mode: KelvinMode,
    pub default_transition: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorCommand {
    pub hue: f64,
    pub saturation: f64,
    pub dim: f64,
    pub temperature: f64,
    pub kelvin: u16,
}

impl ColorCommand {
    pub fn hsbk(&self) -> Hsbk {
        Hsbk {
            hue: self.hue,
            saturation: self.saturation * 100.0,
            brightness: self.dim * 100.0,
            kelvin: self.kelvin,
        }
    }
}

/// Axes the caller asked to change, as opposed to ones filled from confirmed state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Touched {
    pub dim: bool,
    pub hue: bool,
    pub saturation: bool,
    pub temperature: bool,
}

/// Everything one debounce fire sends to the hardware.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePlan {
    pub color: Option<ColorCommand>,
    pub power: Option<bool>,
    pub relays: Vec<(u8, u16)>,
    pub duration: Duration,
    pub touched: Touched,
    /// Pending state as it stood before gap filling; restored on failure.
    pub backup: FutureStatus,
}

impl UpdatePlan {
    pub fn is_empty(&self) -> bool {
        self.color.is_none() && self.power.is_none() && self.relays.is_empty()
    }
}

/// Kelvin for a normalized temperature; `0` is the coolest end of the range.
pub fn kelvin_for(range: TemperatureRange, temperature: f64) -> u16 {
    map_scale(0.0, 1.0, range.max as f64, range.min as f64, temperature)
        .round()
        .clamp(0.0, u16::MAX as f64) as u16
}

pub fn temperature_for(range: TemperatureRange, kelvin: u16) -> f64 {
    if range.max == range.min {
        return 0.0;
    }
    map_scale(range.max as f64, range.min as f64, 0.0, 1.0, kelvin as f64)
}

pub fn plan_update(
    confirmed: &LightStatus,
    pending: &FutureStatus,
    policy: &Policy,
    range: TemperatureRange,
) -> UpdatePlan {
    let mut future = pending.clone();
    let mut touched = Touched {
        dim: future.dim.is_some(),
        hue: future.hue.is_some(),
        saturation: future.saturation.is_some(),
        temperature: future.temperature.is_some(),
    };

    if policy.operation_mode == OperationMode::Athom {
        if let Some(dim) = future.dim {
            let effective_on = future.on_off.unwrap_or(confirmed.on_off);
            if effective_on && dim == 0.0 {
                future.on_off = Some(false);
            } else if !effective_on && confirmed.dim == 0.0 && dim > 0.0 {
                future.on_off = Some(true);
            }
        }
    }

    if matches!(policy.operation_mode, OperationMode::Athom | OperationMode::Lifx)
        && future.on_off == Some(true)
        && future.dim.unwrap_or(confirmed.dim) == 0.0
    {
        future.dim = Some(MIN_DIM);
        touched.dim = true;
    }

    let backup = future.clone();
    let duration = future.duration.unwrap_or(policy.default_transition);

    let color = future.has_color().then(|| {
        let dim = future.dim.unwrap_or(confirmed.dim);
        let hue = future.hue.unwrap_or(confirmed.hue);
        let saturation = future.saturation.unwrap_or(confirmed.saturation);
        let temperature = future.temperature.unwrap_or(confirmed.temperature);
        let mut kelvin = kelvin_for(range, temperature);
        if saturation > 0.0 {
            match policy.kelvin_mode {
                KelvinMode::Lifx => kelvin = KELVIN_LIFX,
                KelvinMode::Adobe => kelvin = KELVIN_ADOBE,
                KelvinMode::Ignore => {}
            }
        }
        ColorCommand {
            hue,
            saturation,
            dim,
            temperature,
            kelvin,
        }
    });

    let relays = future
        .relays
        .iter()
        .enumerate()
        .filter_map(|(idx, level)| level.map(|level| (idx as u8, level)))
        .collect();

    UpdatePlan {
        color,
        power: future.on_off,
        relays,
        duration,
        touched,
        backup,
    }
}

/// Folds an applied colour command into confirmed state.
pub fn apply_color(status: &mut LightStatus, command: &ColorCommand, touched: Touched) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    status.dim = command.dim;
    status.hue = command.hue;
    status.saturation = command.saturation;
    status.temperature = command.temperature;
    if command.saturation > 0.0 {
        status.saturation_cached = command.saturation;
    } else {
        status.temperature_cached = command.temperature;
    }

    if touched.dim {
        events.push(DeviceEvent::Dim(command.dim));
    }
    if touched.temperature {
        events.push(DeviceEvent::Temperature(command.temperature));
    }
    if touched.hue {
        events.push(DeviceEvent::Hue(command.hue));
    }
    if touched.saturation {
        events.push(DeviceEvent::Saturation(command.saturation));
        events.push(DeviceEvent::ColorMode(command.saturation > 0.0));
    }
    events
}

pub fn apply_power(status: &mut LightStatus, on: bool) -> Vec<DeviceEvent> {
    status.on_off = on;
    vec![DeviceEvent::OnOff(on)]
}

/// What the reconciler must leave alone because a local write supersedes it.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteGuards {
    pub power_in_flight: bool,
    pub color_in_flight: bool,
    pub pending: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadingContext {
    pub supports_color: bool,
    pub temperature_range: Option<TemperatureRange>,
}

/// Applies a polled reading to confirmed state and returns the changes.
pub fn reconcile(
    status: &mut LightStatus,
    reading: &LightReading,
    context: ReadingContext,
    guards: WriteGuards,
) -> Vec<DeviceEvent> {
    let mut events = Vec::new();

    if status.name.as_deref() != Some(reading.label.as_str()) {
        status.name = Some(reading.label.clone());
        events.push(DeviceEvent::Name(reading.label.clone()));
    }

    if !guards.power_in_flight && !guards.pending && status.on_off != reading.power {
        status.on_off = reading.power;
        events.push(DeviceEvent::OnOff(reading.power));
    }

    if guards.color_in_flight || guards.pending {
        return events;
    }

    let dim = reading.color.brightness / 100.0;
    if status.dim != dim {
        status.dim = dim;
        events.push(DeviceEvent::Dim(dim));
    }

    if let Some(range) = context.temperature_range {
        let temperature = temperature_for(range, reading.color.kelvin);
        let tolerance = 1.0 / (range.max as f64 - range.min as f64);
        if (status.temperature - temperature).abs() > tolerance {
            if !(0.0..=1.0).contains(&temperature) {
                warn!(
                    kelvin = reading.color.kelvin,
                    temperature, "ignoring light temperature outside the supported range"
                );
            } else {
                status.temperature = temperature;
                if status.saturation == 0.0 {
                    status.temperature_cached = temperature;
                }
                events.push(DeviceEvent::Temperature(temperature));
            }
        }
    }

    if context.supports_color {
        let saturation = reading.color.saturation / 100.0;
        if status.saturation != saturation {
            let was_color = status.saturation > 0.0;
            if was_color != (saturation > 0.0) {
                events.push(DeviceEvent::ColorMode(saturation > 0.0));
            }
            status.saturation = saturation;
            if saturation > 0.0 {
                status.saturation_cached = saturation;
            }
            events.push(DeviceEvent::Saturation(saturation));
        }
        if status.hue != reading.color.hue {
            status.hue = reading.color.hue;
            events.push(DeviceEvent::Hue(reading.color.hue));
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    const RANGE: TemperatureRange = TemperatureRange { min: 2500, max: 9000 };

    fn policy(operation_mode: OperationMode, kelvin_mode: KelvinMode) -> Policy {
        Policy {
            operation_mode,
            kelvin_mode,
            default_transition: Duration::from_millis(500),
        }
    }

    fn lit(dim: f64) -> LightStatus {
        LightStatus {
            on_off: true,
            dim,
            ..Default::default()
        }
    }

    #[test]
    fn duration_keeps_the_maximum() {
        let mut future = FutureStatus::default();
        future.record_duration(Some(Duration::from_millis(300)));
        future.record_duration(None);
        future.record_duration(Some(Duration::from_millis(100)));
        future.record_duration(Some(Duration::from_millis(900)));
        assert_eq!(future.duration, Some(Duration::from_millis(900)));
    }

    #[test]
    fn partial_update_fills_gaps_from_confirmed() {
        let confirmed = LightStatus {
            dim: 0.4,
            hue: 10.0,
            saturation: 0.0,
            temperature: 0.5,
            ..lit(0.4)
        };
        let future = FutureStatus {
            hue: Some(200.0),
            ..Default::default()
        };
        let plan = plan_update(&confirmed, &future, &policy(OperationMode::Legacy, KelvinMode::Lifx), RANGE);
        let color = plan.color.unwrap();
        assert_eq!(color.hue, 200.0);
        assert_eq!(color.dim, 0.4);
        assert_eq!(color.temperature, 0.5);
        assert_eq!(color.kelvin, 5750);
        assert!(plan.power.is_none());
        assert_eq!(plan.duration, Duration::from_millis(500));
        assert_eq!(plan.backup, future);
        assert!(plan.touched.hue && !plan.touched.dim);
    }

    #[test]
    fn athom_dim_zero_turns_off() {
        let future = FutureStatus {
            dim: Some(0.0),
            ..Default::default()
        };
        let plan = plan_update(&lit(0.6), &future, &policy(OperationMode::Athom, KelvinMode::Lifx), RANGE);
        assert_eq!(plan.power, Some(false));
        assert_eq!(plan.color.unwrap().dim, 0.0);
    }

    #[test]
    fn athom_dim_up_from_zero_turns_on() {
        let off = LightStatus::default();
        let future = FutureStatus {
            dim: Some(0.3),
            ..Default::default()
        };
        let plan = plan_update(&off, &future, &policy(OperationMode::Athom, KelvinMode::Lifx), RANGE);
        assert_eq!(plan.power, Some(true));
        assert_eq!(plan.color.unwrap().dim, 0.3);
    }

    #[test]
    fn legacy_mode_keeps_power_and_dim_apart() {
        let future = FutureStatus {
            dim: Some(0.0),
            ..Default::default()
        };
        let plan = plan_update(&lit(0.6), &future, &policy(OperationMode::Legacy, KelvinMode::Lifx), RANGE);
        assert_eq!(plan.power, None);

        let future = FutureStatus {
            on_off: Some(true),
            ..Default::default()
        };
        let plan = plan_update(&LightStatus::default(), &future, &policy(OperationMode::Legacy, KelvinMode::Lifx), RANGE);
        assert!(plan.color.is_none());
    }

    #[test]
    fn switching_on_from_zero_applies_the_floor() {
        for mode in [OperationMode::Athom, OperationMode::Lifx] {
            let future = FutureStatus {
                on_off: Some(true),
                ..Default::default()
            };
            let plan = plan_update(&LightStatus::default(), &future, &policy(mode, KelvinMode::Lifx), RANGE);
            assert_eq!(plan.power, Some(true));
            assert_eq!(plan.color.unwrap().dim, MIN_DIM);
            assert!(plan.touched.dim);
            assert_eq!(plan.backup.dim, Some(MIN_DIM));
        }
    }

    #[test]
    fn floor_does_not_override_a_requested_dim() {
        let future = FutureStatus {
            on_off: Some(true),
            dim: Some(0.7),
            ..Default::default()
        };
        let plan = plan_update(&LightStatus::default(), &future, &policy(OperationMode::Lifx, KelvinMode::Lifx), RANGE);
        assert_eq!(plan.color.unwrap().dim, 0.7);
    }

    #[test]
    fn kelvin_policy_in_colour_mode() {
        let future = FutureStatus {
            saturation: Some(0.8),
            temperature: Some(1.0),
            ..Default::default()
        };
        let confirmed = lit(0.5);
        let lifx = plan_update(&confirmed, &future, &policy(OperationMode::Lifx, KelvinMode::Lifx), RANGE);
        assert_eq!(lifx.color.unwrap().kelvin, KELVIN_LIFX);
        let adobe = plan_update(&confirmed, &future, &policy(OperationMode::Lifx, KelvinMode::Adobe), RANGE);
        assert_eq!(adobe.color.unwrap().kelvin, KELVIN_ADOBE);
        let ignore = plan_update(&confirmed, &future, &policy(OperationMode::Lifx, KelvinMode::Ignore), RANGE);
        assert_eq!(ignore.color.unwrap().kelvin, 2500);
    }

    #[test]
    fn white_mode_passes_kelvin_through() {
        let future = FutureStatus {
            saturation: Some(0.0),
            temperature: Some(0.0),
            ..Default::default()
        };
        let plan = plan_update(&lit(0.5), &future, &policy(OperationMode::Lifx, KelvinMode::Lifx), RANGE);
        assert_eq!(plan.color.unwrap().kelvin, 9000);
    }

    #[test]
    fn relay_levels_become_commands() {
        let mut future = FutureStatus::default();
        future.relays[1] = Some(RELAY_FULL);
        future.relays[3] = Some(0);
        let plan = plan_update(&LightStatus::default(), &future, &policy(OperationMode::Lifx, KelvinMode::Lifx), RANGE);
        assert_eq!(plan.relays, vec![(1, RELAY_FULL), (3, 0)]);
        assert!(plan.color.is_none() && plan.power.is_none());
    }

    #[test]
    fn restore_keeps_newer_intent() {
        let backup = FutureStatus {
            dim: Some(0.2),
            hue: Some(90.0),
            duration: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let mut current = FutureStatus {
            hue: Some(180.0),
            ..Default::default()
        };
        current.restore_from(&backup);
        assert_eq!(current.dim, Some(0.2));
        assert_eq!(current.hue, Some(180.0));
        assert_eq!(current.duration, Some(Duration::from_millis(100)));
    }

    #[test]
    fn apply_color_tracks_caches() {
        let mut status = lit(0.2);
        let command = ColorCommand {
            hue: 120.0,
            saturation: 0.6,
            dim: 0.9,
            temperature: 0.1,
            kelvin: KELVIN_LIFX,
        };
        let touched = Touched {
            saturation: true,
            ..Default::default()
        };
        let events = apply_color(&mut status, &command, touched);
        assert_eq!(status.saturation_cached, 0.6);
        assert_eq!(status.dim, 0.9);
        assert_eq!(events, vec![DeviceEvent::Saturation(0.6), DeviceEvent::ColorMode(true)]);
    }

    fn reading(power: bool, hue: f64, saturation: f64, brightness: f64, kelvin: u16) -> LightReading {
        LightReading {
            label: "Desk".to_string(),
            power,
            color: Hsbk {
                hue,
                saturation,
                brightness,
                kelvin,
            },
        }
    }

    const COLOR_LIGHT: ReadingContext = ReadingContext {
        supports_color: true,
        temperature_range: Some(RANGE),
    };

    #[test]
    fn reconcile_emits_differences() {
        let mut status = LightStatus {
            name: Some("Desk".to_string()),
            ..Default::default()
        };
        let events = reconcile(&mut status, &reading(true, 30.0, 50.0, 80.0, 9000), COLOR_LIGHT, WriteGuards::default());
        assert_eq!(
            events,
            vec![
                DeviceEvent::OnOff(true),
                DeviceEvent::Dim(0.8),
                DeviceEvent::ColorMode(true),
                DeviceEvent::Saturation(0.5),
                DeviceEvent::Hue(30.0),
            ]
        );
        assert_eq!(status.saturation_cached, 0.5);
    }

    #[test]
    fn reconcile_respects_in_flight_writes() {
        let mut status = lit(0.5);
        status.name = Some("Desk".to_string());
        let guards = WriteGuards {
            color_in_flight: true,
            ..Default::default()
        };
        let events = reconcile(&mut status, &reading(false, 0.0, 0.0, 10.0, 9000), COLOR_LIGHT, guards);
        assert_eq!(events, vec![DeviceEvent::OnOff(false)]);
        assert_eq!(status.dim, 0.5);

        let guards = WriteGuards {
            pending: true,
            ..Default::default()
        };
        let events = reconcile(&mut status, &reading(true, 0.0, 0.0, 10.0, 9000), COLOR_LIGHT, guards);
        assert!(events.is_empty());
    }

    #[test]
    fn reconcile_drops_out_of_range_temperature() {
        let mut status = LightStatus {
            name: Some("Desk".to_string()),
            temperature: 0.5,
            ..Default::default()
        };
        reconcile(&mut status, &reading(false, 0.0, 0.0, 0.0, 12000), COLOR_LIGHT, WriteGuards::default());
        assert_eq!(status.temperature, 0.5);
        let events = reconcile(&mut status, &reading(false, 0.0, 0.0, 0.0, 2500), COLOR_LIGHT, WriteGuards::default());
        assert_eq!(events, vec![DeviceEvent::Temperature(1.0)]);
        assert_eq!(status.temperature_cached, 1.0);
    }
}
