// effects/player.rs
use rand::{Rng, seq::SliceRandom};
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{Notify, broadcast},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use validator::Validate;

use super::definition::{Channels, ColorSpec, CommandKind, EffectCommand, EffectDefinition, RandomMode, Step, ZoneSelector};
use crate::{
    color::{HEX_KELVIN, Hsbk},
    devices::{Light, status::kelvin_for},
    error::AppError,
    events::EventBus,
    manager::{hardware_color, waveform_packet},
    utils::random_between,
};

/// A stopped run still gets this long before it restores and ends.
pub const STOP_GRACE: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectEvent {
    Ended,
}

/// What the scheduler does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Step(usize, Duration),
    End(Duration),
}

/// Per-run switches fixed before the first step plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayOptions {
    /// Loops even when the definition does not.
    pub looped: bool,
    pub restore_on_end: bool,
}

impl Default for PlayOptions {
    fn default() -> Self {
        Self {
            looped: false,
            restore_on_end: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ColorSnapshot {
    hue: f64,
    saturation: f64,
    dim: f64,
    temperature: f64,
}

#[derive(Default)]
struct RunState {
    active: bool,
    stop_requested: bool,
    played: Vec<bool>,
    index: usize,
    snapshots: Vec<(Arc<Light>, ColorSnapshot)>,
    wake: Arc<Notify>,
    scheduler: Option<JoinHandle<()>>,
}

/// One playable instance of an effect definition over ordered zone groups.
pub struct Effect {
    definition: EffectDefinition,
    zones: Vec<Vec<Arc<Light>>>,
    looped: bool,
    restore_on_end: bool,
    run: Mutex<RunState>,
    events: EventBus<EffectEvent>,
}

impl Effect {
    pub fn new(definition: EffectDefinition, zones: Vec<Vec<Arc<Light>>>, options: PlayOptions) -> Result<Self, AppError> {
        definition.validate()?;
        let required = definition.required_zones();
        if zones.len() < required {
            return Err(AppError::Validation(format!(
                "effect {} needs {} zones, got {}",
                definition.name,
                required,
                zones.len()
            )));
        }
        let looped = definition.looped || options.looped;
        info!(effect = %definition.name, looped, zones = zones.len(), "Custom effect ready");
        Ok(Self {
            run: Mutex::new(RunState {
                played: vec![false; definition.choreo.len()],
                ..Default::default()
            }),
            definition,
            zones,
            looped,
            restore_on_end: options.restore_on_end,
            events: EventBus::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn looped(&self) -> bool {
        self.looped
    }

    pub fn required_zones(&self) -> usize {
        self.definition.required_zones()
    }

    /// True from `start` until `Ended` has been published.
    pub fn active(&self) -> bool {
        lock(&self.run).active
    }

    pub fn restore_on_end(&self) -> bool {
        self.restore_on_end
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EffectEvent> {
        self.events.subscribe()
    }

    /// Returns false when already running or there is nothing to play.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.definition.choreo.is_empty() {
            return false;
        }
        let wake = {
            let mut run = lock(&self.run);
            if run.active {
                return false;
            }
            run.active = true;
            run.stop_requested = false;
            run.played.fill(false);
            run.index = 0;
            run.snapshots = self.capture();
            run.wake = Arc::new(Notify::new());
            Arc::clone(&run.wake)
        };
        info!(effect = %self.definition.name, "Starting effect");

        for command in &self.definition.init_cmds {
            self.run_command(command);
        }

        let linger = self.definition.init_linger();
        let first = if linger.is_zero() {
            self.play_step(0)
        } else {
            Schedule::Step(0, linger)
        };

        let effect = Arc::clone(self);
        let handle = tokio::spawn(async move { effect.drive(first, wake).await });
        lock(&self.run).scheduler = Some(handle);
        true
    }

    /// Requests termination; `Ended` follows after [`STOP_GRACE`].
    pub fn stop(&self) {
        let mut run = lock(&self.run);
        if !run.active || run.stop_requested {
            return;
        }
        run.stop_requested = true;
        run.wake.notify_one();
        debug!(effect = %self.definition.name, "Stop requested");
    }

    fn stop_requested(&self) -> bool {
        lock(&self.run).stop_requested
    }

    async fn drive(self: Arc<Self>, mut schedule: Schedule, wake: Arc<Notify>) {
        loop {
            match schedule {
                Schedule::Step(index, delay) => {
                    if !self.wait(delay, &wake).await {
                        break;
                    }
                    schedule = self.play_step(index);
                }
                Schedule::End(delay) => {
                    if self.wait(delay, &wake).await {
                        self.finish();
                        return;
                    }
                    break;
                }
            }
        }
        tokio::time::sleep(STOP_GRACE).await;
        self.finish();
    }

    /// False once a stop was requested.
    async fn wait(&self, delay: Duration, wake: &Notify) -> bool {
        if self.stop_requested() {
            return false;
        }
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wake.notified() => {}
            }
        }
        !self.stop_requested()
    }

    fn finish(&self) {
        let snapshots = {
            let mut run = lock(&self.run);
            run.played.fill(false);
            run.index = 0;
            run.scheduler = None;
            std::mem::take(&mut run.snapshots)
        };
        if self.restore_on_end() {
            restore(&snapshots);
        }
        lock(&self.run).active = false;
        info!(effect = %self.definition.name, "Effect ended");
        self.events.publish(EffectEvent::Ended);
    }

    /// Runs step `index` and decides what follows it.
    pub fn play_step(&self, index: usize) -> Schedule {
        let step = &self.definition.choreo[index];
        for command in &step.cmds {
            self.run_command(command);
        }

        let mut run = lock(&self.run);
        run.index = index;
        run.played[index] = true;
        let linger = draw_linger(step);

        let next = if step.random_next {
            pick_random(&self.definition.choreo, &run.played, self.definition.ignore_played)
        } else {
            Some(index + 1).filter(|&next| next < self.definition.choreo.len())
        };

        match next {
            Some(next) => Schedule::Step(next, linger),
            None if self.looped => {
                run.played.fill(false);
                let next = if step.random_next {
                    pick_random(&self.definition.choreo, &run.played, self.definition.ignore_played).unwrap_or(0)
                } else {
                    0
                };
                Schedule::Step(next, linger)
            }
            // A one-shot run with no eligible random step left ends instead of
            // wrapping back to step 0.
            None => Schedule::End(linger),
        }
    }

    fn capture(&self) -> Vec<(Arc<Light>, ColorSnapshot)> {
        self.zones
            .iter()
            .flatten()
            .map(|light| {
                let snapshot = ColorSnapshot {
                    hue: light.hue(),
                    saturation: light.saturation(),
                    dim: light.dim_level(),
                    temperature: light.temperature(),
                };
                (Arc::clone(light), snapshot)
            })
            .collect()
    }

    fn resolve_zones(&self, selector: ZoneSelector) -> Vec<usize> {
        match selector {
            ZoneSelector::All => (0..self.zones.len()).collect(),
            ZoneSelector::Random => vec![rand::thread_rng().gen_range(0..self.zones.len())],
            ZoneSelector::Index(index) if index < self.zones.len() => vec![index],
            ZoneSelector::Index(index) => {
                warn!(effect = %self.definition.name, index, "command targets a missing zone");
                Vec::new()
            }
        }
    }

    pub fn run_command(&self, command: &EffectCommand) {
        let mut rng = rand::thread_rng();
        let per_run = match (&command.color, command.color_mode) {
            (ColorSpec::Channels(min), RandomMode::PerRun | RandomMode::PerApply) => {
                ColorSpec::Channels(randomize(&mut rng, min, command.color_max.as_ref()))
            }
            (color, _) => color.clone(),
        };

        let mut length = draw_length(&mut rng, command);
        for zone in self.resolve_zones(command.selector()) {
            if command.length_mode == RandomMode::PerApply {
                length = draw_length(&mut rng, command);
            }
            for light in &self.zones[zone] {
                if !light.supports_color() {
                    continue;
                }
                let color = match (&per_run, &command.color, command.color_mode) {
                    (ColorSpec::Channels(_), ColorSpec::Channels(min), RandomMode::PerApply) => {
                        ColorSpec::Channels(randomize(&mut rng, min, command.color_max.as_ref()))
                    }
                    (color, _, _) => color.clone(),
                };
                match command.kind {
                    CommandKind::SetColor => apply_color(light, &color, length),
                    CommandKind::SetWaveform => send_waveform(light, &color, length, command),
                }
            }
        }
    }
}

fn draw_linger(step: &Step) -> Duration {
    let millis = match step.linger_max {
        Some(max) if max > step.linger => rand::thread_rng().gen_range(step.linger..=max),
        _ => step.linger,
    };
    Duration::from_millis(millis)
}

fn draw_length<R: Rng + ?Sized>(rng: &mut R, command: &EffectCommand) -> Duration {
    let millis = match (command.length_mode, command.length_max) {
        (RandomMode::Off, _) | (_, None) => command.length as f64,
        (_, Some(max)) => random_between(rng, command.length as f64, max as f64, false),
    };
    Duration::from_millis(millis as u64)
}

/// Uniform choice over steps not yet played (unless played steps are
/// ignored) and not blocked.
fn pick_random(steps: &[Step], played: &[bool], ignore_played: bool) -> Option<usize> {
    let eligible: Vec<usize> = steps
        .iter()
        .enumerate()
        .filter(|(idx, step)| !step.random_block && (ignore_played || !played[*idx]))
        .map(|(idx, _)| idx)
        .collect();
    eligible.choose(&mut rand::thread_rng()).copied()
}

fn randomize<R: Rng + ?Sized>(rng: &mut R, min: &Channels, max: Option<&Channels>) -> Channels {
    let max = max.copied().unwrap_or(*min);
    let draw = |rng: &mut R, lo: Option<f64>, hi: Option<f64>, decimals: bool| {
        lo.map(|lo| random_between(rng, lo, hi.unwrap_or(lo), decimals))
    };
    Channels {
        hue: draw(rng, min.hue, max.hue, false),
        saturation: draw(rng, min.saturation, max.saturation, false),
        brightness: draw(rng, min.brightness, max.brightness, false),
        kelvin: draw(rng, min.kelvin, max.kelvin, true),
    }
}

fn apply_color(light: &Arc<Light>, color: &ColorSpec, duration: Duration) {
    let hsbk = match color {
        ColorSpec::Hex(hex) => {
            let Ok(hsbk) = Hsbk::from_hex(hex) else { return };
            light.update_core_data(
                Some(hsbk.hue),
                Some(hsbk.saturation / 100.0),
                Some(hsbk.brightness / 100.0),
                None,
            );
            Hsbk {
                kelvin: HEX_KELVIN,
                ..hsbk
            }
        }
        ColorSpec::Channels(channels) => {
            let temperature = channels.kelvin.unwrap_or_else(|| light.temperature());
            let hsbk = Hsbk {
                hue: channels.hue.unwrap_or_else(|| light.hue()),
                saturation: channels.saturation.unwrap_or_else(|| light.saturation() * 100.0),
                brightness: channels.brightness.unwrap_or_else(|| light.dim_level() * 100.0),
                kelvin: kelvin_for(light.temperature_range(), temperature),
            };
            light.update_core_data(
                channels.hue,
                channels.saturation.map(|s| s / 100.0),
                channels.brightness.map(|b| b / 100.0),
                channels.kelvin,
            );
            hsbk
        }
    };
    let light = Arc::clone(light);
    tokio::spawn(async move { light.direct_color(hsbk, duration).await });
}

fn send_waveform(light: &Arc<Light>, color: &ColorSpec, period: Duration, command: &EffectCommand) {
    let hw = match color {
        ColorSpec::Hex(hex) => match Hsbk::from_hex(hex) {
            Ok(hsbk) => hsbk.to_hardware(),
            Err(_) => return,
        },
        ColorSpec::Channels(channels) => hardware_color(
            channels.hue.unwrap_or_else(|| light.hue()),
            channels.saturation.unwrap_or_else(|| light.saturation() * 100.0),
            channels.brightness.unwrap_or_else(|| light.dim_level() * 100.0),
            channels.kelvin.unwrap_or_else(|| light.temperature()),
            light.temperature_range(),
        ),
    };
    let packet = waveform_packet(hw, period, command.repeats, command.wave, command.skew, command.transient);
    let light = Arc::clone(light);
    tokio::spawn(async move { light.send_packet(packet).await });
}

/// Puts every light back to its pre-run colour: through the setters, with a
/// direct write, and into confirmed state once more after that write.
fn restore(snapshots: &[(Arc<Light>, ColorSnapshot)]) {
    for (light, snap) in snapshots {
        light.set_light_color(snap.hue, None);
        light.set_light_saturation(snap.saturation, None);
        light.set_dim_level(snap.dim, None);
        light.set_light_temperature(snap.temperature, None);

        let hsbk = Hsbk {
            hue: snap.hue,
            saturation: snap.saturation * 100.0,
            brightness: snap.dim * 100.0,
            kelvin: kelvin_for(light.temperature_range(), snap.temperature),
        };
        let transition = light.default_transition();
        let target = Arc::clone(light);
        let snap = *snap;
        tokio::spawn(async move {
            target.direct_color(hsbk, transition).await;
            target.update_core_data(Some(snap.hue), Some(snap.saturation), Some(snap.dim), Some(snap.temperature));
        });
        light.update_core_data(Some(snap.hue), Some(snap.saturation), Some(snap.dim), Some(snap.temperature));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(random_next: bool, random_block: bool) -> Step {
        Step {
            linger: 0,
            linger_max: None,
            random_next,
            random_block,
            cmds: Vec::new(),
        }
    }

    #[test]
    fn random_pick_skips_played_and_blocked() {
        let steps = vec![step(true, false), step(true, true), step(true, false), step(true, false)];
        let played = vec![true, false, false, true];
        for _ in 0..50 {
            assert_eq!(pick_random(&steps, &played, false), Some(2));
        }
        assert_eq!(pick_random(&steps, &[true, false, true, true], false), None);
        let any = pick_random(&steps, &[true; 4], true).unwrap();
        assert_ne!(any, 1);
    }

    #[test]
    fn linger_stays_within_bounds() {
        let mut s = step(false, false);
        s.linger = 100;
        s.linger_max = Some(200);
        for _ in 0..50 {
            let linger = draw_linger(&s);
            assert!(linger >= Duration::from_millis(100) && linger <= Duration::from_millis(200));
        }
        s.linger_max = None;
        assert_eq!(draw_linger(&s), Duration::from_millis(100));
    }

    #[test]
    fn randomize_only_touches_set_channels() {
        let min = Channels {
            hue: Some(10.0),
            kelvin: Some(0.2),
            ..Default::default()
        };
        let max = Channels {
            hue: Some(20.0),
            kelvin: Some(0.4),
            ..Default::default()
        };
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let out = randomize(&mut rng, &min, Some(&max));
            let hue = out.hue.unwrap();
            assert!((10.0..20.0).contains(&hue));
            assert!(out.saturation.is_none() && out.brightness.is_none());
            let kelvin = out.kelvin.unwrap();
            assert!((0.2..=0.4).contains(&kelvin));
            assert_eq!((kelvin * 100.0).round() / 100.0, kelvin);
        }
    }
}
