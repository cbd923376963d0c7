mod common;

use common::{Fixture, bulb, color_calls, hsbk};
use lanlight::{
    effects::{Effect, EffectDefinition, EffectEvent, EffectRegistry, PlayOptions},
    error::AppError,
    transport::{
        Packet, Waveform,
        sim::{SimCall, SimLight},
    },
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;

fn definition(value: serde_json::Value) -> EffectDefinition {
    serde_json::from_value(value).unwrap()
}

fn keep_last_colour() -> PlayOptions {
    PlayOptions {
        restore_on_end: false,
        ..Default::default()
    }
}

fn ended_count(events: &mut tokio::sync::broadcast::Receiver<EffectEvent>) -> usize {
    let mut count = 0;
    while let Ok(EffectEvent::Ended) = events.try_recv() {
        count += 1;
    }
    count
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[tokio::test(start_paused = true)]
async fn effect_restores_the_starting_colour() {
    // White at 40 %, 5750 K sits in the middle of the 2500..9000 range.
    let fx = Fixture::new(vec![bulb("a").with_color(hsbk(200.0, 0.0, 40.0, 5750), true)]).await;
    let light = fx.ready("a").await;
    let sim = fx.sim("a");
    assert!(close(light.dim_level(), 0.4));
    assert!(close(light.temperature(), 0.5));

    let effect = Arc::new(
        Effect::new(
            definition(json!({
                "Name": "Warm sweep",
                "Choreo": [{ "Linger": 200, "Cmds": [{
                    "Zone": 0, "Type": 0, "Color": { "H": 30, "S": 100, "B": 90, "K": 0.25 }, "Len": 100
                }] }]
            })),
            vec![vec![light.clone()]],
            PlayOptions::default(),
        )
        .unwrap(),
    );
    let mut events = effect.subscribe();
    assert!(effect.start());
    assert!(effect.active());

    sleep(Duration::from_millis(50)).await;
    let (swept, duration) = *color_calls(&sim).last().unwrap();
    assert_eq!(swept, hsbk(30.0, 100.0, 90.0, 7375));
    assert_eq!(duration, Duration::from_millis(100));
    assert_eq!(light.hue(), 30.0);
    assert!(close(light.dim_level(), 0.9));
    assert!(close(light.temperature(), 0.25));

    sleep(Duration::from_secs(2)).await;
    assert!(!effect.active());
    assert_eq!(ended_count(&mut events), 1);
    assert_eq!(light.hue(), 200.0);
    assert_eq!(light.saturation(), 0.0);
    assert!(close(light.dim_level(), 0.4));
    assert!(close(light.temperature(), 0.5));

    let restored = sim.color();
    assert_eq!(restored.hue, 200.0);
    assert_eq!(restored.saturation, 0.0);
    assert!(close(restored.brightness, 40.0));
    assert_eq!(restored.kelvin, 5750);
}

#[tokio::test(start_paused = true)]
async fn restore_can_be_turned_off_before_the_run() {
    let fx = Fixture::new(vec![bulb("a").with_color(hsbk(0.0, 0.0, 100.0, 3500), true)]).await;
    let light = fx.ready("a").await;
    let sim = fx.sim("a");
    let registry = EffectRegistry::new();
    let mut notices = registry.subscribe();

    // Finishes inside start() plus one yield.
    let def = definition(json!({
        "Name": "Instant green",
        "InitLinger": 0,
        "Choreo": [{ "Linger": 0, "Cmds": [{ "Zone": 0, "Type": 0, "Color": "#00ff00", "Len": 0 }] }]
    }));
    let id = registry.start(def, vec![vec![light.clone()]], keep_last_colour()).unwrap();

    sleep(Duration::from_secs(2)).await;
    assert_eq!(notices.try_recv().unwrap().id, id);
    assert!(registry.list().is_empty());
    assert_eq!(light.hue(), 120.0);
    assert_eq!(light.saturation(), 1.0);
    assert_eq!(sim.color().hue, 120.0);
    assert_eq!(color_calls(&sim).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stopping_a_looped_effect_ends_it_once() {
    let fx = Fixture::new(vec![bulb("a")]).await;
    let light = fx.ready("a").await;

    let effect = Arc::new(
        Effect::new(
            definition(json!({
                "Name": "Blink",
                "Looped": true,
                "Choreo": [
                    { "Linger": 100, "Cmds": [{ "AllZ": true, "Type": 0, "Color": "#ffffff" }] },
                    { "Linger": 100, "Cmds": [{ "AllZ": true, "Type": 0, "Color": "#000000" }] }
                ]
            })),
            vec![vec![light.clone()]],
            PlayOptions::default(),
        )
        .unwrap(),
    );
    let mut events = effect.subscribe();
    assert!(effect.start());
    assert!(!effect.start());

    sleep(Duration::from_secs(3)).await;
    assert!(effect.active());
    assert_eq!(ended_count(&mut events), 0);

    effect.stop();
    effect.stop();
    sleep(Duration::from_millis(500)).await;
    assert!(effect.active());

    sleep(Duration::from_secs(2)).await;
    assert!(!effect.active());
    assert_eq!(ended_count(&mut events), 1);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(ended_count(&mut events), 0);
}

#[tokio::test(start_paused = true)]
async fn looped_effect_plays_whole_cycles_until_stopped() {
    let fx = Fixture::new(vec![bulb("a")]).await;
    let light = fx.ready("a").await;
    let sim = fx.sim("a");
    sim.clear_calls();

    let effect = Arc::new(
        Effect::new(
            definition(json!({
                "Name": "Red blue",
                "Choreo": [
                    { "Linger": 100, "Cmds": [{ "Zone": 0, "Type": 0, "Color": "#ff0000" }] },
                    { "Linger": 100, "Cmds": [{ "Zone": 0, "Type": 0, "Color": "#0000ff" }] }
                ]
            })),
            vec![vec![light.clone()]],
            PlayOptions {
                looped: true,
                restore_on_end: false,
            },
        )
        .unwrap(),
    );
    assert!(effect.looped());
    let mut events = effect.subscribe();
    assert!(effect.start());

    // Steps land at 0, 100, 200 and 300 ms: two cycles of two steps.
    sleep(Duration::from_millis(350)).await;
    effect.stop();
    sleep(Duration::from_secs(2)).await;
    assert_eq!(ended_count(&mut events), 1);

    let hues: Vec<f64> = color_calls(&sim).iter().map(|(color, _)| color.hue).collect();
    assert_eq!(hues, vec![0.0, 240.0, 0.0, 240.0]);
}

#[tokio::test(start_paused = true)]
async fn random_next_with_every_step_blocked() {
    let fx = Fixture::new(vec![bulb("a")]).await;
    let light = fx.ready("a").await;
    let sim = fx.sim("a");
    sim.clear_calls();

    let choreo = json!([
        { "Linger": 100, "RndNext": true, "RndBlock": true, "Cmds": [{ "Zone": 0, "Type": 0, "Color": "#ff0000" }] },
        { "Linger": 100, "RndNext": true, "RndBlock": true, "Cmds": [{ "Zone": 0, "Type": 0, "Color": "#0000ff" }] }
    ]);

    // One-shot: the first step plays, then nothing is eligible.
    let once = Arc::new(
        Effect::new(
            definition(json!({ "Name": "Blocked", "Choreo": choreo.clone() })),
            vec![vec![light.clone()]],
            keep_last_colour(),
        )
        .unwrap(),
    );
    let mut events = once.subscribe();
    assert!(once.start());
    sleep(Duration::from_secs(1)).await;
    assert!(!once.active());
    assert_eq!(ended_count(&mut events), 1);
    let hues: Vec<f64> = color_calls(&sim).iter().map(|(color, _)| color.hue).collect();
    assert_eq!(hues, vec![0.0]);

    // Looped: falls back to the first step every time.
    sim.clear_calls();
    let looped = Arc::new(
        Effect::new(
            definition(json!({ "Name": "Blocked loop", "Looped": true, "Choreo": choreo })),
            vec![vec![light.clone()]],
            keep_last_colour(),
        )
        .unwrap(),
    );
    assert!(looped.start());
    sleep(Duration::from_millis(250)).await;
    assert!(looped.active());
    let hues: Vec<f64> = color_calls(&sim).iter().map(|(color, _)| color.hue).collect();
    assert_eq!(hues, vec![0.0, 0.0, 0.0]);
    looped.stop();
}

#[tokio::test(start_paused = true)]
async fn random_next_plays_every_step_once() {
    let fx = Fixture::new(vec![bulb("a")]).await;
    let light = fx.ready("a").await;
    let sim = fx.sim("a");

    let step = |hex: &str| json!({ "Linger": 20, "RndNext": true, "Cmds": [{ "Zone": 0, "Type": 0, "Color": hex }] });
    let effect = Arc::new(
        Effect::new(
            definition(json!({
                "Name": "Shuffle",
                "Choreo": [step("#ff0000"), step("#ffff00"), step("#00ff00"), step("#0000ff")]
            })),
            vec![vec![light.clone()]],
            keep_last_colour(),
        )
        .unwrap(),
    );

    for _ in 0..5 {
        sim.clear_calls();
        let mut events = effect.subscribe();
        assert!(effect.start());
        sleep(Duration::from_secs(1)).await;
        assert_eq!(ended_count(&mut events), 1);

        let calls = color_calls(&sim);
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0].0.hue, 0.0);
        let mut hues: Vec<i64> = calls.iter().map(|(color, _)| color.hue.round() as i64).collect();
        hues.sort_unstable();
        assert_eq!(hues, vec![0, 60, 120, 240]);
    }
}

#[tokio::test(start_paused = true)]
async fn blocked_steps_are_never_drawn() {
    let fx = Fixture::new(vec![bulb("a")]).await;
    let light = fx.ready("a").await;
    let sim = fx.sim("a");

    let effect = Arc::new(
        Effect::new(
            definition(json!({
                "Name": "Intro",
                "Choreo": [
                    { "Linger": 10, "RndNext": true, "RndBlock": true, "Cmds": [{ "Zone": 0, "Type": 0, "Color": "#ff0000" }] },
                    { "Linger": 10, "RndNext": true, "Cmds": [{ "Zone": 0, "Type": 0, "Color": "#0000ff" }] }
                ]
            })),
            vec![vec![light.clone()]],
            keep_last_colour(),
        )
        .unwrap(),
    );
    assert!(effect.start());
    sleep(Duration::from_secs(1)).await;

    let hues: Vec<f64> = color_calls(&sim).iter().map(|(color, _)| color.hue).collect();
    assert_eq!(hues, vec![0.0, 240.0]);
    assert!(!effect.active());
}

#[tokio::test(start_paused = true)]
async fn waveforms_go_out_as_packets() {
    let fx = Fixture::new(vec![bulb("a")]).await;
    let light = fx.ready("a").await;
    let sim = fx.sim("a");
    sim.clear_calls();

    let effect = Arc::new(
        Effect::new(
            definition(json!({
                "Name": "Pulse",
                "Choreo": [{ "Linger": 10, "Cmds": [{
                    "Zone": 0, "Type": 1, "Color": { "H": 180, "S": 100, "B": 50 },
                    "Len": 400, "Rep": 3, "Skew": 0.25, "Wave": "PULSE", "Trans": true
                }] }]
            })),
            vec![vec![light.clone()]],
            keep_last_colour(),
        )
        .unwrap(),
    );
    assert!(effect.start());
    sleep(Duration::from_millis(100)).await;

    let packets: Vec<Packet> = sim
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            SimCall::Packet(packet) => Some(packet),
            _ => None,
        })
        .collect();
    assert_eq!(packets.len(), 1);
    match &packets[0] {
        Packet::SetWaveform {
            transient,
            color,
            period,
            cycles,
            skew_ratio,
            waveform,
        } => {
            assert!(transient);
            assert_eq!(*period, Duration::from_millis(400));
            assert_eq!(*cycles, 3.0);
            assert_eq!(*skew_ratio, 0.25);
            assert_eq!(*waveform, Waveform::Pulse);
            assert_eq!(color.hue, 32768);
            assert_eq!(color.saturation, 65535);
            assert_eq!(color.brightness, 32768);
        }
        other => panic!("unexpected packet {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn lights_without_colour_are_skipped() {
    let fx = Fixture::new(vec![SimLight::new("w", common::address(60)).with_label("White").with_product(1, 10)]).await;
    let light = fx.ready("w").await;
    let sim = fx.sim("w");
    sim.clear_calls();

    let effect = Arc::new(
        Effect::new(
            definition(json!({
                "Name": "Red",
                "Choreo": [{ "Linger": 10, "Cmds": [{ "AllZ": true, "Type": 0, "Color": "#ff0000" }] }]
            })),
            vec![vec![light]],
            keep_last_colour(),
        )
        .unwrap(),
    );
    assert!(effect.start());
    sleep(Duration::from_millis(200)).await;
    assert!(color_calls(&sim).is_empty());
}

#[tokio::test(start_paused = true)]
async fn too_few_zones_are_rejected() {
    let fx = Fixture::new(vec![bulb("a")]).await;
    let light = fx.ready("a").await;

    let def = definition(json!({
        "Name": "Two zones",
        "Choreo": [{ "Cmds": [{ "Zone": 1, "Type": 0, "Color": "#ff0000" }] }]
    }));
    let result = Effect::new(def, vec![vec![light]], PlayOptions::default());
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[tokio::test(start_paused = true)]
async fn registry_tracks_runs_until_they_end() {
    let fx = Fixture::new(vec![bulb("a")]).await;
    let light = fx.ready("a").await;
    let registry = EffectRegistry::new();
    let mut notices = registry.subscribe();

    let empty = definition(json!({ "Name": "Nothing" }));
    assert!(matches!(
        registry.start(empty, vec![vec![light.clone()]], PlayOptions::default()),
        Err(AppError::Validation(_))
    ));

    let def = definition(json!({
        "Name": "Once",
        "Choreo": [{ "Linger": 100, "Cmds": [{ "Zone": 0, "Type": 0, "Color": "#ffffff" }] }]
    }));
    let id = registry.start(def, vec![vec![light]], PlayOptions::default()).unwrap();
    assert_eq!(registry.list().len(), 1);
    assert_eq!(registry.list()[0].name, "Once");

    sleep(Duration::from_secs(1)).await;
    assert!(registry.list().is_empty());
    let notice = notices.try_recv().unwrap();
    assert_eq!(notice.id, id);
    assert!(matches!(registry.stop(id), Err(AppError::EffectNotFound)));
}
