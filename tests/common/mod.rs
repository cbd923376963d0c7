#![allow(dead_code)]

use lanlight::{
    catalog::JsonCatalog,
    color::Hsbk,
    config::ControllerSettings,
    devices::Light,
    manager::Manager,
    transport::sim::{SimCall, SimLan, SimLight},
};
use std::{net::IpAddr, sync::Arc, time::Duration};

pub struct Fixture {
    pub lan: Arc<SimLan>,
    pub manager: Arc<Manager>,
}

impl Fixture {
    pub async fn new(lights: Vec<SimLight>) -> Self {
        Self::with_settings(ControllerSettings::default(), lights).await
    }

    pub async fn with_settings(settings: ControllerSettings, lights: Vec<SimLight>) -> Self {
        let lan = Arc::new(SimLan::new());
        for light in lights {
            lan.add_light(light);
        }
        let catalog = Arc::new(JsonCatalog::embedded().unwrap());
        let manager = Manager::new(settings, lan.clone(), catalog);
        manager.discover().await.unwrap();
        Self { lan, manager }
    }

    pub fn sim(&self, id: &str) -> Arc<SimLight> {
        self.lan.light(id).unwrap()
    }

    /// Waits until the light is registered and has completed its first poll.
    pub async fn ready(&self, id: &str) -> Arc<Light> {
        for _ in 0..200 {
            if let Some(light) = self.manager.device(id) {
                if light.is_ready() {
                    return light;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{id} never became ready");
    }

    pub async fn registered(&self, id: &str) -> Arc<Light> {
        for _ in 0..200 {
            if let Some(light) = self.manager.device(id) {
                return light;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{id} was never discovered");
    }
}

pub fn address(last: u8) -> IpAddr {
    IpAddr::from([192, 168, 1, last])
}

pub fn bulb(id: &str) -> SimLight {
    SimLight::new(id, address(10)).with_label("Desk")
}

pub fn hsbk(hue: f64, saturation: f64, brightness: f64, kelvin: u16) -> Hsbk {
    Hsbk {
        hue,
        saturation,
        brightness,
        kelvin,
    }
}

pub fn color_calls(sim: &SimLight) -> Vec<(Hsbk, Duration)> {
    sim.calls()
        .into_iter()
        .filter_map(|call| match call {
            SimCall::Color(color, duration) => Some((color, duration)),
            _ => None,
        })
        .collect()
}

pub fn power_calls(sim: &SimLight) -> Vec<bool> {
    sim.calls()
        .into_iter()
        .filter_map(|call| match call {
            SimCall::On(_) => Some(true),
            SimCall::Off(_) => Some(false),
            _ => None,
        })
        .collect()
}
