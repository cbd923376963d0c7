// catalog/mod.rs
//! Static product knowledge: capabilities, energy usage and switch layouts
//! keyed by vendor and product id.

use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use utoipa::ToSchema;

use crate::error::AppError;

const EMBEDDED_PRODUCTS: &str = include_str!("products.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TemperatureRange {
    pub min: u16,
    pub max: u16,
}

impl Default for TemperatureRange {
    fn default() -> Self {
        Self { min: 3500, max: 3500 }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, ToSchema)]
pub struct Capabilities {
    pub name: String,
    pub vendor_name: String,
    pub color: bool,
    pub chain: bool,
    pub matrix: bool,
    pub infrared: bool,
    pub multizone: bool,
    pub hev: bool,
    pub relays: bool,
    pub buttons: bool,
    /// Absent when the product has a single fixed white point.
    pub temperature_range: Option<TemperatureRange>,
}

/// Watts drawn at full brightness and in standby.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct EnergyUsage {
    pub usage_on: f64,
    pub usage_off: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct SwitchLayout {
    pub relays: u8,
    pub buttons: u8,
    /// Self consumption in watts indexed by the number of pulled relays.
    pub levels: Vec<f64>,
}

pub trait ProductCatalog: Send + Sync {
    fn lookup_capabilities(
        &self,
        vendor_id: u32,
        product_id: u32,
        fw_major: u16,
        fw_minor: u16,
    ) -> Option<Capabilities>;

    fn lookup_energy(&self, vendor_id: u32, product_id: u32) -> Option<EnergyUsage>;

    fn lookup_switch(&self, vendor_id: u32, product_id: u32) -> Option<SwitchLayout>;
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Features {
    color: Option<bool>,
    chain: Option<bool>,
    matrix: Option<bool>,
    infrared: Option<bool>,
    multizone: Option<bool>,
    hev: Option<bool>,
    relays: Option<bool>,
    buttons: Option<bool>,
    temperature_range: Option<[u16; 2]>,
}

impl Features {
    fn overlay(&mut self, other: &Features) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(color, chain, matrix, infrared, multizone, hev, relays, buttons, temperature_range);
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Upgrade {
    major: u16,
    minor: u16,
    features: Features,
}

#[derive(Debug, Clone, Deserialize)]
struct Product {
    pid: u32,
    name: String,
    #[serde(default)]
    features: Features,
    #[serde(default)]
    upgrades: Vec<Upgrade>,
}

#[derive(Debug, Clone, Deserialize)]
struct Vendor {
    vid: u32,
    name: String,
    products: Vec<Product>,
}

/// Catalog backed by a products index in the vendor's published JSON layout.
#[derive(Debug, Clone)]
pub struct JsonCatalog {
    vendors: Vec<Vendor>,
}

impl JsonCatalog {
    pub fn embedded() -> Result<Self, AppError> {
        Self::from_json(EMBEDDED_PRODUCTS)
    }

    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        let vendors: Vec<Vendor> = serde_json::from_str(raw)?;
        Ok(Self { vendors })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let raw = fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("reading {}: {}", path.as_ref().display(), e))?;
        Self::from_json(&raw)
    }

    /// Every vendor/product pair with its display name.
    pub fn products(&self) -> impl Iterator<Item = (u32, u32, &str)> {
        self.vendors
            .iter()
            .flat_map(|v| v.products.iter().map(move |p| (v.vid, p.pid, p.name.as_str())))
    }
}

fn version_satisfies(min_major: u16, min_minor: u16, major: u16, minor: u16) -> bool {
    (major, minor) >= (min_major, min_minor)
}

impl ProductCatalog for JsonCatalog {
    fn lookup_capabilities(
        &self,
        vendor_id: u32,
        product_id: u32,
        fw_major: u16,
        fw_minor: u16,
    ) -> Option<Capabilities> {
        let vendor = self.vendors.iter().find(|v| v.vid == vendor_id)?;
        let product = vendor.products.iter().find(|p| p.pid == product_id)?;

        let mut features = product.features.clone();
        for upgrade in &product.upgrades {
            if version_satisfies(upgrade.major, upgrade.minor, fw_major, fw_minor) {
                features.overlay(&upgrade.features);
            }
        }

        let temperature_range = features
            .temperature_range
            .filter(|[min, max]| min != max)
            .map(|[min, max]| TemperatureRange { min, max });

        Some(Capabilities {
            name: product.name.clone(),
            vendor_name: vendor.name.clone(),
            color: features.color.unwrap_or(false),
            chain: features.chain.unwrap_or(false),
            matrix: features.matrix.unwrap_or(false),
            infrared: features.infrared.unwrap_or(false),
            multizone: features.multizone.unwrap_or(false),
            hev: features.hev.unwrap_or(false),
            relays: features.relays.unwrap_or(false),
            buttons: features.buttons.unwrap_or(false),
            temperature_range,
        })
    }

    fn lookup_energy(&self, vendor_id: u32, product_id: u32) -> Option<EnergyUsage> {
        ENERGY_DATA
            .iter()
            .find(|(vid, pid, _, _)| *vid == vendor_id && *pid == product_id)
            .map(|&(_, _, usage_on, usage_off)| EnergyUsage { usage_on, usage_off })
    }

    fn lookup_switch(&self, vendor_id: u32, product_id: u32) -> Option<SwitchLayout> {
        SWITCH_DATA
            .iter()
            .find(|(vid, pid, _, _, _)| *vid == vendor_id && *pid == product_id)
            .map(|&(_, _, relays, buttons, levels)| SwitchLayout {
                relays,
                buttons,
                levels: levels.to_vec(),
            })
    }
}

// (vendor, product, usage on, usage off)
const ENERGY_DATA: &[(u32, u32, f64, f64)] = &[
    (1, 1, 17.0, 1.7),
    (1, 3, 11.5, 1.5),
    (1, 10, 11.0, 0.7),
    (1, 11, 11.0, 0.7),
    (1, 18, 11.0, 0.7),
    (1, 20, 11.0, 0.7),
    (1, 22, 11.0, 0.7),
    (1, 27, 11.0, 0.47),
    (1, 28, 11.0, 0.47),
    (1, 29, 11.0, 0.47),
    (1, 30, 11.0, 0.47),
    (1, 36, 13.0, 0.5),
    (1, 37, 13.0, 0.5),
    (1, 49, 9.0, 0.47),
    (1, 50, 9.0, 0.47),
    (1, 51, 9.0, 0.47),
    (1, 52, 6.0, 0.47),
    (1, 57, 8.5, 0.2),
    (1, 59, 8.5, 0.2),
    (1, 62, 10.5, 0.2),
    (1, 68, 4.5, 0.2),
    (1, 90, 11.5, 0.2),
    (1, 91, 8.5, 0.2),
    (1, 92, 8.5, 0.2),
    (1, 97, 11.5, 0.2),
    (1, 99, 11.5, 0.2),
    (1, 109, 11.5, 0.2),
];

// (vendor, product, relays, buttons, self consumption by pulled relays)
const SWITCH_DATA: &[(u32, u32, u8, u8, &[f64])] = &[
    (1, 70, 4, 4, &[0.37, 0.68, 0.96, 1.27, 1.6]),
    (1, 71, 4, 4, &[0.37, 0.68, 0.96, 1.27, 1.6]),
    (1, 89, 4, 4, &[0.44, 0.74, 1.04, 1.32, 1.68]),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_index_parses() {
        let catalog = JsonCatalog::embedded().unwrap();
        assert!(catalog.products().any(|(_, pid, _)| pid == 22));
    }

    #[test]
    fn unknown_product_is_none() {
        let catalog = JsonCatalog::embedded().unwrap();
        assert!(catalog.lookup_capabilities(1, 9999, 3, 70).is_none());
        assert!(catalog.lookup_capabilities(42, 22, 3, 70).is_none());
    }

    #[test]
    fn firmware_upgrades_overlay_features() {
        let catalog = JsonCatalog::embedded().unwrap();
        let old = catalog.lookup_capabilities(1, 91, 3, 60).unwrap();
        assert_eq!(old.temperature_range, Some(TemperatureRange { min: 2500, max: 9000 }));
        let new = catalog.lookup_capabilities(1, 91, 3, 70).unwrap();
        assert_eq!(new.temperature_range, Some(TemperatureRange { min: 1500, max: 9000 }));
        let newer_major = catalog.lookup_capabilities(1, 91, 4, 0).unwrap();
        assert_eq!(newer_major.temperature_range.unwrap().min, 1500);
    }

    #[test]
    fn fixed_white_point_has_no_temperature_support() {
        let catalog = JsonCatalog::embedded().unwrap();
        let mini = catalog.lookup_capabilities(1, 51, 3, 70).unwrap();
        assert!(mini.temperature_range.is_none());
        assert!(!mini.color);
    }

    #[test]
    fn energy_and_switch_tables() {
        let catalog = JsonCatalog::embedded().unwrap();
        assert_eq!(catalog.lookup_energy(1, 1).unwrap().usage_on, 17.0);
        assert!(catalog.lookup_energy(1, 31).is_none());
        let switch = catalog.lookup_switch(1, 89).unwrap();
        assert_eq!(switch.relays, 4);
        assert_eq!(switch.levels.len(), 5);
    }
}
