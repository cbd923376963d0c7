// color.rs
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{error::AppError, utils::scale_to_u16};

/// Kelvin the protocol pairs with colours parsed from RGB hex codes.
pub const HEX_KELVIN: u16 = 3500;

/// Colour in the units the transport's `color` call takes:
/// hue in degrees, saturation and brightness in percent, kelvin absolute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Hsbk {
    pub hue: f64,
    pub saturation: f64,
    pub brightness: f64,
    pub kelvin: u16,
}

/// Raw 16-bit colour as it travels inside packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct HwColor {
    pub hue: u16,
    pub saturation: u16,
    pub brightness: u16,
    pub kelvin: u16,
}

impl Hsbk {
    pub fn from_hex(hex: &str) -> Result<Self, AppError> {
        let (r, g, b) = parse_hex(hex)?;
        let (hue, saturation, brightness) = rgb_to_hsb(r, g, b);
        Ok(Self {
            hue,
            saturation,
            brightness,
            kelvin: HEX_KELVIN,
        })
    }

    pub fn to_hardware(self) -> HwColor {
        HwColor {
            hue: scale_to_u16(0.0, 360.0, self.hue),
            saturation: scale_to_u16(0.0, 100.0, self.saturation),
            brightness: scale_to_u16(0.0, 100.0, self.brightness),
            kelvin: self.kelvin,
        }
    }
}

/// Parses `#rrggbb`, `rrggbb`, `#rgb` or `rgb`.
pub fn parse_hex(hex: &str) -> Result<(u8, u8, u8), AppError> {
    let digits = hex.trim().trim_start_matches('#');
    let invalid = || AppError::Validation(format!("invalid hex colour: {hex}"));
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let expanded: String = match digits.len() {
        3 => digits.chars().flat_map(|c| [c, c]).collect(),
        6 => digits.to_string(),
        _ => return Err(invalid()),
    };
    let channel = |i: usize| u8::from_str_radix(&expanded[i..i + 2], 16).map_err(|_| invalid());
    Ok((channel(0)?, channel(2)?, channel(4)?))
}

/// Hue in whole degrees, saturation and brightness in whole percent.
pub fn rgb_to_hsb(r: u8, g: u8, b: u8) -> (f64, f64, f64) {
    let (r, g, b) = (r as f64 / 255.0, g as f64 / 255.0, b as f64 / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let brightness = max * 100.0;
    let saturation = if max == 0.0 { 0.0 } else { delta / max * 100.0 };
    let mut hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    if hue < 0.0 {
        hue += 360.0;
    }
    (hue.round() % 360.0, saturation.round(), brightness.round())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_colours() {
        assert_eq!(rgb_to_hsb(255, 0, 0), (0.0, 100.0, 100.0));
        assert_eq!(rgb_to_hsb(0, 255, 0), (120.0, 100.0, 100.0));
        assert_eq!(rgb_to_hsb(0, 0, 255), (240.0, 100.0, 100.0));
        assert_eq!(rgb_to_hsb(255, 0, 255), (300.0, 100.0, 100.0));
    }

    #[test]
    fn greys_have_no_saturation() {
        assert_eq!(rgb_to_hsb(0, 0, 0), (0.0, 0.0, 0.0));
        assert_eq!(rgb_to_hsb(255, 255, 255), (0.0, 0.0, 100.0));
    }

    #[test]
    fn hex_forms() {
        assert_eq!(parse_hex("#FF8000").unwrap(), (255, 128, 0));
        assert_eq!(parse_hex(" f80 ").unwrap(), (255, 136, 0));
        assert!(parse_hex("#12345").is_err());
        assert!(parse_hex("zzzzzz").is_err());
    }

    #[test]
    fn hex_to_hardware_colour() {
        let hw = Hsbk::from_hex("#0000ff").unwrap().to_hardware();
        assert_eq!(hw.hue, 43690);
        assert_eq!(hw.saturation, 65535);
        assert_eq!(hw.brightness, 65535);
        assert_eq!(hw.kelvin, HEX_KELVIN);
    }
}
