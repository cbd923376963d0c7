// effects/definition.rs
//! Declarative effect files as stored in the effects library.

use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::{color::parse_hex, transport::Waveform};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "PascalCase")]
pub struct EffectDefinition {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    #[serde(default)]
    pub looped: bool,
    #[serde(default)]
    pub ignore_played: bool,
    #[serde(default)]
    #[validate(nested)]
    pub init_cmds: Vec<EffectCommand>,
    /// Milliseconds.
    #[serde(default)]
    pub init_linger: u64,
    #[serde(default)]
    #[validate(nested)]
    pub choreo: Vec<Step>,
}

impl EffectDefinition {
    /// Zone groups an effect needs: highest referenced zone index plus one.
    pub fn required_zones(&self) -> usize {
        self.choreo
            .iter()
            .flat_map(|step| step.cmds.iter())
            .chain(self.init_cmds.iter())
            .filter_map(|cmd| usize::try_from(cmd.zone).ok())
            .max()
            .map_or(1, |zone| zone + 1)
    }

    pub fn init_linger(&self) -> Duration {
        Duration::from_millis(self.init_linger)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "PascalCase")]
#[validate(schema(function = "check_linger"))]
pub struct Step {
    /// Milliseconds.
    #[serde(default)]
    pub linger: u64,
    #[serde(default)]
    pub linger_max: Option<u64>,
    #[serde(default, rename = "RndNext")]
    pub random_next: bool,
    /// Never picked by a random-next draw.
    #[serde(default, rename = "RndBlock")]
    pub random_block: bool,
    #[validate(nested)]
    pub cmds: Vec<EffectCommand>,
}

fn check_linger(step: &Step) -> Result<(), ValidationError> {
    match step.linger_max {
        Some(max) if max < step.linger => Err(ValidationError::new("linger_range")
            .with_message("LingerMax must not be below Linger".into())),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneSelector {
    All,
    Random,
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CommandKind {
    SetColor,
    SetWaveform,
}

impl TryFrom<u8> for CommandKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CommandKind::SetColor),
            1 => Ok(CommandKind::SetWaveform),
            other => Err(format!("unknown command type {other}")),
        }
    }
}

impl From<CommandKind> for u8 {
    fn from(kind: CommandKind) -> Self {
        match kind {
            CommandKind::SetColor => 0,
            CommandKind::SetWaveform => 1,
        }
    }
}

/// When randomized colours or lengths are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RandomMode {
    #[default]
    Off,
    /// Once per command execution.
    PerRun,
    /// Colour: per device. Length: per zone.
    PerApply,
}

impl TryFrom<u8> for RandomMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RandomMode::Off),
            1 => Ok(RandomMode::PerRun),
            2 => Ok(RandomMode::PerApply),
            other => Err(format!("unknown randomization mode {other}")),
        }
    }
}

impl From<RandomMode> for u8 {
    fn from(mode: RandomMode) -> Self {
        match mode {
            RandomMode::Off => 0,
            RandomMode::PerRun => 1,
            RandomMode::PerApply => 2,
        }
    }
}

/// Per-channel colour; unset channels keep the light's current value.
/// Hue in degrees, saturation and brightness in percent, kelvin normalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct Channels {
    #[serde(rename = "H", default)]
    #[validate(range(min = 0.0, max = 360.0))]
    pub hue: Option<f64>,
    #[serde(rename = "S", default)]
    #[validate(range(min = 0.0, max = 100.0))]
    pub saturation: Option<f64>,
    #[serde(rename = "B", default)]
    #[validate(range(min = 0.0, max = 100.0))]
    pub brightness: Option<f64>,
    #[serde(rename = "K", default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub kelvin: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColorSpec {
    Hex(String),
    Channels(Channels),
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "PascalCase")]
#[validate(schema(function = "check_command"))]
pub struct EffectCommand {
    #[serde(default, rename = "AllZ")]
    pub all_zones: bool,
    /// `-1` targets one random zone.
    #[serde(default)]
    #[validate(range(min = -1))]
    pub zone: i32,
    #[serde(rename = "Type")]
    pub kind: CommandKind,
    pub color: ColorSpec,
    #[serde(default)]
    pub color_max: Option<Channels>,
    #[serde(default, rename = "ColorRndMode")]
    pub color_mode: RandomMode,
    /// Milliseconds.
    #[serde(default, rename = "Len")]
    pub length: u64,
    #[serde(default, rename = "LenMax")]
    pub length_max: Option<u64>,
    #[serde(default, rename = "LenMode")]
    pub length_mode: RandomMode,
    #[serde(default, rename = "Rep")]
    #[validate(range(min = 0.0))]
    pub repeats: f32,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub skew: f32,
    #[serde(default, rename = "Trans")]
    pub transient: bool,
    #[serde(default = "default_waveform", deserialize_with = "waveform_name_or_index")]
    pub wave: Waveform,
}

impl EffectCommand {
    pub fn selector(&self) -> ZoneSelector {
        if self.all_zones {
            ZoneSelector::All
        } else if self.zone < 0 {
            ZoneSelector::Random
        } else {
            ZoneSelector::Index(self.zone as usize)
        }
    }
}

fn check_command(cmd: &EffectCommand) -> Result<(), ValidationError> {
    match &cmd.color {
        ColorSpec::Hex(hex) => {
            if parse_hex(hex).is_err() {
                return Err(ValidationError::new("color").with_message(format!("invalid hex colour {hex}").into()));
            }
        }
        ColorSpec::Channels(channels) => {
            channels.validate().map_err(|_| ValidationError::new("color_range"))?;
            if cmd.color_mode != RandomMode::Off {
                let max = cmd
                    .color_max
                    .ok_or_else(|| ValidationError::new("color_max").with_message("ColorMax is required for random colours".into()))?;
                max.validate().map_err(|_| ValidationError::new("color_range"))?;
            }
        }
    }
    if cmd.length_mode != RandomMode::Off {
        match cmd.length_max {
            Some(max) if max >= cmd.length => {}
            _ => {
                return Err(ValidationError::new("length_range")
                    .with_message("LenMax must be set and not below Len".into()));
            }
        }
    }
    Ok(())
}

fn default_waveform() -> Waveform {
    Waveform::Saw
}

fn waveform_name_or_index<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Waveform, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Name(Waveform),
        Index(u8),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Name(waveform) => Ok(waveform),
        Raw::Index(index) => match index {
            0 => Ok(Waveform::Saw),
            1 => Ok(Waveform::Sine),
            2 => Ok(Waveform::HalfSine),
            3 => Ok(Waveform::Triangle),
            4 => Ok(Waveform::Pulse),
            other => Err(serde::de::Error::custom(format!("unknown waveform {other}"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> EffectDefinition {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn parses_library_layout() {
        let def = parse(json!({
            "Name": "Police",
            "Looped": true,
            "InitLinger": 0,
            "InitCmds": [],
            "Choreo": [
                { "Linger": 500, "RndNext": true, "Cmds": [
                    { "Zone": 0, "Type": 0, "Color": "#ff0000", "Len": 100 }
                ]},
                { "Linger": 500, "Cmds": [
                    { "Zone": 1, "Type": 1, "Color": { "H": 240, "S": 100, "B": null, "K": null },
                      "Len": 300, "Rep": 2, "Skew": 0.5, "Wave": "PULSE", "Trans": true }
                ]}
            ]
        }));
        assert!(def.validate().is_ok());
        assert_eq!(def.required_zones(), 2);
        let cmd = &def.choreo[1].cmds[0];
        assert_eq!(cmd.kind, CommandKind::SetWaveform);
        assert_eq!(cmd.wave, Waveform::Pulse);
        assert_eq!(cmd.selector(), ZoneSelector::Index(1));
        assert_eq!(def.choreo[0].cmds[0].wave, Waveform::Saw);
    }

    #[test]
    fn random_zone_counts_as_one_zone() {
        let def = parse(json!({
            "Name": "Twinkle",
            "Choreo": [{ "Linger": 10, "Cmds": [{ "Zone": -1, "Type": 0, "Color": "fff" }] }]
        }));
        assert_eq!(def.required_zones(), 1);
        assert_eq!(def.choreo[0].cmds[0].selector(), ZoneSelector::Random);
    }

    #[test]
    fn numeric_waveforms_are_accepted() {
        let def = parse(json!({
            "Name": "Breathe",
            "Choreo": [{ "Cmds": [{ "Type": 1, "Color": "#00ff00", "Wave": 1 }] }]
        }));
        assert_eq!(def.choreo[0].cmds[0].wave, Waveform::Sine);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let bad_hue = parse(json!({
            "Name": "Bad",
            "Choreo": [{ "Cmds": [{ "Type": 0, "Color": { "H": 400 } }] }]
        }));
        assert!(bad_hue.validate().is_err());

        let bad_linger = parse(json!({
            "Name": "Bad",
            "Choreo": [{ "Linger": 500, "LingerMax": 100, "Cmds": [] }]
        }));
        assert!(bad_linger.validate().is_err());

        let bad_hex = parse(json!({
            "Name": "Bad",
            "Choreo": [{ "Cmds": [{ "Type": 0, "Color": "#zzzzzz" }] }]
        }));
        assert!(bad_hex.validate().is_err());

        let missing_max = parse(json!({
            "Name": "Bad",
            "Choreo": [{ "Cmds": [{ "Type": 0, "Color": { "H": 10 }, "ColorRndMode": 1 }] }]
        }));
        assert!(missing_max.validate().is_err());
    }

    #[test]
    fn unknown_command_type_fails_to_parse() {
        let raw = json!({ "Name": "X", "Choreo": [{ "Cmds": [{ "Type": 7, "Color": "#fff" }] }] });
        assert!(serde_json::from_value::<EffectDefinition>(raw).is_err());
    }
}
