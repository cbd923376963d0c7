// effects/library.rs
use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::debug;
use validator::Validate;

use super::EffectDefinition;
use crate::error::AppError;

pub const TEMPLATE_FILE: &str = "template.json";

/// Effect files in `dir`, sorted by name. The template stays hidden.
pub fn installed_effects(dir: impl AsRef<Path>) -> Result<Vec<String>, AppError> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir).with_context(|| format!("reading effects dir {}", dir.display()))?;
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(".json") && name != TEMPLATE_FILE)
        .collect();
    names.sort();
    Ok(names)
}

pub fn effect_path(dir: impl AsRef<Path>, name: &str) -> Result<PathBuf, AppError> {
    if name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(AppError::Validation(format!("invalid effect file name {name}")));
    }
    Ok(dir.as_ref().join(name))
}

/// Reads, parses and validates one effect file.
pub fn load(path: impl AsRef<Path>) -> Result<EffectDefinition, AppError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading effect {}", path.display()))?;
    let definition = parse(&raw)?;
    debug!(path = %path.display(), effect = %definition.name, "Loaded effect");
    Ok(definition)
}

pub fn parse(raw: &str) -> Result<EffectDefinition, AppError> {
    let definition: EffectDefinition = serde_json::from_str(raw)?;
    definition.validate()?;
    Ok(definition)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLINK: &str = r##"{
        "Name": "Blink",
        "Choreo": [
            { "Linger": 100, "Cmds": [{ "AllZ": true, "Type": 0, "Color": "#ffffff" }] },
            { "Linger": 100, "Cmds": [{ "AllZ": true, "Type": 0, "Color": "#000000" }] }
        ]
    }"##;

    #[test]
    fn lists_json_files_without_template() {
        let dir = std::env::temp_dir().join(format!("lanlight-effects-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["b.json", "a.json", TEMPLATE_FILE, "notes.txt"] {
            std::fs::write(dir.join(name), BLINK).unwrap();
        }
        assert_eq!(installed_effects(&dir).unwrap(), vec!["a.json", "b.json"]);
        let def = load(effect_path(&dir, "a.json").unwrap()).unwrap();
        assert_eq!(def.name, "Blink");
        assert_eq!(def.choreo.len(), 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rejects_paths_outside_the_library() {
        assert!(effect_path("effects", "../secret.json").is_err());
        assert!(effect_path("effects", "sub/a.json").is_err());
    }

    #[test]
    fn invalid_effects_are_validation_errors() {
        let err = parse(r#"{ "Name": "", "Choreo": [] }"#).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(matches!(parse("not json"), Err(AppError::Validation(_))));
    }
}
