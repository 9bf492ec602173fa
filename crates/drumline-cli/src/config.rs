use std::path::PathBuf;

use drumline_core::Preferences;
use drumline_services::ActionEntry;

#[derive(Debug, serde::Serialize, serde::Deserialize, Default)]
pub struct AppConfig {
    /// MIDI action bindings
    #[serde(default)]
    pub actions: Vec<ActionEntry>,
    #[serde(default)]
    pub preferences: Preferences,
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("drumline")
        .join("config.toml")
}

pub fn load_config() -> AppConfig {
    let path = config_path();
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|s| match toml::from_str(&s) {
            Ok(config) => Some(config),
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "Ignoring unreadable config");
                None
            }
        })
        .unwrap_or_default()
}

pub fn save_config(config: &AppConfig) {
    let path = config_path();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let Ok(s) = toml::to_string_pretty(config) else { return };
    if std::fs::write(&path, s).is_ok() {
        tracing::info!(path = %path.display(), "Config saved");
    }
}
