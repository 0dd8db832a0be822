use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use toml::map::Entry;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Milliseconds a connector must stay disconnected before the
    /// disconnect is committed. Absorbs cable jitter.
    pub hotplug_debounce_ms: u64,
    /// Milliseconds to wait for a page-flip completion before logging
    /// and rescheduling the output. 0 disables the watchdog.
    pub completion_timeout_ms: u64,
    /// Per-connector overrides, keyed by connector name ("HDMI-A-1").
    #[serde(default)]
    pub displays: BTreeMap<String, DisplayConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hotplug_debounce_ms: 700,
            completion_timeout_ms: 0,
            displays: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DisplayConfig {
    /// Forces a mode instead of the connector's preferred one, in
    /// "WIDTHxHEIGHT" or "WIDTHxHEIGHT@HZ" form.
    pub mode: Option<String>,
    /// Logical render area mapped onto the mode with aspect-preserving
    /// fit. Defaults to the mode size.
    pub render_width: Option<u32>,
    pub render_height: Option<u32>,
    /// Set to false to leave the connector dark.
    pub enabled: Option<bool>,
}

/// A parsed `mode` override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSelector {
    pub width: u16,
    pub height: u16,
    pub refresh_hz: Option<u32>,
}

impl ModeSelector {
    pub fn parse(s: &str) -> Option<Self> {
        let (size, hz) = match s.split_once('@') {
            Some((size, hz)) => (size, Some(hz.parse().ok()?)),
            None => (s, None),
        };
        let (w, h) = size.split_once('x')?;
        Some(Self {
            width: w.trim().parse().ok()?,
            height: h.trim().parse().ok()?,
            refresh_hz: hz,
        })
    }
}

impl Config {
    /// Loads configuration, merging files from lowest to highest
    /// priority: system, XDG user dir, then `./ember_config.toml` as a
    /// dev override. Missing files are skipped silently; unparsable
    /// ones are logged and skipped.
    pub fn load() -> Self {
        let mut merged =
            toml::Value::try_from(Self::default()).expect("default config is always valid toml");

        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(path) = system_config_path() {
            candidates.push(path);
        }
        if let Some(path) = user_config_path() {
            candidates.push(path);
        }
        candidates.push(PathBuf::from("ember_config.toml"));

        for path in candidates {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            match content.parse::<toml::Value>() {
                Ok(value) => {
                    merge_value(&mut merged, value);
                    tracing::info!("Loaded config from {}", path.display());
                }
                Err(err) => warn!("Failed to parse {}: {err}", path.display()),
            }
        }

        merged.try_into().unwrap_or_else(|err| {
            warn!("Falling back to default config due to invalid overrides: {err}");
            Self::default()
        })
    }

    pub fn display(&self, name: &str) -> DisplayConfig {
        self.displays.get(name).cloned().unwrap_or_default()
    }
}

fn merge_value(base: &mut toml::Value, overrides: toml::Value) {
    match (base, overrides) {
        (toml::Value::Table(base_map), toml::Value::Table(override_map)) => {
            for (key, override_value) in override_map {
                match base_map.entry(key) {
                    Entry::Occupied(mut entry) => merge_value(entry.get_mut(), override_value),
                    Entry::Vacant(entry) => {
                        entry.insert(override_value);
                    }
                }
            }
        }
        (base_value, override_value) => {
            *base_value = override_value;
        }
    }
}

fn system_config_path() -> Option<PathBuf> {
    let path = PathBuf::from("/etc/ember/config.toml");
    path.exists().then_some(path)
}

fn user_config_path() -> Option<PathBuf> {
    let config_dir = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(".config"))
        })?;

    let path = config_dir.join("ember").join("config.toml");
    path.exists().then_some(path)
}
