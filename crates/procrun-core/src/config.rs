//! Settings resolution for procrun.
//!
//! Implements hierarchical settings resolution:
//! 1. Built-in defaults
//! 2. Global settings (`<config dir>/procrun/settings.toml`)
//! 3. Explicit settings file (`--config`)
//! 4. Environment variables (`PROCRUN_*`)
//!
//! CLI flags are applied last by the binary itself.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete procrun settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub log: LogSettings,
}

/// Tuning knobs for a supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Seconds between the graceful stop signal and a hard kill.
    pub terminate_timeout_secs: u64,
    /// Milliseconds to wait for output readers after the process exits.
    pub drain_timeout_ms: u64,
    /// Per-subscriber buffer size, in lines.
    pub subscriber_capacity: usize,
    /// Milliseconds a subscriber with a full buffer may stall delivery
    /// before it is disconnected. `0` never disconnects.
    pub subscriber_timeout_ms: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            terminate_timeout_secs: 5,
            drain_timeout_ms: 2_000,
            subscriber_capacity: 1024,
            subscriber_timeout_ms: 5_000,
        }
    }
}

impl RunnerSettings {
    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }

    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub const fn subscriber_timeout(&self) -> Option<Duration> {
        if self.subscriber_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.subscriber_timeout_ms))
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// On-disk shape of a settings file. Every key is optional so a file only
/// overrides what it names.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    #[serde(default)]
    runner: RunnerOverlay,
    #[serde(default)]
    log: LogOverlay,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunnerOverlay {
    terminate_timeout_secs: Option<u64>,
    drain_timeout_ms: Option<u64>,
    subscriber_capacity: Option<usize>,
    subscriber_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogOverlay {
    level: Option<String>,
    json: Option<bool>,
}

/// Load settings with hierarchical resolution.
///
/// A missing global file is skipped; a missing explicit file is an error.
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();

    if let Some(global_path) = global_settings_path()
        && global_path.exists()
    {
        let global = load_settings_file(&global_path)?;
        merge_settings(&mut settings, global);
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Settings file not found: {}",
                path.display()
            )));
        }
        let file = load_settings_file(path)?;
        merge_settings(&mut settings, file);
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok())?;
    settings.validate()?;

    Ok(settings)
}

/// Get the global settings file path.
pub fn global_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("procrun").join("settings.toml"))
}

impl Settings {
    /// Reject values the runner cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.runner.subscriber_capacity == 0 {
            return Err(Error::Config(
                "runner.subscriber_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn load_settings_file(path: &Path) -> Result<SettingsFile> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read settings file {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(toml::from_str(&content)?)
}

fn merge_settings(base: &mut Settings, overlay: SettingsFile) {
    if let Some(v) = overlay.runner.terminate_timeout_secs {
        base.runner.terminate_timeout_secs = v;
    }
    if let Some(v) = overlay.runner.drain_timeout_ms {
        base.runner.drain_timeout_ms = v;
    }
    if let Some(v) = overlay.runner.subscriber_capacity {
        base.runner.subscriber_capacity = v;
    }
    if let Some(v) = overlay.runner.subscriber_timeout_ms {
        base.runner.subscriber_timeout_ms = v;
    }
    if let Some(v) = overlay.log.level {
        base.log.level = v;
    }
    if let Some(v) = overlay.log.json {
        base.log.json = v;
    }
}

fn apply_env_overrides(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    fn parse<T: std::str::FromStr>(key: &str, val: &str) -> Result<T> {
        val.parse()
            .map_err(|_| Error::Config(format!("Invalid value for {key}: {val:?}")))
    }

    if let Some(val) = lookup("PROCRUN_TERMINATE_TIMEOUT") {
        settings.runner.terminate_timeout_secs = parse("PROCRUN_TERMINATE_TIMEOUT", &val)?;
    }
    if let Some(val) = lookup("PROCRUN_DRAIN_TIMEOUT_MS") {
        settings.runner.drain_timeout_ms = parse("PROCRUN_DRAIN_TIMEOUT_MS", &val)?;
    }
    if let Some(val) = lookup("PROCRUN_SUBSCRIBER_CAPACITY") {
        settings.runner.subscriber_capacity = parse("PROCRUN_SUBSCRIBER_CAPACITY", &val)?;
    }
    if let Some(val) = lookup("PROCRUN_SUBSCRIBER_TIMEOUT_MS") {
        settings.runner.subscriber_timeout_ms = parse("PROCRUN_SUBSCRIBER_TIMEOUT_MS", &val)?;
    }
    if let Some(val) = lookup("PROCRUN_LOG_LEVEL") {
        settings.log.level = val;
    }
    if let Some(val) = lookup("PROCRUN_LOG_JSON") {
        settings.log.json = parse("PROCRUN_LOG_JSON", &val)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.runner.terminate_timeout(), Duration::from_secs(5));
        assert_eq!(settings.runner.drain_timeout(), Duration::from_secs(2));
        assert_eq!(settings.runner.subscriber_capacity, 1024);
        assert_eq!(
            settings.runner.subscriber_timeout(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(settings.log.level, "info");
        assert!(!settings.log.json);
    }

    #[test]
    fn file_overrides_only_named_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[runner]\nterminate_timeout_secs = 1\n\n[log]\njson = true\n")
            .unwrap();

        let mut settings = Settings::default();
        merge_settings(&mut settings, load_settings_file(&path).unwrap());

        assert_eq!(settings.runner.terminate_timeout_secs, 1);
        assert_eq!(settings.runner.subscriber_capacity, 1024);
        assert_eq!(settings.log.level, "info");
        assert!(settings.log.json);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[runner]\nbogus = 3\n").unwrap();

        assert!(matches!(load_settings_file(&path), Err(Error::Toml(_))));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = load_settings(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_apply_last() {
        let env: HashMap<&str, &str> = [
            ("PROCRUN_TERMINATE_TIMEOUT", "0"),
            ("PROCRUN_SUBSCRIBER_CAPACITY", "8"),
            ("PROCRUN_SUBSCRIBER_TIMEOUT_MS", "0"),
            ("PROCRUN_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        apply_env_overrides(&mut settings, |k| env.get(k).map(ToString::to_string)).unwrap();

        assert_eq!(settings.runner.terminate_timeout_secs, 0);
        assert_eq!(settings.runner.subscriber_capacity, 8);
        assert_eq!(settings.runner.subscriber_timeout(), None);
        assert_eq!(settings.log.level, "debug");
    }

    #[test]
    fn invalid_env_value_is_an_error() {
        let mut settings = Settings::default();
        let result = apply_env_overrides(&mut settings, |k| {
            (k == "PROCRUN_LOG_JSON").then(|| "maybe".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn zero_capacity_fails_validation() {
        let mut settings = Settings::default();
        settings.runner.subscriber_capacity = 0;
        assert!(settings.validate().is_err());
    }
}
