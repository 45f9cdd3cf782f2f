//! Daemon configuration
//!
//! An optional TOML file supplies defaults, CLI flags override it, and
//! the merged result is validated before the daemon starts.

use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Merged daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Action script to run on display changes. `None` falls back to
    /// `$HOME/.monwatch`.
    pub script: Option<PathBuf>,
    /// Poll interval in seconds, 1-60.
    pub interval: u64,
    /// Run the action once at startup with an "init" status.
    pub startup_action: bool,
    /// Also run change detection on poll ticks, for servers that never
    /// push notifications.
    pub detect_on_poll: bool,
    /// Tracing filter used when RUST_LOG is unset.
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            script: None,
            interval: 3,
            startup_action: false,
            detect_on_poll: false,
            log_level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Well-known config file location.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("monwatch").join("config.toml"))
    }

    /// Load the config file if present, defaults otherwise.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=60).contains(&self.interval) {
            bail!(
                "interval must be between 1 and 60 seconds, got {}",
                self.interval
            );
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// Resolve the action script path; an unset HOME with no explicit
    /// script is a startup failure.
    pub fn resolve_script(&self) -> Result<PathBuf> {
        match &self.script {
            Some(path) => Ok(path.clone()),
            None => default_script(env::var_os("HOME").as_deref()),
        }
    }
}

fn default_script(home: Option<&OsStr>) -> Result<PathBuf> {
    match home {
        Some(home) if !home.is_empty() => Ok(Path::new(home).join(".monwatch")),
        _ => bail!("can't find HOME and no script path was given"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_sane() {
        let config = DaemonConfig::default();
        assert_eq!(config.interval, 3);
        assert!(!config.startup_action);
        assert!(!config.detect_on_poll);
        assert!(config.script.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loads_toml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
script = "/usr/local/libexec/on-display-change"
interval = 10
startup_action = true
"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = DaemonConfig::load_from(file.path()).unwrap();
        assert_eq!(
            config.script.as_deref(),
            Some(Path::new("/usr/local/libexec/on-display-change"))
        );
        assert_eq!(config.interval, 10);
        assert!(config.startup_action);
        // Unset keys keep their defaults.
        assert!(!config.detect_on_poll);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn missing_file_means_defaults() {
        let config = DaemonConfig::load_from(Path::new("/nonexistent/monwatch.toml")).unwrap();
        assert_eq!(config.interval, DaemonConfig::default().interval);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "intervall = 5").unwrap();
        file.flush().unwrap();
        assert!(DaemonConfig::load_from(file.path()).is_err());
    }

    #[test]
    fn interval_bounds_are_enforced() {
        let mut config = DaemonConfig {
            interval: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.interval = 61;
        assert!(config.validate().is_err());
        config.interval = 60;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn script_falls_back_to_home_dotfile() {
        let path = default_script(Some(OsStr::new("/home/operator"))).unwrap();
        assert_eq!(path, Path::new("/home/operator/.monwatch"));
        assert!(default_script(None).is_err());
        assert!(default_script(Some(OsStr::new(""))).is_err());
    }
}
