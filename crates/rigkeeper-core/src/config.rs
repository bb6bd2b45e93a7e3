//! Startup configuration: loading, defaults and validation.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ConfigError, ConfigResult};
use crate::modem::ModemDescriptor;
use crate::resolve::DEFAULT_MATCH_THRESHOLD;

/// Default control port.
pub const DEFAULT_PORT: u16 = 8273;

/// Default startup delay, giving a hotspot network time to come up.
pub const DEFAULT_DELAY_SECS: u64 = 10;

/// Service configuration, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceConfig {
    /// Control listener port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds to wait before listening. Zero or absent means the default.
    #[serde(default)]
    pub delay: Option<u64>,

    /// Minimum device-name similarity for `monitor`
    #[serde(default)]
    pub match_threshold: Option<f64>,

    #[serde(default)]
    pub modems: Vec<ModemDescriptor>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl ServiceConfig {
    /// Reads and parses a JSON configuration file.
    ///
    /// Does not validate; call [`ServiceConfig::validate`] afterwards.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::from_json(&contents).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parses configuration from a JSON string.
    pub fn from_json(contents: &str) -> ConfigResult<Self> {
        serde_json::from_str(contents).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            reason: e.to_string(),
        })
    }

    /// Startup delay in seconds.
    pub fn delay_secs(&self) -> u64 {
        match self.delay {
            Some(0) | None => DEFAULT_DELAY_SECS,
            Some(secs) => secs,
        }
    }

    /// Device-name similarity threshold.
    pub fn match_threshold(&self) -> f64 {
        self.match_threshold.unwrap_or(DEFAULT_MATCH_THRESHOLD)
    }

    /// Checks the configuration is usable.
    ///
    /// Every modem needs a unique name and an executable on the search path;
    /// override ini files and CAT control executables must exist when set.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.modems.is_empty() {
            return Err(ConfigError::NoModems);
        }

        let threshold = self.match_threshold();
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::InvalidFieldValue {
                field: "MatchThreshold".to_string(),
                value: threshold.to_string(),
                expected: "a number between 0 and 1".to_string(),
            });
        }

        let mut names = HashSet::new();
        for modem in &self.modems {
            if !names.insert(modem.name.as_str()) {
                return Err(ConfigError::DuplicateModem {
                    name: modem.name.clone(),
                });
            }

            if modem.cmd.trim().is_empty() {
                return Err(ConfigError::MissingCommand {
                    name: modem.name.clone(),
                });
            }
            assert_executable(&modem.name, &modem.cmd)?;

            if let Some(config) = &modem.config {
                if !config.is_file() {
                    return Err(ConfigError::ConfigFileMissing {
                        name: modem.name.clone(),
                        path: config.clone(),
                    });
                }
            }

            if let Some(cmd) = modem.cat_control().and_then(|cat| cat.cmd.as_deref()) {
                assert_executable(&modem.name, cmd)?;
            }
        }

        Ok(())
    }
}

fn assert_executable(name: &str, cmd: &str) -> ConfigResult<()> {
    which::which(cmd)
        .map(|_| ())
        .map_err(|e| ConfigError::ExecutableNotFound {
            name: name.to_string(),
            path: cmd.to_string(),
            reason: e.to_string(),
        })
}

/// Default configuration path: the running executable with a `.json`
/// extension.
pub fn default_config_path() -> std::io::Result<PathBuf> {
    Ok(std::env::current_exe()?.with_extension("json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::ModemType;

    const SAMPLE: &str = r#"{
        "Port": 8300,
        "Modems": [
            {
                "Name": "VARA HF",
                "Type": "hf",
                "Cmd": "sh",
                "Args": "",
                "CatCtrl": { "Port": 4532, "Dialect": "hamlib", "Cmd": "sh", "Args": "-c true" }
            },
            { "Name": "VARA FM", "Type": "fm", "Cmd": "sh" }
        ]
    }"#;

    #[test]
    fn test_parse_sample() {
        let config = ServiceConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.port, 8300);
        assert_eq!(config.modems.len(), 2);
        assert_eq!(config.modems[1].modem_type, ModemType::Fm);
        let cat = config.modems[0].cat_control().unwrap();
        assert_eq!(cat.port, Some(4532));
        assert_eq!(cat.dialect, "hamlib");
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::from_json(r#"{ "Modems": [] }"#).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.delay_secs(), 10);
        assert_eq!(config.match_threshold(), 0.7);

        let config = ServiceConfig::from_json(r#"{ "Delay": 0, "MatchThreshold": 0.5 }"#).unwrap();
        assert_eq!(config.delay_secs(), 10);
        assert_eq!(config.match_threshold(), 0.5);

        let config = ServiceConfig::from_json(r#"{ "Delay": 3 }"#).unwrap();
        assert_eq!(config.delay_secs(), 3);
    }

    #[test]
    fn test_validate_no_modems() {
        let config = ServiceConfig::from_json("{}").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::NoModems)));
    }

    #[test]
    fn test_validate_missing_executable() {
        let config = ServiceConfig::from_json(
            r#"{ "Modems": [{ "Name": "X", "Type": "hf", "Cmd": "this-command-does-not-exist" }] }"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ExecutableNotFound { .. }));
        assert!(err.to_string().contains("this-command-does-not-exist"));
    }

    #[test]
    fn test_validate_duplicate_names() {
        let config = ServiceConfig::from_json(
            r#"{ "Modems": [
                { "Name": "X", "Type": "hf", "Cmd": "sh" },
                { "Name": "X", "Type": "fm", "Cmd": "sh" }
            ] }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateModem { .. })
        ));
    }

    #[test]
    fn test_validate_missing_override_ini() {
        let config = ServiceConfig::from_json(
            r#"{ "Modems": [{ "Name": "X", "Type": "hf", "Cmd": "sh", "Config": "/nonexistent/x.ini" }] }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ConfigFileMissing { .. })
        ));
    }

    #[test]
    fn test_validate_threshold_range() {
        let config = ServiceConfig::from_json(
            r#"{ "MatchThreshold": 1.5, "Modems": [{ "Name": "X", "Type": "hf", "Cmd": "sh" }] }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFieldValue { .. })
        ));
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rigkeeper.json");

        assert!(matches!(
            ServiceConfig::load(&path),
            Err(ConfigError::Read { .. })
        ));

        std::fs::write(&path, "{ not json").unwrap();
        let err = ServiceConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("rigkeeper.json"));

        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(ServiceConfig::load(&path).unwrap().modems.len(), 2);
    }

    #[test]
    fn test_default_config_path_is_json() {
        let path = default_config_path().unwrap();
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("json"));
    }
}
