//! Key lookups in a modem's ini-style configuration file.
//!
//! Only two values are ever read: the capture device name and the TCP
//! command port. Section and key names match case-insensitively; lines
//! starting with `;` or `#` are comments.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Section holding the audio device selection.
pub const SOUNDCARD_SECTION: &str = "Soundcard";

/// Key naming the capture device.
pub const INPUT_DEVICE_KEY: &str = "Input Device Name";

/// Section holding network settings.
pub const SETUP_SECTION: &str = "Setup";

/// Key holding the modem's TCP command port.
pub const COMMAND_PORT_KEY: &str = "TCP Command Port";

/// Errors reading an ini file.
#[derive(Error, Debug)]
pub enum IniError {
    #[error("Failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Invalid value {value:?} for [{section}] {key}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
}

/// Finds the value of `key` in `section`, if present.
pub fn lookup<'a>(contents: &'a str, section: &str, key: &str) -> Option<&'a str> {
    let mut in_section = false;

    for line in contents.lines() {
        let line = line.trim_start_matches('\u{feff}').trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_section = name.trim().eq_ignore_ascii_case(section);
            continue;
        }

        if !in_section {
            continue;
        }

        if let Some((k, v)) = line.split_once('=') {
            if k.trim().eq_ignore_ascii_case(key) {
                return Some(v.trim());
            }
        }
    }

    None
}

/// Reads a single value from an ini file on disk.
///
/// Files written by Windows tools are not always UTF-8, so invalid bytes are
/// replaced rather than rejected.
pub fn read_value(path: &Path, section: &str, key: &str) -> Result<Option<String>, IniError> {
    let bytes = fs::read(path).map_err(|e| IniError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let contents = String::from_utf8_lossy(&bytes);
    Ok(lookup(&contents, section, key)
        .filter(|v| !v.is_empty())
        .map(str::to_string))
}

/// Reads `[Soundcard] Input Device Name`.
pub fn input_device_name(path: &Path) -> Result<Option<String>, IniError> {
    read_value(path, SOUNDCARD_SECTION, INPUT_DEVICE_KEY)
}

/// Reads `[Setup] TCP Command Port`.
pub fn command_port(path: &Path) -> Result<Option<u16>, IniError> {
    match read_value(path, SETUP_SECTION, COMMAND_PORT_KEY)? {
        Some(value) => value
            .parse::<u16>()
            .map(Some)
            .map_err(|_| IniError::InvalidValue {
                section: SETUP_SECTION.to_string(),
                key: COMMAND_PORT_KEY.to_string(),
                value,
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARA_INI: &str = "\
[Setup]
Retries=10
TCP Command Port=8300

; audio
[Soundcard]
Input Device Name=Microphone (USB Audio CODEC )
Output Device Name=Speakers (USB Audio CODEC )
";

    #[test]
    fn test_lookup_in_section() {
        assert_eq!(
            lookup(VARA_INI, "Soundcard", "Input Device Name"),
            Some("Microphone (USB Audio CODEC )")
        );
        assert_eq!(lookup(VARA_INI, "Setup", "TCP Command Port"), Some("8300"));
    }

    #[test]
    fn test_lookup_is_section_scoped() {
        assert_eq!(lookup(VARA_INI, "Setup", "Input Device Name"), None);
        assert_eq!(lookup(VARA_INI, "Missing", "Retries"), None);
    }

    #[test]
    fn test_lookup_case_insensitive_and_comments() {
        let contents = "#comment\n[soundcard]\n; Input Device Name=old\ninput device name = Line In\n";
        assert_eq!(lookup(contents, "Soundcard", "Input Device Name"), Some("Line In"));
    }

    #[test]
    fn test_read_values_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("VARA.ini");
        std::fs::write(&path, VARA_INI).unwrap();

        assert_eq!(
            input_device_name(&path).unwrap().as_deref(),
            Some("Microphone (USB Audio CODEC )")
        );
        assert_eq!(command_port(&path).unwrap(), Some(8300));
    }

    #[test]
    fn test_empty_value_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("VARA.ini");
        std::fs::write(&path, "[Soundcard]\nInput Device Name=\n").unwrap();
        assert_eq!(input_device_name(&path).unwrap(), None);
        assert_eq!(command_port(&path).unwrap(), None);
    }

    #[test]
    fn test_invalid_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("VARA.ini");
        std::fs::write(&path, "[Setup]\nTCP Command Port=eighty\n").unwrap();
        assert!(matches!(
            command_port(&path),
            Err(IniError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = input_device_name(Path::new("/nonexistent/VARA.ini")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/VARA.ini"));
    }
}
