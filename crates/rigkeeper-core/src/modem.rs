//! Modem descriptors, the per-modem run lock, and the static modem registry.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::ini;

// ============================================================================
// Modem Type
// ============================================================================

/// Modem family, which selects the advertised discovery service type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModemType {
    Hf,
    Fm,
}

impl ModemType {
    /// Returns the lowercase configuration name (`hf` / `fm`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hf => "hf",
            Self::Fm => "fm",
        }
    }
}

impl fmt::Display for ModemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// Auxiliary CAT control executable started alongside a modem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatControl {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub cmd: Option<String>,
    #[serde(default)]
    pub args: String,
    #[serde(default, deserialize_with = "zero_as_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub dialect: String,
}

/// Static description of one launchable modem, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModemDescriptor {
    /// Unique lookup key used by `start` / `monitor`
    pub name: String,

    #[serde(rename = "Type")]
    pub modem_type: ModemType,

    pub cmd: String,

    #[serde(default)]
    pub args: String,

    /// Modem-specific ini installed over the default ini while running
    #[serde(default, deserialize_with = "empty_as_none_path")]
    pub config: Option<PathBuf>,

    /// Capture device name; overrides the ini `Input Device Name`
    #[serde(default, deserialize_with = "empty_as_none")]
    pub audio_input_name: Option<String>,

    #[serde(default)]
    pub cat_ctrl: Option<CatControl>,

    /// Modem listening port; falls back to the ini `TCP Command Port`
    #[serde(default, deserialize_with = "zero_as_none")]
    pub port: Option<u16>,
}

impl ModemDescriptor {
    /// Creates a descriptor with only the required fields set.
    pub fn new(name: impl Into<String>, modem_type: ModemType, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            modem_type,
            cmd: cmd.into(),
            args: String::new(),
            config: None,
            audio_input_name: None,
            cat_ctrl: None,
            port: None,
        }
    }

    /// Returns the CAT control definition if it names an executable.
    pub fn cat_control(&self) -> Option<&CatControl> {
        self.cat_ctrl.as_ref().filter(|cat| cat.cmd.is_some())
    }

    /// Locates the ini file the modem reads by default.
    ///
    /// The ini sits next to the executable with the same stem. `Cmd` is tried
    /// first, then `Args` (wine-hosted modems name the real executable there).
    pub fn default_ini_path(&self) -> Option<PathBuf> {
        [self.cmd.as_str(), self.args.trim()]
            .into_iter()
            .filter(|candidate| !candidate.is_empty())
            .filter_map(ini_beside)
            .find(|path| path.is_file())
    }

    /// Returns the ini file describing this modem: the override if set,
    /// otherwise the default ini.
    pub fn ini_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(|| self.default_ini_path())
    }

    /// Resolves the modem's listening port from the descriptor or its ini.
    pub fn resolve_port(&self) -> Option<u16> {
        if self.port.is_some() {
            return self.port;
        }
        let path = self.ini_path()?;
        match ini::command_port(&path) {
            Ok(port) => port,
            Err(e) => {
                debug!(modem = %self.name, path = %path.display(), error = %e, "No port in ini");
                None
            }
        }
    }
}

/// Returns `<dir>/<stem>.ini` for an executable path, resolving bare names on
/// the search path.
fn ini_beside(executable: &str) -> Option<PathBuf> {
    let path = Path::new(executable);
    let resolved = if path.components().count() > 1 || path.is_absolute() {
        path.to_path_buf()
    } else {
        which::which(executable).unwrap_or_else(|_| path.to_path_buf())
    };
    resolved.file_stem()?;
    Some(resolved.with_extension("ini"))
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

fn empty_as_none_path<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(empty_as_none(deserializer)?.map(PathBuf::from))
}

fn zero_as_none<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<u16>::deserialize(deserializer)?;
    Ok(value.filter(|port| *port != 0))
}

// ============================================================================
// Run Lock
// ============================================================================

/// Non-blocking exclusivity flag guarding one modem.
///
/// There is no waiting: a caller either takes the lock immediately or is
/// told the modem is busy.
#[derive(Debug, Default)]
pub struct ModemLock {
    held: AtomicBool,
}

impl ModemLock {
    /// Attempts to take the lock. Returns `false` if it is already held.
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the lock. Releasing a free lock is a no-op.
    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    /// Returns true while some session holds the lock.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// A registry entry: the immutable descriptor plus its run lock.
#[derive(Debug)]
pub struct Modem {
    descriptor: ModemDescriptor,
    lock: ModemLock,
}

impl Modem {
    pub fn new(descriptor: ModemDescriptor) -> Self {
        Self {
            descriptor,
            lock: ModemLock::default(),
        }
    }

    pub fn descriptor(&self) -> &ModemDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_held()
    }

    /// Takes the run lock, returning a lease that releases it on drop.
    pub fn try_lease(self: &Arc<Self>) -> Option<ModemLease> {
        if self.lock.try_acquire() {
            debug!(modem = %self.name(), "Modem lock acquired");
            Some(ModemLease {
                modem: Arc::clone(self),
            })
        } else {
            None
        }
    }
}

/// Proof of holding a modem's run lock.
///
/// Dropping the lease releases the lock exactly once, including during
/// unwinding.
#[derive(Debug)]
pub struct ModemLease {
    modem: Arc<Modem>,
}

impl ModemLease {
    pub fn descriptor(&self) -> &ModemDescriptor {
        self.modem.descriptor()
    }
}

impl Drop for ModemLease {
    fn drop(&mut self) {
        self.modem.lock.release();
        debug!(modem = %self.modem.name(), "Modem lock released");
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Static table of modems, shared by every session.
#[derive(Debug, Default)]
pub struct ModemRegistry {
    modems: Vec<Arc<Modem>>,
}

impl ModemRegistry {
    pub fn new(descriptors: impl IntoIterator<Item = ModemDescriptor>) -> Self {
        Self {
            modems: descriptors
                .into_iter()
                .map(|d| Arc::new(Modem::new(d)))
                .collect(),
        }
    }

    /// Looks up a modem by exact name.
    pub fn find(&self, name: &str) -> Option<&Arc<Modem>> {
        self.modems.iter().find(|m| m.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Modem>> {
        self.modems.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modems.iter().map(|m| m.name())
    }

    pub fn len(&self) -> usize {
        self.modems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modems.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ModemRegistry {
        ModemRegistry::new(vec![
            ModemDescriptor::new("VARA HF", ModemType::Hf, "sleep"),
            ModemDescriptor::new("VARA FM", ModemType::Fm, "sleep"),
        ])
    }

    #[test]
    fn test_find_exact_name() {
        let registry = registry();
        assert!(registry.find("VARA HF").is_some());
        assert!(registry.find("vara hf").is_none());
        assert!(registry.find("Alpha").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), ["VARA HF", "VARA FM"]);
    }

    #[test]
    fn test_lease_is_exclusive() {
        let registry = registry();
        let modem = registry.find("VARA HF").unwrap();

        let lease = modem.try_lease().expect("first lease");
        assert!(modem.is_locked());
        assert!(modem.try_lease().is_none());

        // Other modems are unaffected
        assert!(registry.find("VARA FM").unwrap().try_lease().is_some());

        drop(lease);
        assert!(!modem.is_locked());
        assert!(modem.try_lease().is_some());
    }

    #[test]
    fn test_release_free_lock_is_noop() {
        let lock = ModemLock::default();
        lock.release();
        assert!(!lock.is_held());
        assert!(lock.try_acquire());
        lock.release();
        lock.release();
        assert!(lock.try_acquire());
    }

    #[test]
    fn test_lease_released_on_unwind() {
        let registry = registry();
        let modem = Arc::clone(registry.find("VARA FM").unwrap());

        let handle = {
            let modem = Arc::clone(&modem);
            std::thread::spawn(move || {
                let _lease = modem.try_lease().unwrap();
                panic!("session blew up");
            })
        };
        assert!(handle.join().is_err());
        assert!(!modem.is_locked());
    }

    #[test]
    fn test_descriptor_deserialize_blank_fields() {
        let json = r#"{
            "Name": "VARA FM",
            "Type": "fm",
            "Cmd": "VARAFM.exe",
            "Args": "",
            "Config": "",
            "CatCtrl": { "Port": 0, "Dialect": "", "Cmd": "", "Args": "" }
        }"#;
        let modem: ModemDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(modem.modem_type, ModemType::Fm);
        assert!(modem.config.is_none());
        assert!(modem.audio_input_name.is_none());
        assert!(modem.port.is_none());
        assert!(modem.cat_control().is_none());
        let cat = modem.cat_ctrl.unwrap();
        assert!(cat.port.is_none());
    }

    #[test]
    fn test_descriptor_rejects_unknown_type() {
        let json = r#"{ "Name": "X", "Type": "vhf", "Cmd": "x" }"#;
        assert!(serde_json::from_str::<ModemDescriptor>(json).is_err());
    }

    #[test]
    fn test_default_ini_path_next_to_executable() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("VARA.exe");
        std::fs::write(&exe, b"").unwrap();
        let ini = dir.path().join("VARA.ini");

        let mut modem = ModemDescriptor::new("VARA HF", ModemType::Hf, exe.to_string_lossy());
        assert!(modem.default_ini_path().is_none());

        std::fs::write(&ini, b"[Setup]\n").unwrap();
        assert_eq!(modem.default_ini_path(), Some(ini.clone()));

        // Wine-hosted: the real executable is the argument
        modem.cmd = "wine".to_string();
        modem.args = exe.to_string_lossy().into_owned();
        assert_eq!(modem.default_ini_path(), Some(ini));
    }

    #[test]
    fn test_resolve_port_prefers_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let ini = dir.path().join("VARA.ini");
        std::fs::write(&ini, "[Setup]\nTCP Command Port=8300\n").unwrap();

        let mut modem = ModemDescriptor::new("VARA HF", ModemType::Hf, "sleep");
        modem.config = Some(ini);
        assert_eq!(modem.resolve_port(), Some(8300));

        modem.port = Some(9000);
        assert_eq!(modem.resolve_port(), Some(9000));
    }
}
