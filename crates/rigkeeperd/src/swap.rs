//! Config swap transaction: install a modem-specific ini over the default
//! one for the lifetime of a session, and put the original back afterwards.
//!
//! The backup record exists only once the original has been copied aside,
//! so restore is attempted exactly when there is something to restore.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

/// Suffix appended to the original file while it is swapped out.
pub const BACKUP_SUFFIX: &str = ".bak";

/// Errors installing an override config.
#[derive(Debug, Error)]
pub enum SwapError {
    /// The original could not be copied aside; nothing was changed
    #[error("failed to back up {}: {reason}", path.display())]
    Backup { path: PathBuf, reason: String },

    /// The override could not be installed after the backup was taken
    #[error("failed to install {} over {}: {reason}", from.display(), target.display())]
    Install {
        from: PathBuf,
        target: PathBuf,
        reason: String,
        backup: Option<ConfigBackup>,
    },
}

impl SwapError {
    /// Takes the backup taken before the failure, so it can still be restored.
    pub fn take_backup(&mut self) -> Option<ConfigBackup> {
        match self {
            Self::Install { backup, .. } => backup.take(),
            Self::Backup { .. } => None,
        }
    }
}

/// Returns `<target>.bak`.
pub fn backup_path(target: &Path) -> PathBuf {
    let mut path = OsString::from(target.as_os_str());
    path.push(BACKUP_SUFFIX);
    PathBuf::from(path)
}

/// Installs `override_path` over `target`.
///
/// If `target` exists it is first copied to `<target>.bak`; if that copy
/// fails nothing else is attempted. The returned backup must be restored
/// when the session ends.
pub fn install(override_path: &Path, target: &Path) -> Result<Option<ConfigBackup>, SwapError> {
    let backup = if target.exists() {
        let backup = backup_path(target);
        info!(config = %target.display(), backup = %backup.display(), "Backing up config file");
        fs::copy(target, &backup).map_err(|e| SwapError::Backup {
            path: target.to_path_buf(),
            reason: e.to_string(),
        })?;
        Some(ConfigBackup::new(target.to_path_buf(), backup))
    } else {
        None
    };

    info!(
        config = %override_path.display(),
        target = %target.display(),
        "Installing modem config file"
    );
    if let Err(e) = fs::copy(override_path, target) {
        warn!(
            config = %override_path.display(),
            target = %target.display(),
            error = %e,
            "Failed to install modem config file"
        );
        return Err(SwapError::Install {
            from: override_path.to_path_buf(),
            target: target.to_path_buf(),
            reason: e.to_string(),
            backup,
        });
    }

    Ok(backup)
}

/// A swapped-out original config file.
///
/// Restoring consumes the record. A record dropped without an explicit
/// restore (for example while unwinding) restores itself.
#[derive(Debug)]
pub struct ConfigBackup {
    original: PathBuf,
    backup: PathBuf,
    armed: bool,
}

impl ConfigBackup {
    fn new(original: PathBuf, backup: PathBuf) -> Self {
        Self {
            original,
            backup,
            armed: true,
        }
    }

    pub fn original_path(&self) -> &Path {
        &self.original
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    /// Moves the backup back over the original. Failures are logged only.
    pub fn restore(mut self) {
        self.restore_once();
    }

    fn restore_once(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        info!(config = %self.original.display(), "Restoring original config file");
        if let Err(e) = fs::rename(&self.backup, &self.original) {
            warn!(
                config = %self.original.display(),
                backup = %self.backup.display(),
                error = %e,
                "Failed to restore original config file"
            );
        }
    }
}

impl Drop for ConfigBackup {
    fn drop(&mut self) {
        self.restore_once();
    }
}
