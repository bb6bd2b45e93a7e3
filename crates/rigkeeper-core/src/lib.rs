//! rigkeeper core - shared domain types for the modem launcher
//!
//! This crate provides the domain types shared between the wire protocol
//! and the daemon:
//! - `modem` - modem descriptors, the per-modem run lock and the registry
//! - `config` - JSON startup configuration
//! - `ini` - key lookups in a modem's ini file
//! - `level` - dBFS loudness of sample buffers
//! - `resolve` - fuzzy audio device name matching

pub mod config;
pub mod error;
pub mod ini;
pub mod level;
pub mod modem;
pub mod resolve;

// Re-exports for convenience
pub use config::{default_config_path, ServiceConfig, DEFAULT_DELAY_SECS, DEFAULT_PORT};
pub use error::{ConfigError, ConfigResult};
pub use level::{DbfsLevel, SILENCE_DBFS};
pub use modem::{CatControl, Modem, ModemDescriptor, ModemLease, ModemLock, ModemRegistry, ModemType};
pub use resolve::{resolve_device, similarity, DeviceNotFound, DEFAULT_MATCH_THRESHOLD};
