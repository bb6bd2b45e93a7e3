//! rigkeeper daemon - modem sessions, process supervision and audio telemetry
//!
//! This crate provides the runtime of the rigkeeper service:
//! - `server` - TCP control server and the per-connection session engine
//! - `supervisor` - spawning and stopping modem and CAT control processes
//! - `swap` - installing a modem-specific ini and restoring the original
//! - `readiness` - waiting for a modem to open its command port
//! - `audio` - capture-device level monitoring
//! - `discovery` - service discovery records for the configured modems
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    rigkeeper daemon                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  ControlServer  │────▶│     ModemRegistry           │    │
//! │  │  (TCP listener) │     │  (descriptors + run locks)  │    │
//! │  └────────┬────────┘     └─────────────────────────────┘    │
//! │           │ connections                                     │
//! │           ▼                                                 │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │ConnectionSession│────▶│ supervisor / swap / audio   │    │
//! │  │  (per client)   │     │  (owned by the session)     │    │
//! │  └─────────────────┘     └─────────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod audio;
pub mod discovery;
pub mod readiness;
pub mod server;
pub mod supervisor;
pub mod swap;

/// Version reported by the `version` command.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
