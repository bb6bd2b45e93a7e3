//! rigkeeper protocol - line-based control protocol
//!
//! Clients send newline-terminated ASCII commands (`start <name>`,
//! `monitor <name>`, `stop`, `version`, `list`, `config`). The daemon answers
//! with `OK` plus optional data lines, `ERROR <reason>`, or `Invalid command`,
//! and while monitoring interleaves telemetry lines between replies.

pub mod command;
pub mod reply;

pub use command::{Command, ProtocolError, MAX_LINE_LENGTH};
pub use reply::{telemetry_line, Reply};
