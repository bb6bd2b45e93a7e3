//! Waiting for a freshly spawned modem to open its command port.
//!
//! Readiness is judged from the kernel's socket table, never by connecting:
//! several modems treat any TCP connection as a client session.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Number of checks before giving up.
pub const READINESS_ATTEMPTS: u32 = 10;

/// Pause between checks.
pub const READINESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("port {port} not listening after {attempts} checks")]
    PortNotReady { port: u16, attempts: u32 },

    #[error("readiness wait for port {port} cancelled")]
    Cancelled { port: u16 },
}

/// Returns true if some local socket is in LISTEN state on `port`.
#[cfg(target_os = "linux")]
pub fn is_listening(port: u16) -> bool {
    use procfs::net::TcpState;

    let v4 = procfs::net::tcp().unwrap_or_default();
    let v6 = procfs::net::tcp6().unwrap_or_default();
    v4.iter()
        .chain(v6.iter())
        .any(|entry| entry.state == TcpState::Listen && entry.local_address.port() == port)
}

/// The socket table is only inspected on Linux.
#[cfg(not(target_os = "linux"))]
pub fn is_listening(_port: u16) -> bool {
    false
}

/// Polls until `port` is listening, up to `attempts` checks `interval` apart.
pub async fn wait_for_listener(
    port: u16,
    attempts: u32,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), ReadinessError> {
    for attempt in 1..=attempts {
        let listening = tokio::task::spawn_blocking(move || is_listening(port))
            .await
            .unwrap_or(false);
        if listening {
            info!(port, attempt, "Modem port is listening");
            return Ok(());
        }
        debug!(port, attempt, "Modem port not listening yet");

        if attempt == attempts {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(ReadinessError::Cancelled { port }),
            _ = tokio::time::sleep(interval) => {}
        }
    }

    Err(ReadinessError::PortNotReady { port, attempts })
}
