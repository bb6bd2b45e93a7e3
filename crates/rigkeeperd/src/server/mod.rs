//! TCP control server for the rigkeeper daemon.
//!
//! The server:
//! - Listens on a TCP port for client connections
//! - Runs a [`ConnectionSession`] for each client
//! - Tracks live sessions so shutdown waits for every teardown
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  ControlServer  │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionSession│────▶│  ModemRegistry  │
//! │  (per client)   │     │  (run locks)    │
//! └─────────────────┘     └─────────────────┘
//!         │
//!         │ spawn / stop
//!         ▼
//! ┌─────────────────┐
//! │ modem, CAT ctl, │
//! │ audio capture   │
//! └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and allow continued operation

mod session;

pub use session::{config_lines, ConnectionSession, ServiceContext, SessionError, SessionSettings};

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Pause after a failed accept, so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// TCP control server.
pub struct ControlServer {
    listener: TcpListener,
    context: Arc<ServiceContext>,
    cancel_token: CancellationToken,
    sessions: TaskTracker,
}

impl ControlServer {
    /// Binds the control port on all IPv4 interfaces. Port 0 picks a free port.
    pub async fn bind(
        port: u16,
        context: Arc<ServiceContext>,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        Self::bind_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), context, cancel_token).await
    }

    /// Binds a specific address.
    pub async fn bind_addr(
        addr: SocketAddr,
        context: Arc<ServiceContext>,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
            addr,
            error: e.to_string(),
        })?;

        Ok(Self {
            listener,
            context,
            cancel_token,
            sessions: TaskTracker::new(),
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Io(e.to_string()))
    }

    /// Runs the server.
    ///
    /// Accepts connections until the cancellation token is triggered, then
    /// waits for every session to finish its teardown.
    pub async fn run(self) -> Result<(), ServerError> {
        match self.listener.local_addr() {
            Ok(addr) => info!(%addr, "Control server listening"),
            Err(e) => debug!(error = %e, "Control server listening on unknown address"),
        }

        let mut connection_counter: u64 = 0;
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            connection_counter += 1;
                            self.handle_connection(stream, peer, connection_counter);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
            }
        }

        // Stop accepting before waiting on the sessions
        drop(self.listener);
        self.sessions.close();
        info!(sessions = self.sessions.len(), "Waiting for sessions to close");
        self.sessions.wait().await;

        info!("Server shutdown complete");
        Ok(())
    }

    /// Spawns a tracked session task for a new connection.
    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, id: u64) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(session = id, error = %e, "Failed to set TCP_NODELAY");
        }

        info!(session = id, %peer, "Client connected");
        let (reader, writer) = stream.into_split();
        let session = ConnectionSession::new(
            id,
            reader,
            writer,
            Arc::clone(&self.context),
            self.cancel_token.child_token(),
        );

        self.sessions.spawn(async move {
            session.run().await;
            info!(session = id, %peer, "Client disconnected");
        });
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind control port {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("I/O error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigkeeper_core::ModemRegistry;

    fn context() -> Arc<ServiceContext> {
        Arc::new(ServiceContext::new(Arc::new(ModemRegistry::default()), "/tmp/rigkeeper.json"))
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = ControlServer::bind(0, context(), CancellationToken::new())
            .await
            .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let first = ControlServer::bind_addr("127.0.0.1:0".parse().unwrap(), context(), CancellationToken::new())
            .await
            .unwrap();
        let addr = first.local_addr().unwrap();

        let err = ControlServer::bind_addr(addr, context(), CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert!(err.to_string().contains(&addr.port().to_string()));
    }

    #[tokio::test]
    async fn test_run_returns_on_cancel() {
        let cancel = CancellationToken::new();
        let server = ControlServer::bind(0, context(), cancel.clone()).await.unwrap();
        let handle = tokio::spawn(server.run());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
