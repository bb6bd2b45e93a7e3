//! One client connection: the command protocol state machine.
//!
//! A reader task decodes lines off the socket and queues parsed commands.
//! The session loop owns the write half and services whichever of
//! {next command, stop signal, next telemetry level} is ready first, running
//! each to completion, so a telemetry line can never split a reply.
//!
//! ```text
//!  socket ──▶ reader task ──(commands, mpsc)──┐
//!                                             ▼
//!  capture thread ──(levels, mpsc 32)──▶ session loop ──▶ socket
//!                                             ▲
//!  server cancel ──▶ session stop token ──────┘
//! ```
//!
//! State moves `Idle` → `Busy` at most once. Whatever was acquired on the
//! way to `Busy`, including partial progress of a failed `start`, is owned
//! by the session state and released by [`ConnectionSession::teardown`] in a
//! fixed order.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Teardown steps never fail; problems are logged and the next step runs

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rigkeeper_core::ini;
use rigkeeper_core::{resolve_device, DbfsLevel, DeviceNotFound, ModemDescriptor, ModemLease, ModemRegistry};
use rigkeeper_protocol::{telemetry_line, Command, ProtocolError, Reply, MAX_LINE_LENGTH};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{AudioBackend, AudioError, AudioMonitor, TELEMETRY_CAPACITY};
use crate::readiness::{self, READINESS_ATTEMPTS, READINESS_INTERVAL};
use crate::supervisor::{self, ManagedProcess, SpawnError, DEFAULT_STOP_TIMEOUT};
use crate::swap::{self, ConfigBackup, SwapError};

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Parsed commands waiting for the session loop
const COMMAND_QUEUE_CAPACITY: usize = 16;

/// Tunables shared by every session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    /// Minimum device-name similarity for `monitor`
    pub match_threshold: f64,
    pub readiness_attempts: u32,
    pub readiness_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            match_threshold: rigkeeper_core::DEFAULT_MATCH_THRESHOLD,
            readiness_attempts: READINESS_ATTEMPTS,
            readiness_interval: READINESS_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// Everything a session needs from the service, shared read-only.
pub struct ServiceContext {
    pub registry: Arc<ModemRegistry>,
    pub audio: Arc<dyn AudioBackend>,
    pub settings: SessionSettings,
    /// Reported by `config`
    pub config_path: PathBuf,
    /// Reported by `version`
    pub version: String,
}

impl ServiceContext {
    /// Creates a context with the build's audio backend and default settings.
    pub fn new(registry: Arc<ModemRegistry>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            audio: crate::audio::default_backend(),
            settings: SessionSettings::default(),
            config_path: config_path.into(),
            version: crate::VERSION.to_string(),
        }
    }

    pub fn with_audio(mut self, audio: Arc<dyn AudioBackend>) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("modems", &self.registry.len())
            .field("settings", &self.settings)
            .field("config_path", &self.config_path)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Errors ending a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("modem name '{0}' not found")]
    ModemNotFound(String),

    #[error("modem {0} is already running")]
    ModemBusy(String),

    #[error("session already holds modem {0}")]
    AlreadyHolding(String),

    #[error("cannot find default .ini file for modem {0}")]
    IniNotFound(String),

    #[error("audio device not found in {}", .0.display())]
    DeviceNameMissing(PathBuf),

    #[error(transparent)]
    DeviceNotFound(#[from] DeviceNotFound),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Swap(#[from] SwapError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Write timeout")]
    WriteTimeout,
}

impl SessionError {
    /// The reply sent to the client before the session closes, if any.
    ///
    /// Spawn failures answer a bare `ERROR`; socket failures answer nothing.
    pub fn reply(&self) -> Option<Reply> {
        match self {
            Self::Spawn(_) => Some(Reply::bare_error()),
            Self::Io(_) | Self::WriteTimeout => None,
            other => Some(Reply::error(other)),
        }
    }
}

/// Resources held while a session owns a modem.
#[derive(Debug)]
struct Held {
    lease: ModemLease,
    modem: Option<ManagedProcess>,
    cat: Option<ManagedProcess>,
    backup: Option<ConfigBackup>,
    monitor: Option<AudioMonitor>,
}

impl Held {
    fn new(lease: ModemLease) -> Self {
        Self {
            lease,
            modem: None,
            cat: None,
            backup: None,
            monitor: None,
        }
    }

    fn modem_name(&self) -> &str {
        &self.lease.descriptor().name
    }
}

#[derive(Debug)]
enum SessionState {
    Idle,
    Busy(Box<Held>),
    Closed,
}

/// What the loop should do after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

enum Event {
    Command(Result<Command, ProtocolError>),
    Disconnected,
    Stop,
    Level(Option<DbfsLevel>),
}

/// A single client connection.
pub struct ConnectionSession {
    id: u64,
    context: Arc<ServiceContext>,
    writer: BufWriter<OwnedWriteHalf>,
    commands: mpsc::Receiver<Result<Command, ProtocolError>>,
    telemetry: Option<mpsc::Receiver<DbfsLevel>>,
    stop: CancellationToken,
    state: SessionState,
    reader: Option<JoinHandle<()>>,
}

impl ConnectionSession {
    /// Creates a session and starts its reader task.
    ///
    /// `stop` should be a child of the process-wide token.
    pub fn new(
        id: u64,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        context: Arc<ServiceContext>,
        stop: CancellationToken,
    ) -> Self {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let reader = tokio::spawn(read_commands(id, reader, tx, stop.clone()));

        Self {
            id,
            context,
            writer: BufWriter::new(writer),
            commands,
            telemetry: None,
            stop,
            state: SessionState::Idle,
            reader: Some(reader),
        }
    }

    /// Runs the session until `stop`, disconnect, an error or cancellation,
    /// then tears everything down.
    pub async fn run(mut self) {
        debug!(session = self.id, "Session started");

        loop {
            let event = tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => Event::Command(command),
                    None => Event::Disconnected,
                },

                _ = self.stop.cancelled() => Event::Stop,

                level = next_level(&mut self.telemetry) => Event::Level(level),
            };

            match event {
                Event::Command(Ok(command)) => {
                    debug!(session = self.id, %command, "Received command");
                    match self.handle_command(command).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) => break,
                        Err(e) => {
                            warn!(session = self.id, error = %e, "Command failed, closing session");
                            if let Some(reply) = e.reply() {
                                if let Err(e) = self.write(&reply.encode()).await {
                                    debug!(session = self.id, error = %e, "Failed to write error reply");
                                }
                            }
                            break;
                        }
                    }
                }
                Event::Command(Err(e)) => {
                    debug!(session = self.id, error = %e, "Invalid command");
                    if let Err(e) = self.write(&Reply::invalid_command().encode()).await {
                        debug!(session = self.id, error = %e, "Failed to write reply");
                        break;
                    }
                }
                Event::Level(Some(level)) => {
                    if let Err(e) = self.write(&telemetry_line(level)).await {
                        debug!(session = self.id, error = %e, "Failed to write telemetry");
                        break;
                    }
                }
                Event::Level(None) => {
                    debug!(session = self.id, "Telemetry stream ended");
                    self.telemetry = None;
                }
                Event::Disconnected => {
                    debug!(session = self.id, "Client disconnected");
                    break;
                }
                Event::Stop => {
                    debug!(session = self.id, "Session stop requested");
                    break;
                }
            }
        }

        self.teardown().await;
    }

    async fn handle_command(&mut self, command: Command) -> Result<Flow, SessionError> {
        match command {
            Command::Start { modem } => {
                self.start(&modem).await?;
                self.write(&Reply::ok().encode()).await?;
            }
            Command::Monitor { modem } => {
                let device = self.monitor(&modem).await?;
                self.write(&Reply::ok().line(device).encode()).await?;
            }
            Command::Stop => {
                self.write(&Reply::ok().encode()).await?;
                return Ok(Flow::Close);
            }
            Command::Version => {
                let reply = Reply::ok().line(self.context.version.as_str());
                self.write(&reply.encode()).await?;
            }
            Command::List => {
                let reply = Reply::ok().lines(self.context.registry.names());
                self.write(&reply.encode()).await?;
            }
            Command::Config => {
                let reply = Reply::ok().lines(config_lines(
                    &self.context.config_path,
                    self.context.registry.iter().map(|m| m.descriptor()),
                ));
                self.write(&reply.encode()).await?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Takes the named modem's lock. Only an idle session may do so.
    fn acquire(&self, name: &str) -> Result<ModemLease, SessionError> {
        if let SessionState::Busy(held) = &self.state {
            return Err(SessionError::AlreadyHolding(held.modem_name().to_string()));
        }

        let modem = self
            .context
            .registry
            .find(name)
            .ok_or_else(|| SessionError::ModemNotFound(name.to_string()))?;

        modem
            .try_lease()
            .ok_or_else(|| SessionError::ModemBusy(name.to_string()))
    }

    /// `start <name>`: CAT control, config swap, modem, readiness.
    async fn start(&mut self, name: &str) -> Result<(), SessionError> {
        let lease = self.acquire(name)?;
        info!(session = self.id, modem = %name, "Starting modem");

        let mut held = Held::new(lease);
        let result = launch(&self.context, &self.stop, &mut held).await;

        // Partial progress stays with the session for teardown
        self.state = SessionState::Busy(Box::new(held));
        result
    }

    /// `monitor <name>`: resolve the capture device and start streaming.
    ///
    /// Returns the display name of the matched device.
    async fn monitor(&mut self, name: &str) -> Result<String, SessionError> {
        let lease = self.acquire(name)?;
        let descriptor = lease.descriptor().clone();
        let settings = self.context.settings;

        let target = configured_device_name(&descriptor)?;
        info!(session = self.id, modem = %name, device = %target, "Monitoring audio device");

        let audio = Arc::clone(&self.context.audio);
        let devices = tokio::task::spawn_blocking(move || audio.capture_devices())
            .await
            .map_err(|e| AudioError::Enumerate(e.to_string()))??;

        let device = resolve_device(&target, devices.iter().map(String::as_str), settings.match_threshold)?
            .to_string();

        let (tx, rx) = mpsc::channel(TELEMETRY_CAPACITY);
        let monitor = AudioMonitor::start(
            Arc::clone(&self.context.audio),
            device.clone(),
            tx,
            self.stop.child_token(),
        );

        let mut held = Held::new(lease);
        held.monitor = Some(monitor);
        self.state = SessionState::Busy(Box::new(held));
        self.telemetry = Some(rx);

        Ok(device)
    }

    /// Writes and flushes one encoded reply or telemetry line.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        let writer = &mut self.writer;
        match timeout(WRITE_TIMEOUT, async {
            writer.write_all(bytes).await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::Io(e.to_string())),
            Err(_) => Err(SessionError::WriteTimeout),
        }
    }

    /// Releases everything the session holds, in order:
    /// audio monitor, modem process, config restore, CAT control, lock,
    /// socket. Safe to call more than once.
    async fn teardown(&mut self) {
        // Close the queue first so a capture blocked on a full queue wakes up
        self.telemetry = None;

        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        if let SessionState::Busy(held) = state {
            let Held {
                lease,
                modem,
                cat,
                backup,
                monitor,
            } = *held;
            let grace = self.context.settings.stop_timeout;
            let name = lease.descriptor().name.clone();

            if let Some(monitor) = monitor {
                debug!(session = self.id, device = %monitor.device(), "Stopping audio monitor");
                monitor.stop().await;
            }
            if let Some(process) = modem {
                let outcome = process.graceful_stop(grace).await;
                debug!(session = self.id, modem = %name, ?outcome, "Modem process stopped");
            }
            if let Some(backup) = backup {
                debug!(session = self.id, config = %backup.original_path().display(), "Restoring modem config");
                backup.restore();
            }
            if let Some(process) = cat {
                let outcome = process.graceful_stop(grace).await;
                debug!(session = self.id, modem = %name, ?outcome, "CAT control stopped");
            }
            drop(lease);
            info!(session = self.id, modem = %name, "Modem released");
        }

        match timeout(WRITE_TIMEOUT, self.writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(session = self.id, error = %e, "Socket shutdown failed"),
            Err(_) => debug!(session = self.id, "Socket shutdown timed out"),
        }

        self.stop.cancel();
        // Unblocks a reader parked on a full queue
        self.commands.close();
        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.await {
                debug!(session = self.id, error = %e, "Reader task ended abnormally");
            }
        }

        debug!(session = self.id, "Session closed");
    }
}

/// Runs the fallible part of `start`, recording each acquired resource in
/// `held` as soon as it exists.
async fn launch(
    context: &ServiceContext,
    stop: &CancellationToken,
    held: &mut Held,
) -> Result<(), SessionError> {
    let descriptor = held.lease.descriptor().clone();

    if let Some(cat) = descriptor.cat_control() {
        let cmd = cat.cmd.as_deref().unwrap_or_default();
        let label = format!("{} CAT", descriptor.name);
        held.cat = Some(supervisor::spawn(&label, cmd, supervisor::cat_args(&cat.args))?);
    }

    if let Some(custom) = &descriptor.config {
        let target = descriptor
            .default_ini_path()
            .ok_or_else(|| SessionError::IniNotFound(descriptor.name.clone()))?;

        if same_file(custom, &target) {
            debug!(modem = %descriptor.name, "Override config is the default config, not swapping");
        } else {
            match swap::install(custom, &target) {
                Ok(backup) => held.backup = backup,
                Err(mut e) => {
                    held.backup = e.take_backup();
                    return Err(e.into());
                }
            }
        }
    }

    held.modem = Some(supervisor::spawn(
        &descriptor.name,
        &descriptor.cmd,
        supervisor::modem_args(&descriptor.args),
    )?);

    if let Some(port) = descriptor.resolve_port() {
        let settings = context.settings;
        if let Err(e) =
            readiness::wait_for_listener(port, settings.readiness_attempts, settings.readiness_interval, stop)
                .await
        {
            warn!(modem = %descriptor.name, error = %e, "Continuing without confirmed readiness");
        }
    } else {
        debug!(modem = %descriptor.name, "Modem port unknown, skipping readiness check");
    }

    Ok(())
}

/// Capture device name for a modem: the descriptor override, otherwise the
/// `Input Device Name` in the modem's ini.
fn configured_device_name(descriptor: &ModemDescriptor) -> Result<String, SessionError> {
    if let Some(name) = &descriptor.audio_input_name {
        return Ok(name.clone());
    }

    let path = descriptor
        .ini_path()
        .ok_or_else(|| SessionError::IniNotFound(descriptor.name.clone()))?;

    match ini::input_device_name(&path) {
        Ok(Some(name)) => Ok(name),
        Ok(None) => Err(SessionError::DeviceNameMissing(path)),
        Err(e) => {
            warn!(modem = %descriptor.name, error = %e, "Cannot read modem ini");
            Err(SessionError::DeviceNameMissing(path))
        }
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Lines of the `config` reply after `OK`.
pub fn config_lines<'a>(
    config_path: &Path,
    modems: impl IntoIterator<Item = &'a ModemDescriptor>,
) -> Vec<String> {
    let mut lines = vec![format!("Config path: {}", config_path.display())];

    for modem in modems {
        let cat = modem.cat_ctrl.clone().unwrap_or_default();
        let config = modem
            .config
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        lines.push(modem.name.clone());
        lines.push(format!("  Type: {}", modem.modem_type));
        lines.push(format!("  Cmd: {}", modem.cmd));
        lines.push(format!("  Args: {}", modem.args));
        lines.push(format!("  Config: {config}"));
        lines.push(format!("  CatCtrl.Port: {}", cat.port.unwrap_or(0)));
        lines.push(format!("  CatCtrl.Dialect: {}", cat.dialect));
        lines.push(format!("  CatCtrl.Cmd: {}", cat.cmd.unwrap_or_default()));
        lines.push(format!("  CatCtrl.Args: {}", cat.args));
    }

    lines
}

/// Next telemetry level; pending forever while not monitoring.
async fn next_level(telemetry: &mut Option<mpsc::Receiver<DbfsLevel>>) -> Option<DbfsLevel> {
    match telemetry {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Decodes client lines into commands until EOF, a read error, or `stop`.
/// Fires `stop` on the way out.
async fn read_commands(
    session: u64,
    reader: OwnedReadHalf,
    tx: mpsc::Sender<Result<Command, ProtocolError>>,
    stop: CancellationToken,
) {
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    // FramedRead yields one `None` after a decoder error before resuming
    let mut resuming = false;

    loop {
        let item = tokio::select! {
            _ = stop.cancelled() => break,
            item = lines.next() => item,
        };

        let parsed = match item {
            Some(Ok(line)) => {
                resuming = false;
                Command::parse(&line)
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                resuming = true;
                Err(ProtocolError::LineTooLong { max: MAX_LINE_LENGTH })
            }
            // The codec consumes the offending line before reporting it
            Some(Err(LinesCodecError::Io(e))) if e.kind() == io::ErrorKind::InvalidData => {
                resuming = true;
                Err(ProtocolError::InvalidEncoding)
            }
            Some(Err(LinesCodecError::Io(e))) => {
                debug!(session, error = %e, "Read failed");
                break;
            }
            None if resuming => {
                resuming = false;
                continue;
            }
            None => {
                debug!(session, "Client sent EOF");
                break;
            }
        };

        let sent = tokio::select! {
            _ = stop.cancelled() => break,
            sent = tx.send(parsed) => sent,
        };
        if sent.is_err() {
            break;
        }
    }

    stop.cancel();
}
