//! Audio input level monitoring.
//!
//! Capture runs on a blocking thread behind [`AudioBackend`]. Every buffer
//! is reduced to one [`DbfsLevel`] and pushed onto a bounded queue with a
//! blocking send, so a slow client slows the producer instead of losing
//! samples. The capture ends when its stop token fires or the queue closes.
//!
//! ```text
//! ┌──────────────┐  &[i16]   ┌────────────┐  DbfsLevel  ┌─────────────┐
//! │ AudioBackend │──────────▶│ BufferSink │────────────▶│ mpsc (32)   │──▶ session
//! │ (blocking)   │           │ measure()  │ blocking    └─────────────┘
//! └──────────────┘           └────────────┘ send
//! ```

#[cfg(feature = "cpal")]
mod cpal_backend;

#[cfg(feature = "cpal")]
pub use cpal_backend::CpalBackend;

use std::sync::Arc;
use std::time::Duration;

use rigkeeper_core::DbfsLevel;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of a session's telemetry queue.
pub const TELEMETRY_CAPACITY: usize = 32;

/// Capture sample rate in Hz.
pub const SAMPLE_RATE: u32 = 44_100;

/// Capture channel count.
pub const CHANNELS: u16 = 1;

/// Requested frames per buffer (~100 ms).
pub const BUFFER_FRAMES: u32 = 4_410;

/// Receives each captured buffer of signed 16-bit samples.
pub type BufferSink = Box<dyn FnMut(&[i16]) + Send + 'static>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("audio capture is not available in this build")]
    Unavailable,

    #[error("failed to enumerate capture devices: {0}")]
    Enumerate(String),

    #[error("capture device '{0}' disappeared")]
    DeviceGone(String),

    #[error("failed to open capture stream on '{device}': {reason}")]
    Stream { device: String, reason: String },
}

/// Source of capture devices and sample buffers.
///
/// Both methods block and are called from `spawn_blocking` threads.
pub trait AudioBackend: Send + Sync + 'static {
    /// Display names of the available capture devices, in enumeration order.
    fn capture_devices(&self) -> Result<Vec<String>, AudioError>;

    /// Captures from `device`, handing every buffer to `sink`, until `stop`
    /// is cancelled. The device must be released before returning.
    fn capture(&self, device: &str, sink: BufferSink, stop: CancellationToken)
        -> Result<(), AudioError>;
}

/// Backend used when the crate is built without audio support.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl AudioBackend for NullBackend {
    fn capture_devices(&self) -> Result<Vec<String>, AudioError> {
        Err(AudioError::Unavailable)
    }

    fn capture(&self, _device: &str, _sink: BufferSink, _stop: CancellationToken)
        -> Result<(), AudioError> {
        Err(AudioError::Unavailable)
    }
}

/// Returns the backend selected at build time.
pub fn default_backend() -> Arc<dyn AudioBackend> {
    #[cfg(feature = "cpal")]
    {
        Arc::new(CpalBackend::new())
    }
    #[cfg(not(feature = "cpal"))]
    {
        Arc::new(NullBackend)
    }
}

/// Blocks the calling (non-async) thread until `stop` is cancelled.
pub fn block_until_cancelled(stop: &CancellationToken) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle.block_on(stop.cancelled()),
        Err(_) => {
            while !stop.is_cancelled() {
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

/// A running capture feeding a telemetry queue.
#[derive(Debug)]
pub struct AudioMonitor {
    device: String,
    stop: CancellationToken,
    task: JoinHandle<Result<(), AudioError>>,
}

impl AudioMonitor {
    /// Starts capturing from `device` on a blocking thread.
    ///
    /// `stop` should be a child of the owning session's token so that
    /// process-wide shutdown also ends the capture.
    pub fn start(
        backend: Arc<dyn AudioBackend>,
        device: impl Into<String>,
        tx: mpsc::Sender<DbfsLevel>,
        stop: CancellationToken,
    ) -> Self {
        let device = device.into();
        let thread_device = device.clone();
        let thread_stop = stop.clone();

        let task = tokio::task::spawn_blocking(move || {
            let sink_stop = thread_stop.clone();
            let sink: BufferSink = Box::new(move |samples: &[i16]| {
                if sink_stop.is_cancelled() {
                    return;
                }
                if tx.blocking_send(DbfsLevel::measure(samples)).is_err() {
                    // Receiver gone: nobody is listening any more
                    sink_stop.cancel();
                }
            });

            info!(device = %thread_device, "Audio capture started");
            let result = backend.capture(&thread_device, sink, thread_stop);
            match &result {
                Ok(()) => info!(device = %thread_device, "Audio capture stopped"),
                Err(e) => warn!(device = %thread_device, error = %e, "Audio capture failed"),
            }
            result
        });

        Self { device, stop, task }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Cancels the capture and waits for the capture thread to finish.
    ///
    /// The telemetry receiver should be dropped first so a producer blocked
    /// on a full queue is released.
    pub async fn stop(self) {
        self.stop.cancel();
        match self.task.await {
            Ok(_) => debug!(device = %self.device, "Audio capture thread joined"),
            Err(e) => warn!(device = %self.device, error = %e, "Audio capture thread panicked"),
        }
    }
}
