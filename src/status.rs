use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::{Result, YoloError};

/// Snapshot pushed to the status sink after every step and on failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Global step the update refers to.
    pub step: u64,
    /// Percentage of the planned examples processed.
    pub progress: f64,
    /// Fatal error message, if the run failed.
    pub error: Option<String>,
    /// Whether the run has finished.
    pub done: bool,
}

/// Receives status updates. Delivery is best-effort.
pub trait StatusSink: Send + Sync {
    /// Deliver one update.
    fn send(&self, update: &StatusUpdate) -> Result<()>;
}

/// Drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl StatusSink for NullSink {
    fn send(&self, _update: &StatusUpdate) -> Result<()> {
        Ok(())
    }
}

/// Forwards updates over a channel without ever blocking.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<StatusUpdate>,
}

impl ChannelSink {
    /// Wrap the sending half of a channel.
    pub fn new(tx: Sender<StatusUpdate>) -> Self {
        Self { tx }
    }
}

impl StatusSink for ChannelSink {
    fn send(&self, update: &StatusUpdate) -> Result<()> {
        match self.tx.try_send(update.clone()) {
            Ok(()) => Ok(()),
            // a slow consumer only misses intermediate progress
            Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(YoloError::IoError(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "status receiver disconnected",
            ))),
        }
    }
}

/// Writes the latest update as JSON to a flags file watched by another process.
#[derive(Debug, Clone)]
pub struct FlagFileSink {
    path: PathBuf,
}

impl FlagFileSink {
    /// Write updates to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read back the last update written.
    pub fn read(&self) -> Result<StatusUpdate> {
        Ok(serde_json::from_slice(&std::fs::read(&self.path)?)?)
    }
}

impl StatusSink for FlagFileSink {
    fn send(&self, update: &StatusUpdate) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(update)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

struct ControlInner {
    abort: AtomicBool,
    kill: AtomicBool,
    // f64 bits of the last reported progress
    progress: AtomicU64,
    error: Mutex<Option<String>>,
    sink: Box<dyn StatusSink>,
}

/// Shared control surface of a training run.
///
/// Clones observe the same signals, so a run driven on one thread can be aborted and
/// inspected from another.
#[derive(Clone)]
pub struct Control {
    inner: Arc<ControlInner>,
}

impl Default for Control {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl Control {
    /// Create a control reporting to `sink`.
    pub fn new(sink: impl StatusSink + 'static) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                abort: AtomicBool::new(false),
                kill: AtomicBool::new(false),
                progress: AtomicU64::new(0f64.to_bits()),
                error: Mutex::new(None),
                sink: Box::new(sink),
            }),
        }
    }

    /// Ask the loop to stop at the next step boundary.
    pub fn request_abort(&self) {
        self.inner.abort.store(true, Ordering::SeqCst);
    }

    /// Whether an abort was requested.
    pub fn abort_requested(&self) -> bool {
        self.inner.abort.load(Ordering::SeqCst)
    }

    /// Whether the run died on a fatal error.
    pub fn is_killed(&self) -> bool {
        self.inner.kill.load(Ordering::SeqCst)
    }

    /// Message of the fatal error that killed the run.
    pub fn error(&self) -> Option<String> {
        self.inner
            .error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Last progress pushed through [`Control::report`].
    pub fn progress(&self) -> f64 {
        f64::from_bits(self.inner.progress.load(Ordering::SeqCst))
    }

    /// Push an update; failures are logged and swallowed.
    pub fn report(&self, update: &StatusUpdate) {
        self.inner
            .progress
            .store(update.progress.to_bits(), Ordering::SeqCst);
        if let Err(e) = self.inner.sink.send(update) {
            tracing::warn!("status update for step {} not delivered: {e}", update.step);
        }
    }

    /// Record a fatal error, raise the kill flag and notify the sink.
    ///
    /// Returns the error so callers can write `return Err(control.fail(step, err))`.
    pub fn fail(&self, step: u64, err: YoloError) -> YoloError {
        let msg = err.to_string();
        tracing::error!("{msg}");
        *self
            .inner
            .error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(msg.clone());
        self.inner.kill.store(true, Ordering::SeqCst);
        self.report(&StatusUpdate {
            step,
            progress: self.progress(),
            error: Some(msg),
            done: false,
        });
        err
    }
}
