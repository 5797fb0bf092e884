//! Error types for the drover runtime.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the drover runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Worker executable was not found by any resolution step.
    #[error(
        "drover worker executable not found. Set DROVER_WORKER_EXE or install drover-worker on PATH"
    )]
    WorkerNotFound,

    /// Worker executable reported a version below the supported minimum.
    #[error("worker version {found} is older than the minimum supported {minimum}")]
    WorkerVersionTooLow { found: String, minimum: String },

    /// Failed to launch the worker process.
    #[error("failed to launch worker: {0}")]
    LaunchFailed(String),

    /// Worker process exited without being asked to.
    #[error("worker process exited unexpectedly (status {code:?}){}", format_tail(.stderr_tail))]
    ProcessCrashed {
        /// Exit code, if the process exited rather than being signalled.
        code: Option<i32>,
        /// Bounded excerpt of the worker's stderr, newest lines last.
        stderr_tail: String,
    },

    /// The byte stream to the worker is gone; also used to fail requests
    /// that were still pending when it went.
    #[error("disconnected from worker: {0}")]
    Disconnected(String),

    /// The byte stream produced bytes that do not frame correctly.
    #[error("framing error: {0}")]
    Framing(#[from] drover_protocol::FramingError),

    /// Structurally valid frame that cannot be handled.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Worker executed the command and reported failure.
    #[error("{name}: {message}")]
    Remote {
        /// Worker-side error classification (e.g. "TimeoutError", "UnknownResourceError").
        name: String,
        /// Human-readable error message from the worker.
        message: String,
    },

    /// No response arrived before the per-call deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Operation attempted through a handle that was already disposed.
    #[error("object disposed: {id}")]
    ObjectDisposed { id: String },

    /// No object with this id in the registry.
    #[error("object not found: {id}")]
    ObjectNotFound { id: String },

    /// An internal channel closed, meaning the connection task is gone.
    #[error("connection closed unexpectedly")]
    ChannelClosed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_tail(tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!("; stderr tail:\n{tail}")
    }
}

impl Error {
    /// Returns the worker's error name if this is a Remote error.
    pub fn error_name(&self) -> Option<&str> {
        match self {
            Error::Remote { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Returns true if this error means the deadline elapsed, locally or
    /// worker-side.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Remote { name, .. } => name == "TimeoutError",
            _ => false,
        }
    }

    /// Returns true if the worker classified this as a network failure.
    pub fn is_network(&self) -> bool {
        match self {
            Error::Remote { name, message } => {
                name == "NetworkError" || message.contains("net::ERR")
            }
            _ => false,
        }
    }

    /// Returns true if the worker itself is gone, as opposed to one
    /// command failing.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::Disconnected(_) | Error::ProcessCrashed { .. } | Error::ChannelClosed
        )
    }
}
