use std::{borrow::Cow, io, sync::Arc};

use thiserror::Error;
use tracing::warn;

/// Errors that occur while metrics move through the pipeline.
///
/// None of these are returned from the hot-path recording calls. They are delivered to the configured failure callback
/// as they happen, and the most recent write failure is handed back from [`Pipeline::flush`][crate::Pipeline::flush]
/// and [`Pipeline::close`][crate::Pipeline::close]. `close` also returns [`Error::Abandoned`] when its final flush could
/// not reach the backend.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// A metric could not be encoded by the configured protocol.
    #[error("failed to encode metric `{key}`: {source}")]
    Encode {
        /// Encoded identity of the metric.
        key: String,

        /// Reason given by the protocol.
        source: EncodeError,
    },

    /// Establishing a connection to the backend failed.
    #[error("failed to connect over {transport}: {source}")]
    Dial {
        /// Transport that was being dialed.
        transport: &'static str,

        /// Underlying I/O error.
        source: Arc<io::Error>,
    },

    /// Writing a payload to the backend failed, and the payload was lost.
    #[error("failed to write {bytes} byte payload: {source}")]
    Write {
        /// Size of the lost payload.
        bytes: usize,

        /// Underlying I/O error.
        source: Arc<io::Error>,
    },

    /// The delivery queue was full, and the job was dropped.
    #[error("delivery queue is full (capacity {capacity}), job dropped")]
    QueueFull {
        /// Capacity of the delivery queue.
        capacity: usize,
    },

    /// The delivery queue was closed, and the job was dropped.
    #[error("delivery queue is closed, job dropped")]
    QueueClosed,

    /// Processing a job panicked. The pipeline recovered and kept running.
    #[error("panicked while {context}: {message}")]
    Panicked {
        /// What the pipeline was doing.
        context: &'static str,

        /// Panic payload, if it was a string.
        message: String,
    },

    /// The pipeline shut down while disconnected, and buffered bytes were discarded.
    #[error("shut down while disconnected, {bytes} buffered bytes discarded")]
    Abandoned {
        /// Number of bytes that were never written.
        bytes: usize,
    },

    /// The pipeline has already been closed.
    #[error("pipeline is closed")]
    Closed,
}

impl Error {
    pub(crate) fn dial(transport: &'static str, source: io::Error) -> Self {
        Error::Dial { transport, source: Arc::new(source) }
    }

    pub(crate) fn write(bytes: usize, source: io::Error) -> Self {
        Error::Write { bytes, source: Arc::new(source) }
    }
}

/// A protocol failed to encode a metric.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{reason}")]
pub struct EncodeError {
    reason: Cow<'static, str>,
}

impl EncodeError {
    /// Creates a new `EncodeError` with the given reason.
    pub fn new<R>(reason: R) -> Self
    where
        R: Into<Cow<'static, str>>,
    {
        Self { reason: reason.into() }
    }

    /// Returns the reason encoding failed.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Errors that could occur while building a pipeline or aggregator.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The buffer size was zero.
    #[error("buffer size must be greater than zero")]
    InvalidBufferSize,

    /// The retry bounds were zero or inverted.
    #[error("invalid retry bounds: minimum {min:?} must be non-zero and no greater than maximum {max:?}")]
    InvalidRetryBounds {
        /// Configured minimum.
        min: std::time::Duration,

        /// Configured maximum.
        max: std::time::Duration,
    },

    /// The sample rate was not in `(0, 1]`.
    #[error("sample rate must be in (0, 1], got {rate}")]
    InvalidSampleRate {
        /// Configured rate.
        rate: f64,
    },

    /// A set of histogram bucket bounds was empty, unsorted, or contained a non-finite value.
    #[error("invalid histogram buckets: {reason}")]
    InvalidBuckets {
        /// Details about the problem.
        reason: String,
    },

    /// Failed to parse the remote address.
    #[error("invalid remote address: {reason}")]
    InvalidRemoteAddress {
        /// Details about the parsing failure.
        reason: String,
    },

    /// Failed to spawn a background thread.
    #[error("failed to spawn background thread `{name}`")]
    Backend {
        /// Name of the thread.
        name: &'static str,

        /// Error returned when spawning the thread.
        #[source]
        source: io::Error,
    },
}

/// Callback invoked with every asynchronous pipeline failure.
pub type FailCallback = Arc<dyn Fn(&Error) + Send + Sync + 'static>;

pub(crate) fn default_fail_callback() -> FailCallback {
    Arc::new(|error: &Error| warn!(%error, "Metrics pipeline failure."))
}

#[cfg(test)]
mod tests {
    use std::{error::Error as _, io};

    use super::{BuildError, Error};

    #[test]
    fn io_failures_keep_their_source() {
        let spawn = BuildError::Backend {
            name: "metrics-pipeline-connection",
            source: io::Error::new(io::ErrorKind::WouldBlock, "too many threads"),
        };
        assert_eq!(spawn.to_string(), "failed to spawn background thread `metrics-pipeline-connection`");
        assert_eq!(spawn.source().map(ToString::to_string).as_deref(), Some("too many threads"));

        let write = Error::write(13, io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(write, Error::Write { bytes: 13, .. }));
        assert!(write.source().is_some());
    }
}
