use crate::source::TimeSource;
use thiserror::Error;

/// Detector error types covering setup, topology, and time-source failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WarpError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Shared memory region could not be created.
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    /// A worker process or thread could not be launched or reaped.
    #[error("worker spawn error: {0}")]
    Spawn(String),

    /// CPU pinning failed.
    #[error("CPU affinity error: {0}")]
    Affinity(String),

    /// Reading a time source failed.
    #[error("failed to read {clock} time source: {reason}")]
    Clock {
        /// Source that failed.
        clock: TimeSource,
        /// Underlying failure.
        reason: String,
    },

    /// I/O operation error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Time source not available on this platform.
    #[error("{0} time source is not supported on this platform")]
    Unsupported(TimeSource),

    /// A worker terminated abnormally.
    #[error("worker {worker} failed: {reason}")]
    Worker {
        /// Worker identifier (pid or thread index).
        worker: i64,
        /// Termination reason.
        reason: String,
    },
}

/// Convenience type alias for detector operations.
pub type WarpResult<T> = Result<T, WarpError>;
