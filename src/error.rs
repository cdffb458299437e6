//! Error taxonomy for job dispatch.
//!
//! Every variant except `ShutdownInProgress` is fatal to the connection that
//! produced it and to nothing else.

use crate::kernel::KernelError;
use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Frame shorter than declared, oversized, or an undecodable payload.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Scratch or output file failure.
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The convolution step could not be launched, failed, or wrote nothing.
    #[error("convolution step failed: {0}")]
    ExternalProcess(String),

    /// Socket-level failure.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// Kernel file rejected before sending.
    #[error("invalid kernel '{}': {source}", path.display())]
    InvalidKernel {
        path: PathBuf,
        #[source]
        source: KernelError,
    },

    /// Some requests of a load run got no response.
    #[error("{failed} of {total} requests failed")]
    LoadFailed { failed: usize, total: usize },

    /// The accept loop has observed the shutdown signal.
    #[error("server is shutting down")]
    ShutdownInProgress,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
