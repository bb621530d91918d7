//! Virtual interface error types.

use std::io;
use thiserror::Error;

/// Errors raised by virtual interface backends
#[derive(Debug, Error)]
pub enum TunError {
    /// Device could not be created or opened
    #[error("failed to create interface: {0}")]
    Create(String),

    /// Address, MTU, DNS or route configuration failed
    #[error("failed to configure interface: {0}")]
    Configure(String),

    /// I/O error from the device
    #[error("interface I/O error: {0}")]
    Io(#[from] io::Error),

    /// No packet arrived within the backend's wait period
    #[error("interface read timed out")]
    Timeout,

    /// Interface has been closed
    #[error("interface is closed")]
    Closed,

    /// Backend not available on this platform
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Native driver library could not be loaded or lacks an entry point
    #[error("failed to load driver library: {0}")]
    LibraryLoad(String),
}

impl TunError {
    /// True when the caller should simply try again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Result type for interface operations
pub type TunResult<T> = Result<T, TunError>;
