use std::path::PathBuf;

use crate::traits::BusAddress;

/// Errors that can occur in bus transport and trigger line operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to open a handle for the given bus address.
    #[error("failed to open {address}: {source}")]
    Open {
        address: BusAddress,
        source: std::io::Error,
    },

    /// Failed to bind the emulated bus endpoint.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming coordinator connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred during an exchange.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An exchange was attempted on a device whose select line is not asserted.
    #[error("{0} is not selected")]
    NotSelected(BusAddress),

    /// The device returned a different number of bytes than were clocked out.
    #[error("short exchange on {address} ({got} of {expected} bytes)")]
    ShortExchange {
        address: BusAddress,
        expected: usize,
        got: usize,
    },

    /// The emulated socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The device or line state lock was poisoned by a panicking holder.
    #[error("shared state poisoned: {0}")]
    Poisoned(&'static str),

    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;
