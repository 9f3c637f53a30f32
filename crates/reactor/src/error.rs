//! Error taxonomy for the reactor and message layer.
use std::io;

use thiserror::Error;

/// Errors raised across the reactor, message, and connection layers.
#[derive(Error, Debug)]
pub enum Error {
    /// Address parse failure.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Decode failure or oversize line.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Wrong type requested from a parameter, or parameter missing.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// Why the value could not be read as the requested type.
        reason: String,
    },

    /// Datagram payload exceeds the configured maximum.
    #[error("message of {size} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge {
        /// Encoded size of the message.
        size: usize,
        /// Configured maximum datagram size.
        max: usize,
    },

    /// The poll syscall failed with a non-recoverable errno.
    #[error("poll failed: {0}")]
    PollFailure(#[source] io::Error),

    /// Netlink process-event subscription requires a capability the caller lacks.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// An underlying I/O error not covered by a more specific variant.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A bug-class invariant violation. Never expected to occur; re-thrown
    /// rather than swallowed by the dispatcher's per-handler error boundary.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
