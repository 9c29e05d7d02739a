//! Error types for stripenet

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errno-style status used on the wire when a message carries no status.
pub const EINVAL: i32 = -22;

/// Errors that can occur in the stripenet core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // =========================================================================
    // Protocol Format Errors
    // =========================================================================
    /// Magic does not identify any known envelope format
    #[error("bad envelope magic {magic:#010x}")]
    BadMagic { magic: u32 },

    /// Received fewer bytes than the envelope declares
    #[error("truncated message: received {len} bytes, envelope requires {required}")]
    Truncated { len: usize, required: usize },

    /// Protocol version field does not match
    #[error("protocol version mismatch: got {got:#010x}, expected {expected:#010x}")]
    VersionMismatch { got: u32, expected: u32 },

    /// Sub-buffer shorter than the caller requires
    #[error("buffer {index} too small: {len} < {min}")]
    BufferTooSmall { index: usize, len: usize, min: usize },

    /// Self-describing message without its envelope body
    #[error("message has no envelope body")]
    MissingBody,

    /// Message was never initialized or unpacked
    #[error("message is not initialized")]
    Uninitialized,

    // =========================================================================
    // Resource Exhaustion
    // =========================================================================
    /// No reply state became free within the pool wait period
    #[error("no free reply state after {waited_ms}ms")]
    ReplyPoolTimeout { waited_ms: u64 },

    /// Normal allocation refused under memory pressure
    #[error("allocation refused: {0}")]
    AllocationFailed(String),

    // =========================================================================
    // Stripe I/O Errors
    // =========================================================================
    /// A per-stripe sub-operation failed
    #[error("sub-operation on stripe {stripe} failed: {reason}")]
    SubOperation { stripe: usize, reason: String },

    /// Write against an object without stripes
    #[error("object has no stripes to write to")]
    BadDescriptor,

    /// Page fault outside any backing stripe
    #[error("page fault on unbacked object at page {index}")]
    Fault { index: u64 },

    /// Quota denied the operation
    #[error("quota exceeded for {owner}: {requested} bytes requested, {available} available")]
    QuotaExceeded {
        owner: String,
        requested: u64,
        available: u64,
    },

    // =========================================================================
    // Connectivity Errors
    // =========================================================================
    /// Transport failed to deliver a request or its reply
    #[error("transport error: {0}")]
    Transport(String),

    /// Peer reported that the connection is gone
    #[error("import {target} not connected")]
    NotConnected { target: String },

    /// Request was aborted by import invalidation
    #[error("request {xid} invalidated by import deactivation")]
    Invalidated { xid: u64 },

    // =========================================================================
    // Recovery Errors
    // =========================================================================
    /// Import did not leave recovery in time
    #[error("recovery of {target} timed out after {waited_ms}ms")]
    RecoveryTimeout { target: String, waited_ms: u64 },

    /// Recovery already underway
    #[error("recovery already in progress for {target}")]
    AlreadyInProgress { target: String },

    /// Resend requested outside of the RECOVER state
    #[error("import {target} is not in recover state ({state})")]
    NotInRecover { target: String, state: String },

    /// Import has been torn down
    #[error("import {target} is closed")]
    ImportClosed { target: String },

    /// Request was resent too many times
    #[error("request {xid} exceeded {limit} resends")]
    ResendLimit { xid: u64, limit: u32 },

    // =========================================================================
    // Locking Errors
    // =========================================================================
    /// Range lock could not be obtained or released
    #[error("lock error on target {target} object {object}: {reason}")]
    Lock {
        target: u32,
        object: u64,
        reason: String,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Protocol-format errors reject a single message and are never fatal.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::BadMagic { .. }
                | Error::Truncated { .. }
                | Error::VersionMismatch { .. }
                | Error::BufferTooSmall { .. }
                | Error::MissingBody
                | Error::Uninitialized
        )
    }

    /// Connectivity errors move the import to DISCON and schedule a resend.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::NotConnected { .. })
    }

    /// Errno-style code for the status field of an error reply.
    pub fn errno(&self) -> i32 {
        match self {
            Error::BadMagic { .. }
            | Error::Truncated { .. }
            | Error::VersionMismatch { .. }
            | Error::BufferTooSmall { .. }
            | Error::MissingBody
            | Error::Uninitialized => -71, // EPROTO
            Error::ReplyPoolTimeout { .. } | Error::AllocationFailed(_) => -12, // ENOMEM
            Error::SubOperation { .. } => -5,                                  // EIO
            Error::BadDescriptor => -9,                                        // EBADF
            Error::Fault { .. } => -14,                                        // EFAULT
            Error::QuotaExceeded { .. } => -122,                               // EDQUOT
            Error::Transport(_) | Error::NotConnected { .. } => -107,          // ENOTCONN
            Error::Invalidated { .. } => -4,                                   // EINTR
            Error::RecoveryTimeout { .. } => -110,                             // ETIMEDOUT
            Error::AlreadyInProgress { .. } => -114,                           // EALREADY
            Error::NotInRecover { .. } | Error::ResendLimit { .. } => -1,      // EPERM
            Error::ImportClosed { .. } => -108,                                // ESHUTDOWN
            Error::Lock { .. } => -37,                                         // ENOLCK
            Error::Config(_) | Error::DurationParse(_) => EINVAL,
            Error::Internal(_) => -5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Truncated {
            len: 10,
            required: 40,
        };
        assert_eq!(
            err.to_string(),
            "truncated message: received 10 bytes, envelope requires 40"
        );

        let err = Error::SubOperation {
            stripe: 2,
            reason: "target offline".to_string(),
        };
        assert!(err.to_string().contains("stripe 2"));
    }

    #[test]
    fn test_error_classes() {
        assert!(Error::BadMagic { magic: 0 }.is_protocol());
        assert!(!Error::BadMagic { magic: 0 }.is_connectivity());
        assert!(Error::Transport("reset".into()).is_connectivity());
        assert!(!Error::MissingBody.is_connectivity());
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::BadDescriptor.errno(), -9);
        assert_eq!(Error::Fault { index: 3 }.errno(), -14);
        assert_eq!(
            Error::AlreadyInProgress {
                target: "ost0".into()
            }
            .errno(),
            -114
        );
        assert_eq!(Error::Config("x".into()).errno(), EINVAL);
    }
}
