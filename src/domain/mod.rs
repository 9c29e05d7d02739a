//! Domain Layer
//!
//! Ports the core depends on, plus the small value types shared between
//! them.
//!
//! # Usage
//!
//! ```ignore
//! use stripenet::domain::{AllocStrategy, SubIoFactory};
//!
//! // Inject concrete implementations at construction time
//! let device = StripeDevice::new(factory, reserve_slots)?;
//! ```

pub mod ports;

pub use ports::{
    ConnectReply, ExportDisconnector, LockCallbacks, LvbSource, QuotaCapability,
    RangeLockService, RpcTransport, SubIo, SubIoFactory,
};

/// How a caller wants memory for a submit or a reply obtained.
///
/// `Reserved` is used when ordinary allocation is unsafe in the calling
/// context: it draws from a small preallocated pool and may block on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocStrategy {
    #[default]
    Normal,
    Reserved,
}
