//! Range Locking
//!
//! Stripes are protected by extent locks held on their target object. The
//! adapter in this module translates between the striped object's view and
//! the lock service:
//!
//! ```text
//!   StripedObject ──acquire(stripe, mode, extent)──▶ ExtentLockAdapter
//!         ▲                                                 │ enqueue
//!         │ kms / lvb / mtime                               ▼
//!   StripeLockCallbacks ◀──blocking/canceling/glimpse── RangeLockService
//! ```
//!
//! Granted value blocks raise the stripe's known minimum size. A cancelled
//! lock stops vouching for its extent, so the known minimum size shrinks to
//! what the remaining locks cover. Glimpses replace the cached size with the
//! target's.

pub mod adapter;
pub mod types;

pub use adapter::{ExtentLockAdapter, StripeLockCallbacks};
pub use types::{
    kms_limit, EnqueueRequest, Extent, Grant, LockDesc, LockHandle, LockMode, Lvb,
    ResourceId,
};
