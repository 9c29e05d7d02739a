//! Domain Ports (Port/Adapter Pattern)
//!
//! The coordinator, the lock adapter and the recovery controller depend only
//! on these traits. Concrete implementations are injected at construction
//! time; the in-memory ones live in `crate::adapters`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  SubIo │ RangeLockService │ RpcTransport │ Quota    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  MemorySubIo │ LocalLockService │ LoopbackTransport │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::lock::{EnqueueRequest, Grant, LockDesc, LockHandle, Lvb, ResourceId};
use crate::recovery::Export;
use crate::stripe::{IoKind, StripeOp, StripedObject, TwoQueue};
use crate::wire::WireMessage;

// =============================================================================
// Stripe Sub-Operations
// =============================================================================

/// One stripe's share of a logical I/O.
///
/// The coordinator drives a sub-operation through the same phases as a
/// standalone I/O. `end`, `unlock`, `iter_fini` and `fini` cannot fail: the
/// coordinator calls them on every member regardless of earlier errors.
pub trait SubIo: Send {
    /// Bind to `stripe` of `object` for an operation of `kind`.
    fn init(&mut self, object: &Arc<StripedObject>, stripe: usize, kind: IoKind) -> Result<()>;

    /// Prepare one iteration of `op` (stripe-local coordinates).
    fn iter_init(&mut self, op: &StripeOp) -> Result<()>;

    /// Take the range lock `op` needs.
    fn lock(&mut self, op: &StripeOp) -> Result<()>;

    /// Issue the operation.
    fn start(&mut self, op: &StripeOp) -> Result<()>;

    /// Complete the operation. Called on every active member once `start`
    /// has run for the iteration, including members whose own start was
    /// never reached.
    fn end(&mut self, op: &StripeOp);

    fn unlock(&mut self);

    fn iter_fini(&mut self);

    /// Release everything bound by `init`.
    fn fini(&mut self);

    /// Bytes moved by the last iteration (bytes written back, for fsync).
    fn bytes_done(&self) -> u64;

    /// Move the pages this stripe accepts from `queue.qin` to `queue.qout`.
    fn submit(&mut self, queue: &mut TwoQueue) -> Result<()>;
}

/// Allocates sub-operations for a stripe device.
pub trait SubIoFactory: Send + Sync {
    fn alloc(&self) -> Result<Box<dyn SubIo>>;
}

// =============================================================================
// Range Locking
// =============================================================================

/// Callbacks the lock service invokes on behalf of a lock holder.
///
/// May run on any thread; implementations must not rely on the state of the
/// thread that enqueued the lock.
pub trait LockCallbacks: Send + Sync {
    /// Another request conflicts with this lock.
    fn blocking(&self, desc: &LockDesc);

    /// The lock was granted.
    fn completion(&self, _desc: &LockDesc) {}

    /// The lock is going away.
    ///
    /// `kms_limit` is one past the last byte still covered by another lock
    /// granted on the same resource, 0 when none remain.
    fn canceling(&self, desc: &LockDesc, kms_limit: u64);

    /// Report the holder's view of the resource without granting anything.
    fn glimpse(&self, desc: &LockDesc) -> Lvb;
}

/// Extent lock service.
pub trait RangeLockService: Send + Sync {
    fn enqueue(&self, request: EnqueueRequest, callbacks: Arc<dyn LockCallbacks>)
        -> Result<Grant>;

    /// Cancel a granted lock. Cancelling an unknown handle succeeds.
    fn cancel(&self, handle: LockHandle) -> Result<()>;
}

/// Authoritative per-resource attributes, as the target would report them.
pub trait LvbSource: Send + Sync {
    fn lvb(&self, resource: ResourceId) -> Lvb;
}

// =============================================================================
// RPC Transport
// =============================================================================

/// Reply to a connect request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectReply {
    /// Highest transaction the peer has committed.
    pub peer_committed: u64,
    /// Peer keeps replay state for this client.
    pub replayable: bool,
    /// Peer is waiting for clients to replay.
    pub recovering: bool,
}

/// Reliable request/response primitive.
///
/// Transport and timeout failures are reported as `Error::Transport`; a peer
/// that lost the connection reports `Error::NotConnected`.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn connect(&self, target: &str, conn_cnt: u32) -> Result<ConnectReply>;

    async fn send(&self, target: &str, request: &WireMessage) -> Result<WireMessage>;
}

/// Tears down an export's connection.
pub trait ExportDisconnector: Send + Sync {
    /// Receives its own reference to the export and releases it when done.
    fn disconnect(&self, export: Arc<Export>) -> Result<()>;
}

// =============================================================================
// Quota
// =============================================================================

/// Space accounting consulted before writes.
pub trait QuotaCapability: Send + Sync {
    /// Would `bytes` more fit within `owner`'s limit?
    fn check(&self, owner: &str, bytes: u64) -> Result<()>;

    /// Charge `bytes` to `owner`.
    fn acquire(&self, owner: &str, bytes: u64) -> Result<()>;

    /// Return `bytes` to `owner`'s allowance.
    fn release(&self, owner: &str, bytes: u64);
}
