//! Reply states and the bounded reply-state pool.
//!
//! A [`ReplyState`] owns an outgoing reply envelope while it is scheduled,
//! on the network, or referenced by export bookkeeping. Shared ownership is
//! expressed with `Arc`; dropping the last reference frees the state, which
//! is only legal once every in-flight flag is clear.
//!
//! When the caller signals memory pressure the reply buffer comes from a
//! small set of preallocated buffers owned by the service. Waiting for one
//! is bounded; running out of time is a hard allocation failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::{compute_size, WireMessage, MSG_REPLY};
use crate::domain::AllocStrategy;
use crate::error::{Error, Result};
use crate::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Reply pool configuration
#[derive(Debug, Clone)]
pub struct ReplyPoolConfig {
    /// Number of preallocated reply buffers
    pub prealloc: usize,
    /// Size of each preallocated buffer
    pub max_reply_size: usize,
    /// How long to wait for a free buffer
    pub wait: Duration,
}

impl Default for ReplyPoolConfig {
    fn default() -> Self {
        Self {
            prealloc: 4,
            max_reply_size: 16 * 1024,
            wait: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Reply State
// =============================================================================

/// In-flight flags of a reply state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyFlags {
    pub scheduled: bool,
    pub on_net: bool,
    pub handled: bool,
    /// Needs commit handling before it can be released.
    pub difficult: bool,
}

impl ReplyFlags {
    /// Whether the state may be freed.
    pub fn can_free(&self) -> bool {
        !self.scheduled && !self.on_net && (!self.difficult || self.handled)
    }
}

struct ReplyInner {
    msg: WireMessage,
    flags: ReplyFlags,
}

/// Server-side reply in flight.
pub struct ReplyState {
    inner: Mutex<ReplyInner>,
    packed_final: bool,
    pool: Option<Arc<PoolShared>>,
}

impl std::fmt::Debug for ReplyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ReplyState")
            .field("msg", &inner.msg)
            .field("flags", &inner.flags)
            .field("packed_final", &self.packed_final)
            .field("preallocated", &self.pool.is_some())
            .finish()
    }
}

impl ReplyState {
    /// Run `f` against the reply envelope.
    pub fn with_msg<R>(&self, f: impl FnOnce(&mut WireMessage) -> R) -> R {
        f(&mut self.inner.lock().msg)
    }

    pub fn flags(&self) -> ReplyFlags {
        self.inner.lock().flags
    }

    /// Update the in-flight flags.
    pub fn update_flags(&self, f: impl FnOnce(&mut ReplyFlags)) {
        f(&mut self.inner.lock().flags);
    }

    /// False for early replies that will be followed by the real one.
    pub fn is_packed_final(&self) -> bool {
        self.packed_final
    }

    /// Whether the buffer came from the reserved pool.
    pub fn is_preallocated(&self) -> bool {
        self.pool.is_some()
    }
}

impl Drop for ReplyState {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(pool) = self.pool.take() {
            let msg = std::mem::take(&mut inner.msg);
            pool.give_back(msg.into_buffer());
        }
        if !std::thread::panicking() {
            assert!(
                inner.flags.can_free(),
                "reply state freed while in flight: {:?}",
                inner.flags
            );
        }
    }
}

// =============================================================================
// Pool
// =============================================================================

struct PoolShared {
    free: Mutex<Vec<BytesMut>>,
    available: Condvar,
    max_reply_size: usize,
}

impl PoolShared {
    fn give_back(&self, mut buf: BytesMut) {
        buf.clear();
        self.free.lock().push(buf);
        self.available.notify_one();
    }
}

/// Per-service pool of preallocated reply buffers.
pub struct ReplyStatePool {
    shared: Arc<PoolShared>,
    wait: Duration,
}

impl ReplyStatePool {
    pub fn new(config: ReplyPoolConfig) -> Self {
        let free = (0..config.prealloc)
            .map(|_| BytesMut::with_capacity(config.max_reply_size))
            .collect();
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(free),
                available: Condvar::new(),
                max_reply_size: config.max_reply_size,
            }),
            wait: config.wait,
        }
    }

    /// Number of preallocated buffers currently free.
    pub fn available(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Borrow a preallocated buffer, waiting at most the configured period.
    fn take_reserved(&self, size: usize) -> Result<BytesMut> {
        if size > self.shared.max_reply_size {
            return Err(Error::AllocationFailed(format!(
                "reply of {} bytes exceeds reserved size {}",
                size, self.shared.max_reply_size
            )));
        }

        let deadline = Instant::now() + self.wait;
        let mut free = self.shared.free.lock();
        if free.is_empty() {
            metrics::REPLY_POOL_WAITS.inc();
            debug!(size, "waiting for a free reply state");
        }
        while free.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                metrics::REPLY_POOL_TIMEOUTS.inc();
                warn!(
                    waited_ms = self.wait.as_millis() as u64,
                    "no reply state became free"
                );
                return Err(Error::ReplyPoolTimeout {
                    waited_ms: self.wait.as_millis() as u64,
                });
            }
            self.shared.available.wait_for(&mut free, deadline - now);
        }
        free.pop()
            .ok_or_else(|| Error::Internal("reply pool emptied under lock".to_string()))
    }

    /// Allocate a reply state able to hold `size` bytes.
    pub fn alloc(&self, size: usize, strategy: AllocStrategy) -> Result<ReplyState> {
        let (buf, pool) = match strategy {
            AllocStrategy::Normal => (BytesMut::with_capacity(size), None),
            AllocStrategy::Reserved => (self.take_reserved(size)?, Some(self.shared.clone())),
        };
        Ok(ReplyState {
            inner: Mutex::new(ReplyInner {
                msg: WireMessage::from_buffer(buf),
                flags: ReplyFlags::default(),
            }),
            packed_final: true,
            pool,
        })
    }
}

/// Build the reply for `request` in a freshly allocated reply state.
///
/// The reply uses the request's format and copies its opcode. An early
/// reply is not final: the real reply will be packed later.
pub fn pack_reply(
    pool: &ReplyStatePool,
    request: &WireMessage,
    lens: &[u32],
    contents: &[&[u8]],
    strategy: AllocStrategy,
    early: bool,
) -> Result<Arc<ReplyState>> {
    let format = request.format().ok_or(Error::Uninitialized)?;
    let size = compute_size(format, lens);
    let mut rs = pool.alloc(size, strategy)?;

    let inner = rs.inner.get_mut();
    let buf = std::mem::take(&mut inner.msg).into_buffer();
    let mut msg = WireMessage::pack_in(buf, format, lens, contents);
    msg.set_type(MSG_REPLY);
    msg.set_opc(request.opc()?);
    msg.set_conn_cnt(request.conn_cnt()?);
    msg.set_last_xid(request.last_xid()?);
    inner.msg = msg;
    rs.packed_final = !early;

    debug!(size, early, preallocated = rs.is_preallocated(), "packed reply");
    Ok(Arc::new(rs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{MsgFormat, BODY_SIZE};
    use assert_matches::assert_matches;

    fn request() -> WireMessage {
        let mut req = WireMessage::pack_request(MsgFormat::SelfDescribing, 33, &[BODY_SIZE as u32], &[]);
        req.set_conn_cnt(4);
        req
    }

    fn small_pool(prealloc: usize) -> ReplyStatePool {
        ReplyStatePool::new(ReplyPoolConfig {
            prealloc,
            max_reply_size: 4096,
            wait: Duration::from_millis(50),
        })
    }

    #[test]
    fn test_flags_free_rule() {
        let mut flags = ReplyFlags::default();
        assert!(flags.can_free());
        flags.difficult = true;
        assert!(!flags.can_free());
        flags.handled = true;
        assert!(flags.can_free());
        flags.on_net = true;
        assert!(!flags.can_free());
    }

    #[test]
    fn test_pack_reply_copies_request_fields() {
        let pool = small_pool(1);
        let rs = pack_reply(
            &pool,
            &request(),
            &[BODY_SIZE as u32, 8],
            &[],
            AllocStrategy::Normal,
            false,
        )
        .unwrap();
        assert!(rs.is_packed_final());
        assert!(!rs.is_preallocated());
        rs.with_msg(|msg| {
            assert_eq!(msg.msg_type().unwrap(), MSG_REPLY);
            assert_eq!(msg.opc().unwrap(), 33);
            assert_eq!(msg.conn_cnt().unwrap(), 4);
            assert_eq!(msg.bufcount(), 2);
        });
    }

    #[test]
    fn test_early_reply_not_final() {
        let pool = small_pool(1);
        let rs = pack_reply(
            &pool,
            &request(),
            &[BODY_SIZE as u32],
            &[],
            AllocStrategy::Normal,
            true,
        )
        .unwrap();
        assert!(!rs.is_packed_final());
    }

    #[test]
    fn test_reserved_buffer_returns_to_pool() {
        let pool = small_pool(1);
        let rs = pack_reply(
            &pool,
            &request(),
            &[BODY_SIZE as u32],
            &[],
            AllocStrategy::Reserved,
            false,
        )
        .unwrap();
        assert!(rs.is_preallocated());
        assert_eq!(pool.available(), 0);
        drop(rs);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_reserved_pool_timeout() {
        let pool = small_pool(1);
        let _held = pool.alloc(128, AllocStrategy::Reserved).unwrap();
        assert_matches!(
            pool.alloc(128, AllocStrategy::Reserved),
            Err(Error::ReplyPoolTimeout { waited_ms: 50 })
        );
    }

    #[test]
    fn test_reserved_wait_is_woken_by_release() {
        let pool = Arc::new(ReplyStatePool::new(ReplyPoolConfig {
            prealloc: 1,
            max_reply_size: 4096,
            wait: Duration::from_secs(5),
        }));
        let held = pool.alloc(128, AllocStrategy::Reserved).unwrap();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.alloc(128, AllocStrategy::Reserved).is_ok())
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_reserved_rejects_oversized() {
        let pool = small_pool(1);
        assert_matches!(
            pool.alloc(1 << 20, AllocStrategy::Reserved),
            Err(Error::AllocationFailed(_))
        );
    }

    #[test]
    fn test_in_flight_free_still_returns_reserved_buffer() {
        let pool = small_pool(1);
        let rs = pool.alloc(128, AllocStrategy::Reserved).unwrap();
        rs.update_flags(|f| f.on_net = true);
        assert_eq!(pool.available(), 0);

        let freed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| drop(rs)));
        assert!(freed.is_err());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    #[should_panic(expected = "freed while in flight")]
    fn test_free_in_flight_panics() {
        let pool = small_pool(0);
        let rs = pool.alloc(128, AllocStrategy::Normal).unwrap();
        rs.update_flags(|f| f.on_net = true);
        drop(rs);
    }
}
