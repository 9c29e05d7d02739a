//! RPC request records tracked by an import.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::wire::{WireMessage, MSG_REPLAY, MSG_RESENT};

static NEXT_XID: AtomicU64 = AtomicU64::new(1);

/// Which import list a request is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListMembership {
    #[default]
    None,
    /// Transmitted, reply not yet received.
    Sending,
    /// Parked until the import becomes serviceable.
    Delayed,
    /// Replied, kept until the peer commits its transaction.
    Replay,
}

#[derive(Debug)]
struct RequestState {
    transno: u64,
    msg: WireMessage,
    list: ListMembership,
    resend: bool,
    resend_count: u32,
    replayable: bool,
    outcome: Option<Result<WireMessage>>,
}

/// A generic RPC call.
///
/// The exchange id travels in the envelope's last-xid field so replies
/// and resends can be matched against it.
#[derive(Debug)]
pub struct Request {
    xid: u64,
    state: Mutex<RequestState>,
    event: Notify,
}

impl Request {
    /// Wrap `msg` with a fresh exchange id.
    pub fn new(mut msg: WireMessage) -> Arc<Self> {
        let xid = NEXT_XID.fetch_add(1, Ordering::Relaxed);
        msg.set_last_xid(xid);
        Self::build(xid, msg, 0)
    }

    /// A replied request with a known transaction number.
    pub fn committed(xid: u64, transno: u64, mut msg: WireMessage) -> Arc<Self> {
        msg.set_last_xid(xid);
        msg.set_transno(transno);
        Self::build(xid, msg, transno)
    }

    fn build(xid: u64, msg: WireMessage, transno: u64) -> Arc<Self> {
        Arc::new(Self {
            xid,
            state: Mutex::new(RequestState {
                transno,
                msg,
                list: ListMembership::None,
                resend: false,
                resend_count: 0,
                replayable: true,
                outcome: None,
            }),
            event: Notify::new(),
        })
    }

    pub fn xid(&self) -> u64 {
        self.xid
    }

    /// Zero until the peer assigns a transaction.
    pub fn transno(&self) -> u64 {
        self.state.lock().transno
    }

    pub(crate) fn set_transno(&self, transno: u64) {
        let mut state = self.state.lock();
        state.transno = transno;
        state.msg.set_transno(transno);
    }

    pub fn list(&self) -> ListMembership {
        self.state.lock().list
    }

    pub(crate) fn set_list(&self, list: ListMembership) {
        self.state.lock().list = list;
    }

    pub fn is_resend(&self) -> bool {
        self.state.lock().resend
    }

    /// Flag the request to be resent once the import is back.
    pub(crate) fn mark_resend(&self) {
        self.state.lock().resend = true;
    }

    pub fn resend_count(&self) -> u32 {
        self.state.lock().resend_count
    }

    pub fn is_replayable(&self) -> bool {
        self.state.lock().replayable
    }

    /// Requests that are not replayable are dropped once replied.
    pub fn set_replayable(&self, replayable: bool) {
        self.state.lock().replayable = replayable;
    }

    /// Copy of the current envelope.
    pub fn message(&self) -> WireMessage {
        self.state.lock().msg.clone()
    }

    /// Prepare a retransmission: counts it, stamps the generation and the
    /// resent flag. Fails once more than `limit` resends were attempted.
    pub(crate) fn prepare_resend(&self, conn_cnt: u32, limit: u32) -> Result<WireMessage> {
        let mut state = self.state.lock();
        state.resend_count += 1;
        if state.resend_count > limit {
            return Err(Error::ResendLimit {
                xid: self.xid,
                limit,
            });
        }
        state.msg.set_conn_cnt(conn_cnt);
        state.msg.add_flags(MSG_RESENT);
        Ok(state.msg.clone())
    }

    /// Prepare a replay, optionally as a resend of the last replay.
    pub(crate) fn prepare_replay(&self, conn_cnt: u32, resent: bool) -> WireMessage {
        let mut state = self.state.lock();
        state.msg.set_conn_cnt(conn_cnt);
        state.msg.add_flags(MSG_REPLAY);
        if resent {
            state.msg.add_flags(MSG_RESENT);
        } else {
            state.msg.clear_flags(MSG_RESENT);
        }
        state.msg.clone()
    }

    /// Stamp the connection generation for a first transmission.
    pub(crate) fn prepare_send(&self, conn_cnt: u32) -> WireMessage {
        let mut state = self.state.lock();
        state.msg.set_conn_cnt(conn_cnt);
        state.msg.clone()
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Record the final outcome and wake the owner.
    pub(crate) fn complete(&self, outcome: Result<WireMessage>) {
        {
            let mut state = self.state.lock();
            state.resend = false;
            state.outcome = Some(outcome);
        }
        self.event.notify_one();
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    pub(crate) fn take_outcome(&self) -> Option<Result<WireMessage>> {
        self.state.lock().outcome.take()
    }

    /// Give the owner a chance to re-check its wait condition.
    pub(crate) fn wake(&self) {
        self.event.notify_one();
    }

    pub(crate) async fn wait_event(&self) {
        self.event.notified().await;
    }
}
