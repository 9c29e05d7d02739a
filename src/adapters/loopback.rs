//! Loopback RPC Transport
//!
//! An in-process peer implementing the `RpcTransport` port. It assigns
//! transaction numbers, answers with packed reply envelopes and can be
//! taken offline, made to drop sends or put into recovery, which is enough
//! to drive an import through every recovery path.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::domain::{AllocStrategy, ConnectReply, RpcTransport};
use crate::error::{Error, Result};
use crate::wire::{
    pack_reply, ReplyPoolConfig, ReplyStatePool, WireMessage, BODY_SIZE, MSG_REPLAY, MSG_RESENT,
};

/// What the peer saw of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentRecord {
    pub xid: u64,
    pub transno: u64,
    pub flags: u32,
    pub conn_cnt: u32,
}

impl SentRecord {
    pub fn is_replay(&self) -> bool {
        self.flags & MSG_REPLAY != 0
    }

    pub fn is_resent(&self) -> bool {
        self.flags & MSG_RESENT != 0
    }
}

#[derive(Debug)]
struct PeerState {
    online: bool,
    recovering: bool,
    replayable: bool,
    last_transno: u64,
    committed: u64,
    drop_sends: u32,
    connect_delay: Option<Duration>,
    connects: u32,
    sent: Vec<SentRecord>,
}

/// Simulated peer.
pub struct LoopbackTransport {
    state: Mutex<PeerState>,
    replies: ReplyStatePool,
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PeerState {
                online: true,
                recovering: false,
                replayable: true,
                last_transno: 0,
                committed: 0,
                drop_sends: 0,
                connect_delay: None,
                connects: 0,
                sent: Vec::new(),
            }),
            replies: ReplyStatePool::new(ReplyPoolConfig::default()),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    /// Report recovery in the next connect replies.
    pub fn set_recovering(&self, recovering: bool) {
        self.state.lock().recovering = recovering;
    }

    pub fn set_replayable(&self, replayable: bool) {
        self.state.lock().replayable = replayable;
    }

    /// Fail the next `count` sends with a transport error.
    pub fn drop_next_sends(&self, count: u32) {
        self.state.lock().drop_sends = count;
    }

    /// Stall every connect for `delay`.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state.lock().connect_delay = delay;
    }

    /// Declare everything up to `transno` durable.
    pub fn set_committed(&self, transno: u64) {
        self.state.lock().committed = transno;
    }

    pub fn commit_all(&self) {
        let mut state = self.state.lock();
        state.committed = state.last_transno;
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().connects
    }

    /// Every request that reached the peer, in arrival order.
    pub fn sent(&self) -> Vec<SentRecord> {
        self.state.lock().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    fn reply(&self, request: &WireMessage, transno: u64, committed: u64) -> Result<WireMessage> {
        let rs = pack_reply(
            &self.replies,
            request,
            &[BODY_SIZE as u32],
            &[],
            AllocStrategy::Normal,
            false,
        )?;
        Ok(rs.with_msg(|msg| {
            msg.set_transno(transno);
            msg.set_last_committed(committed);
            msg.set_status(0);
            msg.clone()
        }))
    }
}

#[async_trait]
impl RpcTransport for LoopbackTransport {
    async fn connect(&self, target: &str, conn_cnt: u32) -> Result<ConnectReply> {
        let delay = {
            let mut state = self.state.lock();
            state.connects += 1;
            state.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock();
        if !state.online {
            return Err(Error::Transport(format!("{} unreachable", target)));
        }
        debug!(peer = target, conn_cnt, recovering = state.recovering, "peer accepted connection");
        Ok(ConnectReply {
            peer_committed: state.committed,
            replayable: state.replayable,
            recovering: state.recovering,
        })
    }

    async fn send(&self, target: &str, request: &WireMessage) -> Result<WireMessage> {
        let flags = request.flags()?;
        let xid = request.last_xid()?;
        let (transno, committed) = {
            let mut state = self.state.lock();
            if !state.online {
                return Err(Error::Transport(format!("{} unreachable", target)));
            }
            if state.drop_sends > 0 {
                state.drop_sends -= 1;
                return Err(Error::Transport(format!("{} dropped request {}", target, xid)));
            }
            let transno = match request.transno()? {
                0 => {
                    state.last_transno += 1;
                    state.last_transno
                }
                known => known,
            };
            state.sent.push(SentRecord {
                xid,
                transno,
                flags,
                conn_cnt: request.conn_cnt()?,
            });
            (transno, state.committed)
        };
        trace!(peer = target, xid, transno, flags, "peer executed request");
        self.reply(request, transno, committed)
    }
}
