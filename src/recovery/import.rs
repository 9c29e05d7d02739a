//! Client-side import: the connection to one target and its recovery.
//!
//! ```text
//!            handle_not_connected            connect
//!   FULL ─────────────────────────▶ DISCON ───────────▶ CONNECTING
//!    ▲                                 ▲                     │
//!    │ resend done, wake delayed       │ failure             ▼
//!    └──────────────────────────────────┴────────────────  RECOVER
//!                                                  replay_next* → resend
//!
//!   close(): any state ──▶ CLOSED
//! ```
//!
//! All list and state mutation happens under the import's single lock.
//! Requests are locked after the import, never the other way around.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, MutexGuard};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::request::{ListMembership, Request};
use crate::domain::RpcTransport;
use crate::error::{Error, Result};
use crate::metrics;
use crate::wire::WireMessage;

/// Connection state of an import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportState {
    /// Connected and serviceable.
    Full,
    Discon,
    Connecting,
    /// Replaying and resending after a reconnect.
    Recover,
    /// Torn down; no further recovery.
    Closed,
}

impl ImportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportState::Full => "FULL",
            ImportState::Discon => "DISCON",
            ImportState::Connecting => "CONNECTING",
            ImportState::Recover => "RECOVER",
            ImportState::Closed => "CLOSED",
        }
    }

    /// Anything but FULL, CLOSED and DISCON.
    pub fn in_recovery(&self) -> bool {
        !matches!(
            self,
            ImportState::Full | ImportState::Closed | ImportState::Discon
        )
    }
}

impl fmt::Display for ImportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens after a connection loss is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPolicy {
    /// Reconnect in the background right away.
    #[default]
    Connect,
    /// Stay disconnected until `recover` is called.
    Disabled,
    /// Log a recovery upcall and wait for an external `recover`.
    Upcall,
}

/// Per-import recovery settings.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Upper bound on waiting for a reply or for recovery to finish.
    pub obd_timeout: Duration,
    /// Resends allowed per request.
    pub max_resends: u32,
    pub policy: RecoveryPolicy,
    /// Keep replied requests for replay until the peer commits them.
    pub replayable: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            obd_timeout: Duration::from_secs(100),
            max_resends: 10,
            policy: RecoveryPolicy::Connect,
            replayable: true,
        }
    }
}

#[derive(Debug)]
struct ImportInner {
    state: ImportState,
    target: String,
    conn_cnt: u32,
    sending: Vec<Arc<Request>>,
    delayed: Vec<Arc<Request>>,
    /// Ordered by transaction number.
    replay: Vec<Arc<Request>>,
    last_replay_transno: u64,
    last_replay_xid: u64,
    resend_replay: bool,
    peer_committed: u64,
    replayable: bool,
    /// No automatic recovery and no new requests until reactivated.
    deactive: bool,
    no_recov: bool,
    reqs_replayed: u64,
}

/// Connection to one target.
pub struct Import {
    inner: Mutex<ImportInner>,
    state_tx: watch::Sender<ImportState>,
    transport: Arc<dyn RpcTransport>,
    config: ImportConfig,
}

impl fmt::Debug for Import {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Import")
            .field("target", &inner.target)
            .field("state", &inner.state)
            .field("conn_cnt", &inner.conn_cnt)
            .field("sending", &inner.sending.len())
            .field("delayed", &inner.delayed.len())
            .field("replay", &inner.replay.len())
            .finish()
    }
}

impl Import {
    /// A disconnected import for `target`; call [`connect`](Self::connect)
    /// to bring it up.
    pub fn new(
        target: impl Into<String>,
        transport: Arc<dyn RpcTransport>,
        config: ImportConfig,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ImportState::Discon);
        Arc::new(Self {
            inner: Mutex::new(ImportInner {
                state: ImportState::Discon,
                target: target.into(),
                conn_cnt: 0,
                sending: Vec::new(),
                delayed: Vec::new(),
                replay: Vec::new(),
                last_replay_transno: 0,
                last_replay_xid: 0,
                resend_replay: false,
                peer_committed: 0,
                replayable: config.replayable,
                deactive: false,
                no_recov: false,
                reqs_replayed: 0,
            }),
            state_tx,
            transport,
            config,
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn state(&self) -> ImportState {
        self.inner.lock().state
    }

    pub fn target(&self) -> String {
        self.inner.lock().target.clone()
    }

    /// Connection generation, bumped on every connect attempt.
    pub fn conn_cnt(&self) -> u32 {
        self.inner.lock().conn_cnt
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn peer_committed(&self) -> u64 {
        self.inner.lock().peer_committed
    }

    pub fn last_replay_transno(&self) -> u64 {
        self.inner.lock().last_replay_transno
    }

    pub fn reqs_replayed(&self) -> u64 {
        self.inner.lock().reqs_replayed
    }

    pub fn is_deactivated(&self) -> bool {
        self.inner.lock().deactive
    }

    /// Transaction numbers on the replay list, in list order.
    pub fn replay_transnos(&self) -> Vec<u64> {
        self.inner.lock().replay.iter().map(|r| r.transno()).collect()
    }

    pub fn sending_count(&self) -> usize {
        self.inner.lock().sending.len()
    }

    pub fn delayed_count(&self) -> usize {
        self.inner.lock().delayed.len()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ImportState> {
        self.state_tx.subscribe()
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    fn set_state(&self, inner: &mut ImportInner, state: ImportState) {
        if inner.state == state {
            return;
        }
        info!(
            import = %inner.target,
            from = %inner.state,
            to = %state,
            conn_cnt = inner.conn_cnt,
            "import state change"
        );
        metrics::IMPORT_STATE_TRANSITIONS
            .with_label_values(&[state.as_str()])
            .inc();
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// FULL becomes DISCON; reports whether this call did it.
    fn set_discon(&self, inner: &mut ImportInner) -> bool {
        if inner.state != ImportState::Full {
            return false;
        }
        self.set_state(inner, ImportState::Discon);
        true
    }

    fn connect_failed(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ImportState::Closed {
            self.set_state(&mut inner, ImportState::Discon);
        }
    }

    // =========================================================================
    // Replay bookkeeping
    // =========================================================================

    /// Keep a replied request until the peer commits its transaction.
    pub fn retain_for_replay(&self, request: Arc<Request>) {
        let mut inner = self.inner.lock();
        Self::retain_locked(&mut inner, request);
    }

    fn retain_locked(inner: &mut ImportInner, request: Arc<Request>) {
        let transno = request.transno();
        let at = inner.replay.partition_point(|r| r.transno() <= transno);
        request.set_list(ListMembership::Replay);
        inner.replay.insert(at, request);
    }

    /// Record the peer's last committed transaction; never moves backwards.
    pub fn update_peer_committed(&self, committed: u64) {
        let mut inner = self.inner.lock();
        inner.peer_committed = inner.peer_committed.max(committed);
    }

    /// Drop replay entries the peer has committed; returns how many.
    pub fn free_committed(&self) -> usize {
        let mut inner = self.inner.lock();
        Self::free_committed_locked(&mut inner)
    }

    fn free_committed_locked(inner: &mut ImportInner) -> usize {
        let committed = inner.peer_committed;
        let before = inner.replay.len();
        inner.replay.retain(|r| {
            let keep = r.transno() > committed;
            if !keep {
                r.set_list(ListMembership::None);
            }
            keep
        });
        let purged = before - inner.replay.len();
        if purged > 0 {
            debug!(import = %inner.target, purged, committed, "purged committed requests");
        }
        purged
    }

    fn note_reply(&self, reply: &WireMessage) {
        if let Ok(committed) = reply.last_committed() {
            self.update_peer_committed(committed);
        }
    }

    /// Settle `request` with `outcome` and wake its owner.
    fn finish(&self, request: &Arc<Request>, outcome: Result<WireMessage>) {
        {
            let mut inner = self.inner.lock();
            inner.sending.retain(|r| !Arc::ptr_eq(r, request));
            request.set_list(ListMembership::None);
            if let Ok(reply) = &outcome {
                if let Ok(committed) = reply.last_committed() {
                    inner.peer_committed = inner.peer_committed.max(committed);
                }
                let transno = reply.transno().unwrap_or(0);
                if transno > 0 {
                    request.set_transno(transno);
                    if inner.replayable && request.is_replayable() && transno > inner.peer_committed
                    {
                        Self::retain_locked(&mut inner, request.clone());
                    }
                }
            }
        }
        request.complete(outcome);
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Replay one request from the replay list.
    ///
    /// Returns `Ok(false)` once nothing is left to replay. Replays at most
    /// one request per call, in transaction-number order.
    #[instrument(skip(self), fields(import = %self.target()))]
    pub async fn replay_next(&self) -> Result<bool> {
        let (request, resent, conn_cnt, target) = {
            let mut inner = self.inner.lock();
            if inner.state != ImportState::Recover {
                return Err(not_in_recover(&inner));
            }
            Self::free_committed_locked(&mut inner);

            let last_transno = inner.last_replay_transno;
            let selected = inner.replay.iter().find_map(|r| {
                if inner.resend_replay && r.xid() == inner.last_replay_xid {
                    Some((r.clone(), true))
                } else if r.transno() > last_transno {
                    Some((r.clone(), false))
                } else {
                    None
                }
            });
            let Some((request, resent)) = selected else {
                debug!(replayed = inner.reqs_replayed, "replay complete");
                return Ok(false);
            };
            inner.last_replay_transno = request.transno();
            inner.last_replay_xid = request.xid();
            inner.resend_replay = false;
            inner.reqs_replayed += 1;
            (request, resent, inner.conn_cnt, inner.target.clone())
        };

        debug!(
            xid = request.xid(),
            transno = request.transno(),
            resent,
            "replaying request"
        );
        metrics::REPLAYED_REQUESTS.inc();
        let msg = request.prepare_replay(conn_cnt, resent);
        match self.transport.send(&target, &msg).await {
            Ok(reply) => {
                self.note_reply(&reply);
                Ok(true)
            }
            Err(err) => {
                if err.is_connectivity() {
                    self.inner.lock().resend_replay = true;
                }
                Err(err)
            }
        }
    }

    /// Retransmit every request still waiting for a reply.
    ///
    /// Only valid in RECOVER. Returns how many requests were resent.
    #[instrument(skip(self), fields(import = %self.target()))]
    pub async fn resend(&self) -> Result<usize> {
        let (requests, conn_cnt, target) = {
            let inner = self.inner.lock();
            if inner.state != ImportState::Recover {
                return Err(not_in_recover(&inner));
            }
            for request in &inner.sending {
                request.mark_resend();
                debug!(xid = request.xid(), "marked for resend");
            }
            (inner.sending.clone(), inner.conn_cnt, inner.target.clone())
        };

        let results = join_all(
            requests
                .iter()
                .map(|request| self.retransmit(request, conn_cnt, &target)),
        )
        .await;
        match results.into_iter().find_map(Result::err) {
            Some(err) => Err(err),
            None => Ok(requests.len()),
        }
    }

    async fn retransmit(&self, request: &Arc<Request>, conn_cnt: u32, target: &str) -> Result<()> {
        let msg = match request.prepare_resend(conn_cnt, self.config.max_resends) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(xid = request.xid(), error = %err, "giving up on request");
                self.finish(request, Err(err));
                return Ok(());
            }
        };
        metrics::RESENT_REQUESTS.inc();
        match self.transport.send(target, &msg).await {
            Ok(reply) => {
                self.finish(request, Ok(reply));
                Ok(())
            }
            // stays on the sending list for the next recovery
            Err(err) if err.is_connectivity() => Err(err),
            Err(err) => {
                self.finish(request, Err(err));
                Ok(())
            }
        }
    }

    /// Signal every parked request to re-check the import.
    pub fn wake_delayed(&self) {
        let delayed = self.inner.lock().delayed.clone();
        if !delayed.is_empty() {
            debug!(count = delayed.len(), "waking delayed requests");
        }
        for request in delayed {
            request.wake();
        }
    }

    /// Connect, replay if the peer is recovering, resend, then go FULL.
    #[instrument(skip(self), fields(import = %self.target()))]
    pub async fn connect(&self) -> Result<()> {
        let (target, conn_cnt) = {
            let mut inner = self.inner.lock();
            match inner.state {
                ImportState::Closed => {
                    return Err(Error::ImportClosed {
                        target: inner.target.clone(),
                    })
                }
                ImportState::Connecting | ImportState::Recover => {
                    return Err(Error::AlreadyInProgress {
                        target: inner.target.clone(),
                    })
                }
                ImportState::Full | ImportState::Discon => {}
            }
            inner.conn_cnt += 1;
            self.set_state(&mut inner, ImportState::Connecting);
            (inner.target.clone(), inner.conn_cnt)
        };

        let reply = match self.transport.connect(&target, conn_cnt).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "connect failed");
                self.connect_failed();
                return Err(err);
            }
        };

        let replay = {
            let mut inner = self.inner.lock();
            if inner.state == ImportState::Closed {
                return Err(Error::ImportClosed { target });
            }
            inner.peer_committed = inner.peer_committed.max(reply.peer_committed);
            if !reply.replayable {
                for request in inner.replay.drain(..) {
                    request.set_list(ListMembership::None);
                }
            }
            inner.last_replay_transno = 0;
            inner.last_replay_xid = 0;
            inner.resend_replay = false;
            self.set_state(&mut inner, ImportState::Recover);
            reply.recovering && reply.replayable
        };

        if replay {
            loop {
                match self.replay_next().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(err) => {
                        warn!(error = %err, "replay failed");
                        self.connect_failed();
                        return Err(err);
                    }
                }
            }
        }

        if let Err(err) = self.resend().await {
            warn!(error = %err, "resend failed");
            self.connect_failed();
            return Err(err);
        }

        {
            let mut inner = self.inner.lock();
            if inner.state != ImportState::Recover {
                return Err(Error::ImportClosed { target });
            }
            inner.deactive = false;
            self.set_state(&mut inner, ImportState::Full);
        }
        self.wake_delayed();
        Ok(())
    }

    /// Force a reconnect, optionally to a different target.
    ///
    /// Returns [`Error::AlreadyInProgress`] when another recovery is running.
    pub async fn recover(&self, new_target: Option<&str>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state == ImportState::Closed {
                return Err(Error::ImportClosed {
                    target: inner.target.clone(),
                });
            }
            self.set_discon(&mut inner);
            if inner.state != ImportState::Discon {
                return Err(Error::AlreadyInProgress {
                    target: inner.target.clone(),
                });
            }
            if let Some(new_target) = new_target {
                if new_target != inner.target {
                    info!(from = %inner.target, to = new_target, "switching import target");
                    inner.target = new_target.to_string();
                }
            }
        }
        self.connect().await
    }

    /// Wait until the import leaves recovery.
    pub async fn wait_for_recovery(&self, timeout: Duration) -> Result<ImportState> {
        let mut rx = self.state_tx.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|state| !state.in_recovery())).await {
            Ok(Ok(state)) => Ok(*state),
            // the sender lives as long as the import
            Ok(Err(_)) => Ok(self.state()),
            Err(_) => Err(Error::RecoveryTimeout {
                target: self.target(),
                waited_ms: timeout.as_millis() as u64,
            }),
        };
        result
    }

    fn initiate_recovery(self: &Arc<Self>) {
        match self.config.policy {
            RecoveryPolicy::Connect => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let import = self.clone();
                    handle.spawn(async move {
                        if let Err(err) = import.connect().await {
                            warn!(error = %err, "background reconnect failed");
                        }
                    });
                }
                Err(_) => warn!(import = %self.target(), "no runtime to reconnect on"),
            },
            RecoveryPolicy::Disabled => {
                debug!(import = %self.target(), "automatic recovery disabled")
            }
            RecoveryPolicy::Upcall => {
                info!(import = %self.target(), "recovery upcall: waiting for recover request")
            }
        }
    }

    /// React to a connectivity failure of `failed`.
    ///
    /// The import drops to DISCON and `failed` stays on the sending list to
    /// be resent. An import without replay support is deactivated first.
    pub fn handle_not_connected(self: &Arc<Self>, failed: &Arc<Request>) {
        let start = {
            let mut inner = self.inner.lock();
            failed.mark_resend();
            debug!(xid = failed.xid(), "marked for resend");
            let went_discon = self.set_discon(&mut inner);
            if !inner.replayable && !inner.deactive {
                warn!(import = %inner.target, "import cannot replay, deactivating");
                inner.deactive = true;
            }
            went_discon && !inner.deactive && !inner.no_recov
        };
        if start {
            self.initiate_recovery();
        }
    }

    // =========================================================================
    // Request dispatch
    // =========================================================================

    /// Send `request` and wait for its reply.
    ///
    /// While the import is not FULL the request waits on the delayed list.
    /// A connectivity failure starts recovery and the request is resent
    /// once the import comes back, all within the obd timeout.
    #[instrument(skip_all, fields(xid = request.xid()))]
    pub async fn send(self: &Arc<Self>, request: Arc<Request>) -> Result<WireMessage> {
        let timeout = self.config.obd_timeout;
        let deadline = tokio::time::Instant::now() + timeout;

        let (conn_cnt, target) = loop {
            {
                let mut inner = self.inner.lock();
                if inner.state == ImportState::Closed {
                    return Err(Error::ImportClosed {
                        target: inner.target.clone(),
                    });
                }
                if inner.deactive {
                    drop_delayed(&mut inner, &request);
                    return Err(Error::Invalidated {
                        xid: request.xid(),
                    });
                }
                if inner.state == ImportState::Full {
                    drop_delayed(&mut inner, &request);
                    inner.sending.push(request.clone());
                    request.set_list(ListMembership::Sending);
                    break (inner.conn_cnt, inner.target.clone());
                }
                if inner.no_recov {
                    return Err(Error::NotConnected {
                        target: inner.target.clone(),
                    });
                }
                if request.list() != ListMembership::Delayed {
                    inner.delayed.push(request.clone());
                    request.set_list(ListMembership::Delayed);
                    debug!(state = %inner.state, "request delayed");
                }
            }
            if tokio::time::timeout_at(deadline, request.wait_event())
                .await
                .is_err()
            {
                let mut inner = self.inner.lock();
                drop_delayed(&mut inner, &request);
                return Err(Error::RecoveryTimeout {
                    target: inner.target.clone(),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
        };

        let msg = request.prepare_send(conn_cnt);
        match self.transport.send(&target, &msg).await {
            Ok(reply) => self.finish(&request, Ok(reply)),
            Err(err) if err.is_connectivity() => {
                warn!(error = %err, "request lost its connection");
                self.handle_not_connected(&request);
            }
            Err(err) => self.finish(&request, Err(err)),
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(outcome) = request.take_outcome() {
                return outcome;
            }
            if tokio::time::timeout_at(deadline, request.wait_event())
                .await
                .is_err()
            {
                let mut inner = self.inner.lock();
                inner.sending.retain(|r| !Arc::ptr_eq(r, &request));
                request.set_list(ListMembership::None);
                return Err(Error::RecoveryTimeout {
                    target: inner.target.clone(),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    // =========================================================================
    // Administrative control
    // =========================================================================

    /// Deactivate (aborting everything in flight) or reactivate the import.
    pub fn set_active(self: &Arc<Self>, active: bool) {
        if active {
            let reconnect = {
                let mut inner = self.inner.lock();
                inner.deactive = false;
                info!(import = %inner.target, "import activated");
                inner.state == ImportState::Discon && !inner.no_recov
            };
            if reconnect {
                self.initiate_recovery();
            }
            return;
        }

        let aborted = {
            let mut inner = self.inner.lock();
            inner.deactive = true;
            info!(import = %inner.target, "import deactivated");
            take_pending(&mut inner)
        };
        for request in aborted {
            let xid = request.xid();
            request.complete(Err(Error::Invalidated { xid }));
        }
    }

    /// Enable or disable automatic recovery.
    pub fn control_recovery(&self, enabled: bool) {
        let mut inner = self.inner.lock();
        inner.no_recov = !enabled;
        info!(import = %inner.target, enabled, "recovery control");
    }

    /// Tear the import down, failing everything still pending.
    pub fn close(&self) {
        let (aborted, target) = {
            let mut inner = self.inner.lock();
            self.set_state(&mut inner, ImportState::Closed);
            for request in inner.replay.drain(..) {
                request.set_list(ListMembership::None);
            }
            (take_pending(&mut inner), inner.target.clone())
        };
        for request in aborted {
            request.complete(Err(Error::ImportClosed {
                target: target.clone(),
            }));
        }
    }
}

fn not_in_recover(inner: &MutexGuard<'_, ImportInner>) -> Error {
    Error::NotInRecover {
        target: inner.target.clone(),
        state: inner.state.to_string(),
    }
}

fn drop_delayed(inner: &mut ImportInner, request: &Arc<Request>) {
    if request.list() == ListMembership::Delayed {
        inner.delayed.retain(|r| !Arc::ptr_eq(r, request));
        request.set_list(ListMembership::None);
    }
}

fn take_pending(inner: &mut ImportInner) -> Vec<Arc<Request>> {
    let mut pending: Vec<_> = inner.sending.drain(..).collect();
    pending.append(&mut inner.delayed);
    for request in &pending {
        request.set_list(ListMembership::None);
    }
    pending
}
