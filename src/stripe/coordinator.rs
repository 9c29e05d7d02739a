//! Per-request stripe coordination.
//!
//! A [`StripeIo`] owns one logical request for its whole life:
//!
//! ```text
//! INIT ─▶ ITER_INIT ─▶ LOCK ─▶ START ─▶ END ─▶ UNLOCK ─▶ ITER_FINI ─┬─▶ FINI
//!            ▲                                                     │
//!            └──────────────── continuation_pending ───────────────┘
//! ```
//!
//! `lock` and `start` stop at the first failing member. `end`, `unlock`,
//! `iter_fini` and `fini` always visit every member.

use std::sync::Arc;

use tracing::{debug, instrument, trace, warn};

use super::device::{EmergencyReserve, StripeDevice};
use super::layout::EOF;
use super::object::StripedObject;
use super::pages::{PageList, TwoQueue};
use super::request::{IoKind, IoParams, LogicalIoRequest, RwOp, StripeOp};
use super::PAGE_SIZE;
use crate::domain::{AllocStrategy, SubIo};
use crate::error::{Error, Result};
use crate::metrics;

// =============================================================================
// Sub-contexts
// =============================================================================

/// Where a borrowed sub-operation has to go back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorrowedFrom {
    /// The device's spare, lent to single-stripe requests.
    SingleSlot,
    /// Slot of the device's emergency reserve.
    Reserve { slot: usize },
}

enum SubHandle {
    Owned(Box<dyn SubIo>),
    Borrowed {
        sub: Box<dyn SubIo>,
        from: BorrowedFrom,
    },
}

impl SubHandle {
    fn sub_mut(&mut self) -> &mut dyn SubIo {
        match self {
            SubHandle::Owned(sub) | SubHandle::Borrowed { sub, .. } => sub.as_mut(),
        }
    }
}

/// One stripe's state inside a logical request.
pub struct StripeSubContext {
    stripe: usize,
    handle: SubHandle,
    op: StripeOp,
    reenter: u32,
    started: bool,
    result: Option<Error>,
}

impl std::fmt::Debug for StripeSubContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeSubContext")
            .field("stripe", &self.stripe)
            .field("borrowed", &self.borrowed_from())
            .field("op", &self.op)
            .field("result", &self.result)
            .finish()
    }
}

impl StripeSubContext {
    pub fn stripe(&self) -> usize {
        self.stripe
    }

    /// Stripe-local operation of the current (or last) iteration.
    pub fn op(&self) -> &StripeOp {
        &self.op
    }

    pub fn result(&self) -> Option<&Error> {
        self.result.as_ref()
    }

    pub fn borrowed_from(&self) -> Option<BorrowedFrom> {
        match &self.handle {
            SubHandle::Owned(_) => None,
            SubHandle::Borrowed { from, .. } => Some(*from),
        }
    }

    fn with_sub<R>(&mut self, f: impl FnOnce(&mut dyn SubIo, &StripeOp) -> R) -> R {
        self.reenter += 1;
        let r = f(self.handle.sub_mut(), &self.op);
        self.reenter -= 1;
        r
    }
}

/// Totals reported when a request finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoSummary {
    /// Bytes read or written.
    pub transferred: u64,
    /// Bytes written back by fsync.
    pub nr_written: u64,
    pub iterations: u32,
    pub sub_contexts_created: usize,
}

// =============================================================================
// StripeIo
// =============================================================================

/// Coordinator state for one logical request against a striped object.
pub struct StripeIo {
    object: Arc<StripedObject>,
    device: Arc<StripeDevice>,
    request: LogicalIoRequest,
    /// Current iteration range, logical `[pos, endpos)`.
    pos: u64,
    endpos: u64,
    /// End of the whole request.
    io_endpos: u64,
    subs: Vec<Option<StripeSubContext>>,
    active: Vec<usize>,
    /// Set when the whole request touches exactly one stripe.
    single_subio_index: Option<usize>,
    mem_frozen: bool,
    finalized: bool,
    summary: IoSummary,
}

impl std::fmt::Debug for StripeIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeIo")
            .field("object", &self.object.id())
            .field("kind", &self.request.kind)
            .field("pos", &self.pos)
            .field("endpos", &self.endpos)
            .field("active", &self.active)
            .finish()
    }
}

/// Logical byte range of page `index`, `None` past the addressable end.
fn fault_range(index: u64) -> Option<(u64, u64)> {
    let start = index.checked_mul(PAGE_SIZE)?;
    Some((start, start.checked_add(PAGE_SIZE)?))
}

impl StripeIo {
    /// Start coordinating `request`.
    ///
    /// Objects without stripes have nothing to coordinate: reads, fsync,
    /// setattr and misc operations return `Ok(None)`, writes fail with
    /// [`Error::BadDescriptor`] and faults with [`Error::Fault`].
    ///
    /// # Panics
    ///
    /// Panics if the request's parameters do not match its kind.
    pub fn init(
        device: Arc<StripeDevice>,
        object: Arc<StripedObject>,
        request: LogicalIoRequest,
    ) -> Result<Option<Self>> {
        let stripe_count = object.layout().stripe_count();
        if stripe_count == 0 {
            return match (&request.kind, &request.params) {
                (IoKind::Write, _) => Err(Error::BadDescriptor),
                (IoKind::Fault, IoParams::Fault { index, .. }) => {
                    Err(Error::Fault { index: *index })
                }
                _ => Ok(None),
            };
        }
        if let IoParams::Fault { index, .. } = &request.params {
            if fault_range(*index).is_none() {
                return Err(Error::Fault { index: *index });
            }
        }

        object.io_started();
        let mut io = Self {
            object,
            device,
            request,
            pos: 0,
            endpos: 0,
            io_endpos: 0,
            subs: (0..stripe_count).map(|_| None).collect(),
            active: Vec::new(),
            single_subio_index: None,
            mem_frozen: false,
            finalized: false,
            summary: IoSummary::default(),
        };
        io.slice_init();

        let touched: Vec<usize> = (0..stripe_count)
            .filter(|&stripe| io.intersection(stripe, io.pos, io.io_endpos).is_some())
            .collect();
        if let [only] = touched.as_slice() {
            io.single_subio_index = Some(*only);
        }
        trace!(pos = io.pos, endpos = io.io_endpos, ?touched, "stripe io initialized");
        Ok(Some(io))
    }

    /// Derive the logical range the request covers.
    fn slice_init(&mut self) {
        let (pos, endpos) = match (&self.request.kind, &self.request.params) {
            (IoKind::Read | IoKind::Write, IoParams::Rw(rw)) => {
                if rw.append {
                    (0, EOF)
                } else {
                    (rw.pos, rw.pos.saturating_add(rw.count))
                }
            }
            (IoKind::Setattr, IoParams::Setattr { size: Some(size), .. }) => (*size, EOF),
            (IoKind::Setattr, IoParams::Setattr { size: None, .. }) => (0, EOF),
            (IoKind::Fault, IoParams::Fault { index, .. }) => {
                fault_range(*index).unwrap_or((EOF, EOF))
            }
            (IoKind::Fsync, IoParams::Fsync { start, end }) => (*start, *end),
            (IoKind::Misc, _) => (0, EOF),
            (kind, params) => panic!("unsupported operation {:?} with {:?}", kind, params),
        };
        self.pos = pos;
        self.endpos = endpos;
        self.io_endpos = endpos;
    }

    /// Stripe-local inclusive intersection of logical `[start, end)`.
    fn intersection(&self, stripe: usize, start: u64, end: u64) -> Option<(u64, u64)> {
        if end <= start {
            return None;
        }
        let end_incl = if end == EOF { EOF } else { end - 1 };
        self.object
            .layout()
            .stripe_intersects(stripe, start, end_incl)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn request(&self) -> &LogicalIoRequest {
        &self.request
    }

    pub fn object(&self) -> &Arc<StripedObject> {
        &self.object
    }

    /// Logical `[pos, endpos)` of the current iteration.
    pub fn iteration_range(&self) -> (u64, u64) {
        (self.pos, self.endpos)
    }

    /// Stripes in the active set, in set order.
    pub fn active_stripes(&self) -> &[usize] {
        &self.active
    }

    pub fn sub_context(&self, stripe: usize) -> Option<&StripeSubContext> {
        self.subs.get(stripe).and_then(Option::as_ref)
    }

    pub fn single_subio_index(&self) -> Option<usize> {
        self.single_subio_index
    }

    pub fn summary(&self) -> IoSummary {
        self.summary
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Set up the active stripes for the next iteration.
    pub fn iter_init(&mut self) -> Result<()> {
        debug_assert!(self.active.is_empty(), "iter_init with a live active set");
        self.summary.iterations += 1;
        match self.request.kind {
            IoKind::Read | IoKind::Write => self.rw_iter_init(),
            _ => self.iter_init_stripes(),
        }
    }

    fn rw_iter_init(&mut self) -> Result<()> {
        let Some(rw) = self.request.rw_params() else {
            panic!("read/write request without read/write parameters");
        };
        if rw.append {
            // real position is known only once every stripe is locked
            self.pos = 0;
            self.endpos = EOF;
            self.request.continuation_pending = true;
        } else {
            self.pos = rw.pos;
            self.endpos = self.io_endpos;
            let layout = self.object.layout();
            if layout.stripe_count() > 1 {
                let ssize = layout.stripe_size();
                let next = (self.pos / ssize + 1)
                    .checked_mul(ssize)
                    .unwrap_or(u64::MAX);
                self.request.continuation_pending = next < self.io_endpos;
                self.endpos = self.io_endpos.min(next);
            } else {
                self.request.continuation_pending = false;
            }
        }
        self.iter_init_stripes()
    }

    fn iter_init_stripes(&mut self) -> Result<()> {
        for stripe in 0..self.object.layout().stripe_count() {
            let Some((local_start, local_end)) = self.intersection(stripe, self.pos, self.endpos)
            else {
                continue;
            };
            let local_end = if local_end == EOF {
                EOF
            } else {
                local_end + 1
            };
            let op = self.sub_op(stripe, local_start, local_end);

            let ctx = self.sub_get(stripe, None)?;
            ctx.op = op;
            ctx.started = false;
            ctx.with_sub(|sub, op| sub.iter_init(op))?;
            self.active.push(stripe);
        }
        Ok(())
    }

    /// Translate the request into `stripe`'s coordinates, `[start, end)`.
    fn sub_op(&self, stripe: usize, start: u64, end: u64) -> StripeOp {
        let layout = self.object.layout();
        match &self.request.params {
            IoParams::Rw(rw) => {
                let count = if rw.append { 0 } else { end - start };
                let buf_offset = if rw.append || count == 0 {
                    0
                } else {
                    (layout.logical_offset(start, stripe) - rw.origin) as usize
                };
                let op = RwOp {
                    pos: start,
                    count,
                    buf_offset,
                    append: rw.append,
                    sync: rw.sync,
                    buf: rw.buf.clone(),
                };
                if self.request.kind == IoKind::Write {
                    StripeOp::Write(op)
                } else {
                    StripeOp::Read(op)
                }
            }
            IoParams::Setattr { size, mtime } => StripeOp::Setattr {
                size: size.map(|size| layout.size_to_stripe(size, stripe)),
                mtime: *mtime,
            },
            IoParams::Fault {
                writable, buf, ..
            } => StripeOp::Fault {
                index: start / PAGE_SIZE,
                writable: *writable,
                buf: buf.clone(),
            },
            IoParams::Fsync { .. } => StripeOp::Fsync { start, end },
            IoParams::Misc => StripeOp::Misc,
        }
    }

    /// Lock every active stripe, stopping at the first failure.
    pub fn lock(&mut self) -> Result<()> {
        for i in 0..self.active.len() {
            let stripe = self.active[i];
            let rc = match self.subs[stripe].as_mut() {
                Some(ctx) => ctx.with_sub(|sub, op| sub.lock(op)),
                None => continue,
            };
            if let Err(err) = rc {
                return Err(self.record_failure(stripe, err));
            }
        }
        Ok(())
    }

    /// Start every active stripe, stopping at the first failure.
    pub fn start(&mut self) -> Result<()> {
        self.resolve_append();
        for i in 0..self.active.len() {
            let stripe = self.active[i];
            let rc = match self.subs[stripe].as_mut() {
                Some(ctx) => {
                    ctx.started = true;
                    ctx.with_sub(|sub, op| sub.start(op))
                }
                None => continue,
            };
            if let Err(err) = rc {
                return Err(self.record_failure(stripe, err));
            }
        }
        Ok(())
    }

    /// With every stripe locked, place an append at the current end of
    /// the object.
    fn resolve_append(&mut self) {
        let Some(rw) = self.request.rw_params_mut() else {
            return;
        };
        if !rw.append {
            return;
        }
        let size = self.object.size();
        rw.pos = size;
        rw.origin = size;
        rw.append = false;
        let count = rw.count;
        self.pos = size;
        self.io_endpos = size.saturating_add(count);
        self.endpos = self.io_endpos;
        self.request.continuation_pending = false;
        debug!(object = self.object.id(), pos = size, count, "append position resolved");

        for i in 0..self.active.len() {
            let stripe = self.active[i];
            let op = match self.intersection(stripe, self.pos, self.endpos) {
                Some((start, end)) => self.sub_op(stripe, start, end + 1),
                None => self.sub_op(stripe, 0, 0),
            };
            if let Some(ctx) = self.subs[stripe].as_mut() {
                ctx.op = op;
            }
        }
    }

    fn record_failure(&mut self, stripe: usize, err: Error) -> Error {
        warn!(object = self.object.id(), stripe, error = %err, "sub-operation failed");
        metrics::SUBIO_FAILURES.inc();
        if let Some(ctx) = self.subs[stripe].as_mut() {
            ctx.result = Some(err.clone());
        }
        if self.request.result.is_none() {
            self.request.result = Some(err.clone());
        }
        err
    }

    /// Complete every active stripe and collect what they moved.
    pub fn end(&mut self) {
        let fsync = self.request.kind == IoKind::Fsync;
        for &stripe in &self.active {
            let Some(ctx) = self.subs[stripe].as_mut() else {
                continue;
            };
            ctx.with_sub(|sub, op| sub.end(op));
            if ctx.started && ctx.result.is_none() {
                let bytes = ctx.with_sub(|sub, _| sub.bytes_done());
                if fsync {
                    self.summary.nr_written += bytes;
                } else {
                    self.summary.transferred += bytes;
                }
            }
            ctx.started = false;
        }
    }

    pub fn unlock(&mut self) {
        for &stripe in &self.active {
            if let Some(ctx) = self.subs[stripe].as_mut() {
                ctx.with_sub(|sub, _| sub.unlock());
            }
        }
    }

    pub fn iter_fini(&mut self) {
        for stripe in std::mem::take(&mut self.active) {
            if let Some(ctx) = self.subs[stripe].as_mut() {
                ctx.with_sub(|sub, _| sub.iter_fini());
            }
        }
    }

    /// Move past the chunk just done. Returns whether another iteration
    /// is needed.
    pub fn advance(&mut self) -> bool {
        if !self.request.continuation_pending || self.request.result.is_some() {
            return false;
        }
        let moved = self.endpos - self.pos;
        if let Some(rw) = self.request.rw_params_mut() {
            if !rw.append {
                rw.pos += moved;
                rw.count -= moved;
            }
        }
        true
    }

    /// Release every sub-context this request ever created and drop the
    /// request's hold on the object.
    pub fn fini(mut self) -> IoSummary {
        self.fini_inner();
        self.summary
    }

    fn fini_inner(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        for stripe in 0..self.subs.len() {
            self.sub_fini(stripe, None);
        }
        self.object.io_finished();
    }

    // =========================================================================
    // Sub-context management
    // =========================================================================

    fn sub_get(
        &mut self,
        stripe: usize,
        mut reserve: Option<&mut EmergencyReserve>,
    ) -> Result<&mut StripeSubContext> {
        debug_assert_eq!(self.mem_frozen, reserve.is_some());
        if self.subs[stripe].is_none() {
            let handle = match reserve.as_deref_mut() {
                Some(reserve) => SubHandle::Borrowed {
                    sub: reserve.take(stripe)?,
                    from: BorrowedFrom::Reserve { slot: stripe },
                },
                None if self.single_subio_index == Some(stripe) => {
                    match self.device.take_spare() {
                        Some(sub) => SubHandle::Borrowed {
                            sub,
                            from: BorrowedFrom::SingleSlot,
                        },
                        None => SubHandle::Owned(self.device.alloc_sub()?),
                    }
                }
                None => SubHandle::Owned(self.device.alloc_sub()?),
            };
            let mut ctx = StripeSubContext {
                stripe,
                handle,
                op: StripeOp::Misc,
                reenter: 0,
                started: false,
                result: None,
            };
            let kind = self.request.kind;
            if let Err(err) = ctx.with_sub(|sub, _| sub.init(&self.object, stripe, kind)) {
                self.release(ctx.handle, reserve);
                return Err(err);
            }
            trace!(stripe, borrowed = ?ctx.borrowed_from(), "sub-context created");
            self.summary.sub_contexts_created += 1;
            self.subs[stripe] = Some(ctx);
        }
        self.subs[stripe]
            .as_mut()
            .ok_or_else(|| Error::Internal(format!("sub-context {} vanished", stripe)))
    }

    fn sub_fini(&mut self, stripe: usize, reserve: Option<&mut EmergencyReserve>) {
        let Some(ctx) = self.subs[stripe].take() else {
            return;
        };
        assert_eq!(ctx.reenter, 0, "sub-context {} finalized while entered", stripe);
        self.release(ctx.handle, reserve);
    }

    fn release(&self, handle: SubHandle, reserve: Option<&mut EmergencyReserve>) {
        match handle {
            SubHandle::Owned(mut sub) => sub.fini(),
            SubHandle::Borrowed { mut sub, from } => {
                sub.fini();
                match from {
                    BorrowedFrom::SingleSlot => self.device.put_spare(sub),
                    BorrowedFrom::Reserve { slot } => match reserve {
                        Some(reserve) => reserve.give_back(slot, sub),
                        None => self.device.reserve.lock().give_back(slot, sub),
                    },
                }
            }
        }
    }

    // =========================================================================
    // Page submission
    // =========================================================================

    /// Submit `queue.qin` through the stripes owning each page.
    ///
    /// Accepted pages end up in `queue.qout`, everything else back in
    /// `queue.qin`. [`AllocStrategy::Reserved`] uses the device's emergency
    /// reserve and waits for any other reserved submit to finish first.
    pub fn submit(&mut self, queue: &mut TwoQueue, strategy: AllocStrategy) -> Result<()> {
        if let Some(stripe) = self.single_subio_index {
            if strategy == AllocStrategy::Normal || self.subs[stripe].is_some() {
                let ctx = self.sub_get(stripe, None)?;
                return ctx.with_sub(|sub, _| sub.submit(queue));
            }
        }

        let stripe_count = self.object.layout().stripe_count();
        let device = self.device.clone();
        let mut guard = match strategy {
            AllocStrategy::Reserved => Some(device.reserve.lock()),
            AllocStrategy::Normal => None,
        };
        let mut reserve = guard.as_deref_mut();

        let mut queues: Vec<PageList> = match reserve.as_deref_mut() {
            Some(reserve) => {
                if reserve.queues.len() < stripe_count {
                    return Err(Error::AllocationFailed(format!(
                        "emergency reserve covers {} stripes, object has {}",
                        reserve.queues.len(),
                        stripe_count
                    )));
                }
                self.mem_frozen = true;
                metrics::DEGRADED_SUBMITS.inc();
                std::mem::take(&mut reserve.queues)
            }
            None => (0..stripe_count).map(|_| PageList::new()).collect(),
        };

        let layout = self.object.layout().clone();
        while let Some(page) = queue.qin.pop_front() {
            queues[layout.stripe_of(page.offset())].push(page);
        }

        let mut result = Ok(());
        for stripe in 0..stripe_count {
            if queues[stripe].is_empty() {
                continue;
            }
            let ctx = match self.sub_get(stripe, reserve.as_deref_mut()) {
                Ok(ctx) => ctx,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            };
            let mut sub_queue = TwoQueue::new(std::mem::take(&mut queues[stripe]));
            let rc = ctx.with_sub(|sub, _| sub.submit(&mut sub_queue));
            queues[stripe].splice(&mut sub_queue.qin);
            queue.qout.splice(&mut sub_queue.qout);
            if let Err(err) = rc {
                warn!(object = self.object.id(), stripe, error = %err, "page submit failed");
                result = Err(err);
                break;
            }
        }

        for leftover in queues.iter_mut() {
            queue.qin.splice(leftover);
        }

        if let Some(reserve) = reserve {
            reserve.queues = queues;
            for stripe in 0..stripe_count {
                let borrowed = self.subs[stripe]
                    .as_ref()
                    .and_then(StripeSubContext::borrowed_from);
                if let Some(BorrowedFrom::Reserve { .. }) = borrowed {
                    self.sub_fini(stripe, Some(&mut *reserve));
                }
            }
            self.mem_frozen = false;
        }
        result
    }

    /// Run iterations until the request is covered or a member fails.
    fn run(&mut self) -> Result<()> {
        loop {
            let mut rc = self.iter_init();
            if rc.is_ok() {
                rc = self.lock();
                if rc.is_ok() {
                    rc = self.start();
                    self.end();
                }
                self.unlock();
            }
            self.iter_fini();
            rc?;
            if !self.advance() {
                return Ok(());
            }
        }
    }
}

impl Drop for StripeIo {
    fn drop(&mut self) {
        self.fini_inner();
    }
}

/// Drive `request` through every phase until it is complete.
///
/// Returns the first sub-operation failure, after every sub-context has
/// been cleaned up.
#[instrument(skip_all, fields(object = object.id(), kind = ?request.kind))]
pub fn io_loop(
    device: &Arc<StripeDevice>,
    object: &Arc<StripedObject>,
    request: LogicalIoRequest,
) -> Result<IoSummary> {
    let Some(mut io) = StripeIo::init(device.clone(), object.clone(), request)? else {
        return Ok(IoSummary::default());
    };
    let rc = io.run();
    let summary = io.fini();
    debug!(?summary, ok = rc.is_ok(), "stripe io finished");
    rc.map(|()| summary)
}
