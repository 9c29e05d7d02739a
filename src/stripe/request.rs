//! Logical I/O requests and their stripe-local counterparts.

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

use super::layout::EOF;
use super::PAGE_SIZE;
use crate::error::Error;
use crate::lock::{Extent, LockMode};

/// Caller-owned data buffer shared with the sub-operations.
pub type IoBuffer = Arc<Mutex<BytesMut>>;

/// Wrap `data` as an [`IoBuffer`].
pub fn io_buffer(data: BytesMut) -> IoBuffer {
    Arc::new(Mutex::new(data))
}

/// Kind of a logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoKind {
    Read,
    Write,
    Setattr,
    Fault,
    Fsync,
    Misc,
}

/// Read/write parameters.
#[derive(Debug, Clone)]
pub struct RwParams {
    pub pos: u64,
    pub count: u64,
    pub append: bool,
    pub sync: bool,
    /// Data buffer; byte 0 corresponds to the original `pos`.
    pub buf: Option<IoBuffer>,
    pub(crate) origin: u64,
}

/// Parameters of a logical operation.
#[derive(Debug, Clone)]
pub enum IoParams {
    Rw(RwParams),
    /// `size` set means truncate.
    Setattr {
        size: Option<u64>,
        mtime: Option<u64>,
    },
    Fault {
        index: u64,
        writable: bool,
        buf: Option<IoBuffer>,
    },
    Fsync {
        start: u64,
        end: u64,
    },
    Misc,
}

/// One user-visible operation against a striped object.
#[derive(Debug, Clone)]
pub struct LogicalIoRequest {
    pub kind: IoKind,
    pub params: IoParams,
    /// Another iteration is needed to cover the request.
    pub continuation_pending: bool,
    /// First sub-operation failure observed by lock or start.
    pub result: Option<Error>,
}

impl LogicalIoRequest {
    fn new(kind: IoKind, params: IoParams) -> Self {
        Self {
            kind,
            params,
            continuation_pending: false,
            result: None,
        }
    }

    fn rw(kind: IoKind, pos: u64, count: u64, append: bool, buf: Option<IoBuffer>) -> Self {
        Self::new(
            kind,
            IoParams::Rw(RwParams {
                pos,
                count,
                append,
                sync: false,
                buf,
                origin: pos,
            }),
        )
    }

    pub fn read(pos: u64, count: u64, buf: Option<IoBuffer>) -> Self {
        Self::rw(IoKind::Read, pos, count, false, buf)
    }

    pub fn write(pos: u64, count: u64, buf: Option<IoBuffer>) -> Self {
        Self::rw(IoKind::Write, pos, count, false, buf)
    }

    /// Append `count` bytes at whatever the end of the object turns out to be.
    pub fn append(count: u64, buf: Option<IoBuffer>) -> Self {
        Self::rw(IoKind::Write, 0, count, true, buf)
    }

    pub fn truncate(size: u64) -> Self {
        Self::new(
            IoKind::Setattr,
            IoParams::Setattr {
                size: Some(size),
                mtime: None,
            },
        )
    }

    pub fn set_mtime(mtime: u64) -> Self {
        Self::new(
            IoKind::Setattr,
            IoParams::Setattr {
                size: None,
                mtime: Some(mtime),
            },
        )
    }

    pub fn fault(index: u64, writable: bool, buf: Option<IoBuffer>) -> Self {
        Self::new(
            IoKind::Fault,
            IoParams::Fault {
                index,
                writable,
                buf,
            },
        )
    }

    pub fn fsync(start: u64, end: u64) -> Self {
        Self::new(IoKind::Fsync, IoParams::Fsync { start, end })
    }

    pub fn misc() -> Self {
        Self::new(IoKind::Misc, IoParams::Misc)
    }

    /// Mark a read or write synchronous.
    pub fn with_sync(mut self, sync: bool) -> Self {
        if let IoParams::Rw(rw) = &mut self.params {
            rw.sync = sync;
        }
        self
    }

    pub(crate) fn rw_params(&self) -> Option<&RwParams> {
        match &self.params {
            IoParams::Rw(rw) => Some(rw),
            _ => None,
        }
    }

    pub(crate) fn rw_params_mut(&mut self) -> Option<&mut RwParams> {
        match &mut self.params {
            IoParams::Rw(rw) => Some(rw),
            _ => None,
        }
    }
}

// =============================================================================
// Stripe-local operations
// =============================================================================

/// Stripe-local read/write.
#[derive(Debug, Clone)]
pub struct RwOp {
    pub pos: u64,
    pub count: u64,
    /// Offset of `pos` inside the request's data buffer.
    pub buf_offset: usize,
    pub append: bool,
    pub sync: bool,
    pub buf: Option<IoBuffer>,
}

/// Operation handed to one stripe's sub-operation, in stripe-local terms.
#[derive(Debug, Clone)]
pub enum StripeOp {
    Read(RwOp),
    Write(RwOp),
    Setattr {
        size: Option<u64>,
        mtime: Option<u64>,
    },
    Fault {
        /// Stripe-local page index.
        index: u64,
        writable: bool,
        buf: Option<IoBuffer>,
    },
    Fsync {
        start: u64,
        end: u64,
    },
    Misc,
}

impl StripeOp {
    /// Stripe-local `[start, end)` the operation covers, if it is ranged.
    pub fn range(&self) -> Option<(u64, u64)> {
        match self {
            StripeOp::Read(rw) | StripeOp::Write(rw) => Some((rw.pos, rw.pos + rw.count)),
            StripeOp::Fault { index, .. } => Some((index * PAGE_SIZE, (index + 1) * PAGE_SIZE)),
            StripeOp::Fsync { start, end } => Some((*start, *end)),
            StripeOp::Setattr { .. } | StripeOp::Misc => None,
        }
    }

    /// Range lock the operation needs on its stripe.
    pub fn lock_request(&self) -> Option<(LockMode, Extent)> {
        match self {
            StripeOp::Read(rw) if rw.count > 0 => Some((
                LockMode::PR,
                Extent::new(rw.pos, rw.pos + rw.count - 1),
            )),
            StripeOp::Write(rw) if rw.append => Some((LockMode::PW, Extent::whole())),
            StripeOp::Write(rw) if rw.count > 0 => Some((
                LockMode::PW,
                Extent::new(rw.pos, rw.pos + rw.count - 1),
            )),
            StripeOp::Setattr {
                size: Some(size), ..
            } => Some((LockMode::PW, Extent::new(*size, EOF))),
            StripeOp::Setattr { size: None, .. } => Some((LockMode::PW, Extent::whole())),
            StripeOp::Fault {
                index, writable, ..
            } => Some((
                if *writable { LockMode::PW } else { LockMode::PR },
                Extent::new(index * PAGE_SIZE, (index + 1) * PAGE_SIZE - 1),
            )),
            _ => None,
        }
    }
}
