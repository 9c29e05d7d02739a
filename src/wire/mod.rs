//! Wire Message Codec
//!
//! Versioned RPC envelopes in two coexisting on-wire formats:
//!
//! ```text
//! Self-describing (v2)                      Legacy (v1)
//! ┌──────────────────────────────┐          ┌──────────────────────────────┐
//! │ magic │ count │ flvr │ repsz │          │ magic │ type │ version │ opc │
//! │ cksum │ pad   │ pad  │ pad   │          │ handle │ last_xid │ ...       │
//! ├──────────────────────────────┤          │ status │ flags │ conn │ count │
//! │ buflens[count]    (rounded)  │          ├──────────────────────────────┤
//! ├──────────────────────────────┤          │ buflens[count]    (rounded)  │
//! │ buf 0: envelope body (96 B)  │          ├──────────────────────────────┤
//! │ buf 1..n                     │          │ buf 1..n (buf 0 implicit)    │
//! └──────────────────────────────┘          └──────────────────────────────┘
//! ```
//!
//! Every integer is written in the sender's byte order. The magic tells the
//! receiver which format arrived and whether it must be swabbed.

mod body;
mod format;
mod message;
mod reply;

#[cfg(test)]
mod proptest;

pub use body::{MessageBody, BODY_SIZE};
pub use format::{Magic, MsgFormat};
pub use message::WireMessage;
pub use reply::{pack_reply, ReplyFlags, ReplyPoolConfig, ReplyState, ReplyStatePool};

// =============================================================================
// Protocol Constants
// =============================================================================

/// Magic of the legacy fixed-header format.
pub const MAGIC_V1: u32 = 0x0BD0_0BD0;
/// Magic of the self-describing format.
pub const MAGIC_V2: u32 = 0x0BD0_0BD3;
/// Legacy magic as seen from a peer of opposite byte order.
pub const MAGIC_V1_SWABBED: u32 = MAGIC_V1.swap_bytes();
/// Self-describing magic as seen from a peer of opposite byte order.
pub const MAGIC_V2_SWABBED: u32 = MAGIC_V2.swap_bytes();

/// Message protocol version carried in every envelope.
pub const MSG_VERSION: u32 = 0x0000_0003;
/// Upper half of the version word holds the service version.
pub const VERSION_MASK: u32 = 0xffff_0000;

/// Message types.
pub const MSG_REQUEST: u32 = 4711;
pub const MSG_ERR: u32 = 4712;
pub const MSG_REPLY: u32 = 4713;

/// Generic flags live in the low half of the legacy flag word.
pub const GEN_FLAG_MASK: u32 = 0x0000_ffff;
/// Operation flags live in the high half of the legacy flag word.
pub const OP_FLAG_SHIFT: u32 = 16;
pub const OP_FLAG_MASK: u32 = 0xffff_0000;

/// Generic message flags.
pub const MSG_LAST_REPLAY: u32 = 0x0001;
pub const MSG_RESENT: u32 = 0x0002;
pub const MSG_REPLAY: u32 = 0x0004;
pub const MSG_EARLY_REPLY: u32 = 0x0040;

/// Buffer alignment on the wire.
pub const ALIGN: usize = 8;

/// Round a buffer length up to the wire alignment.
#[inline]
pub const fn size_round(len: usize) -> usize {
    (len + ALIGN - 1) & !(ALIGN - 1)
}

/// Total envelope size for `lens` in `format`.
///
/// # Panics
///
/// Panics if `lens` is empty or `lens[0]` is not exactly [`BODY_SIZE`].
pub fn compute_size(format: MsgFormat, lens: &[u32]) -> usize {
    assert!(!lens.is_empty(), "envelope needs at least the body buffer");
    assert_eq!(
        lens[0] as usize, BODY_SIZE,
        "buffer 0 must be the envelope body"
    );
    format.ops().msg_size(lens)
}
