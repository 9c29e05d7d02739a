//! Stripe Coordinator
//!
//! Splits one logical I/O against a striped object into per-stripe
//! sub-operations and drives them through a shared lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          LogicalIoRequest                                │
//! └─────────────────────────────────┬───────────────────────────────────────┘
//!                                   │ init / slice_init
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  StripeIo                                                                │
//! │    iter_init ─▶ lock ─▶ start ─▶ end ─▶ unlock ─▶ iter_fini ─┐          │
//! │        ▲                                                      │          │
//! │        └──────────────── continuation_pending ◀───────────────┘          │
//! │                                                                          │
//! │  subs: [ ctx 0 ][ ctx 1 ][  -   ] ...     active: [0, 1]                 │
//! └──────────┬──────────────┬───────────────────────────────────────────────┘
//!            │              │    Owned | single slot | emergency reserve
//!            ▼              ▼
//!       ┌─────────┐    ┌─────────┐
//!       │ SubIo 0 │    │ SubIo 1 │  ... one per touched stripe
//!       └─────────┘    └─────────┘
//! ```
//!
//! # Components
//!
//! - **Layout** (`layout.rs`): round-robin striping arithmetic
//! - **Pages** (`pages.rs`): ordered page lists and submit queues
//! - **Request** (`request.rs`): logical requests and stripe-local operations
//! - **Object** (`object.rs`): cached attributes and the active-I/O counter
//! - **Device** (`device.rs`): sub-operation factory and emergency reserve
//! - **Coordinator** (`coordinator.rs`): the per-request state machine

pub mod coordinator;
pub mod device;
pub mod layout;
pub mod object;
pub mod pages;
pub mod request;

#[cfg(test)]
mod proptest;

pub use coordinator::{io_loop, BorrowedFrom, IoSummary, StripeIo, StripeSubContext};
pub use device::StripeDevice;
pub use layout::{StripeLayout, StripePattern, TargetIndex, EOF};
pub use object::{ObjectAttrs, StripeAttrs, StripedObject};
pub use pages::{Page, PageList, TwoQueue};
pub use request::{
    io_buffer, IoBuffer, IoKind, IoParams, LogicalIoRequest, RwOp, RwParams, StripeOp,
};

/// Size of a cached page.
pub const PAGE_SIZE: u64 = 4096;
