//! stripenet - Striped Network Storage Client Core
//!
//! The client-side machinery of a striped network filesystem: one logical
//! object is spread round-robin over several storage targets, requests to
//! those targets travel in versioned RPC envelopes, and every connection is
//! able to replay and resend its requests after the peer restarts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          StripedFile                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    Stripe    │───▶│    Extent    │───▶│   Storage    │       │
//! │  │ Coordinator  │    │    Locks     │    │   Targets    │       │
//! │  └──────────────┘    └──────────────┘    └──────┬───────┘       │
//! │                                                 │               │
//! │  ┌──────────────┐    ┌──────────────┐           │               │
//! │  │    Import    │◀──▶│ Wire Codec   │◀──────────┘               │
//! │  │  (recovery)  │    │ (envelopes)  │                           │
//! │  └──────────────┘    └──────────────┘                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - In-memory implementations of the domain ports
//! - [`client`] - File-level API over a striped object
//! - [`config`] - YAML configuration
//! - [`domain`] - Ports the core is written against
//! - [`error`] - Error types
//! - [`lock`] - Extent lock types and the per-stripe lock adapter
//! - [`metrics`] - Prometheus metrics
//! - [`quota`] - Space accounting
//! - [`recovery`] - Import state machine, replay and resend
//! - [`stripe`] - Stripe layout and the I/O coordinator
//! - [`wire`] - Message envelope codec and reply allocation

pub mod adapters;
pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod quota;
pub mod recovery;
pub mod stripe;
pub mod wire;

// Re-export commonly used types
pub use client::StripedFile;
pub use config::StripenetConfig;
pub use error::{Error, Result};
pub use lock::ExtentLockAdapter;
pub use recovery::{Export, Import, ImportConfig, ImportState, RecoveryPolicy, Request};
pub use stripe::{io_loop, LogicalIoRequest, StripeDevice, StripeIo, StripeLayout, StripedObject};
pub use wire::{MsgFormat, WireMessage};
