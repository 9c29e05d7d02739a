//! Import Recovery
//!
//! Tracks requests per connection and brings a connection back after a
//! failure: requests the peer already executed but has not committed are
//! replayed in transaction order, requests that never got a reply are
//! resent with their original xid, and requests queued meanwhile are woken
//! once the import is serviceable again.
//!
//! # Components
//!
//! - **Request** (`request.rs`): one RPC call, its envelope and outcome
//! - **Import** (`import.rs`): the per-target state machine and its lists
//! - **Export** (`export.rs`): the serving side's view, failed at most once

pub mod export;
pub mod import;
pub mod request;

pub use export::Export;
pub use import::{Import, ImportConfig, ImportState, RecoveryPolicy};
pub use request::{ListMembership, Request};
