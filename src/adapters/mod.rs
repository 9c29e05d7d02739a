//! Infrastructure Adapters
//!
//! In-process implementations of the domain ports, following the
//! Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  SubIoFactory │ RangeLockService │ LvbSource │ RpcTransport│ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ MemorySubIoFactory │ LocalLockService │ MemoryTargets      │ │
//! │  │ LoopbackTransport                                          │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use stripenet::adapters::{LocalLockService, MemorySubIoFactory, MemoryTargets};
//! use stripenet::lock::ExtentLockAdapter;
//!
//! let targets = Arc::new(MemoryTargets::new(4));
//! let locks = Arc::new(ExtentLockAdapter::new(
//!     Arc::new(LocalLockService::new(targets.clone())),
//!     false,
//! ));
//! let factory = Arc::new(MemorySubIoFactory::new(targets, locks));
//! ```

pub mod local_lock;
pub mod loopback;
pub mod memory_target;

pub use local_lock::LocalLockService;
pub use loopback::{LoopbackTransport, SentRecord};
pub use memory_target::{MemorySubIo, MemorySubIoFactory, MemoryTarget, MemoryTargets};
