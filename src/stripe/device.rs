//! Stripe device: where sub-operations come from.
//!
//! Besides the ordinary factory the device owns two preallocated sources:
//!
//! - a spare sub-operation lent to requests that touch a single stripe
//! - the emergency reserve: one sub-operation and one scratch page list per
//!   stripe slot, used by submits that must not allocate. Only one such
//!   submit can hold the reserve at a time.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::pages::PageList;
use crate::domain::{SubIo, SubIoFactory};
use crate::error::{Error, Result};

/// Preallocated per-stripe resources for degraded-memory submits.
pub(crate) struct EmergencyReserve {
    pub(crate) subs: Vec<Option<Box<dyn SubIo>>>,
    pub(crate) queues: Vec<PageList>,
}

impl EmergencyReserve {
    /// Borrow the reserved sub-operation of `slot`.
    pub(crate) fn take(&mut self, slot: usize) -> Result<Box<dyn SubIo>> {
        self.subs
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or_else(|| {
                Error::AllocationFailed(format!(
                    "emergency reserve has no sub-operation for stripe {}",
                    slot
                ))
            })
    }

    pub(crate) fn give_back(&mut self, slot: usize, sub: Box<dyn SubIo>) {
        if let Some(entry) = self.subs.get_mut(slot) {
            *entry = Some(sub);
        }
    }
}

/// Source of sub-operations for one striped device.
pub struct StripeDevice {
    factory: Arc<dyn SubIoFactory>,
    pub(crate) reserve: Mutex<EmergencyReserve>,
    spare: Mutex<Option<Box<dyn SubIo>>>,
}

impl std::fmt::Debug for StripeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeDevice")
            .field("reserve_slots", &self.reserve_slots())
            .finish()
    }
}

impl StripeDevice {
    /// Create a device whose emergency reserve covers `reserve_slots` stripes.
    pub fn new(factory: Arc<dyn SubIoFactory>, reserve_slots: usize) -> Result<Arc<Self>> {
        let mut subs = Vec::with_capacity(reserve_slots);
        for _ in 0..reserve_slots {
            subs.push(Some(factory.alloc()?));
        }
        let spare = factory.alloc()?;
        debug!(reserve_slots, "stripe device ready");

        Ok(Arc::new(Self {
            factory,
            reserve: Mutex::new(EmergencyReserve {
                subs,
                queues: (0..reserve_slots).map(|_| PageList::new()).collect(),
            }),
            spare: Mutex::new(Some(spare)),
        }))
    }

    pub fn reserve_slots(&self) -> usize {
        self.reserve.lock().subs.len()
    }

    pub(crate) fn alloc_sub(&self) -> Result<Box<dyn SubIo>> {
        self.factory.alloc()
    }

    pub(crate) fn take_spare(&self) -> Option<Box<dyn SubIo>> {
        self.spare.lock().take()
    }

    pub(crate) fn put_spare(&self, sub: Box<dyn SubIo>) {
        *self.spare.lock() = Some(sub);
    }
}
