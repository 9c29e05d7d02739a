//! Glue between striped objects and the extent lock service.

use std::sync::{Arc, Weak};

use tracing::{debug, instrument, warn};

use super::types::{EnqueueRequest, Extent, LockDesc, LockHandle, LockMode, Lvb, ResourceId};
use crate::domain::{LockCallbacks, RangeLockService};
use crate::error::{Error, Result};
use crate::stripe::{ObjectAttrs, StripedObject};

/// Acquires and releases per-stripe extent locks on behalf of the
/// coordinator's sub-operations.
pub struct ExtentLockAdapter {
    service: Arc<dyn RangeLockService>,
    disabled: bool,
}

impl std::fmt::Debug for ExtentLockAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtentLockAdapter")
            .field("disabled", &self.disabled)
            .finish()
    }
}

impl ExtentLockAdapter {
    pub fn new(service: Arc<dyn RangeLockService>, disabled: bool) -> Self {
        Self { service, disabled }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn resource(object: &StripedObject, stripe: usize) -> Result<ResourceId> {
        let target = object.layout().target(stripe).ok_or_else(|| Error::Lock {
            target: u32::MAX,
            object: object.id(),
            reason: format!("stripe {} is outside the layout", stripe),
        })?;
        Ok(ResourceId {
            target,
            object: object.id(),
        })
    }

    fn callbacks(
        &self,
        object: &Arc<StripedObject>,
        stripe: usize,
        resource: ResourceId,
    ) -> Arc<dyn LockCallbacks> {
        Arc::new(StripeLockCallbacks {
            object: Arc::downgrade(object),
            stripe,
            resource,
            service: Arc::downgrade(&self.service),
        })
    }

    /// Take an extent lock on `stripe` of `object`.
    ///
    /// Returns `None` without contacting the service when `mode` is NL or
    /// locking is disabled.
    #[instrument(skip(self, object), fields(object = object.id()))]
    pub fn acquire(
        &self,
        object: &Arc<StripedObject>,
        stripe: usize,
        mode: LockMode,
        extent: Extent,
    ) -> Result<Option<LockHandle>> {
        if self.disabled || mode == LockMode::NL {
            return Ok(None);
        }
        let resource = Self::resource(object, stripe)?;
        let grant = self.service.enqueue(
            EnqueueRequest {
                resource,
                mode,
                extent,
                glimpse: false,
            },
            self.callbacks(object, stripe, resource),
        )?;
        let Some(handle) = grant.handle else {
            return Err(Error::Lock {
                target: resource.target,
                object: resource.object,
                reason: format!("{} lock on {} granted without a handle", mode, extent),
            });
        };

        object.update_lvb(stripe, grant.lvb, extent);
        if extent.is_whole() {
            object.refresh_size(true);
        }
        object.refresh_mtime();
        debug!(cookie = handle.cookie, %mode, %extent, "extent lock granted");
        Ok(Some(handle))
    }

    /// Release a lock obtained by [`acquire`](Self::acquire).
    pub fn release(&self, mode: LockMode, handle: Option<LockHandle>) -> Result<()> {
        match handle {
            Some(handle) if !self.disabled && mode != LockMode::NL => {
                self.service.cancel(handle)
            }
            _ => Ok(()),
        }
    }

    /// Learn the authoritative attributes of every stripe without keeping
    /// any lock, then merge them into the object's cached attributes.
    #[instrument(skip(self, object), fields(object = object.id()))]
    pub fn glimpse(&self, object: &Arc<StripedObject>) -> Result<ObjectAttrs> {
        for stripe in 0..object.layout().stripe_count() {
            let resource = Self::resource(object, stripe)?;
            let grant = self.service.enqueue(
                EnqueueRequest {
                    resource,
                    mode: LockMode::PR,
                    extent: Extent::whole(),
                    glimpse: true,
                },
                self.callbacks(object, stripe, resource),
            )?;
            object.store_lvb(stripe, grant.lvb);
            if let Some(handle) = grant.handle {
                self.service.cancel(handle)?;
            }
        }
        let attrs = object.refresh_all();
        debug!(size = attrs.size, mtime = attrs.mtime, "glimpse complete");
        Ok(attrs)
    }
}

/// Callbacks attached to one stripe's lock.
///
/// Holds the object weakly: a lock can outlive the I/O that took it.
pub struct StripeLockCallbacks {
    object: Weak<StripedObject>,
    stripe: usize,
    resource: ResourceId,
    service: Weak<dyn RangeLockService>,
}

impl StripeLockCallbacks {
    fn check(&self, desc: &LockDesc) {
        assert_eq!(
            desc.handle.resource, self.resource,
            "corrupted lock callback data for stripe {}",
            self.stripe
        );
    }
}

impl LockCallbacks for StripeLockCallbacks {
    fn blocking(&self, desc: &LockDesc) {
        self.check(desc);
        let Some(service) = self.service.upgrade() else {
            return;
        };
        debug!(cookie = desc.handle.cookie, stripe = self.stripe, "blocking callback, cancelling");
        if let Err(e) = service.cancel(desc.handle) {
            warn!(cookie = desc.handle.cookie, error = %e, "failed to cancel blocking lock");
        }
    }

    fn canceling(&self, desc: &LockDesc, kms_limit: u64) {
        self.check(desc);
        if desc.granted_mode.is_none() {
            return;
        }
        if let Some(object) = self.object.upgrade() {
            object.shift_kms(self.stripe, kms_limit);
        }
    }

    fn glimpse(&self, desc: &LockDesc) -> Lvb {
        self.check(desc);
        match self.object.upgrade() {
            Some(object) => {
                let attrs = object.stripe_attrs(self.stripe);
                Lvb {
                    size: attrs.kms.max(attrs.lvb.size),
                    ..attrs.lvb
                }
            }
            None => desc.lvb,
        }
    }
}
