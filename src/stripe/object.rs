//! Striped objects: layout, cached attributes and the active-I/O counter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::layout::StripeLayout;
use crate::lock::{Extent, Lvb};

/// Cached view of one stripe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StripeAttrs {
    /// Known minimum size: no byte below it can be a hole we missed.
    pub kms: u64,
    /// Last value block returned by the lock service.
    pub lvb: Lvb,
}

/// Cached attributes of a striped object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectAttrs {
    pub size: u64,
    pub mtime: u64,
    pub blocks: u64,
    pub stripes: Vec<StripeAttrs>,
}

impl ObjectAttrs {
    /// Logical size: the largest size any stripe implies.
    ///
    /// With `kms_only` only the known minimum sizes are trusted.
    pub fn merge_size(&self, layout: &StripeLayout, kms_only: bool) -> u64 {
        self.stripes
            .iter()
            .enumerate()
            .map(|(stripe, attrs)| {
                let local = if kms_only {
                    attrs.kms
                } else {
                    attrs.kms.max(attrs.lvb.size)
                };
                layout.stripe_size_to_logical(local, stripe)
            })
            .max()
            .unwrap_or(0)
    }

    pub fn merge_mtime(&self) -> u64 {
        self.stripes.iter().map(|s| s.lvb.mtime).max().unwrap_or(0)
    }

    pub fn merge_blocks(&self) -> u64 {
        self.stripes.iter().map(|s| s.lvb.blocks).sum()
    }
}

/// A logical object striped over several targets.
pub struct StripedObject {
    id: u64,
    layout: StripeLayout,
    attrs: Mutex<ObjectAttrs>,
    active_ios: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl std::fmt::Debug for StripedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripedObject")
            .field("id", &self.id)
            .field("layout", &self.layout)
            .field("active_ios", &self.active_ios())
            .finish()
    }
}

impl StripedObject {
    pub fn new(id: u64, layout: StripeLayout) -> Arc<Self> {
        let stripes = vec![StripeAttrs::default(); layout.stripe_count()];
        Arc::new(Self {
            id,
            layout,
            attrs: Mutex::new(ObjectAttrs {
                stripes,
                ..Default::default()
            }),
            active_ios: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn layout(&self) -> &StripeLayout {
        &self.layout
    }

    /// Snapshot of the cached attributes.
    pub fn attrs(&self) -> ObjectAttrs {
        self.attrs.lock().clone()
    }

    pub fn size(&self) -> u64 {
        self.attrs.lock().size
    }

    /// Size the held locks vouch for; bytes past it need a glimpse.
    pub fn known_min_size(&self) -> u64 {
        self.attrs.lock().merge_size(&self.layout, true)
    }

    pub fn stripe_attrs(&self, stripe: usize) -> StripeAttrs {
        self.attrs
            .lock()
            .stripes
            .get(stripe)
            .copied()
            .unwrap_or_default()
    }

    /// Record the value block granted with a lock on `stripe`.
    ///
    /// Returns the new known minimum size if it grew.
    pub fn update_lvb(&self, stripe: usize, lvb: Lvb, extent: Extent) -> Option<u64> {
        let mut attrs = self.attrs.lock();
        let Some(s) = attrs.stripes.get_mut(stripe) else {
            return None;
        };
        s.lvb = lvb;
        raise_kms(s, lvb.size, extent)
    }

    /// Record a glimpsed value block.
    ///
    /// The glimpse is authoritative: a known minimum size above the target's
    /// size is stale and drops to it.
    pub fn store_lvb(&self, stripe: usize, lvb: Lvb) {
        if let Some(s) = self.attrs.lock().stripes.get_mut(stripe) {
            s.lvb = lvb;
            s.kms = s.kms.min(lvb.size);
        }
    }

    /// A lock on `stripe` went away; only `limit` bytes are still covered.
    pub fn shift_kms(&self, stripe: usize, limit: u64) {
        let mut attrs = self.attrs.lock();
        let Some(s) = attrs.stripes.get_mut(stripe) else {
            return;
        };
        if limit < s.kms {
            debug!(old = s.kms, new = limit, "known minimum size shifted down");
            s.kms = limit;
        }
    }

    /// Refresh the cached object size from the stripes.
    pub fn refresh_size(&self, kms_only: bool) -> u64 {
        let mut attrs = self.attrs.lock();
        attrs.size = attrs.merge_size(&self.layout, kms_only);
        attrs.size
    }

    /// Refresh the cached mtime from the stripes.
    pub fn refresh_mtime(&self) -> u64 {
        let mut attrs = self.attrs.lock();
        attrs.mtime = attrs.merge_mtime();
        attrs.mtime
    }

    /// Refresh size, blocks and mtime from the stripes' value blocks.
    pub fn refresh_all(&self) -> ObjectAttrs {
        let mut attrs = self.attrs.lock();
        attrs.size = attrs.merge_size(&self.layout, false);
        attrs.blocks = attrs.merge_blocks();
        attrs.mtime = attrs.merge_mtime();
        attrs.clone()
    }

    /// A write on `stripe` reached stripe-local offset `local_end`.
    pub fn note_write(&self, stripe: usize, local_end: u64, mtime: u64) {
        let mut attrs = self.attrs.lock();
        let Some(s) = attrs.stripes.get_mut(stripe) else {
            return;
        };
        s.kms = s.kms.max(local_end);
        s.lvb.size = s.lvb.size.max(local_end);
        s.lvb.mtime = s.lvb.mtime.max(mtime);
        let logical = self.layout.stripe_size_to_logical(local_end, stripe);
        attrs.size = attrs.size.max(logical);
        attrs.mtime = attrs.mtime.max(mtime);
    }

    /// `stripe` was truncated to `local_size`.
    pub fn note_truncate(&self, stripe: usize, local_size: u64, mtime: u64) {
        let mut attrs = self.attrs.lock();
        let Some(s) = attrs.stripes.get_mut(stripe) else {
            return;
        };
        s.kms = local_size;
        s.lvb.size = local_size;
        s.lvb.mtime = s.lvb.mtime.max(mtime);
        attrs.size = attrs.merge_size(&self.layout, true);
        attrs.mtime = attrs.mtime.max(mtime);
    }

    // =========================================================================
    // Active I/O tracking
    // =========================================================================

    pub fn active_ios(&self) -> usize {
        self.active_ios.load(Ordering::Acquire)
    }

    pub(crate) fn io_started(&self) {
        self.active_ios.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn io_finished(&self) {
        if self.active_ios.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }

    /// Block until no I/O is active on the object, at most `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.idle_lock.lock();
        while self.active_ios() > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.idle.wait_for(&mut guard, deadline - now);
        }
        true
    }
}

fn raise_kms(attrs: &mut StripeAttrs, lvb_size: u64, extent: Extent) -> Option<u64> {
    let implied = lvb_size.min(extent.end.saturating_add(1));
    if implied > attrs.kms {
        debug!(old = attrs.kms, new = implied, "known minimum size raised");
        attrs.kms = implied;
        Some(implied)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn object() -> Arc<StripedObject> {
        StripedObject::new(1, StripeLayout::new(MB, vec![0, 1, 2]).unwrap())
    }

    #[test]
    fn test_lock_grant_only_grows_kms() {
        let obj = object();
        let lvb = |size| Lvb {
            size,
            ..Default::default()
        };
        assert_eq!(obj.update_lvb(1, lvb(500), Extent::new(0, 99)), Some(100));
        assert_eq!(obj.update_lvb(1, lvb(50), Extent::whole()), None);
        assert_eq!(obj.update_lvb(1, lvb(700), Extent::whole()), Some(700));
        assert_eq!(obj.stripe_attrs(1).kms, 700);
    }

    #[test]
    fn test_shift_kms_only_shrinks() {
        let obj = object();
        obj.note_write(0, 4096, 1);
        obj.shift_kms(0, 8192);
        assert_eq!(obj.stripe_attrs(0).kms, 4096);
        obj.shift_kms(0, 100);
        assert_eq!(obj.stripe_attrs(0).kms, 100);
        obj.shift_kms(0, 0);
        assert_eq!(obj.stripe_attrs(0).kms, 0);
        // the value block still remembers the write
        assert_eq!(obj.attrs().merge_size(obj.layout(), false), 4096);
    }

    #[test]
    fn test_glimpse_replaces_stale_size() {
        let obj = object();
        obj.note_write(1, 7, 1);
        obj.store_lvb(
            1,
            Lvb {
                size: 0,
                mtime: 2,
                blocks: 0,
            },
        );
        assert_eq!(obj.stripe_attrs(1).kms, 0);
        assert_eq!(obj.refresh_all().size, 0);
    }

    #[test]
    fn test_merge_size() {
        let obj = object();
        obj.update_lvb(
            1,
            Lvb {
                size: 100,
                mtime: 5,
                blocks: 1,
            },
            Extent::new(0, 49),
        );
        let attrs = obj.attrs();
        // kms capped by the extent, lvb size is larger
        assert_eq!(attrs.merge_size(obj.layout(), true), MB + 50);
        assert_eq!(attrs.merge_size(obj.layout(), false), MB + 100);
        assert_eq!(attrs.merge_mtime(), 5);
    }

    #[test]
    fn test_note_write_and_truncate() {
        let obj = object();
        obj.note_write(2, 10, 3);
        assert_eq!(obj.size(), 2 * MB + 10);
        obj.note_truncate(2, 0, 4);
        assert_eq!(obj.size(), 0);
        assert_eq!(obj.attrs().mtime, 4);
    }

    #[test]
    fn test_wait_idle() {
        let obj = object();
        assert!(obj.wait_idle(Duration::from_millis(1)));
        obj.io_started();
        assert!(!obj.wait_idle(Duration::from_millis(10)));

        let waiter = {
            let obj = obj.clone();
            std::thread::spawn(move || obj.wait_idle(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        obj.io_finished();
        assert!(waiter.join().unwrap());
        assert_eq!(obj.active_ios(), 0);
    }
}
