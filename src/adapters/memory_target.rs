//! In-Memory Stripe Targets
//!
//! Storage targets that keep stripe objects in memory, and the `SubIo`
//! implementation that runs a stripe's share of an I/O against them. Lets
//! the full coordinator path run without real storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::domain::{LvbSource, SubIo, SubIoFactory};
use crate::error::{Error, Result};
use crate::lock::{ExtentLockAdapter, LockHandle, LockMode, Lvb, ResourceId};
use crate::stripe::{IoKind, StripeOp, StripedObject, TargetIndex, TwoQueue, PAGE_SIZE};

const BLOCK_SIZE: u64 = 512;

#[derive(Debug, Default)]
struct StoredObject {
    data: Vec<u8>,
    mtime: u64,
    /// Bytes written since the last fsync.
    dirty: u64,
}

/// One storage target holding stripe objects keyed by object id.
#[derive(Debug)]
pub struct MemoryTarget {
    index: TargetIndex,
    objects: Mutex<HashMap<u64, StoredObject>>,
    online: AtomicBool,
}

impl MemoryTarget {
    pub fn new(index: TargetIndex) -> Self {
        Self {
            index,
            objects: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
        }
    }

    pub fn index(&self) -> TargetIndex {
        self.index
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Take the target down or bring it back; offline targets fail every call.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    fn check_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::Transport(format!("target {} is offline", self.index)))
        }
    }

    /// Read `len` bytes at `offset`; holes and bytes past the end read as zero.
    pub fn read(&self, object: u64, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.check_online()?;
        let mut out = vec![0u8; len as usize];
        if let Some(stored) = self.objects.lock().get(&object) {
            let start = (offset as usize).min(stored.data.len());
            let end = (offset.saturating_add(len) as usize).min(stored.data.len());
            out[..end - start].copy_from_slice(&stored.data[start..end]);
        }
        Ok(out)
    }

    pub fn write(&self, object: u64, offset: u64, data: &[u8]) -> Result<()> {
        self.check_online()?;
        let mut objects = self.objects.lock();
        let stored = objects.entry(object).or_default();
        let start = offset as usize;
        let end = start + data.len();
        if stored.data.len() < end {
            stored.data.resize(end, 0);
        }
        stored.data[start..end].copy_from_slice(data);
        stored.dirty += data.len() as u64;
        Ok(())
    }

    pub fn truncate(&self, object: u64, size: u64) -> Result<()> {
        self.check_online()?;
        let mut objects = self.objects.lock();
        objects.entry(object).or_default().data.resize(size as usize, 0);
        Ok(())
    }

    pub fn set_mtime(&self, object: u64, mtime: u64) -> Result<()> {
        self.check_online()?;
        self.objects.lock().entry(object).or_default().mtime = mtime;
        Ok(())
    }

    /// Flush `object`; returns how many dirty bytes were written back.
    pub fn fsync(&self, object: u64) -> Result<u64> {
        self.check_online()?;
        let mut objects = self.objects.lock();
        Ok(objects
            .get_mut(&object)
            .map(|stored| std::mem::take(&mut stored.dirty))
            .unwrap_or(0))
    }

    pub fn size(&self, object: u64) -> u64 {
        self.objects
            .lock()
            .get(&object)
            .map_or(0, |stored| stored.data.len() as u64)
    }

    /// Authoritative attributes of `object` on this target.
    pub fn lvb(&self, object: u64) -> Lvb {
        self.objects
            .lock()
            .get(&object)
            .map(|stored| {
                let size = stored.data.len() as u64;
                Lvb {
                    size,
                    mtime: stored.mtime,
                    blocks: size.div_ceil(BLOCK_SIZE),
                }
            })
            .unwrap_or_default()
    }
}

/// A set of targets addressed by index.
#[derive(Debug)]
pub struct MemoryTargets {
    targets: Vec<Arc<MemoryTarget>>,
}

impl MemoryTargets {
    /// Targets `0..count`.
    pub fn new(count: u32) -> Self {
        Self {
            targets: (0..count).map(|i| Arc::new(MemoryTarget::new(i))).collect(),
        }
    }

    pub fn target(&self, index: TargetIndex) -> Option<Arc<MemoryTarget>> {
        self.targets.get(index as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl LvbSource for MemoryTargets {
    fn lvb(&self, resource: ResourceId) -> Lvb {
        self.target(resource.target)
            .map(|target| target.lvb(resource.object))
            .unwrap_or_default()
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// =============================================================================
// Sub-operations
// =============================================================================

/// Allocates [`MemorySubIo`]s bound to a target set and a lock adapter.
#[derive(Debug, Clone)]
pub struct MemorySubIoFactory {
    targets: Arc<MemoryTargets>,
    locks: Arc<ExtentLockAdapter>,
}

impl MemorySubIoFactory {
    pub fn new(targets: Arc<MemoryTargets>, locks: Arc<ExtentLockAdapter>) -> Self {
        Self { targets, locks }
    }
}

impl SubIoFactory for MemorySubIoFactory {
    fn alloc(&self) -> Result<Box<dyn SubIo>> {
        Ok(Box::new(MemorySubIo {
            targets: self.targets.clone(),
            locks: self.locks.clone(),
            binding: None,
            lock: None,
            bytes: 0,
        }))
    }
}

struct Binding {
    object: Arc<StripedObject>,
    stripe: usize,
    target: Arc<MemoryTarget>,
}

/// One stripe's share of an I/O against a [`MemoryTarget`].
pub struct MemorySubIo {
    targets: Arc<MemoryTargets>,
    locks: Arc<ExtentLockAdapter>,
    binding: Option<Binding>,
    lock: Option<(LockMode, LockHandle)>,
    bytes: u64,
}

impl MemorySubIo {
    fn binding(&self) -> Result<&Binding> {
        self.binding
            .as_ref()
            .ok_or_else(|| Error::Internal("sub-operation used before init".to_string()))
    }

    fn failed(stripe: usize, err: Error) -> Error {
        Error::SubOperation {
            stripe,
            reason: err.to_string(),
        }
    }

    fn release_lock(&mut self) {
        if let Some((mode, handle)) = self.lock.take() {
            if let Err(e) = self.locks.release(mode, Some(handle)) {
                warn!(cookie = handle.cookie, error = %e, "failed to release extent lock");
            }
        }
    }

    fn run(&self, op: &StripeOp) -> Result<u64> {
        let binding = self.binding()?;
        let id = binding.object.id();
        let target = &binding.target;
        match op {
            StripeOp::Read(rw) => {
                if rw.count == 0 {
                    return Ok(0);
                }
                let data = target.read(id, rw.pos, rw.count)?;
                if let Some(buf) = &rw.buf {
                    let mut buf = buf.lock();
                    let end = rw.buf_offset + data.len();
                    if buf.len() < end {
                        return Err(Error::Internal(format!(
                            "read buffer holds {} bytes, need {}",
                            buf.len(),
                            end
                        )));
                    }
                    buf[rw.buf_offset..end].copy_from_slice(&data);
                }
                Ok(rw.count)
            }
            StripeOp::Write(rw) => {
                if rw.count == 0 {
                    return Ok(0);
                }
                let data = match &rw.buf {
                    Some(buf) => {
                        let buf = buf.lock();
                        let end = rw.buf_offset + rw.count as usize;
                        if buf.len() < end {
                            return Err(Error::Internal(format!(
                                "write buffer holds {} bytes, need {}",
                                buf.len(),
                                end
                            )));
                        }
                        buf[rw.buf_offset..end].to_vec()
                    }
                    None => vec![0u8; rw.count as usize],
                };
                let mtime = now();
                target.write(id, rw.pos, &data)?;
                target.set_mtime(id, mtime)?;
                binding
                    .object
                    .note_write(binding.stripe, rw.pos + rw.count, mtime);
                if rw.sync {
                    target.fsync(id)?;
                }
                Ok(rw.count)
            }
            StripeOp::Setattr { size, mtime } => {
                let stamp = mtime.unwrap_or_else(now);
                if let Some(size) = size {
                    target.truncate(id, *size)?;
                    binding.object.note_truncate(binding.stripe, *size, stamp);
                }
                if mtime.is_some() {
                    target.set_mtime(id, stamp)?;
                }
                Ok(0)
            }
            StripeOp::Fault { index, buf, .. } => {
                let offset = index
                    .checked_mul(PAGE_SIZE)
                    .ok_or(Error::Fault { index: *index })?;
                let data = target.read(id, offset, PAGE_SIZE)?;
                if let Some(buf) = buf {
                    let mut buf = buf.lock();
                    let len = buf.len().min(data.len());
                    buf[..len].copy_from_slice(&data[..len]);
                }
                Ok(PAGE_SIZE)
            }
            StripeOp::Fsync { .. } => target.fsync(id),
            StripeOp::Misc => Ok(0),
        }
    }
}

impl SubIo for MemorySubIo {
    fn init(&mut self, object: &Arc<StripedObject>, stripe: usize, kind: IoKind) -> Result<()> {
        let target = object
            .layout()
            .target(stripe)
            .and_then(|index| self.targets.target(index))
            .ok_or_else(|| Error::SubOperation {
                stripe,
                reason: "no target backs this stripe".to_string(),
            })?;
        trace!(object = object.id(), stripe, ost = target.index(), ?kind, "sub-operation bound");
        self.binding = Some(Binding {
            object: object.clone(),
            stripe,
            target,
        });
        Ok(())
    }

    fn iter_init(&mut self, _op: &StripeOp) -> Result<()> {
        self.bytes = 0;
        Ok(())
    }

    fn lock(&mut self, op: &StripeOp) -> Result<()> {
        let Some((mode, extent)) = op.lock_request() else {
            return Ok(());
        };
        let binding = self.binding()?;
        let handle = self
            .locks
            .acquire(&binding.object, binding.stripe, mode, extent)?;
        self.lock = handle.map(|handle| (mode, handle));
        Ok(())
    }

    fn start(&mut self, op: &StripeOp) -> Result<()> {
        let stripe = self.binding()?.stripe;
        self.bytes = self.run(op).map_err(|e| Self::failed(stripe, e))?;
        Ok(())
    }

    fn end(&mut self, _op: &StripeOp) {}

    fn unlock(&mut self) {
        self.release_lock();
    }

    fn iter_fini(&mut self) {}

    fn fini(&mut self) {
        self.release_lock();
        self.binding = None;
        self.bytes = 0;
    }

    fn bytes_done(&self) -> u64 {
        self.bytes
    }

    fn submit(&mut self, queue: &mut TwoQueue) -> Result<()> {
        let binding = self.binding()?;
        let stripe = binding.stripe;
        let id = binding.object.id();
        binding
            .target
            .check_online()
            .map_err(|e| Self::failed(stripe, e))?;
        let layout = binding.object.layout();
        let mtime = now();
        while let Some(page) = queue.qin.pop_front() {
            let local = layout.stripe_offset(page.offset(), stripe);
            binding
                .target
                .write(id, local, &page.data)
                .map_err(|e| Self::failed(stripe, e))?;
            binding
                .object
                .note_write(stripe, local + page.data.len() as u64, mtime);
            queue.qout.push(page);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::LocalLockService;
    use crate::stripe::{Page, PageList, RwOp, StripeLayout};
    use assert_matches::assert_matches;
    use bytes::{Bytes, BytesMut};

    const MB: u64 = 1024 * 1024;

    fn setup() -> (Arc<MemoryTargets>, MemorySubIoFactory, Arc<StripedObject>) {
        let targets = Arc::new(MemoryTargets::new(2));
        let locks = Arc::new(ExtentLockAdapter::new(
            Arc::new(LocalLockService::new(targets.clone())),
            false,
        ));
        let factory = MemorySubIoFactory::new(targets.clone(), locks);
        let object = StripedObject::new(3, StripeLayout::new(MB, vec![0, 1]).unwrap());
        (targets, factory, object)
    }

    #[test]
    fn test_target_read_zero_fills() {
        let target = MemoryTarget::new(0);
        target.write(1, 4, b"abcd").unwrap();
        assert_eq!(target.read(1, 2, 8).unwrap(), b"\0\0abcd\0\0".to_vec());
        assert_eq!(target.lvb(1).blocks, 1);
        assert_eq!(target.fsync(1).unwrap(), 4);
        assert_eq!(target.fsync(1).unwrap(), 0);

        target.set_online(false);
        assert_matches!(target.read(1, 0, 1), Err(Error::Transport(_)));
    }

    #[test]
    fn test_write_updates_object() {
        let (targets, factory, object) = setup();
        let mut sub = factory.alloc().unwrap();
        sub.init(&object, 1, IoKind::Write).unwrap();

        let buf = crate::stripe::io_buffer(BytesMut::from(&b"hello"[..]));
        let op = StripeOp::Write(RwOp {
            pos: 10,
            count: 5,
            buf_offset: 0,
            append: false,
            sync: false,
            buf: Some(buf),
        });
        sub.iter_init(&op).unwrap();
        sub.lock(&op).unwrap();
        sub.start(&op).unwrap();
        sub.end(&op);
        assert_eq!(sub.bytes_done(), 5);
        sub.unlock();
        sub.fini();

        assert_eq!(targets.target(1).unwrap().read(3, 10, 5).unwrap(), b"hello");
        assert_eq!(object.size(), MB + 15);
    }

    #[test]
    fn test_offline_target_fails_start() {
        let (targets, factory, object) = setup();
        targets.target(0).unwrap().set_online(false);
        let mut sub = factory.alloc().unwrap();
        sub.init(&object, 0, IoKind::Fsync).unwrap();
        let op = StripeOp::Fsync { start: 0, end: 10 };
        assert_matches!(sub.start(&op), Err(Error::SubOperation { stripe: 0, .. }));
    }

    #[test]
    fn test_submit_writes_pages_at_stripe_offsets() {
        let (targets, factory, object) = setup();
        let mut sub = factory.alloc().unwrap();
        sub.init(&object, 1, IoKind::Write).unwrap();

        let first_page_of_stripe1 = MB / PAGE_SIZE;
        let pages: PageList = [first_page_of_stripe1, first_page_of_stripe1 + 1]
            .into_iter()
            .map(|i| Page::new(i, Bytes::from(vec![7u8; PAGE_SIZE as usize])))
            .collect();
        let mut queue = TwoQueue::new(pages);
        sub.submit(&mut queue).unwrap();

        assert!(queue.qin.is_empty());
        assert_eq!(queue.qout.len(), 2);
        assert_eq!(targets.target(1).unwrap().size(3), 2 * PAGE_SIZE);
    }
}
