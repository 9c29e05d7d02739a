//! File-level API over a striped object.
//!
//! `StripedFile` turns byte-range calls into logical I/O requests for the
//! coordinator. Writes are checked against quota before any stripe is
//! touched; reads that reach past the cached size glimpse the stripes
//! first so a short read is detected from authoritative sizes.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, instrument};

use crate::domain::{AllocStrategy, QuotaCapability};
use crate::error::Result;
use crate::lock::ExtentLockAdapter;
use crate::stripe::{
    io_buffer, io_loop, LogicalIoRequest, ObjectAttrs, PageList, StripeDevice, StripeIo,
    StripedObject, TwoQueue, PAGE_SIZE,
};

/// An open striped file.
pub struct StripedFile {
    device: Arc<StripeDevice>,
    object: Arc<StripedObject>,
    locks: Arc<ExtentLockAdapter>,
    quota: Arc<dyn QuotaCapability>,
    owner: String,
}

impl std::fmt::Debug for StripedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripedFile")
            .field("object", &self.object.id())
            .field("owner", &self.owner)
            .finish()
    }
}

impl StripedFile {
    pub fn new(
        device: Arc<StripeDevice>,
        object: Arc<StripedObject>,
        locks: Arc<ExtentLockAdapter>,
        quota: Arc<dyn QuotaCapability>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            device,
            object,
            locks,
            quota,
            owner: owner.into(),
        }
    }

    pub fn object(&self) -> &Arc<StripedObject> {
        &self.object
    }

    /// Cached size; may lag behind other writers.
    pub fn size(&self) -> u64 {
        self.object.size()
    }

    /// Authoritative attributes from every stripe.
    pub fn stat(&self) -> Result<ObjectAttrs> {
        self.locks.glimpse(&self.object)
    }

    /// Read up to `len` bytes at `pos`. Returns fewer bytes at end of file.
    #[instrument(skip(self), fields(object = self.object.id()))]
    pub fn read(&self, pos: u64, len: u64) -> Result<Bytes> {
        let mut size = self.object.known_min_size();
        if pos.saturating_add(len) > size {
            size = self.locks.glimpse(&self.object)?.size;
        }
        if pos >= size || len == 0 {
            return Ok(Bytes::new());
        }
        let count = len.min(size - pos);

        let buf = io_buffer(BytesMut::zeroed(count as usize));
        let summary = io_loop(
            &self.device,
            &self.object,
            LogicalIoRequest::read(pos, count, Some(buf.clone())),
        )?;
        let mut data = buf.lock().split();
        data.truncate(summary.transferred as usize);
        debug!(pos, requested = len, read = data.len(), "read complete");
        Ok(data.freeze())
    }

    fn growth(&self, end: u64) -> u64 {
        end.saturating_sub(self.object.size())
    }

    /// Run a request that may grow the file by `growth` bytes.
    fn charged(&self, growth: u64, request: LogicalIoRequest) -> Result<u64> {
        self.quota.check(&self.owner, growth)?;
        self.quota.acquire(&self.owner, growth)?;
        match io_loop(&self.device, &self.object, request) {
            Ok(summary) => Ok(summary.transferred),
            Err(err) => {
                self.quota.release(&self.owner, growth);
                Err(err)
            }
        }
    }

    /// Write `data` at `pos`; returns bytes written.
    #[instrument(skip(self, data), fields(object = self.object.id(), len = data.len()))]
    pub fn write(&self, pos: u64, data: &[u8]) -> Result<u64> {
        let count = data.len() as u64;
        let growth = self.growth(pos + count);
        let buf = io_buffer(BytesMut::from(data));
        self.charged(growth, LogicalIoRequest::write(pos, count, Some(buf)))
    }

    /// Write `data` synchronously.
    pub fn write_sync(&self, pos: u64, data: &[u8]) -> Result<u64> {
        let count = data.len() as u64;
        let growth = self.growth(pos + count);
        let buf = io_buffer(BytesMut::from(data));
        self.charged(
            growth,
            LogicalIoRequest::write(pos, count, Some(buf)).with_sync(true),
        )
    }

    /// Append `data` at the end of the file as it stands under the lock.
    #[instrument(skip(self, data), fields(object = self.object.id(), len = data.len()))]
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        let count = data.len() as u64;
        let buf = io_buffer(BytesMut::from(data));
        self.charged(count, LogicalIoRequest::append(count, Some(buf)))
    }

    /// Set the file size.
    #[instrument(skip(self), fields(object = self.object.id()))]
    pub fn truncate(&self, size: u64) -> Result<()> {
        let old = self.object.size();
        if size > old {
            self.charged(size - old, LogicalIoRequest::truncate(size))?;
            return Ok(());
        }
        io_loop(&self.device, &self.object, LogicalIoRequest::truncate(size))?;
        self.quota.release(&self.owner, old - size);
        Ok(())
    }

    pub fn set_mtime(&self, mtime: u64) -> Result<()> {
        io_loop(&self.device, &self.object, LogicalIoRequest::set_mtime(mtime))?;
        Ok(())
    }

    /// Flush `[start, end)`; returns bytes written back.
    pub fn fsync(&self, start: u64, end: u64) -> Result<u64> {
        let summary = io_loop(&self.device, &self.object, LogicalIoRequest::fsync(start, end))?;
        Ok(summary.nr_written)
    }

    /// Resolve a page fault at page `index`, returning the page contents.
    pub fn fault(&self, index: u64, writable: bool) -> Result<Bytes> {
        let buf = io_buffer(BytesMut::zeroed(PAGE_SIZE as usize));
        io_loop(
            &self.device,
            &self.object,
            LogicalIoRequest::fault(index, writable, Some(buf.clone())),
        )?;
        let page = buf.lock().split().freeze();
        Ok(page)
    }

    /// Write cached pages back to their stripes.
    ///
    /// Returns the queue pair: accepted pages in `qout`, pages left behind
    /// by a failed stripe in `qin`.
    #[instrument(skip(self, pages), fields(object = self.object.id(), pages = pages.len()))]
    pub fn writeback(&self, pages: PageList, strategy: AllocStrategy) -> Result<TwoQueue> {
        let end = pages
            .iter()
            .map(|p| p.offset() + p.data.len() as u64)
            .max()
            .unwrap_or(0);
        let growth = self.growth(end);
        self.quota.check(&self.owner, growth)?;
        self.quota.acquire(&self.owner, growth)?;

        let mut queue = TwoQueue::new(pages);
        let io = StripeIo::init(
            self.device.clone(),
            self.object.clone(),
            LogicalIoRequest::misc(),
        );
        let rc = match io {
            Ok(Some(mut io)) => {
                let rc = io.submit(&mut queue, strategy);
                io.fini();
                rc
            }
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = rc {
            self.quota.release(&self.owner, growth);
            return Err(err);
        }
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LocalLockService, MemorySubIoFactory, MemoryTargets};
    use crate::error::Error;
    use crate::quota::{MemoryQuota, Unlimited};
    use crate::stripe::{Page, StripeLayout};
    use assert_matches::assert_matches;

    const KB: u64 = 1024;

    struct Fixture {
        targets: Arc<MemoryTargets>,
        device: Arc<StripeDevice>,
        locks: Arc<ExtentLockAdapter>,
    }

    fn fixture() -> Fixture {
        let targets = Arc::new(MemoryTargets::new(3));
        let locks = Arc::new(ExtentLockAdapter::new(
            Arc::new(LocalLockService::new(targets.clone())),
            false,
        ));
        let factory = Arc::new(MemorySubIoFactory::new(targets.clone(), locks.clone()));
        let device = StripeDevice::new(factory, 4).unwrap();
        Fixture {
            targets,
            device,
            locks,
        }
    }

    fn open(fx: &Fixture, id: u64, quota: Arc<dyn QuotaCapability>) -> StripedFile {
        let object = StripedObject::new(id, StripeLayout::new(64 * KB, vec![0, 1, 2]).unwrap());
        StripedFile::new(fx.device.clone(), object, fx.locks.clone(), quota, "alice")
    }

    #[test]
    fn test_write_read_across_stripes() {
        let fx = fixture();
        let file = open(&fx, 1, Arc::new(Unlimited));
        let data: Vec<u8> = (0..200 * KB).map(|i| (i % 251) as u8).collect();

        assert_eq!(file.write(10, &data).unwrap(), 200 * KB);
        assert_eq!(file.size(), 200 * KB + 10);
        assert_eq!(file.read(10, 200 * KB).unwrap(), Bytes::from(data.clone()));
        assert_eq!(file.read(0, 10).unwrap(), Bytes::from(vec![0u8; 10]));
    }

    #[test]
    fn test_short_read_uses_glimpse() {
        let fx = fixture();
        let writer = open(&fx, 2, Arc::new(Unlimited));
        writer.write(0, &[9u8; 100]).unwrap();

        // a second opener has no cached size yet
        let reader = open(&fx, 2, Arc::new(Unlimited));
        assert_eq!(reader.size(), 0);
        let data = reader.read(50, 1000).unwrap();
        assert_eq!(data.len(), 50);
        assert_eq!(reader.read(100, 10).unwrap().len(), 0);
    }

    #[test]
    fn test_append_and_truncate() {
        let fx = fixture();
        let file = open(&fx, 3, Arc::new(Unlimited));
        file.write(0, b"hello").unwrap();
        file.append(b" world").unwrap();
        assert_eq!(file.read(0, 64).unwrap(), Bytes::from_static(b"hello world"));

        file.truncate(5).unwrap();
        assert_eq!(file.size(), 5);
        assert_eq!(file.stat().unwrap().size, 5);
    }

    #[test]
    fn test_quota_checked_before_write() {
        let fx = fixture();
        let quota = Arc::new(MemoryQuota::new());
        quota.set_limit("alice", 100);
        let file = open(&fx, 4, quota.clone());

        file.write(0, &[1u8; 60]).unwrap();
        assert_matches!(
            file.write(60, &[1u8; 60]),
            Err(Error::QuotaExceeded { requested: 60, .. })
        );
        // nothing reached the targets
        assert_eq!(fx.targets.target(0).unwrap().size(4), 60);
        assert_eq!(quota.used("alice"), 60);

        // overwrites do not grow the file
        file.write(0, &[2u8; 60]).unwrap();
        file.truncate(0).unwrap();
        assert_eq!(quota.used("alice"), 0);
    }

    #[test]
    fn test_fsync_counts_dirty_bytes() {
        let fx = fixture();
        let file = open(&fx, 5, Arc::new(Unlimited));
        file.write(0, &[1u8; 100]).unwrap();
        file.write(64 * KB, &[1u8; 50]).unwrap();
        assert_eq!(file.fsync(0, 128 * KB).unwrap(), 150);
        assert_eq!(file.fsync(0, 128 * KB).unwrap(), 0);
    }

    #[test]
    fn test_fault_returns_page() {
        let fx = fixture();
        let file = open(&fx, 6, Arc::new(Unlimited));
        file.write(PAGE_SIZE, &[5u8; 10]).unwrap();
        let page = file.fault(1, false).unwrap();
        assert_eq!(page.len(), PAGE_SIZE as usize);
        assert_eq!(&page[..10], &[5u8; 10]);
        assert_eq!(page[10], 0);
    }

    #[test]
    fn test_writeback_pages() {
        let fx = fixture();
        let file = open(&fx, 7, Arc::new(Unlimited));
        let per_stripe = 64 * KB / PAGE_SIZE;
        let pages: PageList = [0, per_stripe, 2 * per_stripe]
            .into_iter()
            .map(|i| Page::new(i, Bytes::from(vec![3u8; PAGE_SIZE as usize])))
            .collect();

        let queue = file.writeback(pages, AllocStrategy::Reserved).unwrap();
        assert_eq!(queue.qout.len(), 3);
        assert!(queue.qin.is_empty());
        for target in 0..3 {
            assert_eq!(fx.targets.target(target).unwrap().size(7), PAGE_SIZE);
        }
        assert_eq!(file.size(), 2 * 64 * KB + PAGE_SIZE);
    }
}
