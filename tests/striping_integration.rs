//! Striped I/O Integration Tests
//!
//! End-to-end reads and writes through `StripedFile` and the coordinator
//! against in-memory targets with real extent locking.

use std::sync::Arc;

use assert_matches::assert_matches;
use bytes::Bytes;

use stripenet::adapters::{LocalLockService, MemorySubIoFactory, MemoryTargets};
use stripenet::quota::Unlimited;
use stripenet::stripe::IoSummary;
use stripenet::{
    io_loop, Error, ExtentLockAdapter, LogicalIoRequest, StripeDevice, StripeLayout, StripedFile,
    StripedObject,
};

const KB: u64 = 1024;
const STRIPE: u64 = 64 * KB;

struct Cluster {
    targets: Arc<MemoryTargets>,
    lock_service: Arc<LocalLockService>,
    locks: Arc<ExtentLockAdapter>,
    device: Arc<StripeDevice>,
}

impl Cluster {
    fn new(targets: u32) -> Self {
        let targets = Arc::new(MemoryTargets::new(targets));
        let lock_service = Arc::new(LocalLockService::new(targets.clone()));
        let locks = Arc::new(ExtentLockAdapter::new(lock_service.clone(), false));
        let factory = Arc::new(MemorySubIoFactory::new(targets.clone(), locks.clone()));
        let device = StripeDevice::new(factory, 8).unwrap();
        Self {
            targets,
            lock_service,
            locks,
            device,
        }
    }

    fn object(&self, id: u64, targets: Vec<u32>) -> Arc<StripedObject> {
        StripedObject::new(id, StripeLayout::new(STRIPE, targets).unwrap())
    }

    fn open(&self, object: Arc<StripedObject>) -> StripedFile {
        StripedFile::new(
            self.device.clone(),
            object,
            self.locks.clone(),
            Arc::new(Unlimited),
            "tester",
        )
    }
}

fn pattern(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

// =============================================================================
// Data Placement
// =============================================================================

#[test]
fn test_write_lands_round_robin() {
    let cluster = Cluster::new(4);
    // stripes on targets 2, 0, 3
    let file = cluster.open(cluster.object(1, vec![2, 0, 3]));
    let data = pattern(4 * STRIPE);
    file.write(0, &data).unwrap();

    // stripe 0 holds units 0 and 3, stripes 1 and 2 one unit each
    let on = |target: u32| cluster.targets.target(target).unwrap();
    assert_eq!(on(2).size(1), 2 * STRIPE);
    assert_eq!(on(0).size(1), STRIPE);
    assert_eq!(on(3).size(1), STRIPE);
    assert_eq!(on(1).size(1), 0);

    let unit = |n: u64| &data[(n * STRIPE) as usize..((n + 1) * STRIPE) as usize];
    assert_eq!(on(0).read(1, 0, STRIPE).unwrap(), unit(1));
    assert_eq!(on(2).read(1, STRIPE, STRIPE).unwrap(), unit(3));

    assert_eq!(file.read(0, 4 * STRIPE).unwrap(), Bytes::from(data));
    assert_eq!(cluster.lock_service.held_count(), 0);
}

#[test]
fn test_unaligned_write_spanning_stripes() {
    let cluster = Cluster::new(3);
    let file = cluster.open(cluster.object(2, vec![0, 1, 2]));
    let data = pattern(STRIPE + 100);
    let pos = STRIPE - 50;

    assert_eq!(file.write(pos, &data).unwrap(), data.len() as u64);
    assert_eq!(file.size(), pos + data.len() as u64);
    assert_eq!(file.read(pos, data.len() as u64).unwrap(), Bytes::from(data));
    assert_eq!(file.stat().unwrap().size, pos + STRIPE + 100);
}

#[test]
fn test_single_stripe_request_uses_one_sub_context() {
    let cluster = Cluster::new(3);
    let object = cluster.object(3, vec![0, 1, 2]);
    let summary: IoSummary = io_loop(
        &cluster.device,
        &object,
        LogicalIoRequest::write(STRIPE + 10, 100, None),
    )
    .unwrap();
    assert_eq!(summary.transferred, 100);
    assert_eq!(summary.sub_contexts_created, 1);
    assert_eq!(cluster.targets.target(1).unwrap().size(3), 110);
}

// =============================================================================
// Failure Handling
// =============================================================================

#[test]
fn test_offline_target_fails_and_cleans_up() {
    let cluster = Cluster::new(3);
    let object = cluster.object(4, vec![0, 1, 2]);
    let file = cluster.open(object.clone());
    file.write(0, &pattern(100)).unwrap();

    cluster.targets.target(1).unwrap().set_online(false);
    assert_matches!(
        file.write(0, &pattern(3 * STRIPE)),
        Err(Error::SubOperation { stripe: 1, .. })
    );
    assert_eq!(object.active_ios(), 0);
    assert_eq!(cluster.lock_service.held_count(), 0);

    // stripe 0 alone is still usable
    assert_eq!(file.read(0, 100).unwrap(), Bytes::from(pattern(100)));

    cluster.targets.target(1).unwrap().set_online(true);
    file.write(0, &pattern(3 * STRIPE)).unwrap();
}

#[test]
fn test_object_without_stripes() {
    let cluster = Cluster::new(1);
    let file = cluster.open(StripedObject::new(5, StripeLayout::empty()));

    assert_eq!(file.read(0, 10).unwrap(), Bytes::new());
    assert_matches!(file.write(0, b"x"), Err(Error::BadDescriptor));
    assert_matches!(file.fault(3, false), Err(Error::Fault { index: 3 }));
    assert_eq!(file.fsync(0, u64::MAX).unwrap(), 0);
}

// =============================================================================
// Attribute Merge
// =============================================================================

#[test]
fn test_two_openers_see_each_others_size() {
    let cluster = Cluster::new(2);
    let writer = cluster.open(cluster.object(6, vec![0, 1]));
    let reader = cluster.open(cluster.object(6, vec![0, 1]));

    writer.write(0, &pattern(STRIPE + 7)).unwrap();
    assert_eq!(reader.size(), 0);
    assert_eq!(reader.stat().unwrap().size, STRIPE + 7);
    assert_eq!(reader.read(STRIPE, 100).unwrap().len(), 7);

    writer.truncate(10).unwrap();
    // no stale bytes past the new end, with or without an explicit stat
    assert_eq!(reader.read(0, 100).unwrap(), Bytes::from(pattern(10)));
    assert_eq!(reader.stat().unwrap().size, 10);
    assert_eq!(reader.size(), 10);
}
