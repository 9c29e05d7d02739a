//! In-Process Extent Lock Service
//!
//! Implements the `RangeLockService` port with a per-resource table of
//! granted locks. Conflicting holders get their blocking callback and the
//! enqueue is retried once; glimpses never leave a lock behind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::domain::{LockCallbacks, LvbSource, RangeLockService};
use crate::error::{Error, Result};
use crate::lock::{kms_limit, EnqueueRequest, Grant, LockDesc, LockHandle, Lvb, ResourceId};

struct Held {
    desc: LockDesc,
    callbacks: Arc<dyn LockCallbacks>,
}

/// Extent locks held in this process.
pub struct LocalLockService {
    held: DashMap<ResourceId, Vec<Held>>,
    next_cookie: AtomicU64,
    lvbs: Arc<dyn LvbSource>,
}

impl std::fmt::Debug for LocalLockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLockService")
            .field("held", &self.held_count())
            .finish()
    }
}

impl LocalLockService {
    /// Create a service whose value blocks come from `lvbs`.
    pub fn new(lvbs: Arc<dyn LvbSource>) -> Self {
        Self {
            held: DashMap::new(),
            next_cookie: AtomicU64::new(1),
            lvbs,
        }
    }

    /// Number of locks currently granted.
    pub fn held_count(&self) -> usize {
        self.held.iter().map(|entry| entry.value().len()).sum()
    }

    /// Locks granted on one resource.
    pub fn held_on(&self, resource: ResourceId) -> Vec<LockDesc> {
        self.held
            .get(&resource)
            .map(|entry| entry.iter().map(|h| h.desc).collect())
            .unwrap_or_default()
    }

    /// Grant `request` if nothing conflicts; otherwise return the conflicting
    /// holders.
    fn try_grant(
        &self,
        request: &EnqueueRequest,
        callbacks: &Arc<dyn LockCallbacks>,
        lvb: Lvb,
    ) -> std::result::Result<Option<LockDesc>, Vec<(LockDesc, Arc<dyn LockCallbacks>)>> {
        let mut entry = self.held.entry(request.resource).or_default();
        let conflicts: Vec<_> = entry
            .iter()
            .filter(|h| {
                h.desc.extent.overlaps(&request.extent)
                    && !h
                        .desc
                        .granted_mode
                        .map_or(true, |granted| granted.compatible(request.mode))
            })
            .map(|h| (h.desc, h.callbacks.clone()))
            .collect();
        if !conflicts.is_empty() {
            return Err(conflicts);
        }
        if request.glimpse {
            return Ok(None);
        }

        let desc = LockDesc {
            handle: LockHandle {
                cookie: self.next_cookie.fetch_add(1, Ordering::Relaxed),
                resource: request.resource,
            },
            req_mode: request.mode,
            granted_mode: Some(request.mode),
            extent: request.extent,
            lvb,
        };
        entry.push(Held {
            desc,
            callbacks: callbacks.clone(),
        });
        Ok(Some(desc))
    }
}

impl RangeLockService for LocalLockService {
    fn enqueue(
        &self,
        request: EnqueueRequest,
        callbacks: Arc<dyn LockCallbacks>,
    ) -> Result<Grant> {
        let resource = request.resource;
        for attempt in 0..2 {
            let lvb = self.lvbs.lvb(resource);
            match self.try_grant(&request, &callbacks, lvb) {
                Ok(Some(desc)) => {
                    callbacks.completion(&desc);
                    trace!(cookie = desc.handle.cookie, mode = %request.mode, extent = %request.extent, "granted");
                    return Ok(Grant {
                        handle: Some(desc.handle),
                        lvb,
                    });
                }
                Ok(None) => return Ok(Grant { handle: None, lvb }),
                Err(conflicts) if request.glimpse => {
                    // Holders may know more than the target has seen yet.
                    let merged = conflicts.iter().fold(lvb, |acc, (desc, cb)| {
                        let theirs = cb.glimpse(desc);
                        Lvb {
                            size: acc.size.max(theirs.size),
                            mtime: acc.mtime.max(theirs.mtime),
                            blocks: acc.blocks.max(theirs.blocks),
                        }
                    });
                    return Ok(Grant {
                        handle: None,
                        lvb: merged,
                    });
                }
                Err(conflicts) => {
                    if attempt > 0 {
                        break;
                    }
                    debug!(
                        ost = resource.target,
                        object = resource.object,
                        holders = conflicts.len(),
                        "conflicting holders, sending blocking callbacks"
                    );
                    for (desc, cb) in &conflicts {
                        cb.blocking(desc);
                    }
                }
            }
        }
        Err(Error::Lock {
            target: resource.target,
            object: resource.object,
            reason: format!(
                "{} lock on {} still conflicts after blocking callbacks",
                request.mode, request.extent
            ),
        })
    }

    fn cancel(&self, handle: LockHandle) -> Result<()> {
        let removed = self.held.get_mut(&handle.resource).and_then(|mut entry| {
            let pos = entry.iter().position(|h| h.desc.handle == handle)?;
            let held = entry.remove(pos);
            Some((held, kms_limit(entry.iter().map(|h| &h.desc))))
        });
        self.held
            .remove_if(&handle.resource, |_, holders| holders.is_empty());

        if let Some((held, limit)) = removed {
            let mut desc = held.desc;
            desc.lvb = self.lvbs.lvb(handle.resource);
            held.callbacks.canceling(&desc, limit);
            trace!(cookie = handle.cookie, kms_limit = limit, "cancelled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{Extent, LockMode};
    use parking_lot::Mutex;

    struct FixedLvb(Lvb);

    impl LvbSource for FixedLvb {
        fn lvb(&self, _resource: ResourceId) -> Lvb {
            self.0
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<&'static str>>,
        kms_limits: Mutex<Vec<u64>>,
        service: Mutex<Option<Arc<LocalLockService>>>,
        cancel_on_block: bool,
        glimpse_size: u64,
    }

    impl LockCallbacks for Recorder {
        fn blocking(&self, desc: &LockDesc) {
            self.events.lock().push("blocking");
            if self.cancel_on_block {
                let service = self.service.lock().clone();
                if let Some(service) = service {
                    service.cancel(desc.handle).unwrap();
                }
            }
        }

        fn completion(&self, _desc: &LockDesc) {
            self.events.lock().push("completion");
        }

        fn canceling(&self, _desc: &LockDesc, kms_limit: u64) {
            self.events.lock().push("canceling");
            self.kms_limits.lock().push(kms_limit);
        }

        fn glimpse(&self, desc: &LockDesc) -> Lvb {
            self.events.lock().push("glimpse");
            Lvb {
                size: self.glimpse_size,
                ..desc.lvb
            }
        }
    }

    const RES: ResourceId = ResourceId {
        target: 1,
        object: 9,
    };

    fn service(size: u64) -> Arc<LocalLockService> {
        Arc::new(LocalLockService::new(Arc::new(FixedLvb(Lvb {
            size,
            mtime: 1,
            blocks: 1,
        }))))
    }

    fn request(mode: LockMode, extent: Extent) -> EnqueueRequest {
        EnqueueRequest {
            resource: RES,
            mode,
            extent,
            glimpse: false,
        }
    }

    #[test]
    fn test_compatible_locks_coexist() {
        let svc = service(10);
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        svc.enqueue(request(LockMode::PR, Extent::whole()), a.clone())
            .unwrap();
        let grant = svc
            .enqueue(request(LockMode::PR, Extent::new(0, 9)), b.clone())
            .unwrap();
        assert!(grant.handle.is_some());
        assert_eq!(grant.lvb.size, 10);
        assert_eq!(svc.held_count(), 2);
        assert_eq!(*a.events.lock(), vec!["completion"]);
    }

    #[test]
    fn test_conflict_fires_blocking_and_retries() {
        let svc = service(10);
        let holder = Arc::new(Recorder {
            cancel_on_block: true,
            ..Default::default()
        });
        *holder.service.lock() = Some(svc.clone());
        svc.enqueue(request(LockMode::PW, Extent::new(0, 99)), holder.clone())
            .unwrap();

        let grant = svc
            .enqueue(
                request(LockMode::PW, Extent::new(50, 60)),
                Arc::new(Recorder::default()),
            )
            .unwrap();
        assert!(grant.handle.is_some());
        assert_eq!(
            *holder.events.lock(),
            vec!["completion", "blocking", "canceling"]
        );
        assert_eq!(svc.held_on(RES).len(), 1);
    }

    #[test]
    fn test_stubborn_holder_is_lock_error() {
        let svc = service(10);
        svc.enqueue(
            request(LockMode::EX, Extent::whole()),
            Arc::new(Recorder::default()),
        )
        .unwrap();
        let err = svc
            .enqueue(
                request(LockMode::PR, Extent::new(0, 0)),
                Arc::new(Recorder::default()),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Lock { target: 1, object: 9, .. }));
    }

    #[test]
    fn test_glimpse_never_holds() {
        let svc = service(10);
        let grant = svc
            .enqueue(
                EnqueueRequest {
                    glimpse: true,
                    ..request(LockMode::PR, Extent::whole())
                },
                Arc::new(Recorder::default()),
            )
            .unwrap();
        assert_eq!(grant.handle, None);
        assert_eq!(svc.held_count(), 0);

        let writer = Arc::new(Recorder {
            glimpse_size: 500,
            ..Default::default()
        });
        svc.enqueue(request(LockMode::PW, Extent::whole()), writer.clone())
            .unwrap();
        let grant = svc
            .enqueue(
                EnqueueRequest {
                    glimpse: true,
                    ..request(LockMode::PR, Extent::whole())
                },
                Arc::new(Recorder::default()),
            )
            .unwrap();
        assert_eq!(grant.lvb.size, 500);
        assert_eq!(*writer.events.lock(), vec!["completion", "glimpse"]);
        assert_eq!(svc.held_count(), 1);
    }

    #[test]
    fn test_cancel_reports_remaining_coverage() {
        let svc = service(10);
        let wide = Arc::new(Recorder::default());
        let narrow = Arc::new(Recorder::default());
        let wide_handle = svc
            .enqueue(request(LockMode::PR, Extent::new(0, 8191)), wide.clone())
            .unwrap()
            .handle
            .unwrap();
        let narrow_handle = svc
            .enqueue(request(LockMode::PR, Extent::new(0, 99)), narrow.clone())
            .unwrap()
            .handle
            .unwrap();

        svc.cancel(wide_handle).unwrap();
        assert_eq!(*wide.kms_limits.lock(), vec![100]);
        svc.cancel(narrow_handle).unwrap();
        assert_eq!(*narrow.kms_limits.lock(), vec![0]);
    }

    #[test]
    fn test_cancel_unknown_handle_is_ok() {
        let svc = service(0);
        svc.cancel(LockHandle {
            cookie: 42,
            resource: RES,
        })
        .unwrap();
    }
}
