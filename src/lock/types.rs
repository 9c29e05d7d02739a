//! Range-lock value types.

use std::fmt;

use crate::stripe::layout::{TargetIndex, EOF};

/// Lock modes, weakest first.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    /// No lock
    NL,
    /// Concurrent read
    CR,
    /// Concurrent write
    CW,
    /// Protected read
    PR,
    /// Protected write
    PW,
    /// Exclusive
    EX,
}

impl LockMode {
    /// Whether a holder in `self` can coexist with a holder in `other`.
    pub fn compatible(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (NL, _) | (_, NL) => true,
            (EX, _) | (_, EX) => false,
            (CR, _) | (_, CR) => true,
            (PR, PR) | (CW, CW) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Inclusive byte extent in stripe-local coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub start: u64,
    pub end: u64,
}

impl Extent {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// `[0, EOF]`
    pub fn whole() -> Self {
        Self { start: 0, end: EOF }
    }

    pub fn is_whole(&self) -> bool {
        self.start == 0 && self.end == EOF
    }

    pub fn overlaps(&self, other: &Extent) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.end == EOF {
            write!(f, "[{}, EOF]", self.start)
        } else {
            write!(f, "[{}, {}]", self.start, self.end)
        }
    }
}

/// Lockable resource: one stripe object on one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub target: TargetIndex,
    pub object: u64,
}

/// Handle to a granted lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockHandle {
    pub cookie: u64,
    pub resource: ResourceId,
}

/// Lock value block: the holder's view of a stripe's attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lvb {
    pub size: u64,
    pub mtime: u64,
    pub blocks: u64,
}

/// State of a lock as seen by its callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockDesc {
    pub handle: LockHandle,
    pub req_mode: LockMode,
    /// `None` until the lock is granted.
    pub granted_mode: Option<LockMode>,
    pub extent: Extent,
    pub lvb: Lvb,
}

impl LockDesc {
    /// Granted in exactly the mode it was requested in.
    pub fn granted_as_requested(&self) -> bool {
        self.granted_mode == Some(self.req_mode)
    }
}

/// Highest known minimum size the `granted` locks still vouch for.
pub fn kms_limit<'a>(granted: impl IntoIterator<Item = &'a LockDesc>) -> u64 {
    granted
        .into_iter()
        .filter(|desc| desc.granted_mode.is_some())
        .map(|desc| desc.extent.end.saturating_add(1))
        .max()
        .unwrap_or(0)
}

/// A range-lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub resource: ResourceId,
    pub mode: LockMode,
    pub extent: Extent,
    /// Only learn the attributes; do not keep a lock when it conflicts.
    pub glimpse: bool,
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    /// `None` when a glimpse was answered by the current holders.
    pub handle: Option<LockHandle>,
    pub lvb: Lvb,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        assert!(PR.compatible(PR));
        assert!(!PR.compatible(PW));
        assert!(!PW.compatible(PW));
        assert!(PW.compatible(CR));
        assert!(CW.compatible(CW));
        assert!(!CW.compatible(PR));
        assert!(!EX.compatible(CR));
        assert!(EX.compatible(NL));
        for a in [NL, CR, CW, PR, PW, EX] {
            for b in [NL, CR, CW, PR, PW, EX] {
                assert_eq!(a.compatible(b), b.compatible(a));
            }
        }
    }

    #[test]
    fn test_extent_overlap() {
        let a = Extent::new(0, 99);
        assert!(a.overlaps(&Extent::new(99, 200)));
        assert!(!a.overlaps(&Extent::new(100, 200)));
        assert!(Extent::whole().overlaps(&a));
        assert!(Extent::whole().is_whole());
        assert_eq!(Extent::new(7, EOF).to_string(), "[7, EOF]");
    }

    #[test]
    fn test_granted_as_requested() {
        let handle = LockHandle {
            cookie: 1,
            resource: ResourceId {
                target: 0,
                object: 1,
            },
        };
        let mut desc = LockDesc {
            handle,
            req_mode: LockMode::PW,
            granted_mode: None,
            extent: Extent::whole(),
            lvb: Lvb::default(),
        };
        assert!(!desc.granted_as_requested());
        desc.granted_mode = Some(LockMode::PR);
        assert!(!desc.granted_as_requested());
        desc.granted_mode = Some(LockMode::PW);
        assert!(desc.granted_as_requested());
    }

    #[test]
    fn test_kms_limit() {
        let resource = ResourceId {
            target: 0,
            object: 1,
        };
        let desc = |cookie, extent, granted_mode| LockDesc {
            handle: LockHandle { cookie, resource },
            req_mode: LockMode::PR,
            granted_mode,
            extent,
            lvb: Lvb::default(),
        };
        assert_eq!(kms_limit([]), 0);

        let locks = [
            desc(1, Extent::new(0, 99), Some(LockMode::PR)),
            desc(2, Extent::new(100, 4095), Some(LockMode::PR)),
            // still waiting, vouches for nothing
            desc(3, Extent::new(0, 9999), None),
        ];
        assert_eq!(kms_limit(&locks), 4096);
        assert_eq!(kms_limit(&locks[..1]), 100);
        assert_eq!(kms_limit([&desc(4, Extent::whole(), Some(LockMode::PW))]), EOF);
    }
}
