//! Round-robin striping arithmetic.
//!
//! A logical object is cut into `stripe_size` units laid out round-robin
//! over `stripe_count` targets:
//!
//! ```text
//! logical:  | s0 u0 | s1 u0 | s2 u0 | s0 u1 | s1 u1 | s2 u1 | ...
//! stripe 0: | u0 | u1 | ...
//! ```

use crate::error::{Error, Result};

/// Offset meaning "to the end of the object".
pub const EOF: u64 = u64::MAX;

/// Identity of a storage target.
pub type TargetIndex = u32;

/// Which side of a stripe's footprint a logical offset fell on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Before,
    Inside,
    After,
}

/// Striping pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StripePattern {
    #[default]
    Raid0,
}

/// Immutable per-object striping metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeLayout {
    stripe_size: u64,
    pattern: StripePattern,
    targets: Vec<TargetIndex>,
}

impl StripeLayout {
    /// Create a layout over `targets` (one per stripe, in stripe order).
    pub fn new(stripe_size: u64, targets: Vec<TargetIndex>) -> Result<Self> {
        if stripe_size == 0 || stripe_size % super::PAGE_SIZE != 0 {
            return Err(Error::Config(format!(
                "stripe size {} is not a positive multiple of {}",
                stripe_size,
                super::PAGE_SIZE
            )));
        }
        Ok(Self {
            stripe_size,
            pattern: StripePattern::Raid0,
            targets,
        })
    }

    /// A layout with no stripes (object without data).
    pub fn empty() -> Self {
        Self {
            stripe_size: super::PAGE_SIZE,
            pattern: StripePattern::Raid0,
            targets: Vec::new(),
        }
    }

    pub fn stripe_size(&self) -> u64 {
        self.stripe_size
    }

    pub fn stripe_count(&self) -> usize {
        self.targets.len()
    }

    pub fn pattern(&self) -> StripePattern {
        self.pattern
    }

    pub fn target(&self, stripe: usize) -> Option<TargetIndex> {
        self.targets.get(stripe).copied()
    }

    fn stripe_width(&self) -> u64 {
        self.stripe_size * self.targets.len() as u64
    }

    fn offset_with_side(&self, logical: u64, stripe: usize) -> (u64, Side) {
        if logical == EOF {
            return (EOF, Side::Inside);
        }
        let swidth = self.stripe_width();
        let unit = logical / swidth;
        let mut within = logical % swidth;
        let this_stripe = stripe as u64 * self.stripe_size;

        let side = if within < this_stripe {
            within = 0;
            Side::Before
        } else {
            within -= this_stripe;
            if within >= self.stripe_size {
                within = self.stripe_size;
                Side::After
            } else {
                Side::Inside
            }
        };
        (unit * self.stripe_size + within, side)
    }

    /// Stripe-local offset of `logical`, clamped to the stripe's footprint.
    pub fn stripe_offset(&self, logical: u64, stripe: usize) -> u64 {
        self.offset_with_side(logical, stripe).0
    }

    /// Size of `stripe`'s object when the logical object is `file_size` long.
    pub fn size_to_stripe(&self, file_size: u64, stripe: usize) -> u64 {
        if file_size == EOF {
            return EOF;
        }
        let swidth = self.stripe_width();
        let mut units = file_size / swidth;
        let within = file_size % swidth;
        let this_stripe = stripe as u64 * self.stripe_size;

        let local = if within < this_stripe {
            if units > 0 {
                units -= 1;
                self.stripe_size
            } else {
                0
            }
        } else {
            (within - this_stripe).min(self.stripe_size)
        };
        units * self.stripe_size + local
    }

    /// Stripe-local inclusive range of `[start, end]` on `stripe`, if any.
    pub fn stripe_intersects(&self, stripe: usize, start: u64, end: u64) -> Option<(u64, u64)> {
        let (local_start, start_side) = self.offset_with_side(start, stripe);
        let (mut local_end, end_side) = self.offset_with_side(end, stripe);

        if start_side != Side::Inside && end_side != Side::Inside && local_start == local_end {
            return None;
        }
        // an end clamped from outside the footprint points one past it
        if end_side != Side::Inside {
            local_end -= 1;
        }
        Some((local_start, local_end))
    }

    /// Logical offset of stripe-local offset `local` on `stripe`.
    pub fn logical_offset(&self, local: u64, stripe: usize) -> u64 {
        if local == EOF {
            return EOF;
        }
        let unit = local / self.stripe_size;
        unit * self.stripe_width() + stripe as u64 * self.stripe_size + local % self.stripe_size
    }

    /// Logical object size implied by `stripe`'s object being `local_size` long.
    pub fn stripe_size_to_logical(&self, local_size: u64, stripe: usize) -> u64 {
        if local_size == 0 {
            return 0;
        }
        let units = local_size / self.stripe_size;
        let frag = local_size % self.stripe_size;
        let swidth = self.stripe_width();
        if frag != 0 {
            units * swidth + stripe as u64 * self.stripe_size + frag
        } else {
            (units - 1) * swidth + (stripe as u64 + 1) * self.stripe_size
        }
    }

    /// Stripe holding logical offset `logical`.
    pub fn stripe_of(&self, logical: u64) -> usize {
        if self.targets.is_empty() {
            return 0;
        }
        ((logical / self.stripe_size) % self.targets.len() as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;
    const KB: u64 = 1024;

    fn three_wide() -> StripeLayout {
        StripeLayout::new(MB, vec![10, 11, 12]).unwrap()
    }

    #[test]
    fn test_new_rejects_bad_stripe_size() {
        assert!(StripeLayout::new(0, vec![1]).is_err());
        assert!(StripeLayout::new(1000, vec![1]).is_err());
    }

    #[test]
    fn test_stripe_offset() {
        let layout = three_wide();
        assert_eq!(layout.stripe_offset(900 * KB, 0), 900 * KB);
        assert_eq!(layout.stripe_offset(MB + 5, 1), 5);
        // second unit of stripe 0
        assert_eq!(layout.stripe_offset(3 * MB + 7, 0), MB + 7);
        // before the footprint clamps to the unit start
        assert_eq!(layout.stripe_offset(10, 2), 0);
        assert_eq!(layout.stripe_offset(EOF, 1), EOF);
    }

    #[test]
    fn test_intersects_spanning_write() {
        let layout = three_wide();
        let (start, end) = (900 * KB, 1300 * KB - 1);
        assert_eq!(
            layout.stripe_intersects(0, start, end),
            Some((900 * KB, MB - 1))
        );
        assert_eq!(
            layout.stripe_intersects(1, start, end),
            Some((0, 1300 * KB - MB - 1))
        );
        assert_eq!(layout.stripe_intersects(2, start, end), None);
    }

    #[test]
    fn test_intersects_whole_object() {
        let layout = three_wide();
        for stripe in 0..3 {
            assert_eq!(layout.stripe_intersects(stripe, 0, EOF), Some((0, EOF)));
        }
    }

    #[test]
    fn test_size_to_stripe() {
        let layout = three_wide();
        // 2.5 MB: stripe 0 full unit, stripe 1 half, stripe 2 empty
        let size = 2 * MB + 512 * KB;
        assert_eq!(layout.size_to_stripe(size, 0), MB);
        assert_eq!(layout.size_to_stripe(size, 1), MB);
        assert_eq!(layout.size_to_stripe(size, 2), 512 * KB);
        assert_eq!(layout.size_to_stripe(512 * KB, 2), 0);
        // 3.5 MB: stripe 2 ends its first unit
        assert_eq!(layout.size_to_stripe(3 * MB + 512 * KB, 2), MB);
        assert_eq!(layout.size_to_stripe(3 * MB + 512 * KB, 0), MB + 512 * KB);
    }

    #[test]
    fn test_stripe_size_to_logical() {
        let layout = three_wide();
        assert_eq!(layout.stripe_size_to_logical(0, 1), 0);
        assert_eq!(layout.stripe_size_to_logical(100, 1), MB + 100);
        assert_eq!(layout.stripe_size_to_logical(MB, 1), 2 * MB);
        assert_eq!(layout.stripe_size_to_logical(MB + 1, 0), 3 * MB + 1);
    }

    #[test]
    fn test_logical_offset_inverts_stripe_offset() {
        let layout = three_wide();
        for logical in [0, 5, MB - 1, MB, 2 * MB + 3, 7 * MB + 11] {
            let stripe = layout.stripe_of(logical);
            let local = layout.stripe_offset(logical, stripe);
            assert_eq!(layout.logical_offset(local, stripe), logical);
        }
    }

    #[test]
    fn test_single_stripe_is_identity() {
        let layout = StripeLayout::new(MB, vec![4]).unwrap();
        assert_eq!(layout.stripe_offset(5 * MB + 3, 0), 5 * MB + 3);
        assert_eq!(layout.size_to_stripe(5 * MB + 3, 0), 5 * MB + 3);
    }
}
