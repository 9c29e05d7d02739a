//! Property-Based Tests for Stripe Layout Arithmetic
//!
//! # Test Properties
//!
//! 1. **Offset Inverse**: a byte maps to its stripe and back unchanged
//! 2. **Partition**: per-stripe intersections of a range cover it exactly
//! 3. **Containment**: intersection bounds map back inside the range
//! 4. **Size Merge**: the largest implied size over all stripes is the file size

#![cfg(test)]

use proptest::prelude::*;

use super::layout::StripeLayout;
use super::PAGE_SIZE;

// =============================================================================
// Property Strategies
// =============================================================================

/// 1-16 pages per stripe unit over 1-8 targets.
fn layout_strategy() -> impl Strategy<Value = StripeLayout> {
    (1u64..=16, 1u32..=8).prop_map(|(pages, count)| {
        StripeLayout::new(pages * PAGE_SIZE, (0..count).collect()).unwrap()
    })
}

/// Inclusive byte range `[start, end]`.
fn range_strategy() -> impl Strategy<Value = (u64, u64)> {
    (0u64..4_000_000, 0u64..1_000_000).prop_map(|(start, len)| (start, start + len))
}

// =============================================================================
// Offset Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: logical → (stripe, local) → logical is the identity.
    #[test]
    fn prop_offset_inverse(layout in layout_strategy(), logical in 0u64..100_000_000) {
        let stripe = layout.stripe_of(logical);
        let local = layout.stripe_offset(logical, stripe);
        prop_assert_eq!(layout.logical_offset(local, stripe), logical);
    }

    /// Property: bytes of other stripes clamp onto a chunk boundary.
    #[test]
    fn prop_foreign_offsets_clamp(layout in layout_strategy(), logical in 0u64..100_000_000) {
        let owner = layout.stripe_of(logical);
        for stripe in (0..layout.stripe_count()).filter(|s| *s != owner) {
            let local = layout.stripe_offset(logical, stripe);
            prop_assert_eq!(local % layout.stripe_size(), 0);
        }
    }
}

// =============================================================================
// Intersection Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: the stripes' shares of a range add up to the range.
    #[test]
    fn prop_intersections_partition_range(
        layout in layout_strategy(),
        (start, end) in range_strategy(),
    ) {
        let covered: u64 = (0..layout.stripe_count())
            .filter_map(|stripe| layout.stripe_intersects(stripe, start, end))
            .map(|(lo, hi)| hi - lo + 1)
            .sum();
        prop_assert_eq!(covered, end - start + 1);
    }

    /// Property: both ends of an intersection lie inside the logical range.
    #[test]
    fn prop_intersection_within_range(
        layout in layout_strategy(),
        (start, end) in range_strategy(),
    ) {
        for stripe in 0..layout.stripe_count() {
            if let Some((lo, hi)) = layout.stripe_intersects(stripe, start, end) {
                prop_assert!(lo <= hi);
                let first = layout.logical_offset(lo, stripe);
                let last = layout.logical_offset(hi, stripe);
                prop_assert!(first >= start && first <= end, "first {} outside [{}, {}]", first, start, end);
                prop_assert!(last >= start && last <= end, "last {} outside [{}, {}]", last, start, end);
            }
        }
    }

    /// Property: a range inside one chunk touches exactly one stripe.
    #[test]
    fn prop_single_chunk_single_stripe(layout in layout_strategy(), chunk in 0u64..1000, a in 0u64..PAGE_SIZE, b in 0u64..PAGE_SIZE) {
        let base = chunk * layout.stripe_size();
        let (start, end) = (base + a.min(b), base + a.max(b));
        let touched: Vec<usize> = (0..layout.stripe_count())
            .filter(|s| layout.stripe_intersects(*s, start, end).is_some())
            .collect();
        prop_assert_eq!(touched, vec![layout.stripe_of(start)]);
    }
}

// =============================================================================
// Size Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: merging per-stripe sizes with max recovers the file size.
    #[test]
    fn prop_size_merge(layout in layout_strategy(), size in 1u64..100_000_000) {
        let merged = (0..layout.stripe_count())
            .map(|stripe| layout.stripe_size_to_logical(layout.size_to_stripe(size, stripe), stripe))
            .max()
            .unwrap_or(0);
        prop_assert_eq!(merged, size);
    }

    /// Property: per-stripe sizes add up to the file size.
    #[test]
    fn prop_stripe_sizes_sum(layout in layout_strategy(), size in 0u64..100_000_000) {
        let total: u64 = (0..layout.stripe_count())
            .map(|stripe| layout.size_to_stripe(size, stripe))
            .sum();
        prop_assert_eq!(total, size);
    }
}
