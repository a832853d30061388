//! Algebra over closed `[lo, hi]` block ranges.
//!
//! The difference between a requested window and the already-cached intervals
//! is what makes historical sync incremental: every block range is fetched
//! from the RPC at most once.

/// A closed block range `[lo, hi]`, both ends inclusive.
pub type BlockRange = (u64, u64);

/// Merge a list of ranges into their minimal disjoint union, sorted ascending.
///
/// Adjacent ranges (`hi + 1 == next lo`) are merged as well.
pub fn union(ranges: &[BlockRange]) -> Vec<BlockRange> {
    let mut sorted: Vec<BlockRange> = ranges.to_vec();
    sorted.sort_unstable();

    let mut merged: Vec<BlockRange> = Vec::with_capacity(sorted.len());
    for (lo, hi) in sorted {
        match merged.last_mut() {
            Some((_, prev_hi)) if *prev_hi >= lo.saturating_sub(1) => {
                *prev_hi = (*prev_hi).max(hi);
            }
            _ => merged.push((lo, hi)),
        }
    }
    merged
}

/// Subtract `ys` from `xs`, returning the minimal disjoint remainder.
pub fn difference(xs: &[BlockRange], ys: &[BlockRange]) -> Vec<BlockRange> {
    let xs = union(xs);
    let ys = union(ys);

    let mut out = Vec::new();
    for (lo, hi) in xs {
        let mut cursor = lo;
        for &(y_lo, y_hi) in &ys {
            if y_hi < cursor {
                continue;
            }
            if y_lo > hi {
                break;
            }
            if y_lo > cursor {
                out.push((cursor, y_lo - 1));
            }
            cursor = y_hi.saturating_add(1);
            if cursor > hi {
                break;
            }
        }
        if cursor <= hi {
            out.push((cursor, hi));
        }
    }
    out
}

/// Total number of blocks covered by `ranges` (assumed disjoint).
pub fn total_blocks(ranges: &[BlockRange]) -> u64 {
    ranges.iter().map(|(lo, hi)| hi - lo + 1).sum()
}

/// Intersect two ranges. Returns `None` when they do not overlap.
pub fn intersect(a: BlockRange, b: BlockRange) -> Option<BlockRange> {
    let lo = a.0.max(b.0);
    let hi = a.1.min(b.1);
    (lo <= hi).then_some((lo, hi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_merges_overlap_and_adjacency() {
        assert_eq!(union(&[(3, 7), (0, 2), (9, 10)]), vec![(0, 7), (9, 10)]);
        assert_eq!(union(&[(0, 5), (2, 3)]), vec![(0, 5)]);
        assert_eq!(union(&[]), vec![]);
    }

    #[test]
    fn union_idempotent() {
        let xs = vec![(0, 4), (6, 6), (2, 8), (20, 25)];
        let once = union(&xs);
        assert_eq!(union(&once), once);
    }

    #[test]
    fn union_associative_over_concat() {
        let xs = vec![(0u64, 3u64), (10, 12)];
        let ys = vec![(2u64, 5u64), (13, 13)];
        let concat: Vec<_> = xs.iter().chain(ys.iter()).copied().collect();
        let pre_merged: Vec<_> = union(&xs).into_iter().chain(union(&ys)).collect();
        assert_eq!(union(&concat), union(&pre_merged));
    }

    #[test]
    fn difference_splits_ranges() {
        assert_eq!(difference(&[(0, 10)], &[(3, 5)]), vec![(0, 2), (6, 10)]);
        assert_eq!(difference(&[(0, 10)], &[(0, 10)]), vec![]);
        assert_eq!(difference(&[(0, 10)], &[]), vec![(0, 10)]);
        assert_eq!(difference(&[(5, 8)], &[(0, 5), (8, 12)]), vec![(6, 7)]);
    }

    #[test]
    fn difference_is_disjoint_from_subtrahend() {
        let xs = vec![(0u64, 20u64)];
        let ys = vec![(1u64, 2u64), (4, 4), (7, 15)];
        let diff = difference(&xs, &ys);
        for &(lo, hi) in &diff {
            for &(y_lo, y_hi) in &ys {
                assert!(hi < y_lo || lo > y_hi, "{diff:?} overlaps {ys:?}");
            }
        }
        assert_eq!(total_blocks(&diff) + total_blocks(&ys), total_blocks(&xs));
    }

    #[test]
    fn total_blocks_counts_inclusive() {
        assert_eq!(total_blocks(&[(0, 0)]), 1);
        assert_eq!(total_blocks(&[(0, 4), (10, 11)]), 7);
    }

    #[test]
    fn intersect_clamps() {
        assert_eq!(intersect((0, 10), (5, 20)), Some((5, 10)));
        assert_eq!(intersect((0, 4), (5, 20)), None);
        assert_eq!(intersect((3, 3), (3, 3)), Some((3, 3)));
    }
}
