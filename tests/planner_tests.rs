//! Property tests for the scratch arena planner.

use proptest::prelude::*;

use tileforge::tensor::align_up;
use tileforge::{ArenaPlanner, MEM_ALIGNMENT};

fn lifetimes_overlap(a: (usize, usize), b: (usize, usize)) -> bool {
    a.0 <= b.1 && b.0 <= a.1
}

/// (byte_size, first_op, duration) triples; id is the index.
fn requests() -> impl Strategy<Value = Vec<(usize, usize, usize)>> {
    prop::collection::vec((1usize..2048, 0usize..12, 0usize..6), 1..16)
}

fn build_planner(reqs: &[(usize, usize, usize)]) -> ArenaPlanner {
    let mut planner = ArenaPlanner::new();
    for (id, &(size, first, duration)) in reqs.iter().enumerate() {
        planner.register(id, size, first, first + duration).unwrap();
    }
    planner
}

proptest! {
    #[test]
    fn concurrently_live_ranges_never_alias(reqs in requests()) {
        let plan = build_planner(&reqs).plan();
        for (i, &(size_i, first_i, dur_i)) in reqs.iter().enumerate() {
            for (j, &(size_j, first_j, dur_j)) in reqs.iter().enumerate().skip(i + 1) {
                if !lifetimes_overlap((first_i, first_i + dur_i), (first_j, first_j + dur_j)) {
                    continue;
                }
                let a = plan.offset(i).unwrap();
                let b = plan.offset(j).unwrap();
                prop_assert!(
                    a + align_up(size_i) <= b || b + align_up(size_j) <= a,
                    "ids {} and {} alias: offsets {} and {}",
                    i, j, a, b
                );
            }
        }
    }

    #[test]
    fn planning_is_deterministic(reqs in requests()) {
        let planner = build_planner(&reqs);
        let a = planner.plan();
        let b = planner.plan();
        prop_assert_eq!(a.total_byte_size(), b.total_byte_size());
        for id in 0..reqs.len() {
            prop_assert_eq!(a.offset(id), b.offset(id));
        }
    }

    #[test]
    fn total_size_is_bounded_and_aligned(reqs in requests()) {
        let plan = build_planner(&reqs).plan();
        let total = plan.total_byte_size();

        let aligned_sum: usize = reqs.iter().map(|&(s, _, _)| align_up(s)).sum();
        let aligned_max = reqs.iter().map(|&(s, _, _)| align_up(s)).max().unwrap_or(0);
        prop_assert!(total <= aligned_sum);
        prop_assert!(total >= aligned_max);
        prop_assert_eq!(total % MEM_ALIGNMENT, 0);

        for (id, &(size, _, _)) in reqs.iter().enumerate() {
            let offset = plan.offset(id).unwrap();
            prop_assert_eq!(offset % MEM_ALIGNMENT, 0);
            prop_assert!(offset + align_up(size) <= total);
        }
    }
}
