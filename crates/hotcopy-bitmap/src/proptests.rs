use crate::ClusterBitmap;
use proptest::prelude::*;

const MAX_CLUSTERS: u64 = 300;

#[derive(Debug, Clone)]
enum Op {
    Set { offset: u64, bytes: u64 },
    Reset { offset: u64, bytes: u64 },
}

fn granularity_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![Just(512u64), Just(4096u64), Just(65536u64)]
}

fn op_strategy(len: u64) -> impl Strategy<Value = Op> {
    let range = (0..=len, 0..=len / 4 + 1);
    prop_oneof![
        range
            .clone()
            .prop_map(|(offset, bytes)| Op::Set { offset, bytes }),
        range.prop_map(|(offset, bytes)| Op::Reset { offset, bytes }),
    ]
}

fn case_strategy() -> impl Strategy<Value = (u64, u64, Vec<Op>)> {
    (granularity_strategy(), 1..=MAX_CLUSTERS, 0u64..512).prop_flat_map(
        |(granularity, clusters, tail)| {
            let len = (clusters * granularity).saturating_sub(tail).max(1);
            (
                Just(len),
                Just(granularity),
                proptest::collection::vec(op_strategy(len), 0..32),
            )
        },
    )
}

/// Straightforward per-cluster model of the same semantics.
fn apply_model(model: &mut [bool], len: u64, granularity: u64, op: &Op) {
    let (offset, bytes, set) = match *op {
        Op::Set { offset, bytes } => (offset, bytes, true),
        Op::Reset { offset, bytes } => (offset, bytes, false),
    };
    if bytes == 0 || offset >= len {
        return;
    }
    let end = offset.saturating_add(bytes).min(len);
    for (idx, bit) in model.iter_mut().enumerate() {
        let c_start = idx as u64 * granularity;
        let c_end = (c_start + granularity).min(len);
        let touched = c_start < end && offset < c_end;
        let covered = offset <= c_start && c_end <= end;
        if set && touched {
            *bit = true;
        }
        if !set && covered {
            *bit = false;
        }
    }
}

proptest! {
    #[test]
    fn bitmap_matches_cluster_model((len, granularity, ops) in case_strategy()) {
        let mut bitmap = ClusterBitmap::new(len, granularity).unwrap();
        let mut model = vec![false; bitmap.cluster_count() as usize];

        for op in &ops {
            match *op {
                Op::Set { offset, bytes } => bitmap.set_range(offset, bytes),
                Op::Reset { offset, bytes } => bitmap.reset_range(offset, bytes),
            };
            apply_model(&mut model, len, granularity, op);
        }

        let expected: Vec<u64> = model
            .iter()
            .enumerate()
            .filter(|(_, dirty)| **dirty)
            .map(|(idx, _)| idx as u64 * granularity)
            .collect();
        let actual: Vec<u64> = bitmap.iter_dirty().collect();
        prop_assert_eq!(&actual, &expected);
        prop_assert_eq!(bitmap.dirty_clusters(), expected.len() as u64);

        let range_bytes: u64 = bitmap.dirty_ranges().map(|r| r.len()).sum();
        prop_assert_eq!(range_bytes, bitmap.dirty_count());
    }
}
