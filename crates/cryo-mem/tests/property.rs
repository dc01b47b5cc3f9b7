#![cfg(not(target_arch = "wasm32"))]

use std::collections::BTreeSet;

use cryo_mem::{PageBitmap, PFN_END};
use proptest::prelude::*;

const PFN_SPACE: u64 = 1 << 20;

#[derive(Clone, Debug)]
enum Op {
    Set(u64),
    Clear(u64),
    Test(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    // Bias towards block boundaries so lazy allocation edges get exercised.
    let pfn = prop_oneof![
        4 => 0u64..PFN_SPACE,
        1 => (0u64..32).prop_map(|b| b * 32768),
        1 => (1u64..32).prop_map(|b| b * 32768 - 1),
    ];
    prop_oneof![
        3 => pfn.clone().prop_map(Op::Set),
        2 => pfn.clone().prop_map(Op::Clear),
        2 => pfn.prop_map(Op::Test),
    ]
}

proptest! {
    #[test]
    fn bitmap_agrees_with_reference_set(
        ops in prop::collection::vec(op_strategy(), 1..=512)
    ) {
        let mut map = PageBitmap::new();
        let mut model: BTreeSet<u64> = BTreeSet::new();

        for op in ops {
            match op {
                Op::Set(pfn) => {
                    map.set(pfn);
                    model.insert(pfn);
                }
                Op::Clear(pfn) => {
                    map.clear(pfn);
                    model.remove(&pfn);
                }
                Op::Test(pfn) => {
                    prop_assert_eq!(map.test(pfn), model.contains(&pfn));
                }
            }
        }

        prop_assert_eq!(map.count(), model.len() as u64);

        // Full iteration must agree with the model, in order.
        map.seek(0);
        for &expected in &model {
            prop_assert_eq!(map.next_pfn(), expected);
        }
        prop_assert_eq!(map.next_pfn(), PFN_END);
    }

    #[test]
    fn next_pfn_is_monotone_between_resets(
        members in prop::collection::btree_set(0u64..PFN_SPACE, 0..=256),
        seeks in prop::collection::vec(0u64..PFN_SPACE, 1..=8)
    ) {
        let mut map = PageBitmap::new();
        for &pfn in &members {
            map.set(pfn);
        }

        for seek in seeks {
            map.seek(seek);
            let mut last: Option<u64> = None;
            let mut seen = 0usize;
            loop {
                let pfn = map.next_pfn();
                if pfn == PFN_END {
                    break;
                }
                prop_assert!(pfn >= seek);
                if let Some(prev) = last {
                    prop_assert!(pfn > prev);
                }
                prop_assert!(members.contains(&pfn));
                last = Some(pfn);
                seen += 1;
            }
            // Every member at or above the seek point must have been seen.
            prop_assert_eq!(seen, members.range(seek..).count());
        }
    }

    #[test]
    fn dup_is_deep(
        members in prop::collection::btree_set(0u64..PFN_SPACE, 0..=128)
    ) {
        let mut a = PageBitmap::new();
        for &pfn in &members {
            a.set(pfn);
        }
        let mut b = PageBitmap::dup(&a);
        for &pfn in &members {
            b.clear(pfn);
        }
        prop_assert_eq!(b.count(), 0);
        prop_assert_eq!(a.count(), members.len() as u64);
    }
}
