//! Property tests for the object identity map.

use proptest::prelude::*;
use vkr_core::{Lookup, ObjectMap};
use vkr_trace::{ObjectKind, NULL_HANDLE};

fn any_kind() -> impl Strategy<Value = ObjectKind> {
    (0..ObjectKind::COUNT).prop_map(|i| ObjectKind::ALL[i])
}

#[derive(Debug, Clone)]
enum Op {
    Add(ObjectKind, u64, u64),
    Remove(ObjectKind, u64),
}

fn any_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any_kind(), 1u64..64, 1u64..u64::MAX).prop_map(|(k, t, r)| Op::Add(k, t, r)),
        (any_kind(), 1u64..64).prop_map(|(k, t)| Op::Remove(k, t)),
    ]
}

proptest! {
    #[test]
    fn add_then_remap_returns_replay_handle(
        kind in any_kind(),
        trace in 1u64..,
        replay in 1u64..,
    ) {
        let mut map = ObjectMap::new();
        map.add(kind, trace, replay);
        prop_assert_eq!(map.remap(kind, trace), replay);
        prop_assert_eq!(map.lookup(kind, trace), Lookup::Mapped(replay));
    }

    #[test]
    fn removed_handle_remaps_to_null(kind in any_kind(), trace in 1u64.., replay in 1u64..) {
        let mut map = ObjectMap::new();
        map.add(kind, trace, replay);
        prop_assert_eq!(map.remove(kind, trace), Some(replay));
        prop_assert_eq!(map.remap(kind, trace), NULL_HANDLE);
        prop_assert_eq!(map.lookup(kind, trace), Lookup::Missing);
    }

    #[test]
    fn null_always_remaps_to_null(ops in prop::collection::vec(any_op(), 0..64), kind in any_kind()) {
        let mut map = ObjectMap::new();
        for op in ops {
            match op {
                Op::Add(k, t, r) => { map.add(k, t, r); }
                Op::Remove(k, t) => { map.remove(k, t); }
            }
        }
        prop_assert_eq!(map.remap(kind, NULL_HANDLE), NULL_HANDLE);
        prop_assert_eq!(map.lookup(kind, NULL_HANDLE), Lookup::Null);
    }

    #[test]
    fn matches_last_write_model(ops in prop::collection::vec(any_op(), 0..128)) {
        let mut map = ObjectMap::new();
        let mut model = std::collections::HashMap::new();
        for op in &ops {
            match *op {
                Op::Add(k, t, r) => {
                    map.add(k, t, r);
                    model.insert((k, t), r);
                }
                Op::Remove(k, t) => {
                    map.remove(k, t);
                    model.remove(&(k, t));
                }
            }
        }
        prop_assert_eq!(map.len(), model.len());
        for kind in ObjectKind::ALL {
            for trace in 1u64..64 {
                let expected = model.get(&(kind, trace)).copied().unwrap_or(NULL_HANDLE);
                prop_assert_eq!(map.remap(kind, trace), expected);
            }
        }
    }
}
