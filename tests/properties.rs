//! Property tests for write idempotence and history bounds.

use proptest::prelude::*;
use serde_json::{json, Value};
use statehold::{HistoryQuery, Store, StoreConfig};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z]{0,8}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                .prop_map(|map| json!(map)),
        ]
    })
}

proptest! {
    #[test]
    fn second_equal_write_is_a_noop(value in json_value()) {
        let store = Store::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        store.subscribe("k", move |_, _, _| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        store.set("k", value.clone()).unwrap();
        store.set("k", value.clone()).unwrap();

        prop_assert_eq!(calls.load(Ordering::SeqCst), 1);
        prop_assert_eq!(store.get_history("k", HistoryQuery::new()).len(), 1);
        prop_assert_eq!(store.get("k"), Some(value));
    }

    #[test]
    fn history_never_exceeds_cap(cap in 0usize..8, writes in 0usize..20) {
        let store = Store::with_config(StoreConfig::default().with_max_history(cap));
        for i in 0..writes {
            store.set("k", i).unwrap();
        }

        let history = store.get_history("k", HistoryQuery::new());
        prop_assert_eq!(history.len(), writes.min(cap));
        if writes >= 2 && cap > 0 {
            prop_assert_eq!(&history[0].previous_value, &Some(json!(writes - 2)));
        }
    }

    #[test]
    fn batch_delivers_first_previous_and_last_value(values in prop::collection::vec(0i64..5, 1..10)) {
        let store = Store::new();
        store.set("k", -1).unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        store.subscribe("k", move |new, old, _| {
            seen_clone.lock().unwrap().push((new.cloned(), old.cloned()));
        });

        store.batch(|store| {
            for value in &values {
                store.set("k", *value).unwrap();
            }
        });

        let last = *values.last().unwrap();
        let seen = seen.lock().unwrap();
        prop_assert_eq!(seen.len(), 1);
        prop_assert_eq!(&seen[0], &(Some(json!(last)), Some(json!(-1))));
    }
}
