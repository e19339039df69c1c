// property_tests.rs
// Laws that hold for any input stream

use std::collections::BTreeSet;

use pipestat_core::{pipestat, Document, Flow, Pipeline};
use proptest::prelude::*;
use serde_json::{json, Value as JsonValue};

fn keyed_docs() -> impl Strategy<Value = Vec<(u8, i32)>> {
    prop::collection::vec((0u8..6, -50i32..50), 0..40)
}

fn to_docs(rows: &[(u8, i32)]) -> Vec<JsonValue> {
    rows.iter()
        .enumerate()
        .map(|(seq, (k, n))| json!({"k": format!("k{}", k), "n": n, "seq": seq}))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig { failure_persistence: None, ..ProptestConfig::default() })]

    #[test]
    fn sort_is_ordered_and_stable(rows in keyed_docs()) {
        let out = pipestat(to_docs(&rows), &json!([{"$sort": {"n": 1}}])).unwrap();
        prop_assert_eq!(out.len(), rows.len());
        for pair in out.windows(2) {
            let (a, b) = (pair[0].get("n"), pair[1].get("n"));
            prop_assert!(a.compare(&b).is_le());
            if a == b {
                // equal keys keep arrival order
                let (sa, sb) = (pair[0].get("seq"), pair[1].get("seq"));
                prop_assert!(sa.compare(&sb).is_lt());
            }
        }
    }

    #[test]
    fn group_yields_one_bucket_per_key(rows in keyed_docs()) {
        let out = pipestat(
            to_docs(&rows),
            &json!([{"$group": {"_id": "$k", "count": {"$sum": 1}, "total": {"$sum": "$n"}}}]),
        )
        .unwrap();
        let distinct: BTreeSet<u8> = rows.iter().map(|(k, _)| *k).collect();
        prop_assert_eq!(out.len(), distinct.len());

        let counted: f64 = out.iter().filter_map(|d| d.get("count").as_f64()).sum();
        prop_assert_eq!(counted as usize, rows.len());
        let total: f64 = out.iter().filter_map(|d| d.get("total").as_f64()).sum();
        prop_assert_eq!(total as i64, rows.iter().map(|(_, n)| i64::from(*n)).sum::<i64>());
    }

    #[test]
    fn result_is_idempotent(rows in keyed_docs()) {
        let spec = json!([
            {"$match": {"n": {"$gte": 0}}},
            {"$group": {"_id": "$k", "max": {"$max": "$n"}}},
            {"$sort": [["_id", 1]]}
        ]);
        let mut pipeline = Pipeline::from_json(&spec).unwrap();
        for doc in to_docs(&rows) {
            pipeline.feed_json(&doc).unwrap();
        }
        let first = pipeline.result().unwrap();
        let second = pipeline.result().unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn limit_signals_on_the_feed_after_n(rows in keyed_docs(), limit in 0usize..10) {
        let mut pipeline = Pipeline::from_json(&json!([{"$limit": limit}])).unwrap();
        let mut signalled_at = None;
        for (i, doc) in to_docs(&rows).iter().enumerate() {
            if pipeline.feed_json(doc).unwrap() == Flow::LimitReached {
                signalled_at = Some(i);
                break;
            }
        }
        if rows.len() > limit {
            prop_assert_eq!(signalled_at, Some(limit));
        } else {
            prop_assert_eq!(signalled_at, None);
        }
        prop_assert_eq!(pipeline.result().unwrap().len(), rows.len().min(limit));
    }

    #[test]
    fn missing_operands_never_materialize(rows in keyed_docs()) {
        let spec = json!([{"$project": {
            "k": 1,
            "ghost": "$absent",
            "upper": {"$toUpper": "$absent"},
            "part": {"$extract": ["$absent", "(\\d+)"]}
        }}]);
        let out = pipestat(to_docs(&rows), &spec).unwrap();
        for doc in &out {
            prop_assert!(!doc.contains_key("ghost"));
            prop_assert!(!doc.contains_key("part"));
            prop_assert!(doc.contains_key("k"));
        }
    }

    #[test]
    fn skip_then_limit_is_a_window(rows in keyed_docs(), skip in 0usize..10, limit in 1usize..10) {
        let docs = to_docs(&rows);
        let out = pipestat(docs.clone(), &json!([{"$skip": skip}, {"$limit": limit}])).unwrap();
        let expected: Vec<JsonValue> = docs.into_iter().skip(skip).take(limit).collect();
        let actual: Vec<JsonValue> = out.iter().map(Document::to_json).collect();
        prop_assert_eq!(actual, expected);
    }
}
