//! Property-based tests for `FemtoFallbackStore`.
//!
//! Random batches of messages, including embedded newlines and control
//! characters, are appended by concurrent writers while a drainer empties the
//! store. Every event must come out of exactly one drain.

use std::{
    collections::HashMap,
    sync::{Arc, Barrier},
    thread,
};

use femtorelay::{ErrorDetail, FemtoFallbackStore, FemtoLevel, FemtoLogEvent};
use proptest::prelude::*;

fn level() -> impl Strategy<Value = FemtoLevel> {
    prop_oneof![
        Just(FemtoLevel::Information),
        Just(FemtoLevel::Warning),
        Just(FemtoLevel::Error),
        Just(FemtoLevel::Critical),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    #[ignore]
    fn prop_drains_see_each_event_exactly_once(
        ref batches in proptest::collection::vec(
            proptest::collection::vec(".*", 1..20),
            1..4,
        ),
        drains in 1usize..8,
    ) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Arc::new(
            FemtoFallbackStore::open(dir.path().join("fallback.log")).expect("open store"),
        );
        let start = Arc::new(Barrier::new(batches.len() + 1));
        let writers: Vec<_> = batches
            .iter()
            .enumerate()
            .map(|(w, batch)| {
                let store = Arc::clone(&store);
                let start = Arc::clone(&start);
                let batch = batch.clone();
                thread::spawn(move || {
                    start.wait();
                    for (i, body) in batch.into_iter().enumerate() {
                        let event = FemtoLogEvent::new(FemtoLevel::Information, format!("{w}:{i}:{body}"));
                        store.append(&event).expect("append");
                    }
                })
            })
            .collect();

        start.wait();
        let mut seen = Vec::new();
        for _ in 0..drains {
            seen.extend(store.drain_all().expect("drain"));
        }
        for writer in writers {
            writer.join().expect("writer panicked");
        }
        seen.extend(store.drain_all().expect("final drain"));

        let mut counts: HashMap<String, usize> = HashMap::new();
        for event in &seen {
            *counts.entry(event.message.clone()).or_default() += 1;
        }
        let expected: usize = batches.iter().map(Vec::len).sum();
        prop_assert_eq!(seen.len(), expected);
        prop_assert!(counts.values().all(|&c| c == 1));
    }

    #[test]
    #[ignore]
    fn prop_multiline_payloads_keep_framing(
        ref entries in proptest::collection::vec(
            (level(), "(?s).{0,40}", proptest::option::of("(?s).{0,80}")),
            1..16,
        ),
    ) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = FemtoFallbackStore::open(dir.path().join("fallback.log")).expect("open store");
        let events: Vec<_> = entries
            .iter()
            .map(|(level, message, trace)| {
                let event = FemtoLogEvent::new(*level, message.clone());
                match trace {
                    Some(trace) => event.with_error(ErrorDetail::new("failure").with_trace(trace.clone())),
                    None => event,
                }
            })
            .collect();
        store.append_all(&events).expect("append_all");
        prop_assert_eq!(store.len().expect("len"), events.len());
        prop_assert_eq!(store.drain_all().expect("drain"), events);
    }
}
