use std::sync::Arc;

use flowcomm_shuffle::{
    KeyedSortedRunMerger, RunMerger, RunState, SerdeKeyCodec, ShuffleConfig, natural_order,
};

#[test]
fn test_million_distinct_keys_sorted() {
    let dir = tempfile::tempdir().unwrap();
    let config = ShuffleConfig {
        max_bytes_in_memory: 4 * 1024 * 1024,
        max_records_in_memory: usize::MAX,
        read_window_records: 1024,
    };
    let mut run = KeyedSortedRunMerger::<i32>::new(
        dir.path(),
        "million",
        config,
        natural_order(),
        Arc::new(SerdeKeyCodec),
    );

    const N: i32 = 1_000_000;
    let payload = vec![0xABu8; 8];
    // Scramble insertion order so every part needs sorting.
    for i in 0..N {
        let key = ((i as i64 * 7919) % N as i64) as i32;
        run.add(key, payload.clone()).unwrap();
        run.run().unwrap();
    }
    assert!(run.parts().len() >= 2, "expected at least two spills");
    run.switch_to_reading().unwrap();

    let mut groups = run.read_iterator().unwrap();
    let mut count = 0;
    let mut prev: Option<i32> = None;
    while let Some((key, values)) = groups.next_group().unwrap() {
        if let Some(p) = prev {
            assert!(key > p, "keys out of order: {p} then {key}");
        }
        let vals: Vec<Vec<u8>> = values.map(|v| v.unwrap()).collect();
        assert_eq!(vals.len(), 1);
        assert_eq!(vals[0], payload);
        prev = Some(key);
        count += 1;
    }
    assert_eq!(count, N);
    assert_eq!(prev, Some(N - 1));
}

#[test]
fn test_duplicate_keys_grouped_with_every_value() {
    let dir = tempfile::tempdir().unwrap();
    let config = ShuffleConfig {
        max_bytes_in_memory: 256,
        max_records_in_memory: usize::MAX,
        read_window_records: 4,
    };
    let mut run = KeyedSortedRunMerger::<String>::new(
        dir.path(),
        "words",
        config,
        natural_order(),
        Arc::new(SerdeKeyCodec),
    );
    let words = ["pear", "apple", "fig", "apple", "pear", "kiwi", "fig", "apple"];
    for round in 0..10u8 {
        for w in words {
            run.add(w.to_string(), vec![round]).unwrap();
            run.run().unwrap();
        }
    }
    run.switch_to_reading().unwrap();

    let mut groups = run.read_iterator().unwrap();
    let mut seen = Vec::new();
    while let Some((key, values)) = groups.next_group().unwrap() {
        let n = values.count();
        seen.push((key, n));
    }
    assert_eq!(
        seen,
        vec![
            ("apple".to_string(), 30),
            ("fig".to_string(), 20),
            ("kiwi".to_string(), 10),
            ("pear".to_string(), 20),
        ]
    );
}

#[test]
fn test_unkeyed_run_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let mut run = RunMerger::new(
        dir.path(),
        "plain",
        ShuffleConfig {
            max_bytes_in_memory: 64,
            max_records_in_memory: usize::MAX,
            read_window_records: 5,
        },
    );
    for i in 0..100u16 {
        run.add(i.to_le_bytes().repeat(8)).unwrap();
        run.run().unwrap();
    }
    assert_eq!(run.state(), RunState::Writing);
    run.switch_to_reading().unwrap();
    assert_eq!(run.state(), RunState::Reading);

    let total = run.read_iterator().unwrap().map(|v| v.unwrap()).count();
    assert_eq!(total, 100);

    run.clean().unwrap();
    assert_eq!(run.state(), RunState::Done);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
