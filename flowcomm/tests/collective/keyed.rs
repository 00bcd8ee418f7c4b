use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use flowcomm::protocol::codec::{ObjectCodec, ScalarCodec};
use flowcomm::{
    CommConfig, EdgePlan, HashSelector, KeyedGather, KeyedGroups, KeyedPartition, KeyedReduce,
    PartitionValues, ReduceOp, TaskId,
};
use flowcomm_shuffle::{ShuffleConfig, natural_order};

use super::helpers::{Cluster, collector, drive, push, take};

#[test]
fn test_keyed_partition_keys_are_disjoint_and_complete() {
    let cluster = Cluster::new(2, 1);
    let plan = EdgePlan::batch(0, vec![0, 1], vec![0, 1]);
    let results = cluster.run(|ctx| {
        let me = ctx.plan.local_tasks()[0];
        let (out, receiver) = collector::<PartitionValues<(i32, i32)>>();
        let mut op = KeyedPartition::new(
            &ctx,
            plan.clone(),
            Arc::new(ScalarCodec::<i32>::new()),
            Arc::new(ScalarCodec::<i32>::new()),
            receiver,
        )
        .unwrap();
        for k in 0..100 {
            push(&mut op, |op| op.partition(me, &k, &me));
        }
        push(&mut op, |op| op.finish(me));
        drive(&mut op);
        let mut pairs = Vec::new();
        for (target, values) in take(&out) {
            assert_eq!(target, me);
            pairs.extend(values.into_vec().unwrap());
        }
        pairs.sort_unstable();
        pairs
    });

    let mut seen = BTreeSet::new();
    for (dest, pairs) in results.iter().enumerate() {
        for &(k, source) in pairs {
            assert_eq!(
                HashSelector::destination_for(&k, &[0, 1]),
                Some(dest as TaskId),
                "key {k}"
            );
            assert!(seen.insert((k, source)), "duplicate ({k}, {source})");
        }
    }
    let every: BTreeSet<(i32, i32)> = (0..100).flat_map(|k| [(k, 0), (k, 1)]).collect();
    assert_eq!(seen, every);
}

#[test]
fn test_keyed_reduce_word_count() {
    let text = [
        "the quick brown fox",
        "jumps over the lazy dog",
        "the dog sleeps",
    ];
    let cluster = Cluster::new(3, 1);
    let plan = EdgePlan::batch(5, cluster.tasks(), cluster.tasks());
    let results = cluster.run(|ctx| {
        let me = ctx.plan.local_tasks()[0];
        let (out, receiver) = collector::<Vec<(String, i64)>>();
        let mut op = KeyedReduce::new(
            &ctx,
            plan.clone(),
            Arc::new(ObjectCodec::<String>::new()),
            Arc::new(ScalarCodec::<i64>::new()),
            Arc::new(ReduceOp::Sum),
            receiver,
        )
        .unwrap();
        for word in text[me as usize].split_whitespace() {
            push(&mut op, |op| op.reduce(me, &word.to_string(), &1));
        }
        push(&mut op, |op| op.finish(me));
        drive(&mut op);
        take(&out)
    });

    let mut counts: BTreeMap<String, i64> = BTreeMap::new();
    for (w, got) in results.into_iter().enumerate() {
        for (target, pairs) in got {
            assert_eq!(target, w as TaskId);
            for (word, n) in pairs {
                assert!(counts.insert(word, n).is_none(), "word reduced on two targets");
            }
        }
    }
    assert_eq!(counts["the"], 3);
    assert_eq!(counts["dog"], 2);
    assert_eq!(counts["fox"], 1);
    assert_eq!(counts.len(), 9);
}

#[test]
fn test_keyed_gather_spills_and_merges_sorted() {
    let dir = tempfile::tempdir().unwrap();
    let config = CommConfig {
        shuffle: ShuffleConfig {
            max_records_in_memory: 16,
            ..ShuffleConfig::default()
        },
        ..CommConfig::default()
    };
    let cluster = Cluster::new(2, 1).with_config(config);
    let plan = EdgePlan::batch(8, vec![0, 1], vec![0, 1]);
    let results = cluster.run(|ctx| {
        let me = ctx.plan.local_tasks()[0];
        let (out, receiver) = collector::<KeyedGroups<i32, i64>>();
        let mut op = KeyedGather::new(
            &ctx,
            plan.clone(),
            Arc::new(ScalarCodec::<i32>::new()),
            Arc::new(ScalarCodec::<i64>::new()),
            receiver,
        )
        .unwrap()
        .sorted_by(natural_order())
        .with_disk(dir.path())
        .unwrap();
        for k in 0..40 {
            let v = i64::from(me) * 1000 + i64::from(k);
            push(&mut op, |op| op.gather(me, &k, &v));
        }
        push(&mut op, |op| op.finish(me));
        drive(&mut op);
        take(&out)
            .into_iter()
            .map(|(target, groups)| (target, groups.is_spilled(), groups.into_vec().unwrap()))
            .collect::<Vec<_>>()
    });

    let mut keys = Vec::new();
    let mut spilled = false;
    for got in results {
        for (_, was_spilled, groups) in got {
            spilled |= was_spilled;
            let order: Vec<i32> = groups.iter().map(|(k, _)| *k).collect();
            assert!(order.windows(2).all(|w| w[0] < w[1]), "groups come sorted");
            for (k, mut values) in groups {
                values.sort_unstable();
                assert_eq!(values, vec![i64::from(k), 1000 + i64::from(k)]);
                keys.push(k);
            }
        }
    }
    assert!(spilled);
    keys.sort_unstable();
    assert_eq!(keys, (0..40).collect::<Vec<_>>());
}
