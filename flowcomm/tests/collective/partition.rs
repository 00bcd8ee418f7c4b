use std::collections::BTreeMap;
use std::sync::Arc;

use flowcomm::protocol::codec::ScalarCodec;
use flowcomm::{EdgePlan, Operation, Partition, PartitionValues, TaskId};

use super::helpers::{Cluster, Event, Recorder, collector, drive, push, take};

fn values(got: Vec<(TaskId, PartitionValues<i64>)>) -> BTreeMap<TaskId, Vec<i64>> {
    let mut out: BTreeMap<TaskId, Vec<i64>> = BTreeMap::new();
    for (target, values) in got {
        out.entry(target)
            .or_default()
            .extend(values.into_vec().unwrap());
    }
    for vs in out.values_mut() {
        vs.sort_unstable();
    }
    out
}

#[test]
fn test_partition_every_value_arrives_once() {
    let cluster = Cluster::new(3, 2);
    let plan = EdgePlan::batch(0, cluster.tasks(), cluster.tasks());
    let results = cluster.run(|ctx| {
        let (out, receiver) = collector::<PartitionValues<i64>>();
        let mut op = Partition::new(
            &ctx,
            plan.clone(),
            Arc::new(ScalarCodec::<i64>::new()),
            receiver,
        )
        .unwrap();
        for &s in ctx.plan.local_tasks() {
            for i in 0..60 {
                let v = i64::from(s) * 1000 + i;
                push(&mut op, |op| op.partition(s, &v));
            }
            push(&mut op, |op| op.finish(s));
        }
        drive(&mut op);
        (op.received(), values(take(&out)))
    });

    let mut all = Vec::new();
    for (w, (received, got)) in results.into_iter().enumerate() {
        let local = [2 * w as TaskId, 2 * w as TaskId + 1];
        assert_eq!(got.keys().copied().collect::<Vec<_>>(), local);
        // round robin over six destinations: ten values from each source
        for t in local {
            assert_eq!(received[&t], 60);
            assert_eq!(got[&t].len(), 60);
        }
        all.extend(got.into_values().flatten());
    }
    all.sort_unstable();
    let expected: Vec<i64> = (0..6)
        .flat_map(|s| (0..60).map(move |i| s * 1000 + i))
        .collect();
    assert_eq!(all, expected);
}

#[test]
fn test_partition_completion_is_stable() {
    let cluster = Cluster::new(2, 2);
    let plan = EdgePlan::batch(1, vec![0, 1], vec![2, 3]);
    let results = cluster.run(|ctx| {
        let (events, recorder) = Recorder::<PartitionValues<i64>>::new();
        let mut op = Partition::new(
            &ctx,
            plan.clone(),
            Arc::new(ScalarCodec::<i64>::new()),
            recorder,
        )
        .unwrap();
        for &s in ctx.plan.local_tasks() {
            if plan.sources.contains(&s) {
                for d in [2, 3] {
                    push(&mut op, |op| op.partition_to(s, &(i64::from(s) + 10 * i64::from(d)), d));
                }
                push(&mut op, |op| op.finish(s));
            }
        }
        drive(&mut op);
        for _ in 0..20 {
            op.progress().unwrap();
            assert!(op.is_complete());
        }
        assert!(!op.has_pending());
        let events = std::mem::take(&mut *events.lock().unwrap());
        events
            .into_iter()
            .map(|e| match e {
                Event::Value(t, v) => {
                    let mut v = v.into_vec().unwrap();
                    v.sort_unstable();
                    Event::Value(t, v)
                }
                Event::Sync(t, m) => Event::Sync(t, m),
                Event::Complete(t) => Event::Complete(t),
            })
            .collect::<Vec<_>>()
    });

    // the source worker hosts no destination
    assert!(results[0].is_empty());
    let mut got = results[1].clone();
    got.sort_by_key(|e| match e {
        Event::Value(t, _) | Event::Sync(t, _) | Event::Complete(t) => *t,
    });
    assert_eq!(
        got,
        vec![
            Event::Value(2, vec![20, 21]),
            Event::Complete(2),
            Event::Value(3, vec![30, 31]),
            Event::Complete(3),
        ]
    );
}

#[test]
fn test_partition_reset_runs_a_second_batch() {
    let cluster = Cluster::new(1, 3);
    let plan = EdgePlan::batch(2, vec![0], vec![1, 2]);
    let results = cluster.run(|ctx| {
        let (out, receiver) = collector::<PartitionValues<i64>>();
        let mut op = Partition::new(
            &ctx,
            plan.clone(),
            Arc::new(ScalarCodec::<i64>::new()),
            receiver,
        )
        .unwrap();
        let mut batches = Vec::new();
        for round in 0..2i64 {
            for i in 0..4 {
                push(&mut op, |op| op.partition(0, &(round * 100 + i)));
            }
            push(&mut op, |op| op.finish(0));
            drive(&mut op);
            batches.push(values(take(&out)));
            op.reset().unwrap();
        }
        batches
    });

    let batches = &results[0];
    let flat = |m: &BTreeMap<TaskId, Vec<i64>>| {
        let mut all: Vec<i64> = m.values().flatten().copied().collect();
        all.sort_unstable();
        all
    };
    assert_eq!(flat(&batches[0]), vec![0, 1, 2, 3]);
    assert_eq!(flat(&batches[1]), vec![100, 101, 102, 103]);
}
