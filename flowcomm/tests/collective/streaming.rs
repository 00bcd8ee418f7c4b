use std::collections::BTreeSet;
use std::sync::Arc;

use flowcomm::protocol::codec::ScalarCodec;
use flowcomm::{EdgePlan, KeyedReduce, Partition, PartitionValues, Reduce, ReduceOp, TaskId};

use super::helpers::{Cluster, Event, Recorder, Rendezvous, drive_until, push, syncs_seen};

/// Values seen by `target` between consecutive markers, one set per round.
fn rounds(events: &[Event<Vec<i64>>], target: TaskId) -> Vec<(BTreeSet<i64>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut current = BTreeSet::new();
    for e in events {
        match e {
            Event::Value(t, vs) if *t == target => current.extend(vs.iter().copied()),
            Event::Sync(t, m) if *t == target => {
                out.push((std::mem::take(&mut current), m.clone()));
            }
            _ => {}
        }
    }
    assert!(current.is_empty(), "values after the last marker");
    out
}

fn flatten(events: Vec<Event<PartitionValues<i64>>>) -> Vec<Event<Vec<i64>>> {
    events
        .into_iter()
        .map(|e| match e {
            Event::Value(t, v) => Event::Value(t, v.into_vec().unwrap()),
            Event::Sync(t, m) => Event::Sync(t, m),
            Event::Complete(t) => Event::Complete(t),
        })
        .collect()
}

#[test]
fn test_streaming_partition_barriers_separate_rounds() {
    let cluster = Cluster::new(2, 2);
    let plan = EdgePlan::streaming(0, cluster.tasks(), cluster.tasks());
    let done = Rendezvous::default();
    let results = cluster.run(|ctx| {
        let local = ctx.plan.local_tasks().to_vec();
        let (events, recorder) = Recorder::<PartitionValues<i64>>::new();
        let mut op = Partition::new(
            &ctx,
            plan.clone(),
            Arc::new(ScalarCodec::<i64>::new()),
            recorder,
        )
        .unwrap();
        for (round, marker) in [b"r1", b"r2"].into_iter().enumerate() {
            for &s in &local {
                for d in 0..4 {
                    let v = 100 * round as i64 + 10 * i64::from(s) + i64::from(d);
                    push(&mut op, |op| op.partition_to(s, &v, d));
                }
            }
            for &s in &local {
                push(&mut op, |op| op.barrier(s, marker));
            }
        }
        let mut arrived = false;
        drive_until(&mut op, || {
            if !arrived && syncs_seen(&events) == 2 * local.len() {
                arrived = true;
                done.arrive();
            }
            done.arrived() == 2
        });
        let seen = std::mem::take(&mut *events.lock().unwrap());
        (local, flatten(seen))
    });

    for (local, events) in results {
        for t in local {
            let expected: Vec<(BTreeSet<i64>, Vec<u8>)> = [b"r1".to_vec(), b"r2".to_vec()]
                .into_iter()
                .enumerate()
                .map(|(round, marker)| {
                    let values = (0..4)
                        .map(|s| 100 * round as i64 + 10 * s + i64::from(t))
                        .collect();
                    (values, marker)
                })
                .collect();
            assert_eq!(rounds(&events, t), expected, "target {t}");
        }
    }
}

#[test]
fn test_streaming_reduce_one_result_per_round() {
    let cluster = Cluster::new(3, 1);
    let plan = EdgePlan::streaming(1, cluster.tasks(), vec![1]);
    let done = Rendezvous::default();
    let results = cluster.run(|ctx| {
        let me = ctx.plan.local_tasks()[0];
        let (events, recorder) = Recorder::<i64>::new();
        let mut op = Reduce::new(
            &ctx,
            plan.clone(),
            Arc::new(ScalarCodec::<i64>::new()),
            Arc::new(ReduceOp::Sum),
            recorder,
        )
        .unwrap();
        push(&mut op, |op| op.reduce(me, &1));
        push(&mut op, |op| op.barrier(me, b"a"));
        push(&mut op, |op| op.reduce(me, &10));
        push(&mut op, |op| op.barrier(me, b"b"));
        drive_until(&mut op, || {
            if me == 1 && syncs_seen(&events) == 2 && done.arrived() == 0 {
                done.arrive();
            }
            done.arrived() == 1
        });
        events.lock().unwrap().clone()
    });

    assert!(results[0].is_empty() && results[2].is_empty());
    assert_eq!(
        results[1],
        vec![
            Event::Value(1, 3),
            Event::Sync(1, b"a".to_vec()),
            Event::Value(1, 30),
            Event::Sync(1, b"b".to_vec()),
        ]
    );
}

#[test]
fn test_streaming_reduce_barrier_ahead_of_remote_data() {
    let cluster = Cluster::new(2, 1);
    let plan = EdgePlan::streaming(6, cluster.tasks(), vec![0]);
    let root_barrier_sent = Rendezvous::default();
    let done = Rendezvous::default();
    let results = cluster.run(|ctx| {
        let me = ctx.plan.local_tasks()[0];
        let (events, recorder) = Recorder::<i64>::new();
        let mut op = Reduce::new(
            &ctx,
            plan.clone(),
            Arc::new(ScalarCodec::<i64>::new()),
            Arc::new(ReduceOp::Sum),
            recorder,
        )
        .unwrap();
        if me == 0 {
            // the root's own source closes round "a" before it sends anything
            push(&mut op, |op| op.barrier(0, b"a"));
            root_barrier_sent.arrive();
            push(&mut op, |op| op.reduce(0, &5));
            push(&mut op, |op| op.barrier(0, b"b"));
        } else {
            drive_until(&mut op, || root_barrier_sent.arrived() == 1);
            push(&mut op, |op| op.reduce(1, &1));
            push(&mut op, |op| op.barrier(1, b"a"));
            push(&mut op, |op| op.reduce(1, &7));
            push(&mut op, |op| op.barrier(1, b"b"));
        }
        drive_until(&mut op, || {
            if me == 0 && syncs_seen(&events) == 2 && done.arrived() == 0 {
                done.arrive();
            }
            done.arrived() == 1
        });
        events.lock().unwrap().clone()
    });

    assert!(results[1].is_empty());
    assert_eq!(
        results[0],
        vec![
            Event::Value(0, 1),
            Event::Sync(0, b"a".to_vec()),
            Event::Value(0, 12),
            Event::Sync(0, b"b".to_vec()),
        ]
    );
}

#[test]
fn test_streaming_keyed_reduce_flushes_at_barrier() {
    let cluster = Cluster::new(2, 1);
    let plan = EdgePlan::streaming(3, vec![0, 1], vec![0]);
    let done = Rendezvous::default();
    let results = cluster.run(|ctx| {
        let me = ctx.plan.local_tasks()[0];
        let (events, recorder) = Recorder::<Vec<(i32, i64)>>::new();
        let mut op = KeyedReduce::new(
            &ctx,
            plan.clone(),
            Arc::new(ScalarCodec::<i32>::new()),
            Arc::new(ScalarCodec::<i64>::new()),
            Arc::new(ReduceOp::Sum),
            recorder,
        )
        .unwrap();
        for k in 0..5 {
            push(&mut op, |op| op.reduce(me, &k, &(i64::from(me) + 1)));
        }
        push(&mut op, |op| op.barrier(me, b"end"));
        drive_until(&mut op, || {
            if me == 0 && syncs_seen(&events) == 1 && done.arrived() == 0 {
                done.arrive();
            }
            done.arrived() == 1
        });
        events.lock().unwrap().clone()
    });

    let events = &results[0];
    assert_eq!(events.last(), Some(&Event::Sync(0, b"end".to_vec())));
    // partial results may arrive in several flushes; their per-key sums
    // add up to both sources' contributions
    let mut sums = [0i64; 5];
    for e in events {
        if let Event::Value(0, pairs) = e {
            for (k, v) in pairs {
                sums[*k as usize] += v;
            }
        }
    }
    assert_eq!(sums, [3; 5]);
}
