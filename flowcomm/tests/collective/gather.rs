use std::sync::Arc;

use flowcomm::protocol::codec::{ObjectCodec, ScalarCodec};
use flowcomm::{EdgePlan, Gather, Operation, TaskId};

use super::helpers::{Cluster, Rendezvous, collector, drive, drive_until, push, take};

#[test]
fn test_gather_strings_ordered_by_source() {
    let cluster = Cluster::new(3, 2);
    let plan = EdgePlan::batch(0, cluster.tasks(), vec![4]);
    let results = cluster.run(|ctx| {
        let (out, receiver) = collector::<Vec<(TaskId, String)>>();
        let mut op = Gather::new(
            &ctx,
            plan.clone(),
            Arc::new(ObjectCodec::<String>::new()),
            receiver,
        )
        .unwrap();
        for &s in ctx.plan.local_tasks() {
            push(&mut op, |op| op.gather(s, &format!("task-{s}")));
            push(&mut op, |op| op.finish(s));
        }
        drive(&mut op);
        take(&out)
    });

    let expected: Vec<(TaskId, String)> = (0..6).map(|s| (s, format!("task-{s}"))).collect();
    assert_eq!(results[2], vec![(4, expected)]);
    assert!(results[0].is_empty() && results[1].is_empty());
}

#[test]
fn test_gather_many_values_per_source() {
    let cluster = Cluster::new(2, 2);
    let plan = EdgePlan::batch(2, cluster.tasks(), vec![0]);
    let results = cluster.run(|ctx| {
        let (out, receiver) = collector::<Vec<(TaskId, String)>>();
        let mut op = Gather::new(
            &ctx,
            plan.clone(),
            Arc::new(ObjectCodec::<String>::new()),
            receiver,
        )
        .unwrap();
        for &s in ctx.plan.local_tasks() {
            for i in 0..50 {
                push(&mut op, |op| op.gather(s, &format!("{s}:{i}")));
            }
            push(&mut op, |op| op.finish(s));
        }
        drive(&mut op);
        take(&out)
    });

    let (root, items) = &results[0][0];
    assert_eq!(*root, 0);
    assert_eq!(items.len(), 200);
    for s in 0..4 {
        let from: Vec<&String> = items
            .iter()
            .filter(|(src, _)| *src == s)
            .map(|(_, v)| v)
            .collect();
        let want: Vec<String> = (0..50).map(|i| format!("{s}:{i}")).collect();
        assert_eq!(from, want.iter().collect::<Vec<_>>(), "source {s} keeps send order");
    }
}

#[test]
fn test_gather_reset_runs_second_batch_across_workers() {
    let cluster = Cluster::new(2, 2);
    let plan = EdgePlan::batch(7, cluster.tasks(), vec![0]);
    let reset = Rendezvous::default();
    let results = cluster.run(|ctx| {
        let (out, receiver) = collector::<Vec<(TaskId, i64)>>();
        let mut op = Gather::new(
            &ctx,
            plan.clone(),
            Arc::new(ScalarCodec::<i64>::new()),
            receiver,
        )
        .unwrap();
        let mut batches = Vec::new();
        for base in [100, 200] {
            for &s in ctx.plan.local_tasks() {
                push(&mut op, |op| op.gather(s, &(base + i64::from(s))));
                push(&mut op, |op| op.finish(s));
            }
            drive(&mut op);
            batches.push(take(&out));
            op.reset().unwrap();
            // nobody starts the next batch before every worker has reset
            reset.arrive();
            let target = if base == 100 { 2 } else { 4 };
            drive_until(&mut op, || reset.arrived() >= target);
        }
        batches
    });

    let first: Vec<(TaskId, i64)> = (0..4).map(|s| (s, 100 + i64::from(s))).collect();
    let second: Vec<(TaskId, i64)> = (0..4).map(|s| (s, 200 + i64::from(s))).collect();
    assert_eq!(results[0], vec![vec![(0, first)], vec![(0, second)]]);
    assert_eq!(results[1], vec![Vec::new(), Vec::new()]);
}
