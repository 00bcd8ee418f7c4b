use std::sync::Arc;

use flowcomm::protocol::codec::{PrimitiveArrayCodec, ScalarCodec};
use flowcomm::{CommConfig, EdgePlan, ElementWise, Operation, Reduce, ReduceOp, TaskId};

use super::helpers::{Cluster, Event, Recorder, collector, drive, push, take};

#[test]
fn test_reduce_sum_of_four_workers() {
    let cluster = Cluster::new(4, 1);
    let plan = EdgePlan::batch(0, cluster.tasks(), vec![0]);
    let results = cluster.run(|ctx| {
        let me = ctx.plan.local_tasks()[0];
        let (out, receiver) = collector::<i64>();
        let mut op = Reduce::new(
            &ctx,
            plan.clone(),
            Arc::new(ScalarCodec::<i64>::new()),
            Arc::new(ReduceOp::Sum),
            receiver,
        )
        .unwrap();
        push(&mut op, |op| op.reduce(me, &1));
        push(&mut op, |op| op.finish(me));
        drive(&mut op);
        take(&out)
    });

    assert_eq!(results[0], vec![(0, 4)]);
    assert!(results[1..].iter().all(Vec::is_empty));
}

#[test]
fn test_reduce_arrays_spanning_many_buffers() {
    let config = CommConfig {
        buffer_size: 64,
        send_buffer_count: 8,
        receive_buffer_count: 16,
        max_buffers_per_message: 4,
        ..CommConfig::default()
    };
    let cluster = Cluster::new(3, 2).with_config(config);
    let plan = EdgePlan::batch(3, cluster.tasks(), vec![5]);
    let results = cluster.run(|ctx| {
        let (out, receiver) = collector::<Vec<i32>>();
        let mut op = Reduce::new(
            &ctx,
            plan.clone(),
            Arc::new(PrimitiveArrayCodec::<i32>::new()),
            Arc::new(ElementWise(ReduceOp::Sum)),
            receiver,
        )
        .unwrap();
        for &s in ctx.plan.local_tasks() {
            push(&mut op, |op| op.reduce(s, &vec![s; 1000]));
            push(&mut op, |op| op.finish(s));
        }
        drive(&mut op);
        take(&out)
    });

    assert!(results[0].is_empty() && results[1].is_empty());
    assert_eq!(results[2], vec![(5, vec![15; 1000])]);
}

#[test]
fn test_reduce_root_sees_completion_after_result() {
    let cluster = Cluster::new(2, 2);
    let plan = EdgePlan::batch(1, cluster.tasks(), vec![3]);
    let results = cluster.run(|ctx| {
        let (events, recorder) = Recorder::<i64>::new();
        let max = |a: i64, b: i64| a.max(b);
        let mut op = Reduce::new(
            &ctx,
            plan.clone(),
            Arc::new(ScalarCodec::<i64>::new()),
            Arc::new(max),
            recorder,
        )
        .unwrap();
        for &s in ctx.plan.local_tasks() {
            push(&mut op, |op| op.reduce(s, &(i64::from(s) * 7)));
            push(&mut op, |op| op.finish(s));
        }
        drive(&mut op);
        // finished operators stay finished
        for _ in 0..10 {
            op.progress().unwrap();
        }
        assert!(op.is_complete());
        events.lock().unwrap().clone()
    });

    assert!(results[0].is_empty());
    assert_eq!(results[1], vec![Event::Value(3, 21), Event::Complete(3)]);
}

#[test]
fn test_reduce_with_no_local_sources() {
    let cluster = Cluster::new(3, 1);
    // worker 1 hosts no source
    let plan = EdgePlan::batch(0, vec![0, 2], vec![0]);
    let results = cluster.run(|ctx| {
        let (out, receiver) = collector::<i64>();
        let mut op = Reduce::new(
            &ctx,
            plan.clone(),
            Arc::new(ScalarCodec::<i64>::new()),
            Arc::new(ReduceOp::Sum),
            receiver,
        )
        .unwrap();
        let sources: Vec<TaskId> = ctx
            .plan
            .local_tasks()
            .iter()
            .copied()
            .filter(|s| plan.sources.contains(s))
            .collect();
        for s in sources {
            push(&mut op, |op| op.reduce(s, &100));
            push(&mut op, |op| op.finish(s));
        }
        drive(&mut op);
        take(&out)
    });

    assert_eq!(results[0], vec![(0, 200)]);
}
