use std::sync::Arc;

use flowcomm::protocol::codec::PrimitiveArrayCodec;
use flowcomm::{Broadcast, CommConfig, EdgePlan};

use super::helpers::{Cluster, collector, drive, push, take};

#[test]
fn test_broadcast_reaches_every_worker() {
    let config = CommConfig {
        buffer_size: 128,
        send_buffer_count: 8,
        receive_buffer_count: 8,
        max_buffers_per_message: 2,
        tree_inter_node_degree: 2,
        ..CommConfig::default()
    };
    let cluster = Cluster::new(5, 1).with_config(config);
    let plan = EdgePlan::batch(0, vec![2], cluster.tasks());
    let big: Vec<i64> = (0..2000).collect();
    let small = vec![-1i64, -2];

    let results = cluster.run(|ctx| {
        let me = ctx.plan.local_tasks()[0];
        let (out, receiver) = collector::<Vec<Vec<i64>>>();
        let mut op = Broadcast::new(
            &ctx,
            plan.clone(),
            Arc::new(PrimitiveArrayCodec::<i64>::new()),
            receiver,
        )
        .unwrap();
        if me == 2 {
            push(&mut op, |op| op.broadcast(2, &big));
            push(&mut op, |op| op.broadcast(2, &small));
            push(&mut op, |op| op.finish(2));
        }
        drive(&mut op);
        take(&out)
    });

    for (worker, got) in results.into_iter().enumerate() {
        assert_eq!(
            got,
            vec![(worker as i32, vec![big.clone(), small.clone()])],
            "worker {worker}"
        );
    }
}

#[test]
fn test_broadcast_to_subset_of_tasks() {
    let cluster = Cluster::new(3, 2);
    let plan = EdgePlan::batch(7, vec![0], vec![1, 3, 4]);
    let results = cluster.run(|ctx| {
        let (out, receiver) = collector::<Vec<Vec<i64>>>();
        let mut op = Broadcast::new(
            &ctx,
            plan.clone(),
            Arc::new(PrimitiveArrayCodec::<i64>::new()),
            receiver,
        )
        .unwrap();
        if ctx.plan.is_local(0) {
            push(&mut op, |op| op.broadcast(0, &vec![42]));
            push(&mut op, |op| op.finish(0));
        }
        drive(&mut op);
        let mut got = take(&out);
        got.sort_by_key(|(t, _)| *t);
        got
    });

    assert_eq!(results[0], vec![(1, vec![vec![42]])]);
    assert_eq!(results[1], vec![(3, vec![vec![42]])]);
    assert_eq!(results[2], vec![(4, vec![vec![42]])]);
}
