use std::sync::Arc;

use flowcomm::protocol::codec::{PrimitiveArrayCodec, ScalarCodec};
use flowcomm::{AllReduce, EdgePlan, ElementWise, ReduceOp};

use super::helpers::{Cluster, collector, drive, push, take};

#[test]
fn test_allreduce_every_destination_gets_the_sum() {
    let cluster = Cluster::new(4, 2);
    let plan = EdgePlan::batch(0, cluster.tasks(), cluster.tasks());
    let results = cluster.run(|ctx| {
        let (out, receiver) = collector::<i64>();
        let mut op = AllReduce::new(
            &ctx,
            plan.clone(),
            Arc::new(ScalarCodec::<i64>::new()),
            Arc::new(ReduceOp::Sum),
            receiver,
        )
        .unwrap();
        for &s in ctx.plan.local_tasks() {
            push(&mut op, |op| op.reduce(s, &i64::from(s)));
            push(&mut op, |op| op.finish(s));
        }
        drive(&mut op);
        let mut got = take(&out);
        got.sort();
        got
    });

    for (w, got) in results.into_iter().enumerate() {
        let first = 2 * w as i32;
        assert_eq!(got, vec![(first, 28), (first + 1, 28)], "worker {w}");
    }
}

#[test]
fn test_allreduce_arrays_elementwise_max() {
    let cluster = Cluster::new(3, 1);
    let plan = EdgePlan::batch(4, cluster.tasks(), vec![1, 2]);
    let results = cluster.run(|ctx| {
        let me = ctx.plan.local_tasks()[0];
        let (out, receiver) = collector::<Vec<f64>>();
        let mut op = AllReduce::new(
            &ctx,
            plan.clone(),
            Arc::new(PrimitiveArrayCodec::<f64>::new()),
            Arc::new(ElementWise(ReduceOp::Max)),
            receiver,
        )
        .unwrap();
        let mut value = vec![0.0; 3];
        value[me as usize] = 1.5;
        push(&mut op, |op| op.reduce(me, &value));
        push(&mut op, |op| op.finish(me));
        drive(&mut op);
        take(&out)
    });

    assert!(results[0].is_empty());
    assert_eq!(results[1], vec![(1, vec![1.5, 1.5, 1.5])]);
    assert_eq!(results[2], vec![(2, vec![1.5, 1.5, 1.5])]);
}
