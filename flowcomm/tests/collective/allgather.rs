use std::sync::Arc;

use flowcomm::protocol::codec::ObjectCodec;
use flowcomm::{AllGather, EdgePlan, TaskId};

use super::helpers::{Cluster, collector, drive, push, take};

#[test]
fn test_allgather_everyone_sees_every_source() {
    let cluster = Cluster::new(3, 2);
    let plan = EdgePlan::batch(10, cluster.tasks(), cluster.tasks());
    let results = cluster.run(|ctx| {
        let (out, receiver) = collector::<Vec<(TaskId, String)>>();
        let mut op = AllGather::new(
            &ctx,
            plan.clone(),
            Arc::new(ObjectCodec::<String>::new()),
            receiver,
        )
        .unwrap();
        for &s in ctx.plan.local_tasks() {
            push(&mut op, |op| op.gather(s, &format!("hello from {s}")));
            push(&mut op, |op| op.finish(s));
        }
        drive(&mut op);
        let mut got = take(&out);
        got.sort_by_key(|(t, _)| *t);
        got
    });

    let expected: Vec<(TaskId, String)> = (0..6).map(|s| (s, format!("hello from {s}"))).collect();
    for (w, got) in results.into_iter().enumerate() {
        let first = 2 * w as TaskId;
        assert_eq!(
            got,
            vec![(first, expected.clone()), (first + 1, expected.clone())],
            "worker {w}"
        );
    }
}
