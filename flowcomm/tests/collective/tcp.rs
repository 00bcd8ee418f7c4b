use std::sync::Arc;

use flowcomm::protocol::codec::ScalarCodec;
use flowcomm::{
    CommConfig, CommContext, EdgePlan, LogicalPlan, Partition, PartitionValues, Reduce, ReduceOp,
    TaskId, WorkerId, tcp_mesh_local,
};

use super::helpers::{collector, drive, push, take};

const WORKERS: usize = 3;
const TASKS_PER_WORKER: usize = 2;

fn tasks() -> Vec<TaskId> {
    (0..(WORKERS * TASKS_PER_WORKER) as TaskId).collect()
}

/// Run `body` for every worker of a loopback TCP mesh on blocking threads.
async fn over_tcp<R, F>(body: F) -> Vec<R>
where
    F: Fn(CommContext) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    let mesh = tcp_mesh_local(WORKERS).await.unwrap();
    let body = Arc::new(body);
    let handles: Vec<_> = mesh
        .iter()
        .enumerate()
        .map(|(w, channel)| {
            let plan = LogicalPlan::uniform(WORKERS, TASKS_PER_WORKER, w as WorkerId).unwrap();
            let ctx = CommContext::new(CommConfig::default(), plan, channel.clone()).unwrap();
            let body = Arc::clone(&body);
            tokio::task::spawn_blocking(move || body(ctx))
        })
        .collect();
    let mut results = Vec::with_capacity(handles.len());
    for h in handles {
        results.push(h.await.unwrap());
    }
    // sockets stay open until every worker is done
    drop(mesh);
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reduce_over_tcp() {
    let plan = EdgePlan::batch(0, tasks(), vec![3]);
    let results = over_tcp(move |ctx| {
        let (out, receiver) = collector::<i64>();
        let mut op = Reduce::new(
            &ctx,
            plan.clone(),
            Arc::new(ScalarCodec::<i64>::new()),
            Arc::new(ReduceOp::Sum),
            receiver,
        )
        .unwrap();
        for &s in ctx.plan.local_tasks() {
            push(&mut op, |op| op.reduce(s, &(i64::from(s) + 1)));
            push(&mut op, |op| op.finish(s));
        }
        drive(&mut op);
        take(&out)
    })
    .await;

    assert_eq!(results[1], vec![(3, 21)]);
    assert!(results[0].is_empty() && results[2].is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partition_over_tcp() {
    let plan = EdgePlan::batch(4, tasks(), tasks());
    let results = over_tcp(move |ctx| {
        let (out, receiver) = collector::<PartitionValues<i64>>();
        let mut op = Partition::new(
            &ctx,
            plan.clone(),
            Arc::new(ScalarCodec::<i64>::new()),
            receiver,
        )
        .unwrap();
        for &s in ctx.plan.local_tasks() {
            for i in 0..300 {
                push(&mut op, |op| op.partition(s, &(i64::from(s) * 1000 + i)));
            }
            push(&mut op, |op| op.finish(s));
        }
        drive(&mut op);
        take(&out)
            .into_iter()
            .flat_map(|(_, v)| v.into_vec().unwrap())
            .collect::<Vec<i64>>()
    })
    .await;

    let mut all: Vec<i64> = results.into_iter().flatten().collect();
    all.sort_unstable();
    let expected: Vec<i64> = (0..6)
        .flat_map(|s| (0..300).map(move |i| s * 1000 + i))
        .collect();
    assert_eq!(all, expected);
}
