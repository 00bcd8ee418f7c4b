//! Allreduce across 4 workers sharing one process.
//!
//! Each worker hosts two tasks, and every task contributes a vector filled
//! with its own id. After allreduce(Sum), every task holds the element-wise
//! sum of all inputs.
//!
//! ```bash
//! cargo run --example allreduce
//! ```

use std::sync::{Arc, Mutex};
use std::thread;

use flowcomm::protocol::codec::PrimitiveArrayCodec;
use flowcomm::{
    AllReduce, CommConfig, CommContext, EdgePlan, ElementWise, LocalNetwork, LogicalPlan,
    Operation, ReduceOp, TaskId, WorkerId,
};

fn main() -> flowcomm::Result<()> {
    let workers = 4;
    let tasks_per_worker = 2;
    let count = 8usize;
    let network = LocalNetwork::new(workers);
    let tasks: Vec<TaskId> = (0..(workers * tasks_per_worker) as TaskId).collect();
    let plan = EdgePlan::batch(0, tasks.clone(), tasks);

    let results: Vec<flowcomm::Result<Vec<(TaskId, Vec<f32>)>>> = thread::scope(|s| {
        let handles: Vec<_> = (0..workers as WorkerId)
            .map(|w| {
                let network = network.clone();
                let plan = plan.clone();
                s.spawn(move || -> flowcomm::Result<Vec<(TaskId, Vec<f32>)>> {
                    let layout = LogicalPlan::uniform(workers, tasks_per_worker, w)?;
                    let ctx = CommContext::new(CommConfig::default(), layout, network.channel(w))?;
                    let out = Arc::new(Mutex::new(Vec::new()));
                    let sink = Arc::clone(&out);
                    let mut op = AllReduce::new(
                        &ctx,
                        plan,
                        Arc::new(PrimitiveArrayCodec::<f32>::new()),
                        Arc::new(ElementWise(ReduceOp::Sum)),
                        move |task: TaskId, v: Vec<f32>| sink.lock().unwrap().push((task, v)),
                    )?;

                    // each task fills its buffer with its own id
                    let mut pending: Vec<TaskId> = ctx.plan.local_tasks().to_vec();
                    let mut finishing = pending.clone();
                    while !pending.is_empty() || !finishing.is_empty() {
                        if let Some(&t) = pending.first() {
                            if op.reduce(t, &vec![t as f32; count])? {
                                pending.remove(0);
                            }
                        } else if let Some(&t) = finishing.first() {
                            if op.finish(t)? {
                                finishing.remove(0);
                            }
                        }
                        op.progress()?;
                    }
                    while !op.is_complete() {
                        op.progress()?;
                        thread::yield_now();
                    }
                    Ok(std::mem::take(&mut *out.lock().unwrap()))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker thread panicked"))
            .collect()
    });

    for result in results {
        for (task, data) in result? {
            println!("task {task}: {data:?}");
        }
    }
    // Output (all tasks identical):
    // task 0: [28.0, 28.0, 28.0, 28.0, 28.0, 28.0, 28.0, 28.0]
    // task 1: [28.0, 28.0, 28.0, 28.0, 28.0, 28.0, 28.0, 28.0]
    // ...

    Ok(())
}
