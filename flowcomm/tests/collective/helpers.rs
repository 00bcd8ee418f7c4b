use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use flowcomm::{
    CommConfig, CommContext, LocalNetwork, LogicalPlan, Operation, Receiver, Result, TaskId,
    WorkerId,
};

/// How long any drive loop may spin before the test fails.
pub const DEADLINE: Duration = Duration::from_secs(60);

pub type Collected<M> = Arc<Mutex<Vec<(TaskId, M)>>>;

/// A receiver that records every result with its target.
pub fn collector<M: Send + 'static>() -> (Collected<M>, impl Receiver<M> + 'static) {
    let out: Collected<M> = Arc::default();
    let sink = Arc::clone(&out);
    let receiver = move |target: TaskId, m: M| sink.lock().unwrap().push((target, m));
    (out, receiver)
}

pub fn take<M>(out: &Collected<M>) -> Vec<(TaskId, M)> {
    std::mem::take(&mut *out.lock().unwrap())
}

/// What a receiver observed, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<M> {
    Value(TaskId, M),
    Sync(TaskId, Vec<u8>),
    Complete(TaskId),
}

pub type Events<M> = Arc<Mutex<Vec<Event<M>>>>;

/// Receiver recording values, markers and completions.
pub struct Recorder<M>(pub Events<M>);

impl<M> Recorder<M> {
    pub fn new() -> (Events<M>, Self) {
        let events: Events<M> = Arc::default();
        (Arc::clone(&events), Self(events))
    }
}

impl<M: Send> Receiver<M> for Recorder<M> {
    fn receive(&mut self, target: TaskId, message: M) {
        self.0.lock().unwrap().push(Event::Value(target, message));
    }

    fn sync(&mut self, target: TaskId, marker: &[u8]) {
        self.0
            .lock()
            .unwrap()
            .push(Event::Sync(target, marker.to_vec()));
    }

    fn complete(&mut self, target: TaskId) {
        self.0.lock().unwrap().push(Event::Complete(target));
    }
}

pub fn syncs_seen<M>(events: &Events<M>) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, Event::Sync(..)))
        .count()
}

/// Workers of a uniform plan wired over one in-process network.
pub struct Cluster {
    pub workers: usize,
    pub tasks_per_worker: usize,
    pub config: CommConfig,
    pub network: LocalNetwork,
}

impl Cluster {
    pub fn new(workers: usize, tasks_per_worker: usize) -> Self {
        Self {
            workers,
            tasks_per_worker,
            config: CommConfig::default(),
            network: LocalNetwork::new(workers),
        }
    }

    pub fn with_config(mut self, config: CommConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_link_capacity(mut self, frames: usize) -> Self {
        self.network = LocalNetwork::with_link_capacity(self.workers, frames);
        self
    }

    /// Every task of the plan.
    pub fn tasks(&self) -> Vec<TaskId> {
        (0..(self.workers * self.tasks_per_worker) as TaskId).collect()
    }

    pub fn context(&self, worker: WorkerId) -> CommContext {
        let plan = LogicalPlan::uniform(self.workers, self.tasks_per_worker, worker).unwrap();
        CommContext::new(self.config.clone(), plan, self.network.channel(worker)).unwrap()
    }

    /// Run `body` once per worker, each on its own thread, and collect the
    /// results in worker order.
    pub fn run<R, F>(&self, body: F) -> Vec<R>
    where
        F: Fn(CommContext) -> R + Sync,
        R: Send,
    {
        thread::scope(|s| {
            let handles: Vec<_> = (0..self.workers as WorkerId)
                .map(|w| {
                    let ctx = self.context(w);
                    let body = &body;
                    s.spawn(move || body(ctx))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("worker thread panicked"))
                .collect()
        })
    }
}

/// Keep calling `send` until the operator accepts, progressing in between.
pub fn push<O: Operation>(op: &mut O, mut send: impl FnMut(&mut O) -> Result<bool>) {
    let start = Instant::now();
    while !send(op).unwrap() {
        op.progress().unwrap();
        assert!(start.elapsed() < DEADLINE, "send was never accepted");
        thread::yield_now();
    }
}

/// Progress `op` until it reports completion.
pub fn drive<O: Operation>(op: &mut O) {
    let start = Instant::now();
    while !op.is_complete() {
        op.progress().unwrap();
        assert!(start.elapsed() < DEADLINE, "operation did not complete");
        thread::yield_now();
    }
}

/// Progress `op` until `done` holds.
pub fn drive_until<O: Operation>(op: &mut O, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        op.progress().unwrap();
        assert!(start.elapsed() < DEADLINE, "condition never held");
        thread::yield_now();
    }
}

/// Counts workers that reached a point; everyone keeps progressing until
/// all have.
#[derive(Default)]
pub struct Rendezvous(AtomicUsize);

impl Rendezvous {
    pub fn arrive(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    pub fn arrived(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}
