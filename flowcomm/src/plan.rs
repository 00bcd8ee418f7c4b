//! Static placement of logical tasks on workers, groups and machines.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{CommError, Result};
use crate::types::{GroupId, NodeId, TaskId, WorkerId};

/// Immutable task placement shared by every router and operator of a job.
///
/// Lookups for ids the plan does not know return `None`.
#[derive(Debug, Clone)]
pub struct LogicalPlan {
    this_worker: WorkerId,
    workers: BTreeSet<WorkerId>,
    task_worker: HashMap<TaskId, WorkerId>,
    worker_tasks: BTreeMap<WorkerId, Vec<TaskId>>,
    worker_group: HashMap<WorkerId, GroupId>,
    group_workers: BTreeMap<GroupId, Vec<WorkerId>>,
    worker_node: HashMap<WorkerId, NodeId>,
    node_tasks: BTreeMap<NodeId, Vec<TaskId>>,
}

impl LogicalPlan {
    pub fn builder(this_worker: WorkerId) -> LogicalPlanBuilder {
        LogicalPlanBuilder {
            this_worker,
            workers: BTreeSet::from([this_worker]),
            task_worker: BTreeMap::new(),
            worker_group: HashMap::new(),
            worker_node: HashMap::new(),
        }
    }

    /// `workers` workers, each on its own machine, hosting `tasks_per_worker`
    /// consecutive task ids starting at `worker * tasks_per_worker`.
    pub fn uniform(workers: usize, tasks_per_worker: usize, this_worker: WorkerId) -> Result<Self> {
        let mut builder = Self::builder(this_worker);
        for w in 0..workers as WorkerId {
            let first = w * tasks_per_worker as TaskId;
            builder = builder.tasks(w, first..first + tasks_per_worker as TaskId);
        }
        builder.build()
    }

    pub fn this_worker(&self) -> WorkerId {
        self.this_worker
    }

    pub fn workers(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.workers.iter().copied()
    }

    pub fn worker_of(&self, task: TaskId) -> Option<WorkerId> {
        self.task_worker.get(&task).copied()
    }

    pub fn is_local(&self, task: TaskId) -> bool {
        self.worker_of(task) == Some(self.this_worker)
    }

    /// Tasks hosted by `worker`, ascending.
    pub fn tasks_of(&self, worker: WorkerId) -> &[TaskId] {
        self.worker_tasks.get(&worker).map_or(&[], Vec::as_slice)
    }

    pub fn local_tasks(&self) -> &[TaskId] {
        self.tasks_of(self.this_worker)
    }

    pub fn group_of(&self, worker: WorkerId) -> Option<GroupId> {
        self.worker_group.get(&worker).copied()
    }

    pub fn workers_in_group(&self, group: GroupId) -> &[WorkerId] {
        self.group_workers.get(&group).map_or(&[], Vec::as_slice)
    }

    pub fn node_of(&self, worker: WorkerId) -> Option<NodeId> {
        self.worker_node.get(&worker).copied()
    }

    /// Tasks placed on machine `node`, ascending.
    pub fn tasks_on_node(&self, node: NodeId) -> &[TaskId] {
        self.node_tasks.get(&node).map_or(&[], Vec::as_slice)
    }
}

pub struct LogicalPlanBuilder {
    this_worker: WorkerId,
    workers: BTreeSet<WorkerId>,
    task_worker: BTreeMap<TaskId, Vec<WorkerId>>,
    worker_group: HashMap<WorkerId, GroupId>,
    worker_node: HashMap<WorkerId, NodeId>,
}

impl LogicalPlanBuilder {
    /// Declare a worker that may host no tasks.
    pub fn worker(mut self, worker: WorkerId) -> Self {
        self.workers.insert(worker);
        self
    }

    pub fn task(mut self, task: TaskId, worker: WorkerId) -> Self {
        self.workers.insert(worker);
        self.task_worker.entry(task).or_default().push(worker);
        self
    }

    pub fn tasks(mut self, worker: WorkerId, tasks: impl IntoIterator<Item = TaskId>) -> Self {
        for t in tasks {
            self = self.task(t, worker);
        }
        self
    }

    /// Defaults to group 0.
    pub fn group(mut self, worker: WorkerId, group: GroupId) -> Self {
        self.workers.insert(worker);
        self.worker_group.insert(worker, group);
        self
    }

    /// Defaults to a machine of its own (node id equal to the worker id).
    pub fn node(mut self, worker: WorkerId, node: NodeId) -> Self {
        self.workers.insert(worker);
        self.worker_node.insert(worker, node);
        self
    }

    pub fn build(self) -> Result<LogicalPlan> {
        let mut task_worker = HashMap::with_capacity(self.task_worker.len());
        let mut worker_tasks: BTreeMap<WorkerId, Vec<TaskId>> = BTreeMap::new();
        for (task, hosts) in &self.task_worker {
            let first = hosts[0];
            if hosts.iter().any(|w| *w != first) {
                return Err(CommError::InvalidPlan(format!(
                    "task {task} is placed on more than one worker: {hosts:?}"
                )));
            }
            task_worker.insert(*task, first);
            worker_tasks.entry(first).or_default().push(*task);
        }

        let mut worker_group = self.worker_group;
        let mut worker_node = self.worker_node;
        let mut group_workers: BTreeMap<GroupId, Vec<WorkerId>> = BTreeMap::new();
        let mut node_tasks: BTreeMap<NodeId, Vec<TaskId>> = BTreeMap::new();
        for &w in &self.workers {
            if w < 0 {
                return Err(CommError::InvalidPlan(format!("negative worker id {w}")));
            }
            let group = *worker_group.entry(w).or_insert(0);
            group_workers.entry(group).or_default().push(w);
            let node = *worker_node.entry(w).or_insert(w as NodeId);
            let tasks = worker_tasks.get(&w).map_or(&[][..], Vec::as_slice);
            node_tasks.entry(node).or_default().extend_from_slice(tasks);
        }
        for tasks in node_tasks.values_mut() {
            tasks.sort_unstable();
        }

        Ok(LogicalPlan {
            this_worker: self.this_worker,
            workers: self.workers,
            task_worker,
            worker_tasks,
            worker_group,
            group_workers,
            worker_node,
            node_tasks,
        })
    }
}
