//! Degree-bounded reduction/broadcast trees over worker placement.
//!
//! Every participating worker contributes one representative task: the
//! root if the worker hosts it, otherwise its smallest member. Workers on
//! one machine form an intra-node tree under the machine's head worker, and
//! machine heads form the inter-node tree rooted at the root's machine.
//! Children are ordered by representative id, so identical inputs always
//! produce identical trees.

use std::collections::{BTreeMap, HashMap};

use crate::error::{CommError, Result};
use crate::plan::LogicalPlan;
use crate::types::{NodeId, TaskId, WorkerId};

#[derive(Debug, Clone)]
pub struct TreeRouter {
    root: TaskId,
    root_worker: WorkerId,
    this_worker: WorkerId,
    reps: BTreeMap<WorkerId, TaskId>,
    members: BTreeMap<WorkerId, Vec<TaskId>>,
    parent: HashMap<WorkerId, WorkerId>,
    children: HashMap<WorkerId, Vec<WorkerId>>,
}

impl TreeRouter {
    pub fn new(
        plan: &LogicalPlan,
        root: TaskId,
        members: &[TaskId],
        inter_node_degree: usize,
        intra_node_degree: usize,
    ) -> Result<Self> {
        if inter_node_degree == 0 || intra_node_degree == 0 {
            return Err(CommError::InvalidConfig("tree degree must be non-zero".into()));
        }
        let locate = |task: TaskId| {
            plan.worker_of(task)
                .ok_or_else(|| CommError::InvalidPlan(format!("task {task} has no worker")))
        };

        let root_worker = locate(root)?;
        let mut by_worker: BTreeMap<WorkerId, Vec<TaskId>> = BTreeMap::new();
        by_worker.entry(root_worker).or_default();
        for &m in members {
            by_worker.entry(locate(m)?).or_default().push(m);
        }
        for tasks in by_worker.values_mut() {
            tasks.sort_unstable();
            tasks.dedup();
        }

        let mut reps = BTreeMap::new();
        for (&w, tasks) in &by_worker {
            let rep = if w == root_worker {
                root
            } else {
                // non-root workers are only present through their members
                match tasks.first() {
                    Some(&t) => t,
                    None => continue,
                }
            };
            reps.insert(w, rep);
        }

        let order = |w: &WorkerId| (*w != root_worker, reps[w]);

        let mut by_node: BTreeMap<NodeId, Vec<WorkerId>> = BTreeMap::new();
        for &w in reps.keys() {
            let node = plan.node_of(w).unwrap_or(w as NodeId);
            by_node.entry(node).or_default().push(w);
        }
        for workers in by_node.values_mut() {
            workers.sort_by_key(order);
        }
        let mut heads: Vec<WorkerId> = by_node.values().map(|ws| ws[0]).collect();
        heads.sort_by_key(order);

        let mut parent = HashMap::new();
        for workers in by_node.values() {
            for i in 1..workers.len() {
                parent.insert(workers[i], workers[(i - 1) / intra_node_degree]);
            }
        }
        for i in 1..heads.len() {
            parent.insert(heads[i], heads[(i - 1) / inter_node_degree]);
        }

        let mut children: HashMap<WorkerId, Vec<WorkerId>> = HashMap::new();
        for (&child, &p) in &parent {
            children.entry(p).or_default().push(child);
        }
        for list in children.values_mut() {
            list.sort_by_key(|w| reps[w]);
        }

        Ok(Self {
            root,
            root_worker,
            this_worker: plan.this_worker(),
            reps,
            members: by_worker,
            parent,
            children,
        })
    }

    pub fn root(&self) -> TaskId {
        self.root
    }

    pub fn root_worker(&self) -> WorkerId {
        self.root_worker
    }

    /// Whether this worker hosts the root, i.e. is the last receiver of an
    /// upward pass.
    pub fn is_last_receiver(&self) -> bool {
        self.this_worker == self.root_worker
    }

    /// Participating workers, ascending.
    pub fn workers(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.reps.keys().copied()
    }

    /// This worker's representative task, if it takes part in the tree.
    pub fn main_task(&self) -> Option<TaskId> {
        self.main_task_of(self.this_worker)
    }

    pub fn main_task_of(&self, worker: WorkerId) -> Option<TaskId> {
        self.reps.get(&worker).copied()
    }

    /// Members hosted by this worker, ascending.
    pub fn local_members(&self) -> &[TaskId] {
        self.members.get(&self.this_worker).map_or(&[], Vec::as_slice)
    }

    /// In-process hop for a local member: always the local representative.
    pub fn internal_target(&self, source: TaskId) -> Option<TaskId> {
        if self.local_members().binary_search(&source).is_ok()
            || (source == self.root && self.is_last_receiver())
        {
            self.main_task()
        } else {
            None
        }
    }

    pub fn parent(&self) -> Option<(WorkerId, TaskId)> {
        self.parent_of(self.this_worker)
    }

    pub fn parent_of(&self, worker: WorkerId) -> Option<(WorkerId, TaskId)> {
        let p = *self.parent.get(&worker)?;
        Some((p, self.reps[&p]))
    }

    /// Direct child workers with their representatives, ordered by
    /// representative id.
    pub fn children(&self) -> Vec<(WorkerId, TaskId)> {
        self.children_of(self.this_worker)
    }

    pub fn children_of(&self, worker: WorkerId) -> Vec<(WorkerId, TaskId)> {
        self.children
            .get(&worker)
            .map(|ws| ws.iter().map(|w| (*w, self.reps[w])).collect())
            .unwrap_or_default()
    }

    /// Members hosted anywhere below this worker, ascending.
    pub fn all_children(&self) -> Vec<TaskId> {
        let mut out = Vec::new();
        let mut stack: Vec<WorkerId> = self
            .children
            .get(&self.this_worker)
            .cloned()
            .unwrap_or_default();
        while let Some(w) = stack.pop() {
            if let Some(tasks) = self.members.get(&w) {
                out.extend_from_slice(tasks);
            }
            if let Some(kids) = self.children.get(&w) {
                stack.extend_from_slice(kids);
            }
        }
        out.sort_unstable();
        out
    }

    /// Ids the representative receives from on an upward pass: local
    /// members plus the representatives of direct child workers.
    pub fn upstream(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.local_members().to_vec();
        ids.extend(self.children().into_iter().map(|(_, rep)| rep));
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Remote workers that send to this worker on an upward pass.
    pub fn receive_workers_up(&self) -> Vec<WorkerId> {
        self.children().into_iter().map(|(w, _)| w).collect()
    }

    /// Remote workers that send to this worker on a downward pass.
    pub fn receive_workers_down(&self) -> Vec<WorkerId> {
        self.parent().map(|(w, _)| w).into_iter().collect()
    }
}
