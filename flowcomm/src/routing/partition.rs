//! All-to-all routing for partition-family operators.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CommError, Result};
use crate::plan::LogicalPlan;
use crate::types::{TaskId, WorkerId};

/// Internal and external destinations of one local source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceRoutes {
    /// Destinations hosted on this worker.
    pub internal: Vec<TaskId>,
    /// Remote destinations and the worker hosting each.
    pub external: Vec<(TaskId, WorkerId)>,
}

/// Each worker hosting sources runs one partial stage, identified by its
/// smallest local source. Destinations count finished stages instead of
/// finished sources, so no cross-worker bookkeeping is needed.
#[derive(Debug, Clone)]
pub struct PartitionRouter {
    this_worker: WorkerId,
    sources: Vec<TaskId>,
    destinations: Vec<TaskId>,
    local_sources: Vec<TaskId>,
    local_destinations: Vec<TaskId>,
    destination_worker: BTreeMap<TaskId, WorkerId>,
    stages: BTreeMap<WorkerId, TaskId>,
    routes: BTreeMap<TaskId, SourceRoutes>,
}

impl PartitionRouter {
    pub fn new(plan: &LogicalPlan, sources: &[TaskId], destinations: &[TaskId]) -> Result<Self> {
        let this_worker = plan.this_worker();
        let locate = |task: TaskId| {
            plan.worker_of(task)
                .ok_or_else(|| CommError::InvalidPlan(format!("task {task} has no worker")))
        };
        if destinations.is_empty() {
            return Err(CommError::InvalidPlan("partition has no destinations".into()));
        }

        let sources: Vec<TaskId> = sources
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let destinations: Vec<TaskId> = destinations
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut stages: BTreeMap<WorkerId, TaskId> = BTreeMap::new();
        let mut local_sources = Vec::new();
        for &s in &sources {
            let w = locate(s)?;
            stages.entry(w).or_insert(s);
            if w == this_worker {
                local_sources.push(s);
            }
        }

        let mut destination_worker = BTreeMap::new();
        let mut local_destinations = Vec::new();
        for &d in &destinations {
            let w = locate(d)?;
            destination_worker.insert(d, w);
            if w == this_worker {
                local_destinations.push(d);
            }
        }

        let mut routes = BTreeMap::new();
        for &s in &local_sources {
            let mut r = SourceRoutes::default();
            for (&d, &w) in &destination_worker {
                if w == this_worker {
                    r.internal.push(d);
                } else {
                    r.external.push((d, w));
                }
            }
            routes.insert(s, r);
        }

        Ok(Self {
            this_worker,
            sources,
            destinations,
            local_sources,
            local_destinations,
            destination_worker,
            stages,
            routes,
        })
    }

    pub fn sources(&self) -> &[TaskId] {
        &self.sources
    }

    /// All destinations, ascending.
    pub fn destinations(&self) -> &[TaskId] {
        &self.destinations
    }

    pub fn local_sources(&self) -> &[TaskId] {
        &self.local_sources
    }

    pub fn local_destinations(&self) -> &[TaskId] {
        &self.local_destinations
    }

    pub fn routes(&self, source: TaskId) -> Option<&SourceRoutes> {
        self.routes.get(&source)
    }

    pub fn worker_of_destination(&self, destination: TaskId) -> Option<WorkerId> {
        self.destination_worker.get(&destination).copied()
    }

    pub fn is_internal(&self, destination: TaskId) -> bool {
        self.worker_of_destination(destination) == Some(self.this_worker)
    }

    /// Stage id of this worker's partial stage, if it hosts sources.
    pub fn stage(&self) -> Option<TaskId> {
        self.stages.get(&self.this_worker).copied()
    }

    /// Stage ids every destination waits for, ascending.
    pub fn expected_stages(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.stages.values().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Remote workers hosting at least one source.
    pub fn receive_workers(&self) -> Vec<WorkerId> {
        self.stages
            .keys()
            .copied()
            .filter(|w| *w != self.this_worker)
            .collect()
    }
}
