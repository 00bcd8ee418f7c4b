//! Bounded per-upstream queues with end and barrier tracking.
//!
//! Every stage that combines input from several upstream tasks keeps one
//! FIFO per upstream. A barrier at the head of a queue holds that queue
//! back until every live upstream presents one, so values sent after a
//! barrier are never mixed with values sent before it elsewhere.

use std::collections::{BTreeMap, VecDeque};

use crate::error::{CommError, Result};
use crate::types::{EdgeId, TaskId};

#[derive(Debug)]
enum Item<M> {
    Data(M),
    Barrier(Vec<u8>),
    End,
}

#[derive(Debug)]
struct Queue<M> {
    items: VecDeque<Item<M>>,
    ended: bool,
}

impl<M> Queue<M> {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            ended: false,
        }
    }

    /// Reached its end marker: nothing more will come.
    fn exhausted(&self) -> bool {
        matches!(self.items.front(), Some(Item::End))
    }

    fn data_head(&self) -> bool {
        matches!(self.items.front(), Some(Item::Data(_)))
    }

    fn barrier_head(&self) -> bool {
        matches!(self.items.front(), Some(Item::Barrier(_)))
    }
}

/// What a stage may consume next.
#[derive(Debug, PartialEq)]
pub enum Round<M> {
    Values(Vec<M>),
    /// Every live upstream reached the same barrier.
    Aligned(Vec<u8>),
}

#[derive(Debug)]
pub struct UpstreamQueues<M> {
    edge: EdgeId,
    target: TaskId,
    capacity: usize,
    queues: BTreeMap<TaskId, Queue<M>>,
}

impl<M> UpstreamQueues<M> {
    pub fn new(edge: EdgeId, target: TaskId, upstream: &[TaskId], capacity: usize) -> Self {
        Self {
            edge,
            target,
            capacity: capacity.max(1),
            queues: upstream.iter().map(|&u| (u, Queue::new())).collect(),
        }
    }

    pub fn target(&self) -> TaskId {
        self.target
    }

    pub fn upstream(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.queues.keys().copied()
    }

    fn queue(&mut self, upstream: TaskId) -> Result<&mut Queue<M>> {
        self.queues
            .get_mut(&upstream)
            .ok_or(CommError::UnknownUpstream {
                edge: self.edge,
                target: self.target,
                upstream,
            })
    }

    /// Whether `upstream`'s queue has room for `incoming` more items.
    /// An empty queue takes any count, so a batch larger than the capacity
    /// is never refused forever. Unknown upstreams are fatal.
    pub fn accepts(&mut self, upstream: TaskId, incoming: usize) -> Result<bool> {
        let capacity = self.capacity;
        let len = self.queue(upstream)?.items.len();
        Ok(len == 0 || len + incoming <= capacity)
    }

    pub fn push(&mut self, upstream: TaskId, value: M) -> Result<()> {
        self.queue(upstream)?.items.push_back(Item::Data(value));
        Ok(())
    }

    pub fn extend(&mut self, upstream: TaskId, values: impl IntoIterator<Item = M>) -> Result<()> {
        let q = self.queue(upstream)?;
        q.items.extend(values.into_iter().map(Item::Data));
        Ok(())
    }

    pub fn barrier(&mut self, upstream: TaskId, marker: Vec<u8>) -> Result<()> {
        self.queue(upstream)?.items.push_back(Item::Barrier(marker));
        Ok(())
    }

    /// Record the end of `upstream`. A second end is fatal.
    pub fn finish(&mut self, upstream: TaskId) -> Result<()> {
        let (edge, target) = (self.edge, self.target);
        let q = self.queue(upstream)?;
        if q.ended {
            return Err(CommError::DuplicateFinish {
                edge,
                target,
                upstream,
            });
        }
        q.ended = true;
        q.items.push_back(Item::End);
        Ok(())
    }

    /// Every upstream ended and everything before its end was consumed.
    pub fn all_finished(&self) -> bool {
        self.queues.values().all(Queue::exhausted)
    }

    pub fn finished_count(&self) -> usize {
        self.queues.values().filter(|q| q.ended).count()
    }

    /// No data or barrier is waiting.
    pub fn is_drained(&self) -> bool {
        self.queues
            .values()
            .all(|q| q.items.is_empty() || q.exhausted())
    }

    fn try_align(&mut self) -> Option<Vec<u8>> {
        let live: Vec<&Queue<M>> = self.queues.values().filter(|q| !q.exhausted()).collect();
        if live.is_empty() || !live.iter().all(|q| q.barrier_head()) {
            return None;
        }
        let mut marker = None;
        for q in self.queues.values_mut().filter(|q| !q.exhausted()) {
            if let Some(Item::Barrier(m)) = q.items.pop_front() {
                marker.get_or_insert(m);
            }
        }
        marker
    }

    /// One value from every live upstream, or an aligned barrier.
    ///
    /// Waits until every live upstream has something queued. Upstreams
    /// blocked on a barrier sit the round out while the others catch up.
    pub fn take_round(&mut self) -> Option<Round<M>> {
        let live = self.queues.values().filter(|q| !q.exhausted());
        let mut any = false;
        for q in live {
            if q.items.is_empty() {
                return None;
            }
            any = true;
        }
        if !any {
            return None;
        }
        if let Some(marker) = self.try_align() {
            return Some(Round::Aligned(marker));
        }
        let mut values = Vec::new();
        for q in self.queues.values_mut() {
            if q.data_head()
                && let Some(Item::Data(v)) = q.items.pop_front()
            {
                values.push(v);
            }
        }
        Some(Round::Values(values))
    }

    /// Everything queued ahead of a barrier or end, or an aligned barrier.
    pub fn take_available(&mut self) -> Option<Round<M>> {
        let mut values = Vec::new();
        for q in self.queues.values_mut() {
            while q.data_head() {
                if let Some(Item::Data(v)) = q.items.pop_front() {
                    values.push(v);
                }
            }
        }
        if !values.is_empty() {
            return Some(Round::Values(values));
        }
        self.try_align().map(Round::Aligned)
    }

    /// Forget all queued input and ends.
    pub fn reset(&mut self) {
        for q in self.queues.values_mut() {
            q.items.clear();
            q.ended = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues() -> UpstreamQueues<i32> {
        UpstreamQueues::new(0, 9, &[1, 2], 4)
    }

    #[test]
    fn test_round_waits_for_every_upstream() {
        let mut q = queues();
        q.push(1, 10).unwrap();
        assert_eq!(q.take_round(), None);
        q.push(2, 20).unwrap();
        assert_eq!(q.take_round(), Some(Round::Values(vec![10, 20])));
        assert_eq!(q.take_round(), None);
    }

    #[test]
    fn test_barrier_after_data_on_both() {
        let mut q = queues();
        q.push(1, 1).unwrap();
        q.barrier(1, b"b".to_vec()).unwrap();
        q.push(1, 3).unwrap();
        q.push(2, 2).unwrap();
        q.barrier(2, b"b".to_vec()).unwrap();

        assert_eq!(q.take_round(), Some(Round::Values(vec![1, 2])));
        assert_eq!(q.take_round(), Some(Round::Aligned(b"b".to_vec())));
        assert_eq!(q.take_round(), None);
        q.push(2, 4).unwrap();
        assert_eq!(q.take_round(), Some(Round::Values(vec![3, 4])));
    }

    #[test]
    fn test_barrier_first_on_one_upstream_holds_it_back() {
        let mut q = queues();
        q.barrier(1, b"b".to_vec()).unwrap();
        q.push(1, 3).unwrap();
        q.push(2, 2).unwrap();
        q.barrier(2, b"b".to_vec()).unwrap();

        // data from 2 that preceded its barrier is consumed alone
        assert_eq!(q.take_round(), Some(Round::Values(vec![2])));
        assert_eq!(q.take_round(), Some(Round::Aligned(b"b".to_vec())));
        assert_eq!(q.take_round(), None);
        assert_eq!(q.take_available(), Some(Round::Values(vec![3])));
    }

    #[test]
    fn test_take_available_stops_at_barriers() {
        let mut q = queues();
        q.push(1, 1).unwrap();
        q.push(1, 2).unwrap();
        q.barrier(1, vec![]).unwrap();
        q.push(1, 5).unwrap();
        assert_eq!(q.take_available(), Some(Round::Values(vec![1, 2])));
        assert_eq!(q.take_available(), None);
        q.barrier(2, vec![]).unwrap();
        assert_eq!(q.take_available(), Some(Round::Aligned(vec![])));
        assert_eq!(q.take_available(), Some(Round::Values(vec![5])));
    }

    #[test]
    fn test_finish_tracking() {
        let mut q = queues();
        q.push(1, 1).unwrap();
        q.finish(1).unwrap();
        q.finish(2).unwrap();
        assert!(!q.all_finished());
        assert_eq!(q.take_available(), Some(Round::Values(vec![1])));
        assert!(q.all_finished());
        assert_eq!(q.finished_count(), 2);
        assert!(matches!(
            q.finish(2),
            Err(CommError::DuplicateFinish { upstream: 2, target: 9, .. })
        ));
    }

    #[test]
    fn test_ended_upstream_does_not_block_rounds() {
        let mut q = queues();
        q.finish(1).unwrap();
        q.push(2, 7).unwrap();
        assert_eq!(q.take_round(), Some(Round::Values(vec![7])));
    }

    #[test]
    fn test_capacity_and_unknown_upstream() {
        let mut q = UpstreamQueues::new(3, 9, &[1], 1);
        assert!(q.accepts(1, 1).unwrap());
        q.push(1, 0).unwrap();
        assert!(!q.accepts(1, 1).unwrap());
        assert!(matches!(
            q.accepts(5, 1),
            Err(CommError::UnknownUpstream { edge: 3, upstream: 5, .. })
        ));
    }

    #[test]
    fn test_batches_respect_capacity() {
        let mut q = queues();
        // larger than the capacity of 4, but the queue is empty
        assert!(q.accepts(1, 6).unwrap());
        q.extend(1, 0..6).unwrap();
        assert!(!q.accepts(1, 1).unwrap());
        assert_eq!(q.take_available(), Some(Round::Values((0..6).collect())));

        q.extend(2, [1, 2, 3]).unwrap();
        assert!(q.accepts(2, 1).unwrap());
        assert!(!q.accepts(2, 2).unwrap());
    }
}
