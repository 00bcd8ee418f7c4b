use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace};

use super::arena::EdgeShared;
use super::in_message::{ReceiveContext, WorkerInbound};
use super::out_message::{OutMessage, SendContext};
use super::{EdgeSpec, Offer, Payload, RoutingParameters, Sink};
use crate::config::CommConfig;
use crate::context::CommContext;
use crate::error::{CommError, Result};
use crate::protocol::codec::Codec;
use crate::transport::{BufferPool, Channel, ChannelListener};
use crate::types::{EdgeId, Flags, OperationKind, TaskId, WorkerId};

/// Which pending queue of a source a send joins. Values forwarded by a
/// partial stage never wait behind the same task's own sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Lane {
    User,
    Forward,
}

/// The engine of one edge on one worker.
///
/// Owns the edge's send and receive pools, the per-source pending-send
/// queues and the per-worker receive state. Drive it with
/// [`progress`](Self::progress) until [`is_complete`](Self::is_complete).
pub struct ChannelOperation<T> {
    edge: EdgeId,
    kind: OperationKind,
    config: Arc<CommConfig>,
    channel: Arc<dyn Channel>,
    codec: Arc<dyn Codec<T>>,
    shared: Arc<EdgeShared>,
    receive_pool: Arc<BufferPool>,
    local_sources: BTreeSet<TaskId>,
    receive_workers: BTreeSet<WorkerId>,
    receive_targets: HashMap<i32, TaskId>,
    pending: BTreeMap<(TaskId, Lane), VecDeque<OutMessage<T>>>,
    /// Remote worker to the pending queue whose message is part-way
    /// through the link. Chunks of two messages never interleave on a link.
    links: HashMap<WorkerId, (TaskId, Lane)>,
    inbound: BTreeMap<WorkerId, WorkerInbound<T>>,
    closed: bool,
}

impl<T: Clone + Send + 'static> ChannelOperation<T> {
    pub fn new(ctx: &CommContext, spec: EdgeSpec, codec: Arc<dyn Codec<T>>) -> Result<Self> {
        let config = Arc::clone(&ctx.config);
        config.validate()?;
        let channel = Arc::clone(&ctx.channel);

        let send_pool = BufferPool::with_factory(
            "send",
            config.send_buffer_count,
            config.buffer_size,
            |size| channel.create_buffer(size),
        );
        let receive_pool = BufferPool::with_factory(
            "receive",
            config.receive_buffer_count,
            config.buffer_size,
            |size| channel.create_buffer(size),
        );
        let shared = Arc::new(EdgeShared::new(spec.edge, send_pool));

        let receive_workers: BTreeSet<WorkerId> = spec
            .receive_workers
            .iter()
            .copied()
            .filter(|w| *w != ctx.worker())
            .collect();
        for &w in &receive_workers {
            let listener: Arc<dyn ChannelListener> = shared.clone();
            channel.receive_message(w, spec.edge, listener, Arc::clone(&receive_pool))?;
        }

        debug!(
            edge = spec.edge,
            kind = %spec.kind,
            worker = ctx.worker(),
            sources = spec.local_sources.len(),
            receive_workers = receive_workers.len(),
            "edge initialized"
        );

        Ok(Self {
            edge: spec.edge,
            kind: spec.kind,
            config,
            channel,
            codec,
            shared,
            receive_pool,
            local_sources: spec.local_sources.into_iter().collect(),
            receive_workers,
            receive_targets: spec.receive_targets,
            pending: BTreeMap::new(),
            links: HashMap::new(),
            inbound: BTreeMap::new(),
            closed: false,
        })
    }

    pub fn edge(&self) -> EdgeId {
        self.edge
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    pub fn send_pool(&self) -> &Arc<BufferPool> {
        self.shared.send_pool()
    }

    pub fn receive_pool(&self) -> &Arc<BufferPool> {
        &self.receive_pool
    }

    fn lane(&self, source: TaskId, flags: Flags) -> Result<Lane> {
        if flags.contains(Flags::ORIGIN_PARTIAL) {
            Ok(Lane::Forward)
        } else if self.local_sources.contains(&source) {
            Ok(Lane::User)
        } else {
            Err(CommError::UnknownSource {
                edge: self.edge,
                source_task: source,
            })
        }
    }

    /// Whether a send from `source` with `flags` would be queued now.
    pub fn can_send(&self, source: TaskId, flags: Flags) -> Result<bool> {
        let lane = self.lane(source, flags)?;
        Ok(self
            .pending
            .get(&(source, lane))
            .is_none_or(|q| q.len() < self.config.send_pending_max))
    }

    /// Queue `payload` from `source`.
    ///
    /// Returns `Ok(false)` if the source's pending queue is full, dropping
    /// `payload`; check [`can_send`](Self::can_send) first to keep it.
    /// Sends flagged `ORIGIN_PARTIAL` come from partial stages and may use
    /// any source id; all others must come from a local source.
    pub fn send(
        &mut self,
        source: TaskId,
        payload: Payload<T>,
        flags: Flags,
        params: RoutingParameters,
    ) -> Result<bool> {
        let lane = self.lane(source, flags)?;
        let queue = self.pending.entry((source, lane)).or_default();
        if queue.len() >= self.config.send_pending_max {
            trace!(edge = self.edge, source, "pending-send queue full");
            return Ok(false);
        }
        queue.push_back(OutMessage::new(source, payload, flags, params));
        Ok(true)
    }

    /// One bounded unit of receive and send work, delivering to `sink`.
    /// Returns whether anything moved.
    pub fn progress(&mut self, sink: &mut dyn Sink<T>) -> Result<bool> {
        self.channel.progress()?;
        self.shared.check_fatal()?;
        let budget = self.config.progress_batch;
        let mut progressed = false;

        for (worker, buffer) in self.shared.take_inbox() {
            if !self.receive_workers.contains(&worker) {
                self.receive_pool.release(buffer)?;
                return Err(CommError::UnexpectedSender {
                    edge: self.edge,
                    worker,
                });
            }
            self.inbound
                .entry(worker)
                .or_insert_with(|| WorkerInbound::new(worker))
                .push(buffer);
            progressed = true;
        }

        let rx = ReceiveContext {
            edge: self.edge,
            codec: self.codec.as_ref(),
            pool: &self.receive_pool,
            targets: &self.receive_targets,
            ready_max: self.config.receive_pending_max,
        };
        for inbound in self.inbound.values_mut() {
            progressed |= inbound.process(&rx, budget)?;
            while let Some(delivery) = inbound.pop_ready() {
                match sink.on_message(delivery)? {
                    Offer::Accepted => progressed = true,
                    Offer::Refused(back) => {
                        inbound.push_back_ready(back);
                        break;
                    }
                }
            }
        }

        let tx = SendContext {
            edge: self.edge,
            codec: self.codec.as_ref(),
            channel: self.channel.as_ref(),
            shared: &self.shared,
            max_buffers: self.config.max_buffers_per_message,
        };
        for (&key, queue) in self.pending.iter_mut() {
            let mut steps = 0;
            while steps < budget {
                let Some(head) = queue.front_mut() else {
                    break;
                };
                let wire = head
                    .external()
                    .iter()
                    .all(|w| self.links.get(w).is_none_or(|owner| *owner == key));
                progressed |= head.step(&tx, sink, wire)?;
                if head.is_done() {
                    self.links.retain(|_, owner| *owner != key);
                    queue.pop_front();
                    steps += 1;
                    continue;
                }
                if wire && head.on_wire() {
                    for &w in head.external() {
                        self.links.insert(w, key);
                    }
                }
                break;
            }
        }

        Ok(progressed)
    }

    /// No send is queued and no transport send awaits completion.
    pub fn is_complete(&self) -> bool {
        self.pending.values().all(VecDeque::is_empty) && self.shared.arena().live() == 0
    }

    /// Work is queued on either the send or the receive side.
    pub fn has_pending(&self) -> bool {
        !self.is_complete() || self.inbound.values().any(|i| !i.is_idle())
    }

    /// Deregister the edge's receives and return held receive buffers.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.channel.release_receive(self.edge);
        for inbound in self.inbound.values_mut() {
            inbound.release(&self.receive_pool)?;
        }
        self.closed = true;
        debug!(edge = self.edge, kind = %self.kind, "edge closed");
        Ok(())
    }

    /// Prepare for another round of sends. Fails while work is in flight.
    pub fn reset(&mut self) -> Result<()> {
        if self.has_pending() {
            return Err(CommError::OperationBusy {
                edge: self.edge,
                operation: self.kind.name(),
            });
        }
        self.pending.clear();
        self.links.clear();
        self.inbound.clear();
        Ok(())
    }
}
