//! In-process fabric connecting workers of one process.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{trace, warn};

use super::{BufferPool, Channel, ChannelListener, ChannelMessage, SendHandle};
use crate::error::{CommError, Result};
use crate::types::{EdgeId, WorkerId};

/// Frames a link holds before rejecting sends.
pub const DEFAULT_LINK_CAPACITY: usize = 64;

type LinkKey = (WorkerId, WorkerId, EdgeId);

struct Fabric {
    workers: usize,
    link_capacity: usize,
    links: Mutex<HashMap<LinkKey, VecDeque<Vec<u8>>>>,
}

/// Shared fabric; hand one [`LocalChannel`] to each worker.
#[derive(Clone)]
pub struct LocalNetwork {
    fabric: Arc<Fabric>,
}

impl LocalNetwork {
    pub fn new(workers: usize) -> Self {
        Self::with_link_capacity(workers, DEFAULT_LINK_CAPACITY)
    }

    /// `link_capacity` bounds the frames queued per (from, to, edge).
    pub fn with_link_capacity(workers: usize, link_capacity: usize) -> Self {
        Self {
            fabric: Arc::new(Fabric {
                workers,
                link_capacity: link_capacity.max(1),
                links: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn channel(&self, worker: WorkerId) -> Arc<LocalChannel> {
        Arc::new(LocalChannel {
            worker,
            fabric: Arc::clone(&self.fabric),
            state: Mutex::new(LocalState::default()),
        })
    }

    /// Frames sent but not yet picked up by a receiver.
    pub fn frames_in_flight(&self) -> usize {
        let links = self
            .fabric
            .links
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        links.values().map(VecDeque::len).sum()
    }
}

struct Completion {
    listener: Arc<dyn ChannelListener>,
    edge: EdgeId,
    handle: SendHandle,
}

struct Registration {
    listener: Arc<dyn ChannelListener>,
    pool: Arc<BufferPool>,
}

#[derive(Default)]
struct LocalState {
    completions: VecDeque<Completion>,
    receives: BTreeMap<(WorkerId, EdgeId), Registration>,
}

pub struct LocalChannel {
    worker: WorkerId,
    fabric: Arc<Fabric>,
    state: Mutex<LocalState>,
}

impl LocalChannel {
    fn state(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn pop_frame(&self, from: WorkerId, edge: EdgeId) -> Option<Vec<u8>> {
        let mut links = self
            .fabric
            .links
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        links.get_mut(&(from, self.worker, edge))?.pop_front()
    }
}

impl Channel for LocalChannel {
    fn worker(&self) -> WorkerId {
        self.worker
    }

    fn send_message(
        &self,
        target: WorkerId,
        edge: EdgeId,
        message: &ChannelMessage,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<bool> {
        if target < 0 || target as usize >= self.fabric.workers {
            return Err(CommError::transport(format!(
                "worker {target} is not part of the local fabric"
            )));
        }
        {
            let mut links = self
                .fabric
                .links
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            let link = links.entry((self.worker, target, edge)).or_default();
            if !link.is_empty() && link.len() + message.buffers.len() > self.fabric.link_capacity
            {
                trace!(edge, from = self.worker, to = target, "local link full");
                return Ok(false);
            }
            link.extend(message.buffers.iter().map(|b| b.as_slice().to_vec()));
        }
        self.state().completions.push_back(Completion {
            listener,
            edge,
            handle: message.handle,
        });
        Ok(true)
    }

    fn receive_message(
        &self,
        from: WorkerId,
        edge: EdgeId,
        listener: Arc<dyn ChannelListener>,
        pool: Arc<BufferPool>,
    ) -> Result<()> {
        self.state()
            .receives
            .insert((from, edge), Registration { listener, pool });
        Ok(())
    }

    fn release_receive(&self, edge: EdgeId) {
        self.state().receives.retain(|(_, e), _| *e != edge);
        let mut links = self
            .fabric
            .links
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let dropped: usize = links
            .iter_mut()
            .filter(|((_, to, e), _)| *to == self.worker && *e == edge)
            .map(|(_, frames)| std::mem::take(frames).len())
            .sum();
        if dropped > 0 {
            warn!(edge, worker = self.worker, dropped, "dropped undelivered frames");
        }
    }

    fn progress(&self) -> Result<()> {
        // Listeners run without our lock held; they may call back into us.
        let (completions, receives) = {
            let mut state = self.state();
            let completions = std::mem::take(&mut state.completions);
            let receives: Vec<_> = state
                .receives
                .iter()
                .map(|(&(from, edge), r)| (from, edge, r.listener.clone(), r.pool.clone()))
                .collect();
            (completions, receives)
        };

        for c in completions {
            c.listener.on_send_complete(c.edge, c.handle);
        }

        for (from, edge, listener, pool) in receives {
            while let Some(mut buffer) = pool.acquire() {
                let Some(frame) = self.pop_frame(from, edge) else {
                    pool.release(buffer)?;
                    break;
                };
                if frame.len() > buffer.capacity() {
                    pool.release(buffer)?;
                    return Err(CommError::transport(format!(
                        "frame of {} bytes from worker {from} exceeds receive buffer of {}",
                        frame.len(),
                        pool.buffer_size()
                    )));
                }
                buffer.append(&frame);
                listener.on_receive_complete(from, edge, buffer);
            }
        }
        Ok(())
    }
}
