//! Outbound buffer ownership shared with transport callbacks.
//!
//! Every transport message built for an edge gets a slot in the edge's
//! [`SendArena`]. The slot counts sends the transport accepted but has not
//! completed. Once the sender has dispatched to every target it seals the
//! slot with the message's buffers; they return to the send pool when the
//! count reaches zero, whichever happens last.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, trace};

use crate::error::{CommError, Result};
use crate::transport::{BufferPool, ChannelListener, DataBuffer, SendHandle};
use crate::types::{EdgeId, WorkerId};

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    live: bool,
    outstanding: u32,
    sealed: Option<Vec<DataBuffer>>,
}

#[derive(Debug, Default)]
pub(crate) struct SendArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl SendArena {
    pub(crate) fn allocate(&mut self) -> SendHandle {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.live = true;
        slot.outstanding = 0;
        slot.sealed = None;
        self.live += 1;
        SendHandle {
            index,
            generation: slot.generation,
        }
    }

    fn slot(&mut self, edge: EdgeId, handle: SendHandle) -> Result<&mut Slot> {
        match self.slots.get_mut(handle.index as usize) {
            Some(slot) if slot.live && slot.generation == handle.generation => Ok(slot),
            _ => Err(CommError::ReleaseUnreferenced {
                edge,
                index: handle.index,
            }),
        }
    }

    /// Count a send about to be handed to the transport.
    pub(crate) fn reserve(&mut self, edge: EdgeId, handle: SendHandle) -> Result<()> {
        self.slot(edge, handle)?.outstanding += 1;
        Ok(())
    }

    /// Undo a reservation the transport rejected.
    pub(crate) fn unreserve(&mut self, edge: EdgeId, handle: SendHandle) -> Result<()> {
        let slot = self.slot(edge, handle)?;
        slot.outstanding = slot.outstanding.saturating_sub(1);
        Ok(())
    }

    /// Hand over the buffers once every target was dispatched. Returns them
    /// straight back if nothing is outstanding.
    pub(crate) fn seal(
        &mut self,
        edge: EdgeId,
        handle: SendHandle,
        buffers: Vec<DataBuffer>,
    ) -> Result<Option<Vec<DataBuffer>>> {
        let slot = self.slot(edge, handle)?;
        if slot.outstanding == 0 {
            self.free_slot(handle.index);
            return Ok(Some(buffers));
        }
        slot.sealed = Some(buffers);
        Ok(None)
    }

    /// A transport send finished. Returns the buffers to release, if this
    /// was the last reference to a sealed slot.
    pub(crate) fn complete(
        &mut self,
        edge: EdgeId,
        handle: SendHandle,
    ) -> Result<Option<Vec<DataBuffer>>> {
        let slot = self.slot(edge, handle)?;
        if slot.outstanding == 0 {
            return Err(CommError::ReleaseUnreferenced {
                edge,
                index: handle.index,
            });
        }
        slot.outstanding -= 1;
        if slot.outstanding > 0 || slot.sealed.is_none() {
            return Ok(None);
        }
        let buffers = slot.sealed.take();
        self.free_slot(handle.index);
        Ok(buffers)
    }

    fn free_slot(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.live = false;
        slot.outstanding = 0;
        self.free.push(index);
        self.live -= 1;
    }

    /// Slots still holding buffers or awaiting completions.
    pub(crate) fn live(&self) -> usize {
        self.live
    }
}

/// State of one edge reachable from transport callbacks.
pub(crate) struct EdgeShared {
    edge: EdgeId,
    send_pool: Arc<BufferPool>,
    arena: Mutex<SendArena>,
    inbox: Mutex<VecDeque<(WorkerId, DataBuffer)>>,
    fatal: Mutex<Option<CommError>>,
}

impl EdgeShared {
    pub(crate) fn new(edge: EdgeId, send_pool: Arc<BufferPool>) -> Self {
        Self {
            edge,
            send_pool,
            arena: Mutex::new(SendArena::default()),
            inbox: Mutex::new(VecDeque::new()),
            fatal: Mutex::new(None),
        }
    }

    pub(crate) fn send_pool(&self) -> &Arc<BufferPool> {
        &self.send_pool
    }

    pub(crate) fn arena(&self) -> MutexGuard<'_, SendArena> {
        self.arena.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn take_inbox(&self) -> VecDeque<(WorkerId, DataBuffer)> {
        std::mem::take(&mut *self.inbox.lock().unwrap_or_else(|p| p.into_inner()))
    }

    /// Surface an error raised inside a callback.
    pub(crate) fn check_fatal(&self) -> Result<()> {
        match self.fatal.lock().unwrap_or_else(|p| p.into_inner()).take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn park(&self, e: CommError) {
        error!(edge = self.edge, "fatal error in transport callback: {e}");
        let mut fatal = self.fatal.lock().unwrap_or_else(|p| p.into_inner());
        if fatal.is_none() {
            *fatal = Some(e);
        }
    }

    pub(crate) fn release_send(&self, buffers: Vec<DataBuffer>) -> Result<()> {
        for b in buffers {
            self.send_pool.release(b)?;
        }
        Ok(())
    }
}

impl ChannelListener for EdgeShared {
    fn on_send_complete(&self, edge: EdgeId, handle: SendHandle) {
        trace!(edge, index = handle.index, "send complete");
        let released = self.arena().complete(edge, handle);
        match released {
            Ok(Some(buffers)) => {
                if let Err(e) = self.release_send(buffers) {
                    self.park(e);
                }
            }
            Ok(None) => {}
            Err(e) => self.park(e),
        }
    }

    fn on_receive_complete(&self, from: WorkerId, edge: EdgeId, buffer: DataBuffer) {
        if edge != self.edge {
            self.park(CommError::malformed(
                self.edge,
                from,
                format!("buffer for edge {edge} delivered to edge {}", self.edge),
            ));
            return;
        }
        self.inbox
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back((from, buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffers(n: usize) -> Vec<DataBuffer> {
        (0..n).map(|_| DataBuffer::new(8)).collect()
    }

    #[test]
    fn test_seal_after_completions_releases_immediately() {
        let mut arena = SendArena::default();
        let h = arena.allocate();
        arena.reserve(0, h).unwrap();
        assert!(arena.complete(0, h).unwrap().is_none());
        let back = arena.seal(0, h, buffers(2)).unwrap();
        assert_eq!(back.map(|b| b.len()), Some(2));
        assert_eq!(arena.live(), 0);
    }

    #[test]
    fn test_last_completion_releases_sealed_buffers() {
        let mut arena = SendArena::default();
        let h = arena.allocate();
        arena.reserve(0, h).unwrap();
        arena.reserve(0, h).unwrap();
        assert!(arena.seal(0, h, buffers(3)).unwrap().is_none());
        assert!(arena.complete(0, h).unwrap().is_none());
        assert_eq!(arena.complete(0, h).unwrap().map(|b| b.len()), Some(3));
        assert_eq!(arena.live(), 0);
    }

    #[test]
    fn test_unreferenced_completion_is_fatal() {
        let mut arena = SendArena::default();
        let h = arena.allocate();
        assert!(matches!(
            arena.complete(4, h),
            Err(CommError::ReleaseUnreferenced { edge: 4, .. })
        ));
    }

    #[test]
    fn test_stale_handle_is_rejected() {
        let mut arena = SendArena::default();
        let h = arena.allocate();
        arena.seal(0, h, buffers(1)).unwrap();
        let again = arena.allocate();
        assert_eq!(again.index, h.index);
        assert_ne!(again.generation, h.generation);
        assert!(arena.reserve(0, h).is_err());
    }

    #[test]
    fn test_callback_errors_are_parked() {
        let pool = BufferPool::new("send", 2, 8);
        let shared = EdgeShared::new(1, pool);
        shared.on_send_complete(
            1,
            SendHandle {
                index: 9,
                generation: 1,
            },
        );
        assert!(matches!(
            shared.check_fatal(),
            Err(CommError::ReleaseUnreferenced { .. })
        ));
        assert!(shared.check_fatal().is_ok());
    }

    #[test]
    fn test_completion_returns_buffers_to_pool() {
        let pool = BufferPool::new("send", 2, 8);
        let shared = EdgeShared::new(0, pool.clone());
        let bufs: Vec<_> = (0..2).filter_map(|_| pool.acquire()).collect();
        let h = {
            let mut arena = shared.arena();
            let h = arena.allocate();
            arena.reserve(0, h).unwrap();
            assert!(arena.seal(0, h, bufs).unwrap().is_none());
            h
        };
        assert_eq!(pool.available(), 0);
        shared.on_send_complete(0, h);
        assert_eq!(pool.available(), 2);
        shared.check_fatal().unwrap();
    }
}
