//! Network channel abstraction and its implementations.
//!
//! A [`Channel`] moves whole transport messages (one or more wire buffers)
//! between workers per edge. It never blocks: a send it cannot take is
//! rejected with `Ok(false)`, and completions and received buffers are
//! handed to [`ChannelListener`]s from inside [`Channel::progress`].

pub mod buffer_pool;
pub mod local;
pub mod tcp;

use std::sync::Arc;

use crate::error::Result;
use crate::types::{EdgeId, WorkerId};

pub use buffer_pool::{BufferPool, DataBuffer};
pub use local::{LocalChannel, LocalNetwork};
pub use tcp::{TcpChannel, tcp_mesh_local, tcp_mesh_local_with_queue_depth};

/// Handle of an outbound message in its edge's send arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendHandle {
    pub index: u32,
    pub generation: u32,
}

/// One transport message: the buffers of (part of) one serialized message.
#[derive(Debug)]
pub struct ChannelMessage {
    pub handle: SendHandle,
    pub buffers: Vec<DataBuffer>,
}

pub trait ChannelListener: Send + Sync {
    /// A message accepted by `send_message` has left this worker.
    fn on_send_complete(&self, edge: EdgeId, handle: SendHandle);

    /// A buffer arrived; it was taken from the pool registered for
    /// `(from, edge)` and must be released back to it.
    fn on_receive_complete(&self, from: WorkerId, edge: EdgeId, buffer: DataBuffer);
}

pub trait Channel: Send + Sync {
    fn worker(&self) -> WorkerId;

    fn create_buffer(&self, size: usize) -> DataBuffer {
        DataBuffer::new(size)
    }

    /// Queue `message` for `target`. The bytes are copied before returning.
    /// `Ok(false)` means the transport is full and the caller must retry.
    fn send_message(
        &self,
        target: WorkerId,
        edge: EdgeId,
        message: &ChannelMessage,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<bool>;

    /// Deliver buffers arriving from `from` on `edge` to `listener`, copying
    /// each into a buffer drawn from `pool`. Arrivals wait while the pool is
    /// empty.
    fn receive_message(
        &self,
        from: WorkerId,
        edge: EdgeId,
        listener: Arc<dyn ChannelListener>,
        pool: Arc<BufferPool>,
    ) -> Result<()>;

    /// Drop every receive registration for `edge`.
    fn release_receive(&self, edge: EdgeId);

    fn progress(&self) -> Result<()>;
}
