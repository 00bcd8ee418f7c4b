//! Outbound envelope and its send state machine.

use std::sync::Arc;

use tracing::trace;

use super::arena::EdgeShared;
use super::{Delivery, Offer, Payload, RoutingParameters, Sink};
use crate::error::Result;
use crate::protocol::codec::Codec;
use crate::protocol::framing::write_frame;
use crate::protocol::header::{FRAME_PREFIX, MessageHeader, SINGLE_OBJECT};
use crate::transport::{Channel, ChannelListener, ChannelMessage};
use crate::types::{EdgeId, Flags, TaskId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutState {
    /// Handing the payload to same-worker destinations.
    Internal,
    /// Bytes remain that are not yet in wire buffers.
    Serialize,
    /// A built transport message awaits acceptance by external targets.
    Sending,
    Done,
}

/// Everything a step needs from the owning edge.
pub(crate) struct SendContext<'a, T> {
    pub edge: EdgeId,
    pub codec: &'a dyn Codec<T>,
    pub channel: &'a dyn Channel,
    pub shared: &'a Arc<EdgeShared>,
    pub max_buffers: usize,
}

struct Chunk {
    message: ChannelMessage,
    next_target: usize,
}

pub(crate) struct OutMessage<T> {
    source: TaskId,
    flags: Flags,
    params: RoutingParameters,
    payload: Payload<T>,
    internal_done: usize,
    state: OutState,
    encoded: Vec<u8>,
    encoded_offset: usize,
    chunk: Option<Chunk>,
}

impl<T: Clone> OutMessage<T> {
    pub(crate) fn new(
        source: TaskId,
        payload: Payload<T>,
        flags: Flags,
        params: RoutingParameters,
    ) -> Self {
        Self {
            source,
            flags,
            params,
            payload,
            internal_done: 0,
            state: OutState::Internal,
            encoded: Vec::new(),
            encoded_offset: 0,
            chunk: None,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == OutState::Done
    }

    /// Whether the message has reached its wire phase and so holds the
    /// links to its remote workers until done.
    pub(crate) fn on_wire(&self) -> bool {
        matches!(self.state, OutState::Serialize | OutState::Sending)
    }

    pub(crate) fn external(&self) -> &[WorkerId] {
        &self.params.external
    }

    /// Advance as far as possible. Returns whether anything moved.
    ///
    /// With `wire` false the message stops before its first wire chunk;
    /// another message is still mid-way through a link it needs.
    pub(crate) fn step(
        &mut self,
        cx: &SendContext<'_, T>,
        sink: &mut dyn Sink<T>,
        wire: bool,
    ) -> Result<bool> {
        let mut progressed = false;
        loop {
            let moved = match self.state {
                OutState::Internal => self.send_internally(cx, sink)?,
                OutState::Serialize | OutState::Sending if !wire => return Ok(progressed),
                OutState::Serialize => self.serialize(cx)?,
                OutState::Sending => self.send_externally(cx)?,
                OutState::Done => return Ok(progressed),
            };
            if !moved {
                return Ok(progressed);
            }
            progressed = true;
        }
    }

    fn send_internally(&mut self, cx: &SendContext<'_, T>, sink: &mut dyn Sink<T>) -> Result<bool> {
        let mut moved = false;
        while self.internal_done < self.params.internal.len() {
            let last = self.internal_done + 1 == self.params.internal.len()
                && self.params.external.is_empty();
            let payload = if last {
                std::mem::replace(&mut self.payload, Payload::Empty)
            } else {
                self.payload.clone()
            };
            let delivery = Delivery {
                source: self.source,
                target: self.params.internal[self.internal_done],
                path: self.params.path,
                flags: self.flags,
                payload,
                remote: false,
            };
            match sink.on_message(delivery)? {
                Offer::Accepted => {
                    self.internal_done += 1;
                    moved = true;
                }
                Offer::Refused(back) => {
                    if last {
                        self.payload = back.payload;
                    }
                    return Ok(moved);
                }
            }
        }

        if self.params.external.is_empty() {
            self.state = OutState::Done;
        } else {
            encode_message(
                cx.codec,
                self.source,
                self.flags,
                self.params.path,
                &self.payload,
                &mut self.encoded,
            )?;
            self.payload = Payload::Empty;
            self.state = OutState::Serialize;
        }
        Ok(true)
    }

    fn serialize(&mut self, cx: &SendContext<'_, T>) -> Result<bool> {
        let pool = cx.shared.send_pool();
        let mut buffers = Vec::new();
        while buffers.len() < cx.max_buffers && self.encoded_offset < self.encoded.len() {
            let Some(mut buffer) = pool.acquire() else {
                break;
            };
            self.encoded_offset += buffer.append(&self.encoded[self.encoded_offset..]);
            buffers.push(buffer);
        }
        if buffers.is_empty() {
            trace!(edge = cx.edge, source = self.source, "send pool empty");
            return Ok(false);
        }
        let handle = cx.shared.arena().allocate();
        trace!(
            edge = cx.edge,
            source = self.source,
            buffers = buffers.len(),
            partial = self.encoded_offset < self.encoded.len(),
            "serialized chunk"
        );
        self.chunk = Some(Chunk {
            message: ChannelMessage { handle, buffers },
            next_target: 0,
        });
        self.state = OutState::Sending;
        Ok(true)
    }

    fn send_externally(&mut self, cx: &SendContext<'_, T>) -> Result<bool> {
        let Some(chunk) = self.chunk.as_mut() else {
            self.state = OutState::Done;
            return Ok(true);
        };
        let handle = chunk.message.handle;
        let listener: Arc<dyn ChannelListener> = cx.shared.clone();
        let mut moved = false;

        while chunk.next_target < self.params.external.len() {
            let target = self.params.external[chunk.next_target];
            cx.shared.arena().reserve(cx.edge, handle)?;
            let accepted =
                cx.channel
                    .send_message(target, cx.edge, &chunk.message, listener.clone());
            match accepted {
                Ok(true) => {
                    chunk.next_target += 1;
                    moved = true;
                }
                Ok(false) => {
                    cx.shared.arena().unreserve(cx.edge, handle)?;
                    trace!(edge = cx.edge, target, "transport rejected send");
                    return Ok(moved);
                }
                Err(e) => {
                    cx.shared.arena().unreserve(cx.edge, handle)?;
                    return Err(e);
                }
            }
        }

        let buffers = std::mem::take(&mut chunk.message.buffers);
        self.chunk = None;
        let released = cx.shared.arena().seal(cx.edge, handle, buffers)?;
        if let Some(buffers) = released {
            cx.shared.release_send(buffers)?;
        }
        self.state = if self.encoded_offset < self.encoded.len() {
            OutState::Serialize
        } else {
            self.encoded = Vec::new();
            OutState::Done
        };
        Ok(true)
    }
}

/// Write header and length-prefixed frames for `payload` into `out`.
pub(crate) fn encode_message<T>(
    codec: &dyn Codec<T>,
    source: TaskId,
    flags: Flags,
    path: i32,
    payload: &Payload<T>,
    out: &mut Vec<u8>,
) -> Result<()> {
    let count = match payload {
        Payload::Single(_) | Payload::Marker(_) => SINGLE_OBJECT,
        Payload::Batch(values) => values.len() as i32,
        Payload::Empty => 0,
    };
    let flags = match payload {
        Payload::Marker(_) => flags | Flags::SYNC_BARRIER,
        _ => flags,
    };
    out.extend_from_slice(
        &MessageHeader {
            source,
            flags,
            destination: path,
            count,
        }
        .to_bytes(),
    );

    match payload {
        Payload::Single(value) => write_frame_with(out, |o| codec.encode(value, o))?,
        Payload::Batch(values) => {
            for value in values {
                write_frame_with(out, |o| codec.encode(value, o))?;
            }
        }
        Payload::Marker(bytes) => write_frame(out, bytes),
        Payload::Empty => {}
    }
    Ok(())
}

/// Encode one frame in place, patching its length prefix afterwards.
fn write_frame_with(out: &mut Vec<u8>, encode: impl FnOnce(&mut Vec<u8>) -> Result<()>) -> Result<()> {
    let at = out.len();
    out.extend_from_slice(&[0u8; FRAME_PREFIX]);
    encode(out)?;
    let len = (out.len() - at - FRAME_PREFIX) as u32;
    out[at..at + FRAME_PREFIX].copy_from_slice(&len.to_le_bytes());
    Ok(())
}
