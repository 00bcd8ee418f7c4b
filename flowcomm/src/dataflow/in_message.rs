//! Inbound reconstruction of messages from wire buffers.
//!
//! Buffers from one worker arrive in send order and a buffer never holds
//! bytes of two messages. The first buffer of a message starts with the
//! header. A [`FrameScanner`] pass over every attached buffer finds where
//! the message ends without decoding; values are decoded as their frames
//! complete, and each buffer goes back to the receive pool as soon as it
//! has been read.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::trace;

use super::{Delivery, Payload};
use crate::error::{CommError, Result};
use crate::protocol::codec::Codec;
use crate::protocol::framing::{FrameReader, FrameScanner};
use crate::protocol::header::{HEADER_SIZE, MessageHeader};
use crate::transport::{BufferPool, DataBuffer};
use crate::types::{EdgeId, Flags, TaskId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InState {
    /// Bytes of the message are still missing.
    Building,
    /// Every byte arrived; decoding may still be in progress.
    Built,
}

/// Message currently being rebuilt from one worker.
pub(crate) struct InMessage<T> {
    header: MessageHeader,
    target: TaskId,
    state: InState,
    scanner: FrameScanner,
    reader: FrameReader,
    buffers: VecDeque<DataBuffer>,
    offset: usize,
    values: Vec<T>,
    marker: Option<Vec<u8>>,
    decoded: usize,
    attached: usize,
}

impl<T> InMessage<T> {
    fn start(header: MessageHeader, target: TaskId) -> Self {
        Self {
            scanner: FrameScanner::new(header.object_count()),
            header,
            target,
            state: InState::Building,
            reader: FrameReader::new(),
            buffers: VecDeque::new(),
            offset: HEADER_SIZE,
            values: Vec::new(),
            marker: None,
            decoded: 0,
            attached: 0,
        }
    }

    /// Count the bytes of `buffer` belonging to this message. Trailing bytes
    /// past the message end are malformed.
    fn attach(&mut self, edge: EdgeId, worker: WorkerId, buffer: DataBuffer) -> Result<()> {
        let skip = if self.attached == 0 { HEADER_SIZE } else { 0 };
        self.attached += 1;
        let body = &buffer.as_slice()[skip..];
        let used = self.scanner.scan(body);
        if used < body.len() {
            return Err(CommError::malformed(
                edge,
                worker,
                format!("{} bytes past the end of a message", body.len() - used),
            ));
        }
        if self.scanner.is_complete() {
            self.state = InState::Built;
        }
        self.buffers.push_back(buffer);
        Ok(())
    }

    fn is_built(&self) -> bool {
        self.state == InState::Built
    }

    fn is_decoded(&self) -> bool {
        self.is_built() && self.decoded == self.header.object_count() && self.buffers.is_empty()
    }

    /// Decode whatever attached bytes allow, releasing read buffers.
    fn decode(&mut self, codec: &dyn Codec<T>, pool: &BufferPool) -> Result<()> {
        let raw = self.header.flags.contains(Flags::SYNC_BARRIER);
        while let Some(front) = self.buffers.front() {
            let bytes = &front.as_slice()[self.offset..];
            if bytes.is_empty() {
                if let Some(done) = self.buffers.pop_front() {
                    pool.release(done)?;
                }
                self.offset = 0;
                continue;
            }
            let (used, frame) = self.reader.feed(bytes);
            self.offset += used;
            if let Some(frame) = frame {
                if raw {
                    self.marker = Some(frame);
                } else {
                    self.values.push(codec.decode(&frame)?);
                }
                self.decoded += 1;
            }
        }
        Ok(())
    }

    fn into_delivery(self) -> Delivery<T> {
        let h = self.header;
        let payload = if let Some(marker) = self.marker {
            Payload::Marker(marker)
        } else if h.is_single() {
            match self.values.into_iter().next() {
                Some(v) => Payload::Single(v),
                None => Payload::Empty,
            }
        } else if h.count == 0 {
            Payload::Empty
        } else {
            Payload::Batch(self.values)
        };
        Delivery {
            source: h.source,
            target: self.target,
            path: h.destination,
            flags: h.flags,
            payload,
            remote: true,
        }
    }

    fn release_all(&mut self, pool: &BufferPool) -> Result<()> {
        while let Some(b) = self.buffers.pop_front() {
            pool.release(b)?;
        }
        Ok(())
    }
}

/// Arrival side of one remote worker on one edge.
pub(crate) struct WorkerInbound<T> {
    worker: WorkerId,
    arrived: VecDeque<DataBuffer>,
    current: Option<InMessage<T>>,
    ready: VecDeque<Delivery<T>>,
}

/// Wiring the receive side validates headers against.
pub(crate) struct ReceiveContext<'a, T> {
    pub edge: EdgeId,
    pub codec: &'a dyn Codec<T>,
    pub pool: &'a Arc<BufferPool>,
    pub targets: &'a HashMap<i32, TaskId>,
    pub ready_max: usize,
}

impl<T> WorkerInbound<T> {
    pub(crate) fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            arrived: VecDeque::new(),
            current: None,
            ready: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, buffer: DataBuffer) {
        self.arrived.push_back(buffer);
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.arrived.is_empty() && self.current.is_none() && self.ready.is_empty()
    }

    /// Rebuild up to `budget` messages into the ready queue.
    pub(crate) fn process(&mut self, cx: &ReceiveContext<'_, T>, budget: usize) -> Result<bool> {
        let mut progressed = false;
        let mut completed = 0;
        while completed < budget && self.ready.len() < cx.ready_max {
            if self.current.is_none() {
                let Some(first) = self.arrived.pop_front() else {
                    break;
                };
                let message = match self.begin(cx, &first) {
                    Ok(m) => m,
                    Err(e) => {
                        cx.pool.release(first)?;
                        return Err(e);
                    }
                };
                let current = self.current.insert(message);
                current.attach(cx.edge, self.worker, first)?;
                progressed = true;
            }
            let Some(current) = self.current.as_mut() else {
                break;
            };
            while !current.is_built() {
                let Some(next) = self.arrived.pop_front() else {
                    break;
                };
                current.attach(cx.edge, self.worker, next)?;
                progressed = true;
            }
            let before = current.decoded;
            current.decode(cx.codec, cx.pool)?;
            progressed |= current.decoded > before;
            if !current.is_decoded() {
                break;
            }
            if let Some(done) = self.current.take() {
                trace!(
                    edge = cx.edge,
                    worker = self.worker,
                    source = done.header.source,
                    target = done.target,
                    "message built"
                );
                self.ready.push_back(done.into_delivery());
                completed += 1;
                progressed = true;
            }
        }
        Ok(progressed)
    }

    fn begin(&self, cx: &ReceiveContext<'_, T>, first: &DataBuffer) -> Result<InMessage<T>> {
        let header = MessageHeader::parse(first.as_slice())
            .ok_or_else(|| CommError::malformed(cx.edge, self.worker, "unreadable header"))?;
        let target = *cx
            .targets
            .get(&header.destination)
            .ok_or(CommError::UnexpectedDestination {
                edge: cx.edge,
                destination: header.destination,
            })?;
        Ok(InMessage::start(header, target))
    }

    pub(crate) fn pop_ready(&mut self) -> Option<Delivery<T>> {
        self.ready.pop_front()
    }

    pub(crate) fn push_back_ready(&mut self, delivery: Delivery<T>) {
        self.ready.push_front(delivery);
    }

    /// Return every held buffer to `pool`, dropping partial messages.
    pub(crate) fn release(&mut self, pool: &BufferPool) -> Result<()> {
        if let Some(mut current) = self.current.take() {
            current.release_all(pool)?;
        }
        while let Some(b) = self.arrived.pop_front() {
            pool.release(b)?;
        }
        self.ready.clear();
        Ok(())
    }
}
