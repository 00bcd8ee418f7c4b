//! The per-edge data-flow engine.
//!
//! A [`ChannelOperation`] moves one edge's messages from `send` calls to a
//! [`Sink`] through bounded queues and pooled wire buffers. Same-worker
//! destinations are handed to the sink in process; remote destinations
//! go through the [`Channel`](crate::transport::Channel) as framed
//! messages spanning as many buffers as needed.
//!
//! Nothing here blocks. A full queue, an empty pool or a rejecting
//! transport leaves work queued for the next [`ChannelOperation::progress`].

mod arena;
mod in_message;
mod operation;
mod out_message;

pub use operation::ChannelOperation;

use std::collections::HashMap;

use crate::types::{EdgeId, Flags, OperationKind, TaskId, WorkerId};

/// Body of one logical message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<T> {
    /// One value; header count `-1`.
    Single(T),
    /// A list of values; header count `n`.
    Batch(Vec<T>),
    /// Raw synchronization bytes, sent with `SYNC_BARRIER`.
    Marker(Vec<u8>),
    /// No body; header count `0`.
    Empty,
}

impl<T> Payload<T> {
    /// Number of values carried (markers carry none).
    pub fn len(&self) -> usize {
        match self {
            Payload::Single(_) => 1,
            Payload::Batch(v) => v.len(),
            Payload::Marker(_) | Payload::Empty => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten the carried values.
    pub fn into_values(self) -> Vec<T> {
        match self {
            Payload::Single(v) => vec![v],
            Payload::Batch(v) => v,
            Payload::Marker(_) | Payload::Empty => Vec::new(),
        }
    }
}

/// Where one send goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingParameters {
    /// Routing path written into the header; receivers map it to a target.
    pub path: i32,
    /// Same-worker destination tasks.
    pub internal: Vec<TaskId>,
    /// Remote workers.
    pub external: Vec<WorkerId>,
}

impl RoutingParameters {
    pub fn internal(path: i32, targets: Vec<TaskId>) -> Self {
        Self {
            path,
            internal: targets,
            external: Vec::new(),
        }
    }

    pub fn external(path: i32, workers: Vec<WorkerId>) -> Self {
        Self {
            path,
            internal: Vec::new(),
            external: workers,
        }
    }
}

/// A message handed to a [`Sink`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<T> {
    pub source: TaskId,
    pub target: TaskId,
    pub path: i32,
    pub flags: Flags,
    pub payload: Payload<T>,
    /// Whether the message crossed the network.
    pub remote: bool,
}

/// Answer of a sink to one delivery.
#[derive(Debug)]
pub enum Offer<T> {
    Accepted,
    /// Not taken; the engine keeps it at the head of its queue.
    Refused(Delivery<T>),
}

/// Consumer of an edge's deliveries.
pub trait Sink<T> {
    fn on_message(&mut self, delivery: Delivery<T>) -> crate::error::Result<Offer<T>>;
}

/// Static wiring of one edge on this worker.
#[derive(Debug, Clone)]
pub struct EdgeSpec {
    pub edge: EdgeId,
    pub kind: OperationKind,
    /// Tasks allowed to originate sends here.
    pub local_sources: Vec<TaskId>,
    /// Remote workers that send on this edge.
    pub receive_workers: Vec<WorkerId>,
    /// Header path to local target task for remote messages.
    pub receive_targets: HashMap<i32, TaskId>,
}
