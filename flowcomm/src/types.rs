use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use crate::error::CommError;

/// Cluster-wide unique id of one parallel instance of an operator.
pub type TaskId = i32;

/// Id of a physical worker process.
pub type WorkerId = i32;

/// Id of one data-flow connection; carries exactly one collective.
pub type EdgeId = i32;

/// Identifier of a machine hosting one or more workers.
pub type NodeId = u32;

/// Identifier of a worker group.
pub type GroupId = u32;

/// Wire data types understood by the built-in codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    I16 = 0,
    I32 = 1,
    I64 = 2,
    F32 = 3,
    F64 = 4,
    Bytes = 5,
    Object = 6,
}

impl MessageType {
    /// Size of one element in bytes, if fixed.
    pub const fn element_size(self) -> Option<usize> {
        match self {
            MessageType::I16 => Some(2),
            MessageType::I32 | MessageType::F32 => Some(4),
            MessageType::I64 | MessageType::F64 => Some(8),
            MessageType::Bytes => Some(1),
            MessageType::Object => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            MessageType::I16 => "i16",
            MessageType::I32 => "i32",
            MessageType::I64 => "i64",
            MessageType::F32 => "f32",
            MessageType::F64 => "f64",
            MessageType::Bytes => "bytes",
            MessageType::Object => "object",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction operations over numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}

/// Header flag bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// The source finished sending on this edge.
    pub const END: Flags = Flags(1);
    /// Produced by barrier alignment rather than by a user call.
    pub const SYNC: Flags = Flags(1 << 1);
    /// Payload is a raw byte marker, not a codec value.
    pub const SYNC_BARRIER: Flags = Flags(1 << 2);
    /// Checkpoint marker.
    pub const BARRIER: Flags = Flags(1 << 3);
    /// Sent by a user call.
    pub const ORIGIN_SENDER: Flags = Flags(1 << 4);
    /// Forwarded by a partial receiver.
    pub const ORIGIN_PARTIAL: Flags = Flags(1 << 5);
    /// Final item of a flush batch.
    pub const LAST: Flags = Flags(1 << 6);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Flags(bits)
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn without(self, other: Flags) -> Self {
        Flags(self.0 & !other.0)
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 7] = [
            (Flags::END, "END"),
            (Flags::SYNC, "SYNC"),
            (Flags::SYNC_BARRIER, "SYNC_BARRIER"),
            (Flags::BARRIER, "BARRIER"),
            (Flags::ORIGIN_SENDER, "ORIGIN_SENDER"),
            (Flags::ORIGIN_PARTIAL, "ORIGIN_PARTIAL"),
            (Flags::LAST, "LAST"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            f.write_str("Flags(NONE)")
        } else {
            write!(f, "Flags({})", set.join("|"))
        }
    }
}

/// Receiver flavor of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// One-shot: every source calls `finish` and results are delivered once.
    Batch,
    /// Continuous: results flow per round or window; barriers align sources.
    Streaming,
}

/// Router family used by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouterKind {
    Tree,
    Partition,
}

/// The closed set of collective operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Reduce,
    Gather,
    Broadcast,
    AllReduce,
    AllGather,
    Partition,
    KeyedPartition,
    KeyedGather,
    KeyedReduce,
}

impl OperationKind {
    pub const ALL: [OperationKind; 9] = [
        OperationKind::Reduce,
        OperationKind::Gather,
        OperationKind::Broadcast,
        OperationKind::AllReduce,
        OperationKind::AllGather,
        OperationKind::Partition,
        OperationKind::KeyedPartition,
        OperationKind::KeyedGather,
        OperationKind::KeyedReduce,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            OperationKind::Reduce => "reduce",
            OperationKind::Gather => "gather",
            OperationKind::Broadcast => "broadcast",
            OperationKind::AllReduce => "allreduce",
            OperationKind::AllGather => "allgather",
            OperationKind::Partition => "partition",
            OperationKind::KeyedPartition => "keyed-partition",
            OperationKind::KeyedGather => "keyed-gather",
            OperationKind::KeyedReduce => "keyed-reduce",
        }
    }

    pub const fn router(self) -> RouterKind {
        match self {
            OperationKind::Reduce
            | OperationKind::Gather
            | OperationKind::Broadcast
            | OperationKind::AllReduce
            | OperationKind::AllGather => RouterKind::Tree,
            OperationKind::Partition
            | OperationKind::KeyedPartition
            | OperationKind::KeyedGather
            | OperationKind::KeyedReduce => RouterKind::Partition,
        }
    }

    /// Number of edges the operator occupies. Composites run an upward and a
    /// downward pass on two consecutive edges.
    pub const fn edges(self) -> usize {
        match self {
            OperationKind::AllReduce | OperationKind::AllGather => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OperationKind {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_ascii_lowercase().replace(['_', ' '], "-");
        OperationKind::ALL
            .into_iter()
            .find(|k| k.name() == normalized || k.name().replace('-', "") == normalized)
            .ok_or_else(|| CommError::InvalidConfig(format!("unknown operation '{s}'")))
    }
}
