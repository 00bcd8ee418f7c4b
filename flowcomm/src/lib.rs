pub mod config;
pub mod context;
pub mod dataflow;
pub mod error;
pub mod hash;
pub mod ops;
pub mod plan;
pub mod protocol;
pub mod receiver;
pub mod reduce;
pub mod routing;
pub mod selector;
pub mod transport;
pub mod types;

pub use config::CommConfig;
pub use context::CommContext;
pub use dataflow::{ChannelOperation, Delivery, EdgeSpec, Offer, Payload, RoutingParameters, Sink};
pub use error::{CommError, Result};
pub use ops::{
    AllGather, AllReduce, Broadcast, EdgePlan, Gather, KeyedGather, KeyedGroups, KeyedPartition,
    KeyedReduce, Operation, Partition, PartitionValues, Reduce,
};
pub use plan::{LogicalPlan, LogicalPlanBuilder};
pub use protocol::{Codec, MessageHeader};
pub use receiver::Receiver;
pub use reduce::{ElementWise, ReduceFunction, Reducible};
pub use routing::{PartitionRouter, TreeRouter};
pub use selector::{DestinationSelector, HashSelector, LoadBalanceSelector};
pub use transport::{
    BufferPool, Channel, ChannelListener, DataBuffer, LocalChannel, LocalNetwork, TcpChannel,
    tcp_mesh_local, tcp_mesh_local_with_queue_depth,
};
pub use types::{EdgeId, Flags, Mode, OperationKind, ReduceOp, RouterKind, TaskId, WorkerId};
