//! Routing tables derived from the logical plan at operator construction.

pub mod partition;
pub mod tree;

pub use partition::{PartitionRouter, SourceRoutes};
pub use tree::TreeRouter;
