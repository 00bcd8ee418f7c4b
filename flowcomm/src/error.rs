use crate::types::{EdgeId, TaskId, WorkerId};

pub type Result<T> = std::result::Result<T, CommError>;

#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("edge {edge}: task {source_task} is not a registered source on this worker")]
    UnknownSource { edge: EdgeId, source_task: TaskId },

    #[error("edge {edge}: task {target} received from unknown upstream {upstream}")]
    UnknownUpstream {
        edge: EdgeId,
        target: TaskId,
        upstream: TaskId,
    },

    #[error("edge {edge}: buffer from worker {worker} which is not a registered sender")]
    UnexpectedSender { edge: EdgeId, worker: WorkerId },

    #[error("edge {edge}: malformed message from worker {worker}: {reason}")]
    MalformedHeader {
        edge: EdgeId,
        worker: WorkerId,
        reason: String,
    },

    #[error("edge {edge}: message for destination {destination} has no local target")]
    UnexpectedDestination { edge: EdgeId, destination: i32 },

    #[error("{pool} buffer pool overflow: released more buffers than it holds")]
    PoolOverflow { pool: &'static str },

    #[error("edge {edge}: released send message {index} with no outstanding reference")]
    ReleaseUnreferenced { edge: EdgeId, index: u32 },

    #[error("edge {edge}: task {target} saw a second finish from {upstream}")]
    DuplicateFinish {
        edge: EdgeId,
        target: TaskId,
        upstream: TaskId,
    },

    #[error("invalid logical plan: {0}")]
    InvalidPlan(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("edge {edge}: {operation} cannot reset while work is pending")]
    OperationBusy {
        edge: EdgeId,
        operation: &'static str,
    },

    #[error("message encode failed: {0}")]
    EncodeFailed(String),

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Shuffle(#[from] flowcomm_shuffle::ShuffleError),
}

impl CommError {
    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn malformed(edge: EdgeId, worker: WorkerId, reason: impl Into<String>) -> Self {
        Self::MalformedHeader {
            edge,
            worker,
            reason: reason.into(),
        }
    }
}
