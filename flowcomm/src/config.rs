//! Runtime-configurable tuning parameters for flowcomm.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `FLOWCOMM_`) or by constructing a custom `CommConfig`.

use flowcomm_shuffle::ShuffleConfig;

use crate::error::{CommError, Result};
use crate::protocol::header::HEADER_SIZE;

/// Per-edge buffer, queue and routing parameters.
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// Capacity of one wire buffer in bytes.
    pub buffer_size: usize,

    /// Buffers in each edge's send pool.
    pub send_buffer_count: usize,

    /// Buffers in each edge's receive pool.
    pub receive_buffer_count: usize,

    /// Upper bound on buffers packed into one transport message. Larger
    /// payloads are sent as a sequence of such messages.
    pub max_buffers_per_message: usize,

    /// Depth of each per-source pending-send queue.
    pub send_pending_max: usize,

    /// Decoded messages held per sending worker before delivery stalls.
    pub receive_pending_max: usize,

    /// Depth of each per-upstream queue inside receivers.
    pub receive_queue_max: usize,

    /// Units of send and receive work done by one `progress()` call.
    pub progress_batch: usize,

    /// Fan-out between machines in reduction and broadcast trees.
    pub tree_inter_node_degree: usize,

    /// Fan-out between workers sharing a machine.
    pub tree_intra_node_degree: usize,

    /// Values buffered per destination before a partition stage flushes.
    pub partition_batch_size: usize,

    /// Values a streaming keyed receiver accumulates before flushing.
    pub window_count: usize,

    /// Distinct live keys a keyed combiner holds before refusing new keys.
    pub keyed_max_keys: usize,

    /// Spill thresholds for disk-backed receivers.
    pub shuffle: ShuffleConfig,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024, // 64 KiB
            send_buffer_count: 32,
            receive_buffer_count: 64,
            max_buffers_per_message: 8,
            send_pending_max: 16,
            receive_pending_max: 16,
            receive_queue_max: 1024,
            progress_batch: 64,
            tree_inter_node_degree: 2,
            tree_intra_node_degree: 2,
            partition_batch_size: 128,
            window_count: 16,
            keyed_max_keys: 4096,
            shuffle: ShuffleConfig::default(),
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse::<usize>().ok()
}

impl CommConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `FLOWCOMM_BUFFER_SIZE`
    /// - `FLOWCOMM_SEND_BUFFERS`
    /// - `FLOWCOMM_RECEIVE_BUFFERS`
    /// - `FLOWCOMM_MAX_BUFFERS_PER_MESSAGE`
    /// - `FLOWCOMM_SEND_PENDING_MAX`
    /// - `FLOWCOMM_RECEIVE_PENDING_MAX`
    /// - `FLOWCOMM_RECEIVE_QUEUE_MAX`
    /// - `FLOWCOMM_PROGRESS_BATCH`
    /// - `FLOWCOMM_TREE_INTER_NODE_DEGREE`
    /// - `FLOWCOMM_TREE_INTRA_NODE_DEGREE`
    /// - `FLOWCOMM_PARTITION_BATCH_SIZE`
    /// - `FLOWCOMM_WINDOW_COUNT`
    /// - `FLOWCOMM_KEYED_MAX_KEYS`
    /// - `FLOWCOMM_SHUFFLE_*` (see [`ShuffleConfig::from_env`])
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        let fields: [(&str, &mut usize); 13] = [
            ("FLOWCOMM_BUFFER_SIZE", &mut cfg.buffer_size),
            ("FLOWCOMM_SEND_BUFFERS", &mut cfg.send_buffer_count),
            ("FLOWCOMM_RECEIVE_BUFFERS", &mut cfg.receive_buffer_count),
            (
                "FLOWCOMM_MAX_BUFFERS_PER_MESSAGE",
                &mut cfg.max_buffers_per_message,
            ),
            ("FLOWCOMM_SEND_PENDING_MAX", &mut cfg.send_pending_max),
            ("FLOWCOMM_RECEIVE_PENDING_MAX", &mut cfg.receive_pending_max),
            ("FLOWCOMM_RECEIVE_QUEUE_MAX", &mut cfg.receive_queue_max),
            ("FLOWCOMM_PROGRESS_BATCH", &mut cfg.progress_batch),
            (
                "FLOWCOMM_TREE_INTER_NODE_DEGREE",
                &mut cfg.tree_inter_node_degree,
            ),
            (
                "FLOWCOMM_TREE_INTRA_NODE_DEGREE",
                &mut cfg.tree_intra_node_degree,
            ),
            ("FLOWCOMM_PARTITION_BATCH_SIZE", &mut cfg.partition_batch_size),
            ("FLOWCOMM_WINDOW_COUNT", &mut cfg.window_count),
            ("FLOWCOMM_KEYED_MAX_KEYS", &mut cfg.keyed_max_keys),
        ];
        for (name, slot) in fields {
            if let Some(n) = env_usize(name) {
                *slot = n;
            }
        }
        cfg.shuffle = ShuffleConfig::from_env();
        cfg
    }

    /// Reject settings the engine cannot make progress with.
    pub fn validate(&self) -> Result<()> {
        let min_buffer = HEADER_SIZE + 4;
        if self.buffer_size < min_buffer {
            return Err(CommError::InvalidConfig(format!(
                "buffer_size {} is smaller than header plus one length prefix ({min_buffer})",
                self.buffer_size
            )));
        }
        let non_zero = [
            ("send_buffer_count", self.send_buffer_count),
            ("receive_buffer_count", self.receive_buffer_count),
            ("max_buffers_per_message", self.max_buffers_per_message),
            ("send_pending_max", self.send_pending_max),
            ("receive_pending_max", self.receive_pending_max),
            ("receive_queue_max", self.receive_queue_max),
            ("progress_batch", self.progress_batch),
            ("tree_inter_node_degree", self.tree_inter_node_degree),
            ("tree_intra_node_degree", self.tree_intra_node_degree),
            ("partition_batch_size", self.partition_batch_size),
            ("window_count", self.window_count),
            ("keyed_max_keys", self.keyed_max_keys),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, v)| *v == 0) {
            return Err(CommError::InvalidConfig(format!("{name} must be non-zero")));
        }
        if self.max_buffers_per_message > self.send_buffer_count
            || self.max_buffers_per_message > self.receive_buffer_count
        {
            return Err(CommError::InvalidConfig(format!(
                "max_buffers_per_message {} exceeds a buffer pool ({} send, {} receive)",
                self.max_buffers_per_message, self.send_buffer_count, self.receive_buffer_count
            )));
        }
        Ok(())
    }
}
