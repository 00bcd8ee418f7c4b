//! Spill thresholds for shuffle runs.

/// Thresholds that decide when a run flushes its in-memory records to a new
/// part file, and how much of a part file a reader keeps resident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleConfig {
    /// Spill once the buffered record payloads exceed this many bytes.
    pub max_bytes_in_memory: usize,

    /// Spill once more than this many records are buffered.
    pub max_records_in_memory: usize,

    /// Records loaded per refill when a reader walks a part file.
    pub read_window_records: usize,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            max_bytes_in_memory: 64 * 1024 * 1024, // 64 MiB
            max_records_in_memory: 1_000_000,
            read_window_records: 1024,
        }
    }
}

impl ShuffleConfig {
    /// Load thresholds from `FLOWCOMM_SHUFFLE_*` variables, falling back to
    /// defaults.
    ///
    /// Recognized variables:
    /// - `FLOWCOMM_SHUFFLE_MAX_BYTES`
    /// - `FLOWCOMM_SHUFFLE_MAX_RECORDS`
    /// - `FLOWCOMM_SHUFFLE_READ_WINDOW`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("FLOWCOMM_SHUFFLE_MAX_BYTES")
            && let Ok(n) = v.parse::<usize>()
        {
            cfg.max_bytes_in_memory = n;
        }
        if let Ok(v) = std::env::var("FLOWCOMM_SHUFFLE_MAX_RECORDS")
            && let Ok(n) = v.parse::<usize>()
        {
            cfg.max_records_in_memory = n;
        }
        if let Ok(v) = std::env::var("FLOWCOMM_SHUFFLE_READ_WINDOW")
            && let Ok(n) = v.parse::<usize>()
        {
            cfg.read_window_records = n.max(1);
        }

        cfg
    }

    pub(crate) fn over_threshold(&self, bytes: usize, records: usize) -> bool {
        bytes > self.max_bytes_in_memory || records > self.max_records_in_memory
    }
}
