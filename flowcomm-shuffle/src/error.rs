use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, ShuffleError>;

#[derive(Debug, thiserror::Error)]
pub enum ShuffleError {
    #[error("run '{name}' is reading; add() is no longer permitted")]
    AddAfterReading { name: String },

    #[error("run '{name}' must switch to reading before it can be read")]
    NotReading { name: String },

    #[error("run '{name}' has already been read; runs are single-pass")]
    AlreadyConsumed { name: String },

    #[error("run '{name}' has been cleaned")]
    Cleaned { name: String },

    #[error("part file {path} is corrupt: {reason}")]
    CorruptPart { path: PathBuf, reason: String },

    #[error("key codec failed: {0}")]
    Codec(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ShuffleError {
    /// Disk failures are logged where they are raised.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        tracing::warn!(path = %path.display(), "shuffle disk I/O failed: {source}");
        Self::Io { path, source }
    }
}
