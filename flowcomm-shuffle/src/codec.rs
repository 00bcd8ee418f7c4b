use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, ShuffleError};

/// Serializes keys into part files and back.
pub trait KeyCodec<K>: Send + Sync {
    fn encode_key(&self, key: &K, out: &mut Vec<u8>) -> Result<()>;
    fn decode_key(&self, bytes: &[u8]) -> Result<K>;
}

/// General-purpose key codec backed by bincode.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerdeKeyCodec;

impl<K: Serialize + DeserializeOwned> KeyCodec<K> for SerdeKeyCodec {
    fn encode_key(&self, key: &K, out: &mut Vec<u8>) -> Result<()> {
        bincode::serialize_into(out, key).map_err(|e| ShuffleError::Codec(e.to_string()))
    }

    fn decode_key(&self, bytes: &[u8]) -> Result<K> {
        bincode::deserialize(bytes).map_err(|e| ShuffleError::Codec(e.to_string()))
    }
}
