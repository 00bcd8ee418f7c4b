//! Pluggable value serializers.
//!
//! Each edge carries one `Codec<T>` turning values into the bytes of one
//! frame and back. Built-ins cover little-endian primitive arrays, raw
//! bytes and a general-purpose serde/bincode object codec, plus
//! combinators for keyed pairs and lists.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CommError, Result};
use crate::types::MessageType;

pub trait Codec<T>: Send + Sync {
    /// Wire type of the (value part of the) payload.
    fn message_type(&self) -> MessageType;

    /// Wire type of the key, for keyed payloads.
    fn key_type(&self) -> Option<MessageType> {
        None
    }

    /// Append the encoding of `value` to `out`.
    fn encode(&self, value: &T, out: &mut Vec<u8>) -> Result<()>;

    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// Fixed-width numeric element with a little-endian encoding.
pub trait Element: Copy + Send + Sync + 'static {
    const TYPE: MessageType;
    const SIZE: usize;
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut Vec<u8>);
}

macro_rules! impl_element {
    ($($ty:ty => $mt:ident),*) => {
        $(
            impl Element for $ty {
                const TYPE: MessageType = MessageType::$mt;
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    Self::from_le_bytes(raw)
                }

                #[inline]
                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_element!(i16 => I16, i32 => I32, i64 => I64, f32 => F32, f64 => F64);

/// `Vec<E>` as packed little-endian elements.
pub struct PrimitiveArrayCodec<E>(PhantomData<fn() -> E>);

impl<E> PrimitiveArrayCodec<E> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E> Default for PrimitiveArrayCodec<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Element> Codec<Vec<E>> for PrimitiveArrayCodec<E> {
    fn message_type(&self) -> MessageType {
        E::TYPE
    }

    fn encode(&self, value: &Vec<E>, out: &mut Vec<u8>) -> Result<()> {
        out.reserve(value.len() * E::SIZE);
        for &e in value {
            e.write_le(out);
        }
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<E>> {
        if bytes.len() % E::SIZE != 0 {
            return Err(CommError::DecodeFailed(format!(
                "{} bytes is not a whole number of {} elements",
                bytes.len(),
                E::TYPE
            )));
        }
        Ok(bytes.chunks_exact(E::SIZE).map(E::read_le).collect())
    }
}

/// A single numeric value.
pub struct ScalarCodec<E>(PhantomData<fn() -> E>);

impl<E> ScalarCodec<E> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E> Default for ScalarCodec<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Element> Codec<E> for ScalarCodec<E> {
    fn message_type(&self) -> MessageType {
        E::TYPE
    }

    fn encode(&self, value: &E, out: &mut Vec<u8>) -> Result<()> {
        value.write_le(out);
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<E> {
        if bytes.len() != E::SIZE {
            return Err(CommError::DecodeFailed(format!(
                "expected {} bytes for {}, got {}",
                E::SIZE,
                E::TYPE,
                bytes.len()
            )));
        }
        Ok(E::read_le(bytes))
    }
}

/// Raw bytes, passed through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn message_type(&self) -> MessageType {
        MessageType::Bytes
    }

    fn encode(&self, value: &Vec<u8>, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(value);
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// General-purpose codec for any serde type.
pub struct ObjectCodec<T>(PhantomData<fn() -> T>);

impl<T> ObjectCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for ObjectCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> for ObjectCodec<T> {
    fn message_type(&self) -> MessageType {
        MessageType::Object
    }

    fn encode(&self, value: &T, out: &mut Vec<u8>) -> Result<()> {
        bincode::serialize_into(out, value).map_err(|e| CommError::EncodeFailed(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| CommError::DecodeFailed(e.to_string()))
    }
}

/// `(K, V)` as `[key_len:u32][key][value]`.
pub struct PairCodec<K, V> {
    key: Arc<dyn Codec<K>>,
    value: Arc<dyn Codec<V>>,
}

impl<K, V> PairCodec<K, V> {
    pub fn new(key: Arc<dyn Codec<K>>, value: Arc<dyn Codec<V>>) -> Self {
        Self { key, value }
    }

    pub fn key_codec(&self) -> &Arc<dyn Codec<K>> {
        &self.key
    }

    pub fn value_codec(&self) -> &Arc<dyn Codec<V>> {
        &self.value
    }
}

impl<K, V> Codec<(K, V)> for PairCodec<K, V> {
    fn message_type(&self) -> MessageType {
        self.value.message_type()
    }

    fn key_type(&self) -> Option<MessageType> {
        Some(self.key.message_type())
    }

    fn encode(&self, value: &(K, V), out: &mut Vec<u8>) -> Result<()> {
        let at = out.len();
        out.extend_from_slice(&[0u8; 4]);
        self.key.encode(&value.0, out)?;
        let key_len = (out.len() - at - 4) as u32;
        out[at..at + 4].copy_from_slice(&key_len.to_le_bytes());
        self.value.encode(&value.1, out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<(K, V)> {
        let (len, rest) = bytes
            .split_first_chunk::<4>()
            .ok_or_else(|| CommError::DecodeFailed("pair shorter than key prefix".into()))?;
        let key_len = u32::from_le_bytes(*len) as usize;
        if rest.len() < key_len {
            return Err(CommError::DecodeFailed(format!(
                "key length {key_len} exceeds pair of {} bytes",
                rest.len()
            )));
        }
        let (k, v) = rest.split_at(key_len);
        Ok((self.key.decode(k)?, self.value.decode(v)?))
    }
}

/// `Vec<T>` as `[count:u32]` followed by `[len:u32][item]` per element.
pub struct ListCodec<T> {
    item: Arc<dyn Codec<T>>,
}

impl<T> ListCodec<T> {
    pub fn new(item: Arc<dyn Codec<T>>) -> Self {
        Self { item }
    }
}

impl<T> Codec<Vec<T>> for ListCodec<T> {
    fn message_type(&self) -> MessageType {
        self.item.message_type()
    }

    fn key_type(&self) -> Option<MessageType> {
        self.item.key_type()
    }

    fn encode(&self, value: &Vec<T>, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        for item in value {
            let at = out.len();
            out.extend_from_slice(&[0u8; 4]);
            self.item.encode(item, out)?;
            let len = (out.len() - at - 4) as u32;
            out[at..at + 4].copy_from_slice(&len.to_le_bytes());
        }
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<T>> {
        let truncated = || CommError::DecodeFailed("truncated list".into());
        let (count, mut rest) = bytes.split_first_chunk::<4>().ok_or_else(truncated)?;
        let count = u32::from_le_bytes(*count) as usize;
        let mut out = Vec::with_capacity(count.min(rest.len() / 4));
        for _ in 0..count {
            let (len, tail) = rest.split_first_chunk::<4>().ok_or_else(truncated)?;
            let len = u32::from_le_bytes(*len) as usize;
            if tail.len() < len {
                return Err(truncated());
            }
            let (item, tail) = tail.split_at(len);
            out.push(self.item.decode(item)?);
            rest = tail;
        }
        Ok(out)
    }
}
