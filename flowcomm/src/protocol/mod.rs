//! Wire format: header, object framing and value codecs.

pub mod codec;
pub mod framing;
pub mod header;

pub use codec::{
    BytesCodec, Codec, Element, ListCodec, ObjectCodec, PairCodec, PrimitiveArrayCodec,
    ScalarCodec,
};
pub use framing::{FrameReader, FrameScanner, write_frame};
pub use header::{HEADER_SIZE, MessageHeader, SINGLE_OBJECT};
