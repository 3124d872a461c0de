//! The record codec boundary.
//!
//! The relay core treats the binary format of individual records as opaque:
//! it only needs `encode(record, ctx) -> bytes` and `decode(bytes) -> record`.
//! [`PostcardCodec`] is the default implementation; alternative codecs (e.g.
//! with string-table compression using the [`CodecContext`]) can be swapped
//! in behind the same trait.

use crate::record::Record;

/// Errors produced at the codec boundary.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The input bytes do not describe a valid record.
    #[error("malformed record: {0}")]
    Malformed(#[from] postcard::Error),

    /// An I/O error occurred while reading record bytes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-connection codec context.
///
/// Codecs that maintain connection-scoped state (string tables, dictionaries)
/// keep it here; the relay only threads the context through, it never looks
/// inside. The default codec is stateless.
#[derive(Debug, Default)]
pub struct CodecContext {
    _private: (),
}

impl CodecContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Encode/decode boundary for records.
pub trait RecordCodec: Send + Sync {
    /// Serialize one record, appending its bytes to `buf`.
    fn encode(&self, record: &Record, ctx: &CodecContext, buf: &mut Vec<u8>)
    -> Result<(), CodecError>;

    /// Deserialize one record from the front of `input`, advancing it past
    /// the consumed bytes.
    fn decode(&self, input: &mut &[u8]) -> Result<Record, CodecError>;
}

/// Default codec: postcard-serialized [`Record`] values.
#[derive(Debug, Default)]
pub struct PostcardCodec;

impl RecordCodec for PostcardCodec {
    fn encode(
        &self,
        record: &Record,
        _ctx: &CodecContext,
        buf: &mut Vec<u8>,
    ) -> Result<(), CodecError> {
        *buf = postcard::to_extend(record, std::mem::take(buf))?;
        Ok(())
    }

    fn decode(&self, input: &mut &[u8]) -> Result<Record, CodecError> {
        let (record, rest) = postcard::take_from_bytes::<Record>(*input)?;
        *input = rest;
        Ok(record)
    }
}
