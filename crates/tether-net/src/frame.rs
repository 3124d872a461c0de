//! Length-prefixed framing for the reliable stream channel.
//!
//! Every record on the reliable channel is a length-prefixed frame:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (2 bytes)  |   payload          |
//! | u16 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The 2-byte prefix encodes the payload size and does not include itself.
//! Reads poll a caller-supplied predicate on socket timeouts so blocked
//! receive loops can exit cooperatively without treating cancellation as a
//! stream error.

use std::io::{ErrorKind, Read, Write};

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 2 KiB.
    pub max_payload_size: u16,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 2048,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: usize,
        /// The configured maximum.
        max: u16,
    },

    /// The peer closed the stream before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// The read was abandoned because the connection is shutting down.
    #[error("read cancelled")]
    Cancelled,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Append one `[u16 len][payload]` frame to a staging buffer.
///
/// Returns the number of bytes appended (payload length + 2).
pub fn append_frame(
    buf: &mut Vec<u8>,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<usize, FrameError> {
    if payload.len() > config.max_payload_size as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: config.max_payload_size,
        });
    }
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(payload.len() + 2)
}

/// Write one frame directly to a writer.
///
/// Returns the number of bytes written (payload length + 2).
pub fn write_frame<W: Write>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<usize, FrameError> {
    if payload.len() > config.max_payload_size as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: config.max_payload_size,
        });
    }
    writer.write_all(&(payload.len() as u16).to_le_bytes())?;
    if !payload.is_empty() {
        writer.write_all(payload)?;
    }
    Ok(payload.len() + 2)
}

/// Read one frame's payload into `buf` (cleared first).
///
/// Blocks until the full frame is available. Socket read timeouts invoke
/// `keep_waiting`; returning `false` aborts with [`FrameError::Cancelled`].
/// Returns the framed size (payload length + 2).
pub fn read_frame_into<R: Read>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    config: &FrameConfig,
    keep_waiting: &dyn Fn() -> bool,
) -> Result<usize, FrameError> {
    let mut len_buf = [0u8; 2];
    read_full(reader, &mut len_buf, keep_waiting)?;
    let payload_len = u16::from_le_bytes(len_buf);

    if payload_len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len as usize,
            max: config.max_payload_size,
        });
    }

    buf.clear();
    buf.resize(payload_len as usize, 0);
    if payload_len > 0 {
        read_full(reader, buf, keep_waiting)?;
    }
    Ok(payload_len as usize + 2)
}

/// Fill `buf` completely, retrying across timeouts while `keep_waiting`
/// allows. Uses plain `read` (not `read_exact`) so a timeout between chunks
/// never loses already-consumed bytes.
fn read_full<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    keep_waiting: &dyn Fn() -> bool,
) -> Result<(), FrameError> {
    let mut off = 0;
    while off < buf.len() {
        match reader.read(&mut buf[off..]) {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => off += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                if !keep_waiting() {
                    return Err(FrameError::Cancelled);
                }
            }
            Err(e) => return Err(FrameError::Io(e)),
        }
    }
    Ok(())
}
