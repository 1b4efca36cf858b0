//! Wire framing for batches of messages.
//!
//! A frame carries any number of messages, each optionally followed by
//! out-of-band payload bytes that are copied raw instead of re-encoded:
//!
//! ```text
//! [u32 frame_len][u32 count]
//!   { [u32 total][u32 header_len][flags: u8][envelope ..][payload ..] } x count
//! ```
//!
//! * `frame_len` counts every byte after itself.
//! * `header_len` covers the flag byte plus the bincode envelope
//!   (destination, headers, body).
//! * `total` covers the `header_len` field, the header region and the
//!   payload, so the payload length is `total - header_len - 4`.
//!
//! All integers are little-endian. Decoded payloads are handed out in
//! chunks of at most [`LARGE_OBJECT_SIZE`] bytes.

use {
    crate::{
        error::{ClusterNetError, Result},
        message::{Message, Priority},
    },
    std::io::Read,
};

/// Largest payload chunk a decoded message carries.
pub const LARGE_OBJECT_SIZE: usize = 79 * 1024;

/// `[u32 frame_len][u32 count]`
pub const FRAME_HEADER_LEN: usize = 8;

/// `[u32 total][u32 header_len]`
const ENTRY_PREFIX_LEN: usize = 8;

// ── Outbound envelope ───────────────────────────────────────────────────────

/// A message serialized once and ready to be copied into frames.
#[derive(Debug, Clone)]
pub struct BinaryMessage {
    /// Entry prefix, flag byte and envelope.
    pub buffers: Vec<Vec<u8>>,
    /// Raw payload chunks appended after the buffers.
    pub user_payload: Option<Vec<Vec<u8>>>,
    pub priority: Priority,
    size: usize,
}

impl BinaryMessage {
    /// Serialize `msg` into a frame entry.
    pub fn encode(msg: &Message) -> Result<Self> {
        let envelope = msg.encode_envelope()?;
        let payload_len = msg.payload_len();
        let header_len = envelope.len().saturating_add(1);
        let total = header_len.saturating_add(4).saturating_add(payload_len);
        let header_len_field = to_u32(header_len)?;
        let total_field = to_u32(total)?;

        let mut entry = Vec::with_capacity(ENTRY_PREFIX_LEN.saturating_add(header_len));
        entry.extend_from_slice(&total_field.to_le_bytes());
        entry.extend_from_slice(&header_len_field.to_le_bytes());
        entry.push(msg.flags.bits());
        entry.extend_from_slice(&envelope);

        let size = entry.len().saturating_add(payload_len);
        let user_payload = msg.payload.clone().filter(|_| payload_len > 0);
        Ok(Self {
            buffers: vec![entry],
            user_payload,
            priority: msg.priority,
            size,
        })
    }

    /// Bytes this entry occupies inside a frame.
    pub fn size(&self) -> usize {
        self.size
    }
}

fn to_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| ClusterNetError::Framing(format!("length {len} exceeds u32")))
}

// ── Frame encoding ──────────────────────────────────────────────────────────

/// Accumulates entries into one frame, reusing its buffer across frames.
#[derive(Debug)]
pub struct FrameBuilder {
    buf: Vec<u8>,
    count: u32,
}

impl FrameBuilder {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut builder = Self {
            buf: Vec::with_capacity(capacity.max(FRAME_HEADER_LEN)),
            count: 0,
        };
        builder.clear();
        builder
    }

    /// Drop every entry, keeping the allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.buf.extend_from_slice(&[0u8; FRAME_HEADER_LEN]);
        self.count = 0;
    }

    pub fn push(&mut self, msg: &BinaryMessage) {
        for buffer in &msg.buffers {
            self.buf.extend_from_slice(buffer);
        }
        for chunk in msg.user_payload.iter().flatten() {
            self.buf.extend_from_slice(chunk);
        }
        self.count = self.count.saturating_add(1);
    }

    /// Bytes the frame occupies so far, header included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Patch the frame header and return the finished frame.
    pub fn finish(&mut self) -> Result<&[u8]> {
        let frame_len = to_u32(self.buf.len().saturating_sub(4))?;
        self.buf[..4].copy_from_slice(&frame_len.to_le_bytes());
        self.buf[4..FRAME_HEADER_LEN].copy_from_slice(&self.count.to_le_bytes());
        Ok(&self.buf)
    }
}

/// Encode `messages` into one contiguous frame.
pub fn encode_frame(messages: &[BinaryMessage]) -> Result<Vec<u8>> {
    let capacity = messages
        .iter()
        .fold(FRAME_HEADER_LEN, |acc, msg| acc.saturating_add(msg.size()));
    let mut builder = FrameBuilder::with_capacity(capacity);
    for msg in messages {
        builder.push(msg);
    }
    builder.finish()?;
    Ok(builder.buf)
}

/// The 8-byte header of a frame holding exactly one entry of `entry_len` bytes.
pub fn single_message_header(entry_len: usize) -> Result<[u8; FRAME_HEADER_LEN]> {
    let frame_len = to_u32(entry_len.saturating_add(4))?;
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[..4].copy_from_slice(&frame_len.to_le_bytes());
    header[4..].copy_from_slice(&1u32.to_le_bytes());
    Ok(header)
}

// ── Frame decoding ──────────────────────────────────────────────────────────

struct FrameCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameCursor<'a> {
    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(ClusterNetError::Framing(format!(
                "{what} declares {len} bytes but only {} remain",
                self.remaining()
            )));
        }
        let start = self.pos;
        self.pos = start.saturating_add(len);
        Ok(&self.buf[start..self.pos])
    }

    fn read_u32(&mut self, what: &str) -> Result<usize> {
        let bytes = self.take(4, what)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(raw) as usize)
    }
}

/// Decode a complete frame, length prefix included.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<Message>> {
    let mut cursor = FrameCursor { buf: frame, pos: 0 };
    let frame_len = cursor.read_u32("frame")?;
    if frame_len != cursor.remaining() {
        return Err(ClusterNetError::Framing(format!(
            "frame declares {frame_len} bytes but {} were supplied",
            cursor.remaining()
        )));
    }
    decode_frame_body(&frame[4..])
}

/// Decode the part of a frame that follows the length prefix.
pub fn decode_frame_body(body: &[u8]) -> Result<Vec<Message>> {
    let mut cursor = FrameCursor { buf: body, pos: 0 };
    let count = cursor.read_u32("message count")?;
    // Every entry needs at least its prefix and flag byte.
    let mut messages = Vec::with_capacity(count.min(body.len() / (ENTRY_PREFIX_LEN + 1)));
    for _ in 0..count {
        let total = cursor.read_u32("message")?;
        let mut entry = FrameCursor {
            buf: cursor.take(total, "message")?,
            pos: 0,
        };
        let header_len = entry.read_u32("header")?;
        if header_len == 0 {
            return Err(ClusterNetError::Framing("empty header region".to_string()));
        }
        let header = entry.take(header_len, "header")?;
        let payload = entry.take(entry.remaining(), "payload")?;
        let payload = (!payload.is_empty()).then(|| {
            payload
                .chunks(LARGE_OBJECT_SIZE)
                .map(<[u8]>::to_vec)
                .collect::<Vec<_>>()
        });
        messages.push(Message::decode_envelope(&header[1..], header[0], payload)?);
    }
    if cursor.remaining() != 0 {
        return Err(ClusterNetError::Framing(format!(
            "{} trailing bytes after {count} messages",
            cursor.remaining()
        )));
    }
    Ok(messages)
}

/// A frame read from a stream.
#[derive(Debug)]
pub struct Frame {
    pub messages: Vec<Message>,
    /// Bytes consumed from the stream, prefix included.
    pub wire_len: usize,
}

/// Reads whole frames from a byte stream into a reusable buffer.
pub struct FrameReader {
    buf: Vec<u8>,
    max_frame_size: usize,
}

impl FrameReader {
    pub fn new(initial_capacity: usize, max_frame_size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(initial_capacity),
            max_frame_size,
        }
    }

    /// Block until a whole frame has been read and decode it.
    pub fn read_frame<R: Read>(&mut self, reader: &mut R) -> Result<Frame> {
        let mut prefix = [0u8; 4];
        reader.read_exact(&mut prefix)?;
        let len = u32::from_le_bytes(prefix) as usize;
        if len > self.max_frame_size {
            return Err(ClusterNetError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        self.buf.resize(len, 0);
        reader.read_exact(&mut self.buf[..len])?;
        let messages = decode_frame_body(&self.buf[..len])?;
        Ok(Frame {
            messages,
            wire_len: len.saturating_add(4),
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
