//! HTTP/3 frame encoding, async frame parsing and the QUIC varint codec.
//!
//! HTTP/3 frames consist of a varint type, varint length, and payload.
//! QUIC handles stream multiplexing and flow control, so a frame never
//! spans streams and parsing is a straight read off one byte stream.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::H3Error;
use crate::settings::Settings;

// ── Frame type constants (RFC 9114 Section 7.2) ─────────────────────

pub const FRAME_DATA: u64 = 0x00;
pub const FRAME_HEADERS: u64 = 0x01;
pub const FRAME_SETTINGS: u64 = 0x04;
pub const FRAME_GOAWAY: u64 = 0x07;

/// HTTP/2 frame types that MUST NOT appear in HTTP/3 (RFC 9114 Section 7.2.8).
const RESERVED_H2_TYPES: &[u64] = &[0x02, 0x03, 0x06, 0x08, 0x09];

/// Frame types above this value are not defined by RFC 9114 and may be
/// claimed by extensions (WebTransport and friends).
pub const MAX_KNOWN_FRAME_TYPE: u64 = 0x0d;

/// Largest SETTINGS payload we are willing to buffer.
const MAX_SETTINGS_LEN: u64 = 8 * 1024;

/// A GOAWAY payload is a single varint.
const MAX_GOAWAY_LEN: u64 = 8;

// ── QUIC Variable-Length Integer (RFC 9000 Section 16) ──────────────

/// Encode a QUIC variable-length integer into `buf`.
///
/// Values 0..2^6 use 1 byte, 2^6..2^14 use 2, 2^14..2^30 use 4, 2^30..2^62 use 8.
pub fn encode_varint(buf: &mut Vec<u8>, value: u64) {
    debug_assert!(value < (1 << 62), "varint value too large");
    match varint_len(value) {
        1 => buf.push(value as u8),
        2 => buf.extend_from_slice(&(0x4000 | value as u16).to_be_bytes()),
        4 => buf.extend_from_slice(&(0x8000_0000 | value as u32).to_be_bytes()),
        _ => buf.extend_from_slice(&(0xc000_0000_0000_0000 | value).to_be_bytes()),
    }
}

/// Decode a QUIC variable-length integer from the start of `buf`.
///
/// Returns `(value, bytes_consumed)` or `None` if the buffer is too short.
pub fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = 1usize << (first >> 6);
    if buf.len() < len {
        return None;
    }
    let mut value = u64::from(first & 0x3f);
    for &b in &buf[1..len] {
        value = (value << 8) | u64::from(b);
    }
    Some((value, len))
}

/// Returns the encoded byte length for a varint value (1, 2, 4, or 8).
pub fn varint_len(value: u64) -> usize {
    if value < (1 << 6) {
        1
    } else if value < (1 << 14) {
        2
    } else if value < (1 << 30) {
        4
    } else {
        8
    }
}

/// Read one varint off `r`.
///
/// Returns `Ok(None)` if the stream ended cleanly before the first byte;
/// an end of stream in the middle of the varint is an `UnexpectedEof` error.
pub async fn read_varint<R>(r: &mut R) -> std::io::Result<Option<u64>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut first = [0u8; 1];
    if r.read(&mut first).await? == 0 {
        return Ok(None);
    }
    let len = 1usize << (first[0] >> 6);
    let mut buf = [0u8; 8];
    buf[0] = first[0];
    r.read_exact(&mut buf[1..len]).await?;
    Ok(decode_varint(&buf[..len]).map(|(v, _)| v))
}

async fn read_varint_required<R>(r: &mut R) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    read_varint(r)
        .await?
        .ok_or_else(|| std::io::ErrorKind::UnexpectedEof.into())
}

// ── Frame types ─────────────────────────────────────────────────────

/// An HTTP/3 frame, as written by this crate.
#[derive(Debug, Clone)]
pub enum Frame {
    /// DATA frame (type 0x00): carries request or response body.
    Data { payload: Vec<u8> },
    /// HEADERS frame (type 0x01): QPACK-encoded header block.
    Headers { encoded: Vec<u8> },
    /// SETTINGS frame (type 0x04): configuration parameters.
    Settings(Settings),
    /// GOAWAY frame (type 0x07): graceful shutdown with last stream ID.
    GoAway { stream_id: u64 },
    /// Any other frame type; reserved/grease types are written this way.
    Unknown { frame_type: u64, payload: Vec<u8> },
}

/// The next frame as seen by a reader.
///
/// DATA and HEADERS carry only their declared length: the payload is left on
/// the stream so the caller can bound it before allocating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameHead {
    Data { len: u64 },
    Headers { len: u64 },
    Settings(Settings),
    GoAway { stream_id: u64 },
}

// ── Frame encoding ──────────────────────────────────────────────────

/// Encode a frame header (type + length varints) into `buf`.
pub fn encode_frame_header(buf: &mut Vec<u8>, frame_type: u64, payload_len: u64) {
    encode_varint(buf, frame_type);
    encode_varint(buf, payload_len);
}

impl Frame {
    /// Encode this frame into `buf` (header + payload).
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Data { payload } => {
                encode_frame_header(buf, FRAME_DATA, payload.len() as u64);
                buf.extend_from_slice(payload);
            }
            Frame::Headers { encoded } => {
                encode_frame_header(buf, FRAME_HEADERS, encoded.len() as u64);
                buf.extend_from_slice(encoded);
            }
            Frame::Settings(settings) => {
                let mut payload = Vec::new();
                settings.encode(&mut payload);
                encode_frame_header(buf, FRAME_SETTINGS, payload.len() as u64);
                buf.extend_from_slice(&payload);
            }
            Frame::GoAway { stream_id } => {
                encode_frame_header(buf, FRAME_GOAWAY, varint_len(*stream_id) as u64);
                encode_varint(buf, *stream_id);
            }
            Frame::Unknown {
                frame_type,
                payload,
            } => {
                encode_frame_header(buf, *frame_type, payload.len() as u64);
                buf.extend_from_slice(payload);
            }
        }
    }
}

// ── Frame parsing ───────────────────────────────────────────────────

/// Read the next frame off `r`.
///
/// Unknown frame types are skipped. Returns `Ok(None)` when the stream ends
/// cleanly on a frame boundary.
pub async fn read_frame<R>(r: &mut R) -> Result<Option<FrameHead>, H3Error>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        let Some(frame_type) = read_varint(r).await? else {
            return Ok(None);
        };
        let len = read_varint_required(r).await?;

        if RESERVED_H2_TYPES.contains(&frame_type) {
            return Err(H3Error::FrameUnexpected(frame_type));
        }

        match frame_type {
            FRAME_DATA => return Ok(Some(FrameHead::Data { len })),
            FRAME_HEADERS => return Ok(Some(FrameHead::Headers { len })),
            FRAME_SETTINGS => {
                if len > MAX_SETTINGS_LEN {
                    return Err(H3Error::ExcessiveLoad { frame_type, len });
                }
                let payload = read_payload(r, len).await?;
                return Ok(Some(FrameHead::Settings(Settings::decode(&payload)?)));
            }
            FRAME_GOAWAY => {
                if len > MAX_GOAWAY_LEN {
                    return Err(H3Error::FrameError("oversized GOAWAY payload"));
                }
                let payload = read_payload(r, len).await?;
                return match decode_varint(&payload) {
                    Some((stream_id, n)) if n == payload.len() => {
                        Ok(Some(FrameHead::GoAway { stream_id }))
                    }
                    _ => Err(H3Error::FrameError("malformed GOAWAY payload")),
                };
            }
            _ => skip(r, len).await?,
        }
    }
}

async fn read_payload<R>(r: &mut R, len: u64) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Discard exactly `len` bytes of frame payload.
pub async fn skip<R>(r: &mut R, len: u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut limited = (&mut *r).take(len);
    let skipped = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
    if skipped < len {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}
