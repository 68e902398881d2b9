//! QPACK header compression, static table only (RFC 9204).
//!
//! The encoder never inserts into the dynamic table and announces a table
//! capacity of zero, so no encoder/decoder streams are needed. The decoder
//! rejects header blocks that reference the dynamic table.

use crate::error::H3Error;
use crate::huffman;

/// A single header name-value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Whether this is a pseudo-header (`:status`, `:path`, ...).
    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }
}

/// Turns header lists into encoded header blocks and back.
///
/// The request path only ever talks to this trait, so a stateful codec can
/// be dropped in without touching the framing code.
pub trait HeaderCodec: Send + Sync {
    /// Append the encoded header block for `fields` to `buf`.
    fn encode(&self, fields: &[HeaderField], buf: &mut Vec<u8>);

    /// Decode a complete header block.
    fn decode(&self, block: &[u8]) -> Result<Vec<HeaderField>, H3Error>;
}

/// Stateless QPACK codec using only the 99-entry static table.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticQpack;

impl HeaderCodec for StaticQpack {
    fn encode(&self, fields: &[HeaderField], buf: &mut Vec<u8>) {
        encode(fields, buf)
    }

    fn decode(&self, block: &[u8]) -> Result<Vec<HeaderField>, H3Error> {
        decode(block)
    }
}

// ── Prefix integers (RFC 9204 Section 4.1.1) ────────────────────────
//
// Not QUIC varints: the low `prefix_bits` of the first byte hold the value
// if it fits, otherwise they are all ones and the rest follows in 7-bit
// little-endian groups.

fn encode_prefix_int(buf: &mut Vec<u8>, value: u64, prefix_bits: u8, pattern: u8) {
    let max = (1u64 << prefix_bits) - 1;
    if value < max {
        buf.push(pattern | value as u8);
        return;
    }
    buf.push(pattern | max as u8);
    let mut rest = value - max;
    while rest >= 0x80 {
        buf.push(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    buf.push(rest as u8);
}

/// Write a string literal whose Huffman flag sits just above `prefix_bits`.
fn encode_string(buf: &mut Vec<u8>, data: &[u8], prefix_bits: u8, pattern: u8) {
    let huffman_len = huffman::encoded_len(data);
    if huffman_len < data.len() {
        encode_prefix_int(buf, huffman_len as u64, prefix_bits, pattern | 1 << prefix_bits);
        huffman::encode(data, buf);
    } else {
        encode_prefix_int(buf, data.len() as u64, prefix_bits, pattern);
        buf.extend_from_slice(data);
    }
}

// ── Static table (RFC 9204 Appendix A) ──────────────────────────────

const STATIC_TABLE: &[(&[u8], &[u8])] = &[
    (b":authority", b""),
    (b":path", b"/"),
    (b"age", b"0"),
    (b"content-disposition", b""),
    (b"content-length", b"0"),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"referer", b""),
    (b"set-cookie", b""),
    (b":method", b"CONNECT"),
    (b":method", b"DELETE"),
    (b":method", b"GET"),
    (b":method", b"HEAD"),
    (b":method", b"OPTIONS"),
    (b":method", b"POST"),
    (b":method", b"PUT"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"103"),
    (b":status", b"200"),
    (b":status", b"304"),
    (b":status", b"404"),
    (b":status", b"503"),
    (b"accept", b"*/*"),
    (b"accept", b"application/dns-message"),
    (b"accept-encoding", b"gzip, deflate, br"),
    (b"accept-ranges", b"bytes"),
    (b"access-control-allow-headers", b"cache-control"),
    (b"access-control-allow-headers", b"content-type"),
    (b"access-control-allow-origin", b"*"),
    (b"cache-control", b"max-age=0"),
    (b"cache-control", b"max-age=2592000"),
    (b"cache-control", b"max-age=604800"),
    (b"cache-control", b"no-cache"),
    (b"cache-control", b"no-store"),
    (b"cache-control", b"public, max-age=31536000"),
    (b"content-encoding", b"br"),
    (b"content-encoding", b"gzip"),
    (b"content-type", b"application/dns-message"),
    (b"content-type", b"application/javascript"),
    (b"content-type", b"application/json"),
    (b"content-type", b"application/x-www-form-urlencoded"),
    (b"content-type", b"image/gif"),
    (b"content-type", b"image/jpeg"),
    (b"content-type", b"image/png"),
    (b"content-type", b"text/css"),
    (b"content-type", b"text/html; charset=utf-8"),
    (b"content-type", b"text/plain"),
    (b"content-type", b"text/plain;charset=utf-8"),
    (b"range", b"bytes=0-"),
    (b"strict-transport-security", b"max-age=31536000"),
    (b"strict-transport-security", b"max-age=31536000; includesubdomains"),
    (b"strict-transport-security", b"max-age=31536000; includesubdomains; preload"),
    (b"vary", b"accept-encoding"),
    (b"vary", b"origin"),
    (b"x-content-type-options", b"nosniff"),
    (b"x-xss-protection", b"1; mode=block"),
    (b":status", b"100"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"302"),
    (b":status", b"400"),
    (b":status", b"403"),
    (b":status", b"421"),
    (b":status", b"425"),
    (b":status", b"500"),
    (b"accept-language", b""),
    (b"access-control-allow-credentials", b"FALSE"),
    (b"access-control-allow-credentials", b"TRUE"),
    (b"access-control-allow-headers", b"*"),
    (b"access-control-allow-methods", b"get"),
    (b"access-control-allow-methods", b"get, post, options"),
    (b"access-control-allow-methods", b"options"),
    (b"access-control-expose-headers", b"content-length"),
    (b"access-control-request-headers", b"content-type"),
    (b"access-control-request-method", b"get"),
    (b"access-control-request-method", b"post"),
    (b"alt-svc", b"clear"),
    (b"authorization", b""),
    (b"content-security-policy", b"script-src 'none'; object-src 'none'; base-uri 'none'"),
    (b"early-data", b"1"),
    (b"expect-ct", b""),
    (b"forwarded", b""),
    (b"if-range", b""),
    (b"origin", b""),
    (b"purpose", b"prefetch"),
    (b"server", b""),
    (b"timing-allow-origin", b"*"),
    (b"upgrade-insecure-requests", b"1"),
    (b"user-agent", b""),
    (b"x-forwarded-for", b""),
    (b"x-frame-options", b"deny"),
    (b"x-frame-options", b"sameorigin"),
];

fn static_entry(index: u64) -> Result<&'static (&'static [u8], &'static [u8]), H3Error> {
    STATIC_TABLE
        .get(index as usize)
        .ok_or(H3Error::QpackDecodingFailed)
}

// ── Encoder ─────────────────────────────────────────────────────────

/// Encode a list of headers into a QPACK header block.
pub fn encode(fields: &[HeaderField], buf: &mut Vec<u8>) {
    // Required Insert Count = 0, then Sign = 0 / Delta Base = 0.
    buf.extend_from_slice(&[0x00, 0x00]);

    for field in fields {
        let full = STATIC_TABLE
            .iter()
            .position(|&(n, v)| n == field.name.as_slice() && v == field.value.as_slice());
        if let Some(index) = full {
            // Indexed field line, static (1 T=1 index:6).
            encode_prefix_int(buf, index as u64, 6, 0xc0);
            continue;
        }

        match STATIC_TABLE
            .iter()
            .position(|&(n, _)| n == field.name.as_slice())
        {
            Some(index) => {
                // Literal with static name reference (0 1 N=0 T=1 index:4).
                encode_prefix_int(buf, index as u64, 4, 0x50);
            }
            None => {
                // Literal with literal name (0 0 1 N=0 H name-len:3).
                encode_string(buf, &field.name, 3, 0x20);
            }
        }
        encode_string(buf, &field.value, 7, 0x00);
    }
}

// ── Decoder ─────────────────────────────────────────────────────────

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Result<u8, H3Error> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(H3Error::QpackDecodingFailed)
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn prefix_int(&mut self, prefix_bits: u8) -> Result<u64, H3Error> {
        let max = (1u64 << prefix_bits) - 1;
        let mut value = u64::from(self.peek()?) & max;
        self.pos += 1;
        if value < max {
            return Ok(value);
        }
        let mut shift = 0u32;
        loop {
            let b = self.peek()?;
            self.pos += 1;
            value = value
                .checked_add(u64::from(b & 0x7f) << shift)
                .ok_or(H3Error::QpackDecodingFailed)?;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 56 {
                return Err(H3Error::QpackDecodingFailed);
            }
        }
    }

    fn string(&mut self, prefix_bits: u8) -> Result<Vec<u8>, H3Error> {
        let huffman_coded = self.peek()? & (1 << prefix_bits) != 0;
        let len = self.prefix_int(prefix_bits)? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(H3Error::QpackDecodingFailed)?;
        let raw = &self.buf[self.pos..end];
        self.pos = end;
        if huffman_coded {
            huffman::decode(raw)
        } else {
            Ok(raw.to_vec())
        }
    }
}

/// Decode a QPACK header block (static table only).
pub fn decode(block: &[u8]) -> Result<Vec<HeaderField>, H3Error> {
    let mut cur = Cursor { buf: block, pos: 0 };

    if cur.prefix_int(8)? != 0 {
        // Required Insert Count > 0 means dynamic table references.
        return Err(H3Error::QpackDecodingFailed);
    }
    cur.prefix_int(7)?;

    let mut fields = Vec::new();
    while !cur.is_empty() {
        let first = cur.peek()?;
        let field = match first {
            // Indexed field line: 1 T index:6.
            b if b & 0x80 != 0 => {
                if b & 0x40 == 0 {
                    return Err(H3Error::QpackDecodingFailed);
                }
                let &(name, value) = static_entry(cur.prefix_int(6)?)?;
                HeaderField::new(name, value)
            }
            // Literal with name reference: 0 1 N T index:4.
            b if b & 0x40 != 0 => {
                if b & 0x10 == 0 {
                    return Err(H3Error::QpackDecodingFailed);
                }
                let &(name, _) = static_entry(cur.prefix_int(4)?)?;
                HeaderField::new(name, cur.string(7)?)
            }
            // Literal with literal name: 0 0 1 N H name-len:3.
            b if b & 0x20 != 0 => {
                let name = cur.string(3)?;
                HeaderField::new(name, cur.string(7)?)
            }
            // Post-base forms only address the dynamic table.
            _ => return Err(H3Error::QpackDecodingFailed),
        };
        fields.push(field);
    }

    Ok(fields)
}
