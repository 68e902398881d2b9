use std::collections::BTreeMap;

use crate::error::H3Error;
use crate::frame::{decode_varint, encode_varint};

const SETTINGS_QPACK_MAX_TABLE_CAPACITY: u64 = 0x01;
const SETTINGS_MAX_FIELD_SECTION_SIZE: u64 = 0x06;
const SETTINGS_QPACK_BLOCKED_STREAMS: u64 = 0x07;
/// RFC 9220.
const SETTINGS_ENABLE_CONNECT_PROTOCOL: u64 = 0x08;
/// RFC 9297.
const SETTINGS_H3_DATAGRAM: u64 = 0x33;

/// HTTP/3 SETTINGS parameters (RFC 9114 Section 7.2.4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// SETTINGS_QPACK_MAX_TABLE_CAPACITY (0x01). Default 0 (no dynamic table).
    pub qpack_max_table_capacity: u64,
    /// SETTINGS_MAX_FIELD_SECTION_SIZE (0x06). Default unlimited.
    pub max_field_section_size: u64,
    /// SETTINGS_QPACK_BLOCKED_STREAMS (0x07). Default 0.
    pub qpack_blocked_streams: u64,
    /// SETTINGS_ENABLE_CONNECT_PROTOCOL (0x08): extended CONNECT support.
    pub enable_extended_connect: bool,
    /// SETTINGS_H3_DATAGRAM (0x33): HTTP datagram support.
    pub enable_datagram: bool,
    /// Every other setting, keyed by identifier.
    pub other: BTreeMap<u64, u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            qpack_max_table_capacity: 0,
            max_field_section_size: u64::MAX,
            qpack_blocked_streams: 0,
            enable_extended_connect: false,
            enable_datagram: false,
            other: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Encode settings as a sequence of (identifier, value) varint pairs.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        // Only encode non-default values to save space.
        if self.qpack_max_table_capacity != 0 {
            encode_varint(buf, SETTINGS_QPACK_MAX_TABLE_CAPACITY);
            encode_varint(buf, self.qpack_max_table_capacity);
        }
        if self.max_field_section_size != u64::MAX {
            encode_varint(buf, SETTINGS_MAX_FIELD_SECTION_SIZE);
            encode_varint(buf, self.max_field_section_size);
        }
        if self.qpack_blocked_streams != 0 {
            encode_varint(buf, SETTINGS_QPACK_BLOCKED_STREAMS);
            encode_varint(buf, self.qpack_blocked_streams);
        }
        if self.enable_extended_connect {
            encode_varint(buf, SETTINGS_ENABLE_CONNECT_PROTOCOL);
            encode_varint(buf, 1);
        }
        if self.enable_datagram {
            encode_varint(buf, SETTINGS_H3_DATAGRAM);
            encode_varint(buf, 1);
        }
        for (&id, &value) in &self.other {
            encode_varint(buf, id);
            encode_varint(buf, value);
        }
    }

    /// Decode settings from a SETTINGS frame payload.
    pub fn decode(mut buf: &[u8]) -> Result<Self, H3Error> {
        let mut settings = Settings::default();
        let mut seen = Vec::new();
        while !buf.is_empty() {
            let (id, n) = decode_varint(buf).ok_or(H3Error::FrameError("truncated setting"))?;
            buf = &buf[n..];
            let (value, n) =
                decode_varint(buf).ok_or(H3Error::FrameError("truncated setting"))?;
            buf = &buf[n..];

            if seen.contains(&id) {
                return Err(H3Error::SettingsError("duplicate setting"));
            }
            seen.push(id);

            match id {
                SETTINGS_QPACK_MAX_TABLE_CAPACITY => settings.qpack_max_table_capacity = value,
                SETTINGS_MAX_FIELD_SECTION_SIZE => settings.max_field_section_size = value,
                SETTINGS_QPACK_BLOCKED_STREAMS => settings.qpack_blocked_streams = value,
                SETTINGS_ENABLE_CONNECT_PROTOCOL => {
                    settings.enable_extended_connect = flag(value)?;
                }
                SETTINGS_H3_DATAGRAM => settings.enable_datagram = flag(value)?,
                // HTTP/2 settings that have no HTTP/3 meaning (RFC 9114 Section 7.2.4.1).
                0x02..=0x05 => return Err(H3Error::SettingsError("reserved HTTP/2 setting")),
                _ => {
                    settings.other.insert(id, value);
                }
            }
        }
        Ok(settings)
    }
}

fn flag(value: u64) -> Result<bool, H3Error> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(H3Error::SettingsError("boolean setting out of range")),
    }
}
