use std::io;

use crate::code::ErrorCode;

/// Errors produced by the HTTP/3 framing layer.
#[derive(Debug)]
pub enum H3Error {
    /// The underlying stream failed while reading or writing a frame.
    Io(io::Error),
    /// Received a frame type reserved from HTTP/2 (0x02, 0x03, 0x06, 0x08, 0x09),
    /// or a known frame where it is not allowed.
    FrameUnexpected(u64),
    /// Frame decoding error (truncated varint, invalid payload, etc.).
    FrameError(&'static str),
    /// A frame was larger than this implementation accepts.
    ExcessiveLoad { frame_type: u64, len: u64 },
    /// SETTINGS payload violated RFC 9114 Section 7.2.4.
    SettingsError(&'static str),
    /// QPACK header block decoding failed.
    QpackDecodingFailed,
}

impl H3Error {
    /// The application error code a peer should see for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io(_) => ErrorCode::RequestIncomplete,
            Self::FrameUnexpected(_) => ErrorCode::FrameUnexpected,
            Self::FrameError(_) => ErrorCode::FrameError,
            Self::ExcessiveLoad { .. } => ErrorCode::ExcessiveLoad,
            Self::SettingsError(_) => ErrorCode::SettingsError,
            Self::QpackDecodingFailed => ErrorCode::GeneralProtocolError,
        }
    }
}

impl std::fmt::Display for H3Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {e}"),
            Self::FrameUnexpected(t) => write!(f, "unexpected frame type {t:#x}"),
            Self::FrameError(s) => write!(f, "frame error: {s}"),
            Self::ExcessiveLoad { frame_type, len } => {
                write!(f, "frame {frame_type:#x} too large: {len} bytes")
            }
            Self::SettingsError(s) => write!(f, "settings error: {s}"),
            Self::QpackDecodingFailed => write!(f, "QPACK decoding failed"),
        }
    }
}

impl std::error::Error for H3Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for H3Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
