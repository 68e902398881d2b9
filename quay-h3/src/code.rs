//! HTTP/3 application error codes (RFC 9114 Section 8.1).

use std::fmt;

/// Error code carried in stream resets, STOP_SENDING and CONNECTION_CLOSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum ErrorCode {
    NoError = 0x100,
    GeneralProtocolError = 0x101,
    InternalError = 0x102,
    StreamCreationError = 0x103,
    ClosedCriticalStream = 0x104,
    FrameUnexpected = 0x105,
    FrameError = 0x106,
    ExcessiveLoad = 0x107,
    IdError = 0x108,
    SettingsError = 0x109,
    MissingSettings = 0x10a,
    RequestRejected = 0x10b,
    RequestCanceled = 0x10c,
    RequestIncomplete = 0x10d,
    MessageError = 0x10e,
    ConnectError = 0x10f,
    VersionFallback = 0x110,
}

impl ErrorCode {
    const ALL: [ErrorCode; 17] = [
        ErrorCode::NoError,
        ErrorCode::GeneralProtocolError,
        ErrorCode::InternalError,
        ErrorCode::StreamCreationError,
        ErrorCode::ClosedCriticalStream,
        ErrorCode::FrameUnexpected,
        ErrorCode::FrameError,
        ErrorCode::ExcessiveLoad,
        ErrorCode::IdError,
        ErrorCode::SettingsError,
        ErrorCode::MissingSettings,
        ErrorCode::RequestRejected,
        ErrorCode::RequestCanceled,
        ErrorCode::RequestIncomplete,
        ErrorCode::MessageError,
        ErrorCode::ConnectError,
        ErrorCode::VersionFallback,
    ];

    /// Wire value of this code.
    pub fn value(self) -> u64 {
        self as u64
    }

    /// Map a wire value back to a known code.
    pub fn from_value(value: u64) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.value() == value)
    }

    /// The RFC 9114 name, e.g. `H3_REQUEST_CANCELLED`.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::NoError => "H3_NO_ERROR",
            ErrorCode::GeneralProtocolError => "H3_GENERAL_PROTOCOL_ERROR",
            ErrorCode::InternalError => "H3_INTERNAL_ERROR",
            ErrorCode::StreamCreationError => "H3_STREAM_CREATION_ERROR",
            ErrorCode::ClosedCriticalStream => "H3_CLOSED_CRITICAL_STREAM",
            ErrorCode::FrameUnexpected => "H3_FRAME_UNEXPECTED",
            ErrorCode::FrameError => "H3_FRAME_ERROR",
            ErrorCode::ExcessiveLoad => "H3_EXCESSIVE_LOAD",
            ErrorCode::IdError => "H3_ID_ERROR",
            ErrorCode::SettingsError => "H3_SETTINGS_ERROR",
            ErrorCode::MissingSettings => "H3_MISSING_SETTINGS",
            ErrorCode::RequestRejected => "H3_REQUEST_REJECTED",
            ErrorCode::RequestCanceled => "H3_REQUEST_CANCELLED",
            ErrorCode::RequestIncomplete => "H3_REQUEST_INCOMPLETE",
            ErrorCode::MessageError => "H3_MESSAGE_ERROR",
            ErrorCode::ConnectError => "H3_CONNECT_ERROR",
            ErrorCode::VersionFallback => "H3_VERSION_FALLBACK",
        }
    }
}

impl From<ErrorCode> for u64 {
    fn from(code: ErrorCode) -> u64 {
        code.value()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Formats a raw application error code, using the HTTP/3 name when known.
pub struct DisplayCode(pub u64);

impl fmt::Display for DisplayCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match ErrorCode::from_value(self.0) {
            Some(code) => write!(f, "{code}"),
            None => write!(f, "H3 error ({:#x})", self.0),
        }
    }
}
