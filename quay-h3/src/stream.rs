//! Unidirectional stream types (RFC 9114 Section 6.2, RFC 9204 Section 4.2).

/// Type of a unidirectional stream, announced by its first varint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Control,
    Push,
    QpackEncoder,
    QpackDecoder,
    /// Reserved, grease or extension stream types.
    Other(u64),
}

impl StreamType {
    pub const CONTROL: u64 = 0x00;
    pub const PUSH: u64 = 0x01;
    pub const QPACK_ENCODER: u64 = 0x02;
    pub const QPACK_DECODER: u64 = 0x03;

    pub fn from_value(value: u64) -> Self {
        match value {
            Self::CONTROL => StreamType::Control,
            Self::PUSH => StreamType::Push,
            Self::QPACK_ENCODER => StreamType::QpackEncoder,
            Self::QPACK_DECODER => StreamType::QpackDecoder,
            other => StreamType::Other(other),
        }
    }

    pub fn value(self) -> u64 {
        match self {
            StreamType::Control => Self::CONTROL,
            StreamType::Push => Self::PUSH,
            StreamType::QpackEncoder => Self::QPACK_ENCODER,
            StreamType::QpackDecoder => Self::QPACK_DECODER,
            StreamType::Other(v) => v,
        }
    }
}
