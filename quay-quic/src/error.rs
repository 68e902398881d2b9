use std::io;

/// Errors surfaced by the transport.
///
/// Cloneable so that one failure (a dial error, a lost connection) can be
/// handed to every request that observes it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer reset its sending side of the stream (RESET_STREAM).
    #[error("stream reset by peer (error code {0:#x})")]
    StreamReset(u64),

    /// The peer asked us to stop sending (STOP_SENDING).
    #[error("stream stopped by peer (error code {0:#x})")]
    StreamStopped(u64),

    /// The stream was already finished or reset locally.
    #[error("stream closed")]
    ClosedStream,

    /// The connection was closed with an application error code.
    #[error("connection closed with application error {code:#x}: {reason}")]
    ApplicationClosed {
        code: u64,
        reason: String,
        remote: bool,
    },

    /// The connection was closed by this endpoint.
    #[error("connection closed locally")]
    LocallyClosed,

    /// The connection went away for a transport-level reason.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("idle timeout")]
    TimedOut,

    /// The TLS/QUIC handshake could not be started or did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Data sent as 0-RTT was rejected by the server.
    #[error("0-RTT rejected")]
    ZeroRttRejected,

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("io: {message}")]
    Io { kind: io::ErrorKind, message: String },
}

impl TransportError {
    /// Recover the transport error carried inside an I/O error produced by a
    /// stream's `AsyncRead`/`AsyncWrite` implementation.
    pub fn from_io(err: &io::Error) -> Self {
        if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<TransportError>()) {
            return inner.clone();
        }
        TransportError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Wrap this error for return from an `AsyncRead`/`AsyncWrite` poll.
    pub fn into_io(self) -> io::Error {
        let kind = match &self {
            TransportError::StreamReset(_) | TransportError::StreamStopped(_) => {
                io::ErrorKind::ConnectionReset
            }
            TransportError::ZeroRttRejected => io::ErrorKind::ConnectionRefused,
            TransportError::Io { kind, .. } => *kind,
            _ => io::ErrorKind::NotConnected,
        };
        io::Error::new(kind, self)
    }

    /// The application error code the connection was closed with, if any.
    pub fn application_code(&self) -> Option<u64> {
        match self {
            TransportError::ApplicationClosed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<quinn::ConnectionError> for TransportError {
    fn from(err: quinn::ConnectionError) -> Self {
        use quinn::ConnectionError as E;
        match err {
            E::ApplicationClosed(close) => TransportError::ApplicationClosed {
                code: close.error_code.into_inner(),
                reason: String::from_utf8_lossy(&close.reason).into_owned(),
                remote: true,
            },
            E::LocallyClosed => TransportError::LocallyClosed,
            E::TimedOut => TransportError::TimedOut,
            E::VersionMismatch => TransportError::Handshake(err.to_string()),
            other => TransportError::ConnectionLost(other.to_string()),
        }
    }
}

impl From<quinn::WriteError> for TransportError {
    fn from(err: quinn::WriteError) -> Self {
        use quinn::WriteError as E;
        match err {
            E::Stopped(code) => TransportError::StreamStopped(code.into_inner()),
            E::ConnectionLost(e) => e.into(),
            E::ClosedStream => TransportError::ClosedStream,
            E::ZeroRttRejected => TransportError::ZeroRttRejected,
        }
    }
}

impl From<quinn::ReadError> for TransportError {
    fn from(err: quinn::ReadError) -> Self {
        use quinn::ReadError as E;
        match err {
            E::Reset(code) => TransportError::StreamReset(code.into_inner()),
            E::ConnectionLost(e) => e.into(),
            E::ClosedStream => TransportError::ClosedStream,
            E::ZeroRttRejected => TransportError::ZeroRttRejected,
            other => TransportError::Io {
                kind: io::ErrorKind::InvalidInput,
                message: other.to_string(),
            },
        }
    }
}
