use quay_h3::code::DisplayCode;
use quay_h3::{ErrorCode, H3Error};
use quay_quic::TransportError;

/// Errors returned by [`Client`](crate::Client) and response bodies.
///
/// Every variant falls into one retry class: the caller's own cancellation
/// ([`is_caller_cancellation`](Error::is_caller_cancellation)), a server
/// shutdown ([`is_goaway`](Error::is_goaway)), a protocol violation
/// ([`is_protocol_violation`](Error::is_protocol_violation)), or a setup or
/// transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The client configuration cannot be used to dial.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Dialing the transport failed. Cached and returned to every later
    /// request on the same client.
    #[error("dial failed: {0}")]
    Dial(TransportError),

    /// The connection ended before its handshake completed.
    #[error("handshake failed: {0}")]
    Handshake(TransportError),

    /// The server sent GOAWAY; the request was not (or will not be)
    /// processed and may be retried on a new connection.
    #[error("server sent goaway")]
    Goaway,

    /// The peer violated HTTP/3. `code` is the error code this client used
    /// to abort the stream or connection.
    #[error("{}: {message}", DisplayCode(*code))]
    Protocol { code: u64, message: String },

    /// The request body produced more bytes than its declared length.
    #[error("http: ContentLength={declared} with Body length {actual}")]
    LengthMismatch { declared: u64, actual: u64 },

    /// The caller canceled the request.
    #[error("request canceled")]
    Canceled,

    /// The caller's deadline expired.
    #[error("request timed out")]
    Timeout,

    /// The settings validator refused the server's SETTINGS.
    #[error("settings rejected: {0}")]
    SettingsRejected(String),

    /// The request targets a different authority than the client serves.
    #[error("request for {request} sent to the client for {client}")]
    AuthorityMismatch { client: String, request: String },

    /// The request could not be turned into HTTP/3 headers.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request body source failed.
    #[error("request body: {0}")]
    Body(String),

    /// The stream was aborted with an application error code.
    #[error("stream aborted by {} with {}", side(*remote), DisplayCode(*code))]
    Stream { code: u64, remote: bool },

    /// The connection was closed with an application error code.
    #[error("connection closed by {} with {}: {reason}", side(*remote), DisplayCode(*code))]
    Connection {
        code: u64,
        remote: bool,
        reason: String,
    },

    #[error("transport: {0}")]
    Transport(TransportError),
}

fn side(remote: bool) -> &'static str {
    if remote { "peer" } else { "client" }
}

impl Error {
    pub(crate) fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Protocol {
            code: code.value(),
            message: message.into(),
        }
    }

    /// Classify a transport failure into stream/connection aborts.
    pub fn from_transport(err: TransportError) -> Self {
        match err {
            TransportError::StreamReset(code) | TransportError::StreamStopped(code) => {
                Error::Stream { code, remote: true }
            }
            TransportError::ApplicationClosed {
                code,
                reason,
                remote,
            } => Error::Connection {
                code,
                remote,
                reason,
            },
            other => Error::Transport(other),
        }
    }

    pub(crate) fn from_io(err: &std::io::Error) -> Self {
        Self::from_transport(TransportError::from_io(err))
    }

    pub(crate) fn from_h3(err: H3Error) -> Self {
        match err {
            H3Error::Io(e) => Self::from_io(&e),
            other => Error::Protocol {
                code: other.code().value(),
                message: other.to_string(),
            },
        }
    }

    /// The caller canceled the request or its deadline expired. Not retried.
    pub fn is_caller_cancellation(&self) -> bool {
        matches!(self, Error::Canceled | Error::Timeout)
    }

    /// The server is shutting the connection down.
    pub fn is_goaway(&self) -> bool {
        matches!(self, Error::Goaway)
    }

    /// Either side detected an HTTP/3 protocol violation. Fatal.
    pub fn is_protocol_violation(&self) -> bool {
        let code = match self {
            Error::Protocol { .. } => return true,
            Error::Stream { code, .. } | Error::Connection { code, .. } => *code,
            _ => return false,
        };
        matches!(
            ErrorCode::from_value(code),
            Some(
                ErrorCode::GeneralProtocolError
                    | ErrorCode::StreamCreationError
                    | ErrorCode::ClosedCriticalStream
                    | ErrorCode::FrameUnexpected
                    | ErrorCode::FrameError
                    | ErrorCode::ExcessiveLoad
                    | ErrorCode::IdError
                    | ErrorCode::SettingsError
                    | ErrorCode::MissingSettings
                    | ErrorCode::MessageError
            )
        )
    }

    /// The request is known not to have been processed and can be sent again
    /// on a fresh connection.
    pub fn is_retryable_on_new_connection(&self) -> bool {
        match self {
            Error::Goaway => true,
            Error::Stream { code, remote: true } => {
                *code == ErrorCode::RequestRejected.value()
            }
            _ => false,
        }
    }
}
