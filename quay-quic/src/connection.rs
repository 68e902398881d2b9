use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{TlsParams, TransportConfig};
use crate::error::TransportError;

/// The sending half of a QUIC stream.
///
/// `poll_shutdown` finishes the stream (FIN). Dropping it without finishing
/// is implementation-defined; callers finish or reset explicitly.
pub trait SendStream: AsyncWrite + Unpin + Send + 'static {
    /// Raw QUIC stream id.
    fn id(&self) -> u64;

    /// Abandon the stream with RESET_STREAM carrying `code`.
    fn reset(&mut self, code: u64);
}

/// The receiving half of a QUIC stream. A clean end of stream reads as EOF.
pub trait RecvStream: AsyncRead + Unpin + Send + 'static {
    /// Raw QUIC stream id.
    fn id(&self) -> u64;

    /// Ask the peer to stop sending with STOP_SENDING carrying `code`.
    fn stop(&mut self, code: u64);
}

/// An established (or 0-RTT) QUIC connection.
pub trait Connection: Send + Sync + 'static {
    type Send: SendStream;
    type Recv: RecvStream;

    fn open_bi(
        &self,
    ) -> impl Future<Output = Result<(Self::Send, Self::Recv), TransportError>> + Send;

    fn open_uni(&self) -> impl Future<Output = Result<Self::Send, TransportError>> + Send;

    fn accept_bi(
        &self,
    ) -> impl Future<Output = Result<(Self::Send, Self::Recv), TransportError>> + Send;

    fn accept_uni(&self) -> impl Future<Output = Result<Self::Recv, TransportError>> + Send;

    /// Resolves once the handshake has completed, or with the error that
    /// ended the connection before it could.
    fn handshake_complete(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn is_handshake_complete(&self) -> bool;

    /// Resolves with the reason the connection closed.
    fn closed(&self) -> impl Future<Output = TransportError> + Send;

    /// Close the connection immediately with an application error code.
    fn close(&self, code: u64, reason: &[u8]);

    /// Snapshot of the negotiated TLS parameters.
    fn tls_state(&self) -> TlsState;
}

/// Establishes connections to an authority.
pub trait Dialer: Send + Sync + 'static {
    type Connection: Connection;

    /// Dial `authority` (`host:port`).
    fn dial(
        &self,
        authority: &str,
        tls: &TlsParams,
        config: &TransportConfig,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// TLS details of a connection, copied onto every response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsState {
    pub server_name: Option<String>,
    /// Negotiated ALPN protocol.
    pub alpn: Option<Vec<u8>>,
    /// DER-encoded peer certificate chain, leaf first.
    pub peer_certificates: Vec<Vec<u8>>,
    pub handshake_complete: bool,
}
