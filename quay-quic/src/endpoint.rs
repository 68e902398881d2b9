//! quinn-backed implementation of the transport traits.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use quinn::VarInt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;

use crate::config::{TlsParams, TransportConfig, VERSION_1};
use crate::connection::{Connection, Dialer, RecvStream, SendStream, TlsState};
use crate::error::TransportError;

type HandshakeState = Option<Result<(), TransportError>>;

/// Dials each connection from a fresh client endpoint bound to an ephemeral
/// UDP port.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuinnDialer;

impl Dialer for QuinnDialer {
    type Connection = QuinnConnection;

    async fn dial(
        &self,
        authority: &str,
        tls: &TlsParams,
        config: &TransportConfig,
    ) -> Result<QuinnConnection, TransportError> {
        let remote = tokio::net::lookup_host(authority)
            .await
            .map_err(|e| TransportError::Resolve(format!("{authority}: {e}")))?
            .next()
            .ok_or_else(|| TransportError::Resolve(authority.to_string()))?;

        let local = config.local_addr.unwrap_or(match remote {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        });
        let endpoint = quinn::Endpoint::client(local).map_err(|e| TransportError::from_io(&e))?;

        let server_name = tls
            .server_name
            .clone()
            .unwrap_or_else(|| host_of(authority).to_string());
        let client_config = client_config(tls, config)?;

        let connecting = endpoint
            .connect_with(client_config, remote, &server_name)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let (handshake_tx, handshake_rx) = watch::channel::<HandshakeState>(None);
        let conn = if tls.enable_early_data {
            match connecting.into_0rtt() {
                Ok((conn, accepted)) => {
                    tracing::debug!(%server_name, "dialing with 0-RTT");
                    let watched = conn.clone();
                    tokio::spawn(async move {
                        let accepted = accepted.await;
                        let state = match watched.close_reason() {
                            Some(reason) => Err(reason.into()),
                            None => Ok(()),
                        };
                        if !accepted {
                            tracing::debug!("server rejected 0-RTT data");
                        }
                        let _ = handshake_tx.send(Some(state));
                    });
                    conn
                }
                Err(connecting) => {
                    let conn = connecting.await?;
                    let _ = handshake_tx.send(Some(Ok(())));
                    conn
                }
            }
        } else {
            let conn = connecting.await?;
            let _ = handshake_tx.send(Some(Ok(())));
            conn
        };

        Ok(QuinnConnection {
            conn,
            _endpoint: endpoint,
            handshake: handshake_rx,
            server_name,
        })
    }
}

fn client_config(
    tls: &TlsParams,
    config: &TransportConfig,
) -> Result<quinn::ClientConfig, TransportError> {
    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls.rustls_config())
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    let mut client = quinn::ClientConfig::new(Arc::new(crypto));
    client.version(config.versions.first().copied().unwrap_or(VERSION_1));

    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(config.keep_alive_interval);
    let idle = config
        .max_idle_timeout
        .map(quinn::IdleTimeout::try_from)
        .transpose()
        .map_err(|e| TransportError::Handshake(format!("idle timeout: {e}")))?;
    transport.max_idle_timeout(idle);
    transport.max_concurrent_bidi_streams(VarInt::from_u32(config.max_incoming_bidi_streams));
    transport.max_concurrent_uni_streams(VarInt::from_u32(config.max_incoming_uni_streams));
    if !config.enable_datagrams {
        transport.datagram_receive_buffer_size(None);
    }
    client.transport_config(Arc::new(transport));
    Ok(client)
}

/// Host part of `host:port`, without IPv6 brackets.
fn host_of(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match authority.rsplit_once(':') {
        Some((host, _)) => host,
        None => authority,
    }
}

fn varint(code: u64) -> VarInt {
    VarInt::from_u64(code).unwrap_or(VarInt::MAX)
}

/// A quinn connection plus the endpoint driving it.
pub struct QuinnConnection {
    conn: quinn::Connection,
    _endpoint: quinn::Endpoint,
    handshake: watch::Receiver<HandshakeState>,
    server_name: String,
}

impl QuinnConnection {
    /// The underlying quinn connection, for datagrams and statistics.
    pub fn inner(&self) -> &quinn::Connection {
        &self.conn
    }
}

impl Connection for QuinnConnection {
    type Send = QuinnSendStream;
    type Recv = QuinnRecvStream;

    async fn open_bi(&self) -> Result<(QuinnSendStream, QuinnRecvStream), TransportError> {
        let (send, recv) = self.conn.open_bi().await?;
        Ok((QuinnSendStream { inner: send }, QuinnRecvStream { inner: recv }))
    }

    async fn open_uni(&self) -> Result<QuinnSendStream, TransportError> {
        let send = self.conn.open_uni().await?;
        Ok(QuinnSendStream { inner: send })
    }

    async fn accept_bi(&self) -> Result<(QuinnSendStream, QuinnRecvStream), TransportError> {
        let (send, recv) = self.conn.accept_bi().await?;
        Ok((QuinnSendStream { inner: send }, QuinnRecvStream { inner: recv }))
    }

    async fn accept_uni(&self) -> Result<QuinnRecvStream, TransportError> {
        let recv = self.conn.accept_uni().await?;
        Ok(QuinnRecvStream { inner: recv })
    }

    async fn handshake_complete(&self) -> Result<(), TransportError> {
        let mut rx = self.handshake.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone().unwrap_or(Ok(())),
            Err(_) => Err(TransportError::LocallyClosed),
        }
    }

    fn is_handshake_complete(&self) -> bool {
        matches!(*self.handshake.borrow(), Some(Ok(())))
    }

    async fn closed(&self) -> TransportError {
        self.conn.closed().await.into()
    }

    fn close(&self, code: u64, reason: &[u8]) {
        self.conn.close(varint(code), reason);
    }

    fn tls_state(&self) -> TlsState {
        let handshake = self
            .conn
            .handshake_data()
            .and_then(|data| data.downcast::<quinn::crypto::rustls::HandshakeData>().ok());
        let peer_certificates = self
            .conn
            .peer_identity()
            .and_then(|id| {
                id.downcast::<Vec<rustls::pki_types::CertificateDer<'static>>>()
                    .ok()
            })
            .map(|certs| certs.iter().map(|c| c.to_vec()).collect())
            .unwrap_or_default();
        TlsState {
            server_name: handshake
                .as_ref()
                .and_then(|h| h.server_name.clone())
                .or_else(|| Some(self.server_name.clone())),
            alpn: handshake.and_then(|h| h.protocol),
            peer_certificates,
            handshake_complete: self.is_handshake_complete(),
        }
    }
}

/// Sending half of a quinn stream.
pub struct QuinnSendStream {
    inner: quinn::SendStream,
}

impl SendStream for QuinnSendStream {
    fn id(&self) -> u64 {
        VarInt::from(self.inner.id()).into_inner()
    }

    fn reset(&mut self, code: u64) {
        let _ = self.inner.reset(varint(code));
    }
}

fn map_write_error(err: io::Error) -> io::Error {
    match err.get_ref().and_then(|e| e.downcast_ref::<quinn::WriteError>()) {
        Some(write) => TransportError::from(write.clone()).into_io(),
        None => err,
    }
}

impl AsyncWrite for QuinnSendStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.inner), cx, buf).map_err(map_write_error)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.inner), cx).map_err(map_write_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.inner), cx).map_err(map_write_error)
    }
}

/// Receiving half of a quinn stream.
pub struct QuinnRecvStream {
    inner: quinn::RecvStream,
}

impl RecvStream for QuinnRecvStream {
    fn id(&self) -> u64 {
        VarInt::from(self.inner.id()).into_inner()
    }

    fn stop(&mut self, code: u64) {
        let _ = self.inner.stop(varint(code));
    }
}

impl AsyncRead for QuinnRecvStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.inner), cx, buf).map_err(|err| {
            match err.get_ref().and_then(|e| e.downcast_ref::<quinn::ReadError>()) {
                Some(read) => TransportError::from(read.clone()).into_io(),
                None => err,
            }
        })
    }
}
