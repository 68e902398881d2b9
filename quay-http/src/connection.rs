//! Per-connection state and the background tasks started after dialing:
//! the control stream we send, the peer's unidirectional streams (its
//! control stream included), and optionally hijacked bidirectional streams.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use quay_h3::frame::{self, FrameHead, MAX_KNOWN_FRAME_TYPE, encode_varint, read_varint};
use quay_h3::{ErrorCode, Frame, H3Error, Settings, StreamType};
use quay_quic::{Connection, RecvStream, TransportError};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::config::{HijackedStream, StreamHijacker, UniStreamHijacker};
use crate::error::Error;
use crate::registry::Registry;

/// The server's SETTINGS as seen by settings waiters.
#[derive(Debug, Clone)]
pub(crate) enum PeerSettings {
    Pending,
    Received(Arc<Settings>),
    /// The connection ended before SETTINGS arrived.
    Unavailable(Error),
}

/// Closes a connection; the object-safe slice of [`Connection`] that
/// response bodies need.
pub(crate) trait CloseConnection: Send + Sync {
    fn close_with(&self, code: ErrorCode, reason: &str);
}

impl<C: Connection> CloseConnection for C {
    fn close_with(&self, code: ErrorCode, reason: &str) {
        self.close(code.value(), reason.as_bytes());
    }
}

/// A dialed connection, published once per client.
pub(crate) struct Established<C: Connection> {
    pub(crate) conn: Arc<C>,
    pub(crate) registry: Arc<Registry>,
    settings: watch::Sender<PeerSettings>,
    control_seen: AtomicBool,
    uni_hijacker: Option<UniStreamHijacker>,
}

impl<C: Connection> Established<C> {
    /// Publish a freshly dialed connection and start its background tasks.
    pub(crate) fn start(
        conn: C,
        settings: Settings,
        stream_hijacker: Option<StreamHijacker>,
        uni_hijacker: Option<UniStreamHijacker>,
    ) -> Arc<Self> {
        let established = Arc::new(Self {
            conn: Arc::new(conn),
            registry: Registry::new(),
            settings: watch::channel(PeerSettings::Pending).0,
            control_seen: AtomicBool::new(false),
            uni_hijacker,
        });

        let conn = Arc::clone(&established.conn);
        tokio::spawn(open_control_stream(conn, settings));
        if let Some(hijacker) = stream_hijacker {
            tokio::spawn(Arc::clone(&established).accept_bidi_streams(hijacker));
        }
        tokio::spawn(Arc::clone(&established).accept_uni_streams());
        established
    }

    /// The server's SETTINGS, if they arrived.
    pub(crate) fn settings(&self) -> Option<Arc<Settings>> {
        match &*self.settings.borrow() {
            PeerSettings::Received(settings) => Some(Arc::clone(settings)),
            _ => None,
        }
    }

    /// Wait for the server's SETTINGS, or for the connection to end.
    pub(crate) async fn peer_settings(&self) -> Result<Arc<Settings>, Error> {
        let mut rx = self.settings.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, PeerSettings::Pending))
            .await
            .map(|s| (*s).clone());
        match state {
            Ok(PeerSettings::Received(settings)) => Ok(settings),
            Ok(PeerSettings::Unavailable(err)) => Err(err),
            Ok(PeerSettings::Pending) | Err(_) => {
                Err(Error::Transport(TransportError::LocallyClosed))
            }
        }
    }

    fn publish_settings(&self, state: PeerSettings) {
        self.settings.send_if_modified(|current| {
            if !matches!(current, PeerSettings::Pending) {
                return false;
            }
            *current = state;
            true
        });
    }

    async fn accept_uni_streams(self: Arc<Self>) {
        loop {
            match self.conn.accept_uni().await {
                Ok(recv) => {
                    tokio::spawn(Arc::clone(&self).handle_uni_stream(recv));
                }
                Err(e) => {
                    tracing::debug!(error = %e, "accepting unidirectional stream failed");
                    self.publish_settings(PeerSettings::Unavailable(Error::from_transport(e)));
                    return;
                }
            }
        }
    }

    async fn handle_uni_stream(self: Arc<Self>, mut recv: C::Recv) {
        let stream_type = match read_varint(&mut recv).await {
            Ok(Some(t)) => t,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(error = %e, "reading stream type failed");
                return;
            }
        };
        match StreamType::from_value(stream_type) {
            StreamType::Control => {
                if self.control_seen.swap(true, Ordering::AcqRel) {
                    self.conn
                        .close_with(ErrorCode::StreamCreationError, "duplicate control stream");
                    return;
                }
                self.read_control_stream(recv).await;
            }
            StreamType::Push => {
                self.conn
                    .close_with(ErrorCode::IdError, "server push is not enabled");
            }
            StreamType::QpackEncoder | StreamType::QpackDecoder => {
                let _ = tokio::io::copy(&mut recv, &mut tokio::io::sink()).await;
            }
            StreamType::Other(stream_type) => {
                let mut declined: Box<dyn RecvStream> = match &self.uni_hijacker {
                    Some(hijacker) => match hijacker(stream_type, Box::new(recv)) {
                        Ok(()) => {
                            tracing::debug!(stream_type, "unidirectional stream hijacked");
                            return;
                        }
                        Err(recv) => recv,
                    },
                    None => Box::new(recv),
                };
                declined.stop(ErrorCode::StreamCreationError.value());
            }
        }
    }

    /// Control-stream monitor: SETTINGS first, then GOAWAYs until the
    /// stream or connection ends.
    async fn read_control_stream(&self, mut recv: C::Recv) {
        match frame::read_frame(&mut recv).await {
            Ok(Some(FrameHead::Settings(settings))) => {
                tracing::debug!(?settings, "received SETTINGS");
                self.publish_settings(PeerSettings::Received(Arc::new(settings)));
            }
            Ok(Some(other)) => {
                tracing::debug!(frame = ?other, "control stream did not start with SETTINGS");
                self.conn
                    .close_with(ErrorCode::MissingSettings, "missing SETTINGS frame");
                return;
            }
            Ok(None) => {
                self.conn
                    .close_with(ErrorCode::ClosedCriticalStream, "control stream closed");
                return;
            }
            Err(err) => {
                self.control_stream_error(err);
                return;
            }
        }

        loop {
            match frame::read_frame(&mut recv).await {
                Ok(Some(FrameHead::GoAway { stream_id })) => {
                    match self.registry.apply_goaway(stream_id) {
                        Ok(canceled) => {
                            tracing::debug!(goaway_id = stream_id, canceled, "received GOAWAY");
                        }
                        Err(invalid) => {
                            tracing::warn!(
                                goaway_id = invalid.id,
                                previous = ?invalid.previous,
                                "invalid GOAWAY stream id"
                            );
                            self.conn.close_with(ErrorCode::IdError, "invalid GOAWAY id");
                            return;
                        }
                    }
                }
                Ok(Some(FrameHead::Settings(_))) => {
                    self.conn
                        .close_with(ErrorCode::FrameUnexpected, "duplicate SETTINGS frame");
                    return;
                }
                Ok(Some(other)) => {
                    tracing::debug!(frame = ?other, "unexpected frame on control stream");
                    self.conn.close_with(
                        ErrorCode::FrameUnexpected,
                        "request frame on control stream",
                    );
                    return;
                }
                Ok(None) => {
                    self.conn
                        .close_with(ErrorCode::ClosedCriticalStream, "control stream closed");
                    return;
                }
                Err(err) => {
                    self.control_stream_error(err);
                    return;
                }
            }
        }
    }

    fn control_stream_error(&self, err: H3Error) {
        tracing::error!(error = %err, "error reading control stream");
        if !matches!(err, H3Error::Io(_)) {
            self.conn.close_with(err.code(), &err.to_string());
        }
    }

    async fn accept_bidi_streams(self: Arc<Self>, hijacker: StreamHijacker) {
        loop {
            let (send, mut recv) = match self.conn.accept_bi().await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(error = %e, "accepting bidirectional stream failed");
                    return;
                }
            };
            let conn = Arc::clone(&self.conn);
            let hijacker = Arc::clone(&hijacker);
            tokio::spawn(async move {
                match read_varint(&mut recv).await {
                    Ok(Some(frame_type)) if frame_type > MAX_KNOWN_FRAME_TYPE => {
                        let stream = HijackedStream {
                            send: Box::new(send),
                            recv: Box::new(recv),
                        };
                        if hijacker(frame_type, stream).is_ok() {
                            return;
                        }
                        tracing::debug!(frame_type, "stream hijacker declined stream");
                    }
                    Ok(Some(frame_type)) => {
                        tracing::debug!(frame_type, "HTTP/3 frame on server-initiated stream");
                    }
                    Ok(None) => {}
                    Err(e) => tracing::debug!(error = %e, "error handling stream"),
                }
                conn.close_with(
                    ErrorCode::FrameUnexpected,
                    "received HTTP/3 frame on bidirectional stream",
                );
            });
        }
    }
}

/// Open our control stream and send SETTINGS. Failure closes the connection
/// with `H3_INTERNAL_ERROR`.
async fn open_control_stream<C: Connection>(conn: Arc<C>, settings: Settings) {
    let mut send = match conn.open_uni().await {
        Ok(send) => send,
        Err(e) => {
            tracing::debug!(error = %e, "setting up connection failed");
            conn.close_with(ErrorCode::InternalError, "");
            return;
        }
    };
    let mut buf = Vec::with_capacity(64);
    encode_varint(&mut buf, StreamType::CONTROL);
    Frame::Settings(settings).encode(&mut buf);
    if let Err(e) = send.write_all(&buf).await {
        tracing::debug!(error = %e, "setting up connection failed");
        conn.close_with(ErrorCode::InternalError, "");
        return;
    }
    // The control stream stays open until the connection ends.
    let _ = conn.closed().await;
    drop(send);
}
