//! In-memory QUIC transport and a scripted HTTP/3 server for driving the
//! client without sockets.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::Mutex;
use quay_h3::frame::{self, FrameHead, encode_varint};
use quay_h3::{Frame, HeaderCodec, HeaderField, Settings, StaticQpack, StreamType};
use quay_http::{Client, ClientConfig};
use quay_quic::{
    Connection, Dialer, RecvStream, SendStream, TlsParams, TlsState, TransportConfig,
    TransportError,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

pub const AUTHORITY: &str = "example.com:443";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

impl Side {
    fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

#[derive(Debug, Clone)]
struct Closed {
    by: Side,
    code: u64,
    reason: String,
}

impl Closed {
    fn error_for(&self, side: Side) -> TransportError {
        if self.by == side {
            TransportError::LocallyClosed
        } else {
            TransportError::ApplicationClosed {
                code: self.code,
                reason: self.reason.clone(),
                remote: true,
            }
        }
    }
}

// ── Streams ─────────────────────────────────────────────────────────

#[derive(Default)]
struct PipeState {
    data: VecDeque<u8>,
    fin: bool,
    reset: Option<u64>,
    stopped: Option<u64>,
    closed: Option<Closed>,
    reader: Option<Waker>,
    writer: Option<Waker>,
}

impl PipeState {
    fn wake(&mut self) {
        if let Some(w) = self.reader.take() {
            w.wake();
        }
        if let Some(w) = self.writer.take() {
            w.wake();
        }
    }
}

/// One direction of a stream.
#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
}

/// The sending half of an in-memory stream.
pub struct MockSend {
    id: u64,
    side: Side,
    pipe: Arc<Pipe>,
}

/// The receiving half of an in-memory stream.
pub struct MockRecv {
    id: u64,
    side: Side,
    pipe: Arc<Pipe>,
}

impl MockSend {
    /// Resolves with the code of the peer's STOP_SENDING.
    pub async fn stopped(&self) -> u64 {
        std::future::poll_fn(|cx| {
            let mut st = self.pipe.state.lock();
            match st.stopped {
                Some(code) => Poll::Ready(code),
                None => {
                    st.writer = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await
    }

    pub fn stop_code(&self) -> Option<u64> {
        self.pipe.state.lock().stopped
    }
}

impl SendStream for MockSend {
    fn id(&self) -> u64 {
        self.id
    }

    fn reset(&mut self, code: u64) {
        let mut st = self.pipe.state.lock();
        if st.reset.is_none() && !(st.fin && st.data.is_empty()) {
            st.reset = Some(code);
            st.data.clear();
            st.wake();
        }
    }
}

impl AsyncWrite for MockSend {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut st = self.pipe.state.lock();
        if let Some(closed) = &st.closed {
            return Poll::Ready(Err(closed.error_for(self.side).into_io()));
        }
        if let Some(code) = st.stopped {
            return Poll::Ready(Err(TransportError::StreamStopped(code).into_io()));
        }
        if st.reset.is_some() || st.fin {
            return Poll::Ready(Err(TransportError::ClosedStream.into_io()));
        }
        st.data.extend(buf);
        st.wake();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut st = self.pipe.state.lock();
        if let Some(closed) = &st.closed {
            return Poll::Ready(Err(closed.error_for(self.side).into_io()));
        }
        if st.reset.is_some() {
            return Poll::Ready(Err(TransportError::ClosedStream.into_io()));
        }
        st.fin = true;
        st.wake();
        Poll::Ready(Ok(()))
    }
}

impl RecvStream for MockRecv {
    fn id(&self) -> u64 {
        self.id
    }

    fn stop(&mut self, code: u64) {
        let mut st = self.pipe.state.lock();
        if st.stopped.is_none() {
            st.stopped = Some(code);
            st.data.clear();
            st.wake();
        }
    }
}

impl AsyncRead for MockRecv {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut st = self.pipe.state.lock();
        if let Some(closed) = &st.closed {
            return Poll::Ready(Err(closed.error_for(self.side).into_io()));
        }
        if let Some(code) = st.reset {
            return Poll::Ready(Err(TransportError::StreamReset(code).into_io()));
        }
        if st.stopped.is_some() {
            return Poll::Ready(Err(TransportError::ClosedStream.into_io()));
        }
        if !st.data.is_empty() {
            let n = buf.remaining().min(st.data.len());
            let chunk: Vec<u8> = st.data.drain(..n).collect();
            buf.put_slice(&chunk);
            st.wake();
            return Poll::Ready(Ok(()));
        }
        if st.fin {
            return Poll::Ready(Ok(()));
        }
        st.reader = Some(cx.waker().clone());
        Poll::Pending
    }
}

// ── Connections ─────────────────────────────────────────────────────

struct Shared {
    pipes: Mutex<Vec<Arc<Pipe>>>,
    closed: watch::Sender<Option<Closed>>,
    handshake: watch::Sender<bool>,
}

impl Shared {
    fn pipe(&self) -> Arc<Pipe> {
        let pipe = Arc::new(Pipe::default());
        self.pipes.lock().push(Arc::clone(&pipe));
        pipe
    }

    fn close(&self, by: Side, code: u64, reason: &[u8]) {
        let closed = Closed {
            by,
            code,
            reason: String::from_utf8_lossy(reason).into_owned(),
        };
        let first = self.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(closed.clone());
            true
        });
        if first {
            for pipe in self.pipes.lock().iter() {
                let mut st = pipe.state.lock();
                st.closed = Some(closed.clone());
                st.wake();
            }
        }
    }

    fn closed_error(&self, side: Side) -> Option<TransportError> {
        self.closed.borrow().as_ref().map(|c| c.error_for(side))
    }
}

/// One endpoint of an in-memory connection. The client and the scripted
/// server each hold one.
pub struct MockConnection {
    side: Side,
    shared: Arc<Shared>,
    incoming_bi: tokio::sync::Mutex<mpsc::UnboundedReceiver<(MockSend, MockRecv)>>,
    incoming_uni: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockRecv>>,
    peer_bi: mpsc::UnboundedSender<(MockSend, MockRecv)>,
    peer_uni: mpsc::UnboundedSender<MockRecv>,
    next_bi: AtomicU64,
    next_uni: AtomicU64,
}

impl MockConnection {
    fn pair(handshake_done: bool) -> (MockConnection, MockConnection) {
        let shared = Arc::new(Shared {
            pipes: Mutex::new(Vec::new()),
            closed: watch::channel(None).0,
            handshake: watch::channel(handshake_done).0,
        });
        let (client_bi_tx, client_bi_rx) = mpsc::unbounded_channel();
        let (client_uni_tx, client_uni_rx) = mpsc::unbounded_channel();
        let (server_bi_tx, server_bi_rx) = mpsc::unbounded_channel();
        let (server_uni_tx, server_uni_rx) = mpsc::unbounded_channel();
        let client = MockConnection {
            side: Side::Client,
            shared: Arc::clone(&shared),
            incoming_bi: tokio::sync::Mutex::new(client_bi_rx),
            incoming_uni: tokio::sync::Mutex::new(client_uni_rx),
            peer_bi: server_bi_tx,
            peer_uni: server_uni_tx,
            next_bi: AtomicU64::new(0),
            next_uni: AtomicU64::new(2),
        };
        let server = MockConnection {
            side: Side::Server,
            shared,
            incoming_bi: tokio::sync::Mutex::new(server_bi_rx),
            incoming_uni: tokio::sync::Mutex::new(server_uni_rx),
            peer_bi: client_bi_tx,
            peer_uni: client_uni_tx,
            next_bi: AtomicU64::new(1),
            next_uni: AtomicU64::new(3),
        };
        (client, server)
    }

    fn check_open(&self) -> Result<(), TransportError> {
        match self.shared.closed_error(self.side) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn wait_closed(&self) -> TransportError {
        let mut rx = self.shared.closed.subscribe();
        let closed = rx.wait_for(Option::is_some).await.ok().and_then(|c| (*c).clone());
        match closed {
            Some(closed) => closed.error_for(self.side),
            None => TransportError::LocallyClosed,
        }
    }

    fn peer_gone() -> TransportError {
        TransportError::ConnectionLost("peer gone".into())
    }
}

impl Connection for MockConnection {
    type Send = MockSend;
    type Recv = MockRecv;

    async fn open_bi(&self) -> Result<(MockSend, MockRecv), TransportError> {
        self.check_open()?;
        let id = self.next_bi.fetch_add(4, Ordering::Relaxed);
        let out = self.shared.pipe();
        let back = self.shared.pipe();
        let peer = self.side.peer();
        let remote = (
            MockSend {
                id,
                side: peer,
                pipe: Arc::clone(&back),
            },
            MockRecv {
                id,
                side: peer,
                pipe: Arc::clone(&out),
            },
        );
        self.peer_bi.send(remote).map_err(|_| Self::peer_gone())?;
        Ok((
            MockSend {
                id,
                side: self.side,
                pipe: out,
            },
            MockRecv {
                id,
                side: self.side,
                pipe: back,
            },
        ))
    }

    async fn open_uni(&self) -> Result<MockSend, TransportError> {
        self.check_open()?;
        let id = self.next_uni.fetch_add(4, Ordering::Relaxed);
        let pipe = self.shared.pipe();
        let remote = MockRecv {
            id,
            side: self.side.peer(),
            pipe: Arc::clone(&pipe),
        };
        self.peer_uni.send(remote).map_err(|_| Self::peer_gone())?;
        Ok(MockSend {
            id,
            side: self.side,
            pipe,
        })
    }

    async fn accept_bi(&self) -> Result<(MockSend, MockRecv), TransportError> {
        let mut incoming = self.incoming_bi.lock().await;
        tokio::select! {
            biased;
            err = self.wait_closed() => Err(err),
            stream = incoming.recv() => stream.ok_or_else(Self::peer_gone),
        }
    }

    async fn accept_uni(&self) -> Result<MockRecv, TransportError> {
        let mut incoming = self.incoming_uni.lock().await;
        tokio::select! {
            biased;
            err = self.wait_closed() => Err(err),
            stream = incoming.recv() => stream.ok_or_else(Self::peer_gone),
        }
    }

    async fn handshake_complete(&self) -> Result<(), TransportError> {
        let mut rx = self.shared.handshake.subscribe();
        tokio::select! {
            biased;
            done = rx.wait_for(|done| *done) => done.map(|_| ()).map_err(|_| Self::peer_gone()),
            err = self.wait_closed() => Err(err),
        }
    }

    fn is_handshake_complete(&self) -> bool {
        *self.shared.handshake.borrow()
    }

    async fn closed(&self) -> TransportError {
        self.wait_closed().await
    }

    fn close(&self, code: u64, reason: &[u8]) {
        self.shared.close(self.side, code, reason);
    }

    fn tls_state(&self) -> TlsState {
        TlsState {
            server_name: Some("example.com".into()),
            alpn: Some(b"h3".to_vec()),
            peer_certificates: Vec::new(),
            handshake_complete: self.is_handshake_complete(),
        }
    }
}

// ── Dialer ──────────────────────────────────────────────────────────

/// How a [`MockDialer`] behaves.
#[derive(Debug, Clone)]
pub struct DialPlan {
    pub fail: Option<TransportError>,
    pub delay: Option<Duration>,
    pub handshake_done: bool,
}

impl Default for DialPlan {
    fn default() -> Self {
        Self {
            fail: None,
            delay: None,
            handshake_done: true,
        }
    }
}

/// Dials in-memory connections and hands each server end to the test.
#[derive(Clone)]
pub struct MockDialer {
    plan: DialPlan,
    dials: Arc<AtomicUsize>,
    last: Arc<Mutex<Option<(String, TlsParams, TransportConfig)>>>,
    servers: mpsc::UnboundedSender<MockServer>,
}

impl MockDialer {
    pub fn new(plan: DialPlan) -> (MockDialer, mpsc::UnboundedReceiver<MockServer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = MockDialer {
            plan,
            dials: Arc::new(AtomicUsize::new(0)),
            last: Arc::new(Mutex::new(None)),
            servers: tx,
        };
        (dialer, rx)
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Authority, TLS parameters and transport config of the latest dial.
    pub fn last_dial(&self) -> Option<(String, TlsParams, TransportConfig)> {
        self.last.lock().clone()
    }
}

impl Dialer for MockDialer {
    type Connection = MockConnection;

    async fn dial(
        &self,
        authority: &str,
        tls: &TlsParams,
        config: &TransportConfig,
    ) -> Result<MockConnection, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some((authority.to_string(), tls.clone(), config.clone()));
        if let Some(delay) = self.plan.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.plan.fail {
            return Err(err.clone());
        }
        let (client, server) = MockConnection::pair(self.plan.handshake_done);
        let _ = self.servers.send(MockServer { conn: server });
        Ok(client)
    }
}

/// A client over the mock transport, plus the channel its servers arrive on.
pub fn client(
    config: ClientConfig,
) -> (
    Client<MockDialer>,
    MockDialer,
    mpsc::UnboundedReceiver<MockServer>,
) {
    client_with(config, DialPlan::default())
}

pub fn client_with(
    config: ClientConfig,
    plan: DialPlan,
) -> (
    Client<MockDialer>,
    MockDialer,
    mpsc::UnboundedReceiver<MockServer>,
) {
    init_logging();
    let (dialer, servers) = MockDialer::new(plan);
    let client = Client::with_dialer("example.com", config, dialer.clone()).unwrap();
    (client, dialer, servers)
}

/// Route client logs through the test harness; `RUST_LOG` selects levels.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_test_writer())
        .try_init();
}

/// Poll `cond` until it holds; panics after a few seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

// ── Scripted server ─────────────────────────────────────────────────

pub fn fields(list: &[(&str, &str)]) -> Vec<HeaderField> {
    list.iter().map(|(n, v)| HeaderField::new(*n, *v)).collect()
}

pub fn headers_frame(list: &[(&str, &str)]) -> Vec<u8> {
    let mut block = Vec::new();
    StaticQpack.encode(&fields(list), &mut block);
    let mut buf = Vec::new();
    Frame::Headers { encoded: block }.encode(&mut buf);
    buf
}

pub fn data_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    Frame::Data {
        payload: payload.to_vec(),
    }
    .encode(&mut buf);
    buf
}

/// The server end of a dialed connection.
pub struct MockServer {
    pub conn: MockConnection,
}

impl MockServer {
    /// Accept the next request stream and decode its HEADERS.
    pub async fn accept_request(&self) -> ServerRequest {
        let (send, mut recv) = self.conn.accept_bi().await.unwrap();
        let fields = match frame::read_frame(&mut recv).await.unwrap() {
            Some(FrameHead::Headers { len }) => {
                let mut block = vec![0u8; len as usize];
                recv.read_exact(&mut block).await.unwrap();
                StaticQpack.decode(&block).unwrap()
            }
            other => panic!("expected HEADERS, got {other:?}"),
        };
        ServerRequest {
            id: send.id(),
            fields,
            send,
            recv,
        }
    }

    /// Open the server's control stream and send SETTINGS.
    pub async fn open_control(&self, settings: Settings) -> ControlStream {
        let mut send = self.open_uni_typed(StreamType::CONTROL).await;
        let mut buf = Vec::new();
        Frame::Settings(settings).encode(&mut buf);
        send.write_all(&buf).await.unwrap();
        ControlStream { send }
    }

    /// Open a unidirectional stream and write its type.
    pub async fn open_uni_typed(&self, stream_type: u64) -> MockSend {
        let mut send = self.conn.open_uni().await.unwrap();
        let mut buf = Vec::new();
        encode_varint(&mut buf, stream_type);
        send.write_all(&buf).await.unwrap();
        send
    }

    /// Read the client's control stream up to its SETTINGS.
    pub async fn accept_client_settings(&self) -> Settings {
        let mut recv = self.conn.accept_uni().await.unwrap();
        let stream_type = frame::read_varint(&mut recv).await.unwrap();
        assert_eq!(stream_type, Some(StreamType::CONTROL));
        match frame::read_frame(&mut recv).await.unwrap() {
            Some(FrameHead::Settings(settings)) => settings,
            other => panic!("expected SETTINGS, got {other:?}"),
        }
    }

    pub fn close(&self, code: u64, reason: &str) {
        self.conn.close(code, reason.as_bytes());
    }

    /// The error code the client closed the connection with.
    pub async fn closed_by_client(&self) -> u64 {
        match self.conn.closed().await {
            TransportError::ApplicationClosed { code, .. } => code,
            other => panic!("connection not closed by client: {other:?}"),
        }
    }

    pub fn complete_handshake(&self) {
        self.conn.shared.handshake.send_replace(true);
    }
}

/// The server's control stream.
pub struct ControlStream {
    pub send: MockSend,
}

impl ControlStream {
    pub async fn frame(&mut self, frame: Frame) {
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        self.send.write_all(&buf).await.unwrap();
    }

    pub async fn goaway(&mut self, stream_id: u64) {
        self.frame(Frame::GoAway { stream_id }).await;
    }
}

/// A request as seen by the server.
pub struct ServerRequest {
    pub id: u64,
    pub fields: Vec<HeaderField>,
    pub send: MockSend,
    pub recv: MockRecv,
}

impl ServerRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.fields
            .iter()
            .find(|f| f.name == name.as_bytes())
            .map(|f| String::from_utf8_lossy(&f.value).into_owned())
    }

    /// Read DATA frames to the end of the request stream.
    pub async fn read_body(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut body = Vec::new();
        loop {
            match frame::read_frame(&mut self.recv).await {
                Ok(Some(FrameHead::Data { len })) => {
                    let mut chunk = vec![0u8; len as usize];
                    self.recv
                        .read_exact(&mut chunk)
                        .await
                        .map_err(|e| TransportError::from_io(&e))?;
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => return Ok(body),
                Ok(Some(other)) => panic!("unexpected frame in request body: {other:?}"),
                Err(quay_h3::H3Error::Io(e)) => return Err(TransportError::from_io(&e)),
                Err(e) => panic!("malformed request body: {e}"),
            }
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) {
        self.send.write_all(bytes).await.unwrap();
    }

    pub async fn respond(&mut self, status: u16, headers: &[(&str, &str)]) {
        let status = status.to_string();
        let mut list = vec![(":status", status.as_str())];
        list.extend_from_slice(headers);
        self.write(&headers_frame(&list)).await;
    }

    pub async fn data(&mut self, payload: &[u8]) {
        self.write(&data_frame(payload)).await;
    }

    pub async fn trailers(&mut self, headers: &[(&str, &str)]) {
        self.write(&headers_frame(headers)).await;
    }

    pub async fn finish(&mut self) {
        self.send.shutdown().await.unwrap();
    }

    pub fn reset(&mut self, code: u64) {
        self.send.reset(code);
    }
}
