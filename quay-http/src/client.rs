//! Top-level HTTP/3 client: one lazily dialed connection per authority and
//! the request coordinator that runs every exchange on it.

use std::sync::Arc;

use http::Method;
use http::header;
use quay_h3::frame::{self, FrameHead};
use quay_h3::{ErrorCode, Frame, H3Error, Settings};
use quay_quic::{
    Connection, Dialer, QuinnDialer, RecvStream, SendStream, TlsParams, TransportConfig,
    TransportError, VERSION_1, alpn_for_version,
};
use tokio::io::AsyncReadExt;
use tokio::sync::{OnceCell, oneshot};

use crate::body::{Body, BodyParts, GzipBody, ResponseBody};
use crate::cancel::{AbortHandle, CallerContext, CancelToken, Cause, RequestContext, StreamAbort};
use crate::config::{ClientConfig, RequestOptions};
use crate::connection::{CloseConnection, Established};
use crate::error::Error;
use crate::request::{
    METHOD_GET_0RTT, METHOD_HEAD_0RTT, RequestBody, RequestBuilder, authority_addr,
    drive_send_half, request_authority, request_fields, split_host_port, wants_gzip,
};
use crate::response::{
    Response, ResponseHead, ResponseMeta, is_gzip_response, parse_response_head,
    reported_content_length,
};
use crate::stream::Shared;

/// HTTP/3 client for a single authority.
///
/// The connection is dialed by the first request; concurrent first requests
/// share one dial, and a failed dial is returned to every later request.
/// Cloning is cheap and clones share the connection.
///
/// # Example
///
/// ```rust,ignore
/// let client = Client::new("example.com", ClientConfig::default())?;
/// let resp = client.get("/api/data").header("authorization", "Bearer tok").send().await?;
/// assert_eq!(resp.status(), 200);
/// let body = resp.bytes().await?;
/// ```
pub struct Client<D: Dialer = QuinnDialer> {
    inner: Arc<Inner<D>>,
}

struct Inner<D: Dialer> {
    /// Normalized `host:port`.
    authority: String,
    config: ClientConfig,
    tls: TlsParams,
    transport: TransportConfig,
    dialer: D,
    established: OnceCell<Result<Arc<Established<D::Connection>>, Error>>,
}

impl<D: Dialer> Drop for Inner<D> {
    fn drop(&mut self) {
        if let Some(Ok(established)) = self.established.get() {
            established.conn.close_with(ErrorCode::NoError, "");
        }
    }
}

impl<D: Dialer> Clone for Client<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Client<QuinnDialer> {
    /// Create a client for `authority` (`host` or `host:port`) over QUIC.
    pub fn new(authority: &str, config: ClientConfig) -> Result<Self, Error> {
        Self::with_dialer(authority, config, QuinnDialer)
    }
}

impl<D: Dialer> Client<D> {
    /// Create a client that dials through `dialer`.
    ///
    /// Validates the configuration: exactly one QUIC version (none means
    /// version 1), and HTTP datagrams only on top of QUIC datagrams. The
    /// ALPN token follows the version and SNI defaults to the host.
    pub fn with_dialer(authority: &str, config: ClientConfig, dialer: D) -> Result<Self, Error> {
        if authority.is_empty() {
            return Err(Error::Config("empty authority".into()));
        }
        let mut transport = match &config.transport {
            Some(transport) => transport.clone(),
            None => TransportConfig {
                enable_datagrams: config.enable_datagrams,
                ..TransportConfig::default()
            },
        };
        if transport.versions.is_empty() {
            transport.versions = vec![VERSION_1];
        }
        if transport.versions.len() != 1 {
            return Err(Error::Config(
                "can only use a single QUIC version for dialing a HTTP/3 connection".into(),
            ));
        }
        if config.enable_datagrams && !transport.enable_datagrams {
            return Err(Error::Config(
                "HTTP datagrams enabled, but QUIC datagrams disabled".into(),
            ));
        }

        let mut tls = config.tls.clone();
        if tls.server_name.is_none() {
            let host = split_host_port(authority).map_or(authority, |(host, _)| host);
            tls.server_name = Some(host.trim_start_matches('[').trim_end_matches(']').into());
        }
        tls.alpn_protocols = vec![alpn_for_version(transport.versions[0]).to_vec()];

        Ok(Self {
            inner: Arc::new(Inner {
                authority: authority_addr(authority),
                config,
                tls,
                transport,
                dialer,
                established: OnceCell::new(),
            }),
        })
    }

    /// The normalized `host:port` this client serves.
    pub fn authority(&self) -> &str {
        &self.inner.authority
    }

    /// Build a GET request.
    pub fn get(&self, path: &str) -> RequestBuilder<'_, D> {
        RequestBuilder::new(self, "GET", path)
    }

    /// Build a POST request.
    pub fn post(&self, path: &str) -> RequestBuilder<'_, D> {
        RequestBuilder::new(self, "POST", path)
    }

    /// Build a PUT request.
    pub fn put(&self, path: &str) -> RequestBuilder<'_, D> {
        RequestBuilder::new(self, "PUT", path)
    }

    /// Build a DELETE request.
    pub fn delete(&self, path: &str) -> RequestBuilder<'_, D> {
        RequestBuilder::new(self, "DELETE", path)
    }

    /// Build a request with any method, including `GET_0RTT` and `HEAD_0RTT`.
    pub fn request(&self, method: &str, path: &str) -> RequestBuilder<'_, D> {
        RequestBuilder::new(self, method, path)
    }

    /// Close the connection with `H3_NO_ERROR`, if one was dialed.
    pub fn close(&self) {
        if let Some(Ok(established)) = self.inner.established.get() {
            established.conn.close_with(ErrorCode::NoError, "");
        }
    }

    /// Whether the dialed connection finished its handshake.
    pub fn handshake_complete(&self) -> bool {
        match self.inner.established.get() {
            Some(Ok(established)) => established.conn.is_handshake_complete(),
            _ => false,
        }
    }

    /// The server's SETTINGS, once received.
    pub fn settings(&self) -> Option<Arc<Settings>> {
        match self.inner.established.get() {
            Some(Ok(established)) => established.settings(),
            _ => None,
        }
    }

    /// Stream id of the server's most recent GOAWAY.
    pub fn goaway_id(&self) -> Option<u64> {
        match self.inner.established.get() {
            Some(Ok(established)) => established.registry.goaway_id(),
            _ => None,
        }
    }

    /// Requests whose responses are still in progress.
    pub fn in_flight(&self) -> usize {
        match self.inner.established.get() {
            Some(Ok(established)) => established.registry.len(),
            _ => 0,
        }
    }

    /// Run one request/response exchange.
    ///
    /// Returns once the response headers arrive; the body streams from the
    /// returned [`Response`]. The request body is sent concurrently.
    pub async fn execute(
        &self,
        request: http::Request<RequestBody>,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        let caller = CallerContext::new(&options);
        let (mut parts, body) = request.into_parts();

        let target = request_authority(&parts).map(authority_addr).unwrap_or_default();
        if target != self.inner.authority {
            return Err(Error::AuthorityMismatch {
                client: self.inner.authority.clone(),
                request: target,
            });
        }

        let established = self.establish(&caller).await?;
        let conn = &established.conn;
        if established.registry.goaway_received() {
            return Err(Error::Goaway);
        }

        match parts.method.as_str() {
            METHOD_GET_0RTT => parts.method = Method::GET,
            METHOD_HEAD_0RTT => parts.method = Method::HEAD,
            _ => {
                tokio::select! {
                    biased;
                    err = caller.done() => return Err(err),
                    res = conn.handshake_complete() => res.map_err(Error::Handshake)?,
                }
            }
        }

        if let Some(check) = &options.check_settings {
            let settings = tokio::select! {
                biased;
                err = caller.done() => return Err(err),
                settings = established.peer_settings() => settings?,
            };
            check(&settings).map_err(Error::SettingsRejected)?;
        }

        let (send, recv) = tokio::select! {
            biased;
            err = caller.done() => return Err(err),
            stream = conn.open_bi() => stream.map_err(Error::from_transport)?,
        };
        let stream_id = send.id();
        let send = Shared::send(send);
        let recv = Shared::recv(recv);
        let abort = {
            let send = send.clone();
            let recv = recv.clone();
            let reset: AbortHandle = Arc::new(move |code: u64| send.reset_writing(code));
            let stop: AbortHandle = Arc::new(move |code: u64| recv.stop_reading(code));
            StreamAbort::attached(reset, stop)
        };
        let token = CancelToken::new();
        let registration = established.registry.register(stream_id, token.clone());
        let ctx = Arc::new(RequestContext::new(
            stream_id,
            token,
            caller,
            abort,
            Some(registration),
        ));
        let mut guard = DropGuard::new(&ctx);
        tracing::trace!(stream_id, method = %parts.method, uri = %parts.uri, "sending request");

        tokio::spawn(watch_goaway(Arc::clone(&ctx)));
        let watcher = tokio::spawn(watch_caller(Arc::clone(&ctx)));

        let exchange = Exchange {
            config: &self.inner.config,
            established: &established,
            ctx: &ctx,
            keep_open: options.dont_close_request_stream,
        };
        match exchange.run(parts, body, send, recv).await {
            Ok(response) => {
                if options.dont_close_request_stream {
                    ctx.unwatch.fire();
                    let _ = watcher.await;
                }
                guard.disarm();
                Ok(response)
            }
            Err(failure) => {
                ctx.unwatch.fire();
                let _ = watcher.await;
                if let Some(code) = failure.stream {
                    ctx.abort.abort_write(code);
                }
                if let Some(code) = failure.connection {
                    conn.close_with(code, &failure.error.to_string());
                }
                let err = ctx.normalize(failure.error);
                tracing::debug!(stream_id, error = %err, "request failed");
                ctx.finish();
                guard.disarm();
                Err(err)
            }
        }
    }

    /// The connection, dialing it on first use. The caller giving up does
    /// not poison the cell for later requests.
    async fn establish(
        &self,
        caller: &CallerContext,
    ) -> Result<Arc<Established<D::Connection>>, Error> {
        let result = tokio::select! {
            biased;
            err = caller.done() => return Err(err),
            result = self.inner.established.get_or_init(|| self.dial()) => result,
        };
        result.clone()
    }

    async fn dial(&self) -> Result<Arc<Established<D::Connection>>, Error> {
        let inner = &self.inner;
        let conn = inner
            .dialer
            .dial(&inner.authority, &inner.tls, &inner.transport)
            .await
            .map_err(|e| {
                tracing::warn!(authority = %inner.authority, error = %e, "dial failed");
                Error::Dial(e)
            })?;
        tracing::debug!(authority = %inner.authority, "connection established");
        Ok(Established::start(
            conn,
            inner.config.settings(),
            inner.config.stream_hijacker.clone(),
            inner.config.uni_stream_hijacker.clone(),
        ))
    }
}

/// Aborts both directions once a GOAWAY covers the request, whether or not
/// anyone is still reading the response.
async fn watch_goaway(ctx: Arc<RequestContext>) {
    if ctx.token.cancelled().await == Cause::Goaway {
        tracing::debug!(stream_id = ctx.stream_id, "request canceled by GOAWAY");
        ctx.abort.abort_both(ErrorCode::RequestCanceled);
        ctx.finish();
    }
}

/// Aborts both directions when the caller gives up, until unwatched.
async fn watch_caller(ctx: Arc<RequestContext>) {
    tokio::select! {
        biased;
        _ = ctx.unwatch.wait() => {}
        err = ctx.caller.done() => {
            ctx.token.cancel_with(CallerContext::cause_of(&err));
            ctx.abort.abort_both(ErrorCode::RequestCanceled);
            ctx.finish();
        }
    }
}

/// Cancels the request if `execute` is dropped before it returns.
struct DropGuard {
    ctx: Option<Arc<RequestContext>>,
}

impl DropGuard {
    fn new(ctx: &Arc<RequestContext>) -> Self {
        Self {
            ctx: Some(Arc::clone(ctx)),
        }
    }

    fn disarm(&mut self) {
        self.ctx = None;
    }
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            tracing::debug!(stream_id = ctx.stream_id, "request dropped before completion");
            ctx.token.cancel_with(Cause::Canceled);
            ctx.abort.abort_both(ErrorCode::RequestCanceled);
            ctx.finish();
        }
    }
}

/// A failed exchange: the error plus the aborts it calls for.
struct Failure {
    error: Error,
    /// Reset the request stream's write side with this code.
    stream: Option<ErrorCode>,
    /// Close the connection with this code.
    connection: Option<ErrorCode>,
}

impl Failure {
    fn plain(error: Error) -> Self {
        Self {
            error,
            stream: None,
            connection: None,
        }
    }

    fn connection(code: ErrorCode, message: &str) -> Self {
        Self {
            error: Error::protocol(code, message),
            stream: None,
            connection: Some(code),
        }
    }
}

/// Stop reading `recv` and fail with a stream abort.
fn stream_failure<R: RecvStream>(recv: &mut R, code: ErrorCode, error: Error) -> Failure {
    recv.stop(code.value());
    Failure {
        error,
        stream: Some(code),
        connection: None,
    }
}

fn local_abort<R: RecvStream>(recv: &mut R, code: u64) -> Failure {
    recv.stop(code);
    Failure::plain(Error::Stream {
        code,
        remote: false,
    })
}

struct Exchange<'a, C: Connection> {
    config: &'a ClientConfig,
    established: &'a Arc<Established<C>>,
    ctx: &'a Arc<RequestContext>,
    keep_open: bool,
}

impl<C: Connection> Exchange<'_, C> {
    async fn run(
        &self,
        parts: http::request::Parts,
        body: RequestBody,
        mut send: Shared<C::Send>,
        mut recv: Shared<C::Recv>,
    ) -> Result<Response, Failure> {
        let config = self.config;
        let requested_gzip = wants_gzip(&parts, config.disable_compression);
        let fields = match request_fields(&parts, &body, requested_gzip, config.user_agent.as_deref())
        {
            Ok(fields) => fields,
            Err(err) => {
                send.reset(ErrorCode::InternalError.value());
                recv.stop(ErrorCode::InternalError.value());
                return Err(Failure::plain(err));
            }
        };
        let mut block = Vec::new();
        config.header_codec.encode(&fields, &mut block);
        let mut head = Vec::with_capacity(block.len() + 16);
        Frame::Headers { encoded: block }.encode(&mut head);

        let (head_tx, head_rx) = oneshot::channel();
        tokio::spawn(drive_send_half(
            send,
            head,
            body,
            self.keep_open,
            Arc::clone(self.ctx),
            head_tx,
        ));
        match head_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let code = match err {
                    Error::Stream {
                        code,
                        remote: false,
                    } => code,
                    _ => ErrorCode::InternalError.value(),
                };
                recv.stop(code);
                return Err(Failure::plain(err));
            }
            Err(_) => {
                return Err(Failure::plain(Error::Transport(TransportError::ClosedStream)));
            }
        }

        let head = self.read_head(&mut recv).await?;
        let content_length =
            reported_content_length(&parts.method, head.status, &head.headers, head.declared_length);
        let declared_length = head.declared_length;
        let mut head = head;

        let plain = ResponseBody::new(BodyParts {
            recv: Box::new(recv),
            ctx: Arc::clone(self.ctx),
            conn: Arc::clone(&self.established.conn) as Arc<dyn CloseConnection>,
            codec: Arc::clone(&config.header_codec),
            max_header_bytes: config.max_header_bytes(),
            content_length: declared_length,
        });

        let uncompressed = is_gzip_response(requested_gzip, &head.headers);
        let (body, content_length) = if uncompressed {
            head.headers.remove(header::CONTENT_ENCODING);
            head.headers.remove(header::CONTENT_LENGTH);
            (Body::Gzip(GzipBody::new(plain)), -1)
        } else {
            (Body::Plain(plain), content_length)
        };

        let meta = ResponseMeta {
            content_length,
            uncompressed,
            tls: self.established.conn.tls_state(),
            stream_id: self.ctx.stream_id,
        };
        Ok(Response::new(head, meta, body))
    }

    /// Read and decode the response's HEADERS frame.
    async fn read_head(&self, recv: &mut Shared<C::Recv>) -> Result<ResponseHead, Failure> {
        let abort = &self.ctx.abort;
        let max = self.config.max_header_bytes();

        let first = match abort.guard_read(frame::read_frame(recv)).await {
            Ok(first) => first,
            Err(code) => return Err(local_abort(recv, code)),
        };
        let len = match first {
            Ok(Some(FrameHead::Headers { len })) => len,
            Ok(Some(other)) => {
                tracing::debug!(frame = ?other, "response did not start with HEADERS");
                return Err(Failure::connection(
                    ErrorCode::FrameUnexpected,
                    "expected first frame to be a HEADERS frame",
                ));
            }
            Ok(None) => {
                let err = Error::protocol(ErrorCode::FrameError, "stream ended before HEADERS");
                return Err(stream_failure(recv, ErrorCode::FrameError, err));
            }
            Err(H3Error::Io(e)) => {
                return Err(stream_failure(recv, ErrorCode::FrameError, Error::from_io(&e)));
            }
            Err(e) => {
                let err = Error::protocol(ErrorCode::FrameError, e.to_string());
                return Err(stream_failure(recv, ErrorCode::FrameError, err));
            }
        };

        if len > max {
            let err = Error::protocol(
                ErrorCode::FrameError,
                format!("HEADERS frame too large: {len} bytes (max: {max})"),
            );
            return Err(stream_failure(recv, ErrorCode::FrameError, err));
        }

        let mut block = vec![0u8; len as usize];
        match abort.guard_read(recv.read_exact(&mut block)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(stream_failure(
                    recv,
                    ErrorCode::RequestIncomplete,
                    Error::from_io(&e),
                ));
            }
            Err(code) => return Err(local_abort(recv, code)),
        }

        let fields = self.config.header_codec.decode(&block).map_err(|e| {
            Failure::connection(ErrorCode::GeneralProtocolError, &e.to_string())
        })?;
        parse_response_head(fields).map_err(|message| {
            stream_failure(
                recv,
                ErrorCode::MessageError,
                Error::protocol(ErrorCode::MessageError, message),
            )
        })
    }
}
