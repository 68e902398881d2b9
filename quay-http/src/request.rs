//! Request side of an exchange: the request body type, HEADERS construction
//! and the task that owns a request stream's send half.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{self, HeaderName};
use http::request::Parts;
use http::{HeaderValue, Method};
use quay_h3::frame::{FRAME_DATA, encode_frame_header};
use quay_h3::{ErrorCode, HeaderField};
use quay_quic::SendStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::cancel::RequestContext;
use crate::client::Client;
use crate::config::{DEFAULT_USER_AGENT, RequestOptions};
use crate::error::Error;
use crate::response::Response;

/// Pseudo-method sending a GET in 0-RTT, without waiting for the handshake.
/// 0-RTT data is not replay-protected; use it for idempotent requests only.
pub const METHOD_GET_0RTT: &str = "GET_0RTT";
/// Pseudo-method sending a HEAD in 0-RTT.
pub const METHOD_HEAD_0RTT: &str = "HEAD_0RTT";

const BODY_CHUNK: usize = 8 * 1024;

/// Request body.
#[derive(Default)]
pub enum RequestBody {
    /// No body: the request stream is finished right after HEADERS.
    #[default]
    Empty,
    Bytes(Bytes),
    /// Streamed body. With a declared length, at most that many bytes are
    /// sent and a longer source fails the request.
    Reader {
        reader: Pin<Box<dyn AsyncRead + Send>>,
        content_length: Option<u64>,
    },
}

impl RequestBody {
    pub fn from_reader(reader: impl AsyncRead + Send + 'static, content_length: Option<u64>) -> Self {
        RequestBody::Reader {
            reader: Box::pin(reader),
            content_length,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RequestBody::Empty => true,
            RequestBody::Bytes(b) => b.is_empty(),
            RequestBody::Reader { .. } => false,
        }
    }

    /// Declared length. A streamed body declaring zero counts as unknown.
    pub fn content_length(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Bytes(b) => Some(b.len() as u64),
            RequestBody::Reader { content_length, .. } => content_length.filter(|&n| n > 0),
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            RequestBody::Reader { content_length, .. } => f
                .debug_struct("Reader")
                .field("content_length", content_length)
                .finish_non_exhaustive(),
        }
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(v: Vec<u8>) -> Self {
        Bytes::from(v).into()
    }
}

impl From<&'static [u8]> for RequestBody {
    fn from(s: &'static [u8]) -> Self {
        Bytes::from_static(s).into()
    }
}

impl From<&'static str> for RequestBody {
    fn from(s: &'static str) -> Self {
        Bytes::from_static(s.as_bytes()).into()
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        Bytes::from(s).into()
    }
}

impl From<Bytes> for RequestBody {
    fn from(b: Bytes) -> Self {
        if b.is_empty() {
            RequestBody::Empty
        } else {
            RequestBody::Bytes(b)
        }
    }
}

/// The `:protocol` of an extended CONNECT request (RFC 9220), carried in the
/// request's extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protocol(pub String);

/// Whether this client negotiates gzip for the request: compression is
/// enabled, the method is not HEAD, and the caller set neither
/// `accept-encoding` nor `range`.
pub(crate) fn wants_gzip(parts: &Parts, disable_compression: bool) -> bool {
    let unset = |name: HeaderName| parts.headers.get(name).is_none_or(HeaderValue::is_empty);
    !disable_compression
        && parts.method != Method::HEAD
        && unset(header::ACCEPT_ENCODING)
        && unset(header::RANGE)
}

/// Authority the request targets: the URI's, else the `host` header.
pub(crate) fn request_authority(parts: &Parts) -> Option<&str> {
    parts
        .uri
        .authority()
        .map(|a| a.as_str())
        .or_else(|| parts.headers.get(header::HOST)?.to_str().ok())
}

/// Split `host:port`; `None` when there is no port.
pub(crate) fn split_host_port(authority: &str) -> Option<(&str, &str)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']')?;
        let port = rest[end + 1..].strip_prefix(':')?;
        return Some((&rest[..end], port));
    }
    let (host, port) = authority.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }
    Some((host, port))
}

/// Normalize an authority to `host:port`, defaulting the port to 443.
pub(crate) fn authority_addr(authority: &str) -> String {
    if split_host_port(authority).is_some() {
        return authority.to_string();
    }
    let host = authority.trim_start_matches('[').trim_end_matches(']');
    if host.contains(':') {
        format!("[{host}]:443")
    } else {
        format!("{host}:443")
    }
}

fn is_connection_specific(name: &HeaderName) -> bool {
    name == header::CONNECTION
        || name == header::TRANSFER_ENCODING
        || name == header::UPGRADE
        || name == header::HOST
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
}

fn sends_content_length(method: &Method, length: Option<u64>) -> Option<u64> {
    match length? {
        0 if matches!(*method, Method::POST | Method::PUT | Method::PATCH) => Some(0),
        0 => None,
        n => Some(n),
    }
}

/// Build the header list for a request's HEADERS frame.
pub(crate) fn request_fields(
    parts: &Parts,
    body: &RequestBody,
    requested_gzip: bool,
    user_agent: Option<&str>,
) -> Result<Vec<HeaderField>, Error> {
    let authority = request_authority(parts)
        .ok_or_else(|| Error::InvalidRequest("missing authority".into()))?;
    let protocol = parts.extensions.get::<Protocol>();
    let is_connect = parts.method == Method::CONNECT;
    if protocol.is_some() && !is_connect {
        return Err(Error::InvalidRequest(
            ":protocol is only allowed with CONNECT".into(),
        ));
    }

    let mut fields = vec![HeaderField::new(":method", parts.method.as_str())];
    if is_connect && protocol.is_none() {
        fields.push(HeaderField::new(":authority", authority));
    } else {
        let path = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or("/");
        if let Some(Protocol(protocol)) = protocol {
            fields.push(HeaderField::new(":protocol", protocol.as_str()));
        }
        fields.push(HeaderField::new(
            ":scheme",
            parts.uri.scheme_str().unwrap_or("https"),
        ));
        fields.push(HeaderField::new(":authority", authority));
        fields.push(HeaderField::new(":path", path));
    }

    for (name, value) in &parts.headers {
        if is_connection_specific(name) || name == header::CONTENT_LENGTH {
            continue;
        }
        if name == header::TE && !value.as_bytes().eq_ignore_ascii_case(b"trailers") {
            continue;
        }
        fields.push(HeaderField::new(name.as_str(), value.as_bytes()));
    }

    if let Some(length) = sends_content_length(&parts.method, body.content_length()) {
        fields.push(HeaderField::new("content-length", length.to_string()));
    }
    if requested_gzip {
        fields.push(HeaderField::new("accept-encoding", "gzip"));
    }
    if !parts.headers.contains_key(header::USER_AGENT) {
        let agent = user_agent.unwrap_or(DEFAULT_USER_AGENT);
        if !agent.is_empty() {
            fields.push(HeaderField::new("user-agent", agent));
        }
    }
    Ok(fields)
}

/// Why sending the body stopped early.
enum SendError {
    /// The stream itself failed; the peer already knows.
    Stream(std::io::Error),
    /// The source failed or overran its declared length.
    Source(Error),
}

async fn write_data<S: SendStream>(send: &mut S, data: &[u8]) -> Result<(), SendError> {
    let mut header = Vec::with_capacity(16);
    encode_frame_header(&mut header, FRAME_DATA, data.len() as u64);
    send.write_all(&header).await.map_err(SendError::Stream)?;
    send.write_all(data).await.map_err(SendError::Stream)
}

async fn write_body<S: SendStream>(send: &mut S, body: RequestBody) -> Result<(), SendError> {
    let (mut reader, declared) = match body {
        RequestBody::Empty => return Ok(()),
        RequestBody::Bytes(bytes) => return write_data(send, &bytes).await,
        RequestBody::Reader {
            reader,
            content_length,
        } => (reader, content_length.filter(|&n| n > 0)),
    };

    let source_error = |e: std::io::Error| SendError::Source(Error::Body(e.to_string()));
    let mut buf = vec![0u8; BODY_CHUNK];
    let mut sent = 0u64;
    loop {
        let want = match declared {
            Some(limit) => buf.len().min((limit - sent) as usize),
            None => buf.len(),
        };
        if want == 0 {
            break;
        }
        let n = reader.read(&mut buf[..want]).await.map_err(source_error)?;
        if n == 0 {
            break;
        }
        write_data(send, &buf[..n]).await?;
        sent += n as u64;
    }

    if let Some(declared) = declared {
        let extra = tokio::io::copy(&mut reader, &mut tokio::io::sink())
            .await
            .map_err(source_error)?;
        if extra > 0 {
            return Err(SendError::Source(Error::LengthMismatch {
                declared,
                actual: sent + extra,
            }));
        }
    }
    Ok(())
}

/// Owns the send half of a request stream for its whole life: writes
/// HEADERS, reports the outcome through `head_written`, streams the body and
/// finishes the stream, applying any abort the request's watchers record.
pub(crate) async fn drive_send_half<S: SendStream>(
    mut send: S,
    head: Vec<u8>,
    body: RequestBody,
    keep_open: bool,
    ctx: Arc<RequestContext>,
    head_written: oneshot::Sender<Result<(), Error>>,
) {
    let abort = &ctx.abort;
    let stream_id = ctx.stream_id;

    match abort.guard_write(send.write_all(&head)).await {
        Ok(Ok(())) => {
            let _ = head_written.send(Ok(()));
        }
        Ok(Err(e)) => {
            send.reset(ErrorCode::InternalError.value());
            let _ = head_written.send(Err(Error::from_io(&e)));
            return;
        }
        Err(code) => {
            send.reset(code);
            let _ = head_written.send(Err(Error::Stream {
                code,
                remote: false,
            }));
            return;
        }
    }

    match abort.guard_write(write_body(&mut send, body)).await {
        Ok(Ok(())) => {}
        Ok(Err(SendError::Stream(e))) => {
            tracing::debug!(stream_id, error = %e, "request stream write failed");
            return;
        }
        Ok(Err(SendError::Source(err))) => {
            tracing::error!(stream_id, error = %err, "error writing request");
            ctx.set_body_error(err);
            send.reset(ErrorCode::RequestCanceled.value());
            ctx.abort.abort_both(ErrorCode::RequestCanceled);
            return;
        }
        Err(code) => {
            send.reset(code);
            return;
        }
    }

    if keep_open {
        if let Err(code) = abort.guard_write(ctx.finished.wait()).await {
            send.reset(code);
            return;
        }
    }

    match abort.guard_write(send.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(stream_id, error = %e, "finishing request stream failed"),
        Err(code) => send.reset(code),
    }
}

/// Builder for a request sent through a [`Client`].
///
/// # Example
///
/// ```rust,ignore
/// let resp = client.get("/api/data").header("authorization", "Bearer tok").send().await?;
/// assert_eq!(resp.status(), 200);
/// ```
pub struct RequestBuilder<'a, D: quay_quic::Dialer> {
    client: &'a Client<D>,
    builder: http::request::Builder,
    body: RequestBody,
    options: RequestOptions,
}

impl<'a, D: quay_quic::Dialer> RequestBuilder<'a, D> {
    pub(crate) fn new(client: &'a Client<D>, method: &str, path: &str) -> Self {
        let uri = format!("https://{}{}", client.authority(), path);
        Self {
            client,
            builder: http::Request::builder().method(method).uri(uri),
            body: RequestBody::Empty,
            options: RequestOptions::default(),
        }
    }

    /// Add a header to the request.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.builder = self.builder.header(name, value);
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Send the request and return the response once its headers arrive.
    pub async fn send(self) -> Result<Response, Error> {
        let request = self
            .builder
            .body(self.body)
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;
        self.client.execute(request, self.options).await
    }
}
