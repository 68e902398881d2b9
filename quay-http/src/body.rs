//! Response bodies.
//!
//! [`ResponseBody`] reads DATA frames off the request stream, enforcing the
//! declared content length. [`Body`] is what a [`Response`](crate::Response)
//! hands out: either the plain body or a gzip decoder over it.

use std::io::Write;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use flate2::write::GzDecoder;
use http::HeaderMap;
use quay_h3::frame::{self, FrameHead};
use quay_h3::{ErrorCode, H3Error, HeaderCodec};
use quay_quic::RecvStream;
use tokio::io::AsyncReadExt;

use crate::cancel::RequestContext;
use crate::connection::CloseConnection;
use crate::error::Error;
use crate::response::header_map;

const CHUNK: usize = 16 * 1024;

#[derive(Debug)]
enum State {
    Open,
    /// Clean end of stream (or trailers) observed.
    Done,
    Failed(Error),
    /// Closed by the caller before the end.
    Closed,
}

/// The body of a response, read from its request stream.
///
/// Dropping the body closes it.
pub struct ResponseBody {
    recv: Box<dyn RecvStream>,
    ctx: Arc<RequestContext>,
    conn: Arc<dyn CloseConnection>,
    codec: Arc<dyn HeaderCodec>,
    max_header_bytes: u64,
    /// Unread bytes of the current DATA frame.
    frame_remaining: u64,
    /// Bytes the declared content length still allows.
    allowed: Option<u64>,
    trailers: Option<HeaderMap>,
    state: State,
}

pub(crate) struct BodyParts {
    pub(crate) recv: Box<dyn RecvStream>,
    pub(crate) ctx: Arc<RequestContext>,
    pub(crate) conn: Arc<dyn CloseConnection>,
    pub(crate) codec: Arc<dyn HeaderCodec>,
    pub(crate) max_header_bytes: u64,
    pub(crate) content_length: Option<u64>,
}

impl ResponseBody {
    pub(crate) fn new(parts: BodyParts) -> Self {
        Self {
            recv: parts.recv,
            ctx: parts.ctx,
            conn: parts.conn,
            codec: parts.codec,
            max_header_bytes: parts.max_header_bytes,
            frame_remaining: 0,
            allowed: parts.content_length,
            trailers: None,
            state: State::Open,
        }
    }

    /// Read body bytes into `buf`. Returns 0 at the end of the body.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            match &self.state {
                State::Open => {}
                State::Done | State::Closed => return Ok(0),
                State::Failed(err) => return Err(err.clone()),
            }
            if buf.is_empty() {
                return Ok(0);
            }
            if self.allowed == Some(0) && self.frame_remaining > 0 {
                let err = self.too_much_data();
                return Err(self.fail(err));
            }
            if self.frame_remaining == 0 {
                match self.next_data_frame().await {
                    Ok(true) => continue,
                    Ok(false) => {
                        self.state = State::Done;
                        self.release();
                        return Ok(0);
                    }
                    Err(err) => return Err(self.fail(err)),
                }
            }

            let mut want = buf.len().min(self.frame_remaining as usize);
            if let Some(allowed) = self.allowed {
                want = want.min(allowed as usize);
            }
            let abort = self.ctx.abort.clone();
            let n = match abort.guard_read(self.recv.read(&mut buf[..want])).await {
                Ok(Ok(0)) => {
                    let err = Error::protocol(
                        ErrorCode::FrameError,
                        "stream ended inside a DATA frame",
                    );
                    return Err(self.fail(err));
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(self.fail(Error::from_io(&e))),
                Err(code) => {
                    let err = self.aborted(code);
                    return Err(self.fail(err));
                }
            };
            self.frame_remaining -= n as u64;
            if let Some(allowed) = self.allowed.as_mut() {
                *allowed -= n as u64;
            }
            return Ok(n);
        }
    }

    /// The next chunk of body bytes, or `None` at the end.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        let mut buf = BytesMut::zeroed(CHUNK);
        let n = self.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf.freeze()))
    }

    /// Trailers, once the body has been read to the end.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    /// Whether the body was read to its end.
    pub fn is_end_stream(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Stop reading. A body that was not read to the end has its stream's
    /// read side stopped with `H3_REQUEST_CANCELLED`. Idempotent.
    pub fn close(&mut self) {
        if matches!(self.state, State::Open) {
            self.recv.stop(ErrorCode::RequestCanceled.value());
            self.state = State::Closed;
        }
        self.release();
    }

    /// Apply an abort recorded by the request's watchers.
    fn aborted(&mut self, code: u64) -> Error {
        self.recv.stop(code);
        Error::Stream {
            code,
            remote: false,
        }
    }

    /// Advance to the next DATA frame with payload. `Ok(false)` at the end
    /// of the body.
    async fn next_data_frame(&mut self) -> Result<bool, Error> {
        let abort = self.ctx.abort.clone();
        loop {
            let head = match abort.guard_read(frame::read_frame(&mut self.recv)).await {
                Err(code) => return Err(self.aborted(code)),
                Ok(Ok(head)) => head,
                Ok(Err(err)) => {
                    if !matches!(err, H3Error::Io(_)) {
                        self.conn.close_with(err.code(), &err.to_string());
                    }
                    return Err(Error::from_h3(err));
                }
            };
            match head {
                None => return Ok(false),
                Some(FrameHead::Data { len: 0 }) => continue,
                Some(FrameHead::Data { len }) => {
                    self.frame_remaining = len;
                    if self.allowed == Some(0) {
                        return Err(self.too_much_data());
                    }
                    return Ok(true);
                }
                Some(FrameHead::Headers { len }) => {
                    self.read_trailers(len).await?;
                    return Ok(false);
                }
                Some(other) => {
                    let message = format!("unexpected frame on request stream: {other:?}");
                    self.conn.close_with(ErrorCode::FrameUnexpected, &message);
                    return Err(Error::protocol(ErrorCode::FrameUnexpected, message));
                }
            }
        }
    }

    async fn read_trailers(&mut self, len: u64) -> Result<(), Error> {
        if len > self.max_header_bytes {
            self.recv.stop(ErrorCode::FrameError.value());
            return Err(Error::protocol(
                ErrorCode::FrameError,
                format!(
                    "trailers too large: {len} bytes (max: {})",
                    self.max_header_bytes
                ),
            ));
        }
        let mut block = vec![0u8; len as usize];
        let abort = self.ctx.abort.clone();
        match abort.guard_read(self.recv.read_exact(&mut block)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(Error::from_io(&e)),
            Err(code) => return Err(self.aborted(code)),
        }
        let fields = match self.codec.decode(&block) {
            Ok(fields) => fields,
            Err(err) => {
                self.conn
                    .close_with(ErrorCode::GeneralProtocolError, &err.to_string());
                return Err(Error::protocol(
                    ErrorCode::GeneralProtocolError,
                    err.to_string(),
                ));
            }
        };
        if fields.iter().any(|f| f.is_pseudo()) {
            self.recv.stop(ErrorCode::MessageError.value());
            return Err(Error::protocol(
                ErrorCode::MessageError,
                "pseudo header in trailers",
            ));
        }
        let trailers = header_map(fields).map_err(|message| {
            self.recv.stop(ErrorCode::MessageError.value());
            Error::protocol(ErrorCode::MessageError, message)
        })?;
        self.trailers = Some(trailers);
        Ok(())
    }

    fn too_much_data(&mut self) -> Error {
        self.recv.stop(ErrorCode::MessageError.value());
        Error::protocol(
            ErrorCode::MessageError,
            "too much response data: more than Content-Length",
        )
    }

    fn fail(&mut self, err: Error) -> Error {
        let err = self.ctx.normalize(err);
        self.state = State::Failed(err.clone());
        self.release();
        err
    }

    fn release(&self) {
        self.ctx.finish();
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody")
            .field("stream_id", &self.ctx.stream_id)
            .field("allowed", &self.allowed)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Gzip-decoding decorator over a [`ResponseBody`].
pub struct GzipBody {
    inner: ResponseBody,
    decoder: GzDecoder<Vec<u8>>,
    /// Decoded bytes not yet handed out.
    pending: Bytes,
    finished: bool,
}

impl GzipBody {
    pub(crate) fn new(inner: ResponseBody) -> Self {
        Self {
            inner,
            decoder: GzDecoder::new(Vec::new()),
            pending: Bytes::new(),
            finished: false,
        }
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        while !self.finished {
            match self.inner.next_chunk().await? {
                Some(compressed) => {
                    self.decoder.write_all(&compressed).map_err(gzip_error)?;
                }
                None => {
                    self.decoder.try_finish().map_err(gzip_error)?;
                    self.finished = true;
                }
            }
            let decoded = std::mem::take(self.decoder.get_mut());
            if !decoded.is_empty() {
                return Ok(Some(Bytes::from(decoded)));
            }
        }
        Ok(None)
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if self.pending.is_empty() {
            match self.next_chunk().await? {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }

    pub fn close(&mut self) {
        self.inner.close();
    }
}

fn gzip_error(e: std::io::Error) -> Error {
    Error::Body(format!("gzip: {e}"))
}

/// A response body, transparently decompressed when this client negotiated
/// gzip.
pub enum Body {
    Plain(ResponseBody),
    Gzip(GzipBody),
}

impl Body {
    /// The next chunk of (decoded) body bytes, or `None` at the end.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        match self {
            Body::Plain(b) => b.next_chunk().await,
            Body::Gzip(b) => b.next_chunk().await,
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match self {
            Body::Plain(b) => b.read(buf).await,
            Body::Gzip(b) => b.read(buf).await,
        }
    }

    /// Read the whole body.
    pub async fn bytes(&mut self) -> Result<Bytes, Error> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    pub fn trailers(&self) -> Option<&HeaderMap> {
        match self {
            Body::Plain(b) => b.trailers(),
            Body::Gzip(b) => b.inner.trailers(),
        }
    }

    pub fn close(&mut self) {
        match self {
            Body::Plain(b) => b.close(),
            Body::Gzip(b) => b.close(),
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Plain(b) => f.debug_tuple("Plain").field(b).finish(),
            Body::Gzip(b) => f.debug_tuple("Gzip").field(&b.inner).finish(),
        }
    }
}
