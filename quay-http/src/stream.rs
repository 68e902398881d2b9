//! Request stream halves shared between the task that drives them and the
//! watchers that abort them.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use quay_quic::{RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream half behind a lock that is only held for the length of one poll
/// or one abort, so any clone can reset or stop it while another clone is
/// mid-read or mid-write.
pub(crate) struct Shared<S> {
    id: u64,
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for Shared<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: RecvStream> Shared<S> {
    pub(crate) fn recv(stream: S) -> Self {
        Self {
            id: stream.id(),
            inner: Arc::new(Mutex::new(stream)),
        }
    }

    pub(crate) fn stop_reading(&self, code: u64) {
        self.inner.lock().stop(code);
    }
}

impl<S: SendStream> Shared<S> {
    pub(crate) fn send(stream: S) -> Self {
        Self {
            id: stream.id(),
            inner: Arc::new(Mutex::new(stream)),
        }
    }

    pub(crate) fn reset_writing(&self, code: u64) {
        self.inner.lock().reset(code);
    }
}

impl<S: RecvStream> AsyncRead for Shared<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut stream = self.inner.lock();
        Pin::new(&mut *stream).poll_read(cx, buf)
    }
}

impl<S: RecvStream> RecvStream for Shared<S> {
    fn id(&self) -> u64 {
        self.id
    }

    fn stop(&mut self, code: u64) {
        self.stop_reading(code);
    }
}

impl<S: SendStream> AsyncWrite for Shared<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut stream = self.inner.lock();
        Pin::new(&mut *stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut stream = self.inner.lock();
        Pin::new(&mut *stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut stream = self.inner.lock();
        Pin::new(&mut *stream).poll_shutdown(cx)
    }
}

impl<S: SendStream> SendStream for Shared<S> {
    fn id(&self) -> u64 {
        self.id
    }

    fn reset(&mut self, code: u64) {
        self.reset_writing(code);
    }
}
