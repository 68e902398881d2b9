//! Cancellation plumbing shared by a request's coordinator, its background
//! watchers, the request-body sender and the response body.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use quay_h3::ErrorCode;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::RequestOptions;
use crate::error::Error;
use crate::registry::Registration;

/// Why a cancellation token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    /// The caller canceled.
    Canceled,
    /// The caller's deadline expired.
    DeadlineExceeded,
    /// The server sent a GOAWAY covering the request's stream.
    Goaway,
    /// The exchange completed; nothing is listening any more.
    Released,
}

/// A cloneable cancellation handle. The first recorded cause sticks.
#[derive(Debug, Clone)]
pub struct CancelToken {
    cause: Arc<watch::Sender<Option<Cause>>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { cause: Arc::new(tx) }
    }

    /// Cancel with [`Cause::Canceled`].
    pub fn cancel(&self) {
        self.cancel_with(Cause::Canceled);
    }

    /// Record `cause` unless a cause is already recorded. Returns whether
    /// this call did the cancellation.
    pub fn cancel_with(&self, cause: Cause) -> bool {
        self.cause.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause);
            true
        })
    }

    pub fn cause(&self) -> Option<Cause> {
        *self.cause.borrow()
    }

    pub fn is_canceled(&self) -> bool {
        self.cause().is_some()
    }

    /// Resolves with the recorded cause once the token fires.
    pub async fn cancelled(&self) -> Cause {
        let mut rx = self.cause.subscribe();
        let cause = rx.wait_for(Option::is_some).await.ok().and_then(|c| *c);
        cause.unwrap_or(Cause::Canceled)
    }
}

/// The caller's side of a request: an optional token plus an optional
/// deadline, both taken from [`RequestOptions`].
#[derive(Debug, Clone, Default)]
pub(crate) struct CallerContext {
    token: Option<CancelToken>,
    deadline: Option<Instant>,
}

impl CallerContext {
    pub(crate) fn new(options: &RequestOptions) -> Self {
        Self {
            token: options.cancel.clone(),
            deadline: options.timeout.map(|t| Instant::now() + t),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_timeout(timeout: std::time::Duration) -> Self {
        Self {
            token: None,
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// The caller's error if it already gave up.
    pub(crate) fn error(&self) -> Option<Error> {
        if self.token.as_ref().is_some_and(CancelToken::is_canceled) {
            return Some(Error::Canceled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(Error::Timeout);
        }
        None
    }

    /// Resolves when the caller gives up. Never resolves if it cannot.
    pub(crate) async fn done(&self) -> Error {
        let token = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = token => Error::Canceled,
            _ = deadline => Error::Timeout,
        }
    }

    pub(crate) fn cause_of(err: &Error) -> Cause {
        match err {
            Error::Timeout => Cause::DeadlineExceeded,
            _ => Cause::Canceled,
        }
    }
}

/// A one-shot, idempotent signal.
#[derive(Debug, Clone)]
pub(crate) struct Signal {
    fired: Arc<watch::Sender<bool>>,
}

impl Signal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { fired: Arc::new(tx) }
    }

    pub(crate) fn fire(&self) {
        self.fired.send_if_modified(|fired| !std::mem::replace(fired, true));
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.fired.subscribe();
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// Applies an abort code to one direction of a stream.
pub(crate) type AbortHandle = Arc<dyn Fn(u64) + Send + Sync>;

/// Pending aborts for the two directions of a request stream.
///
/// The first code recorded per direction wins. When the stream halves are
/// attached, that first code is applied to the stream at once, so an abort
/// takes effect even if nobody is reading or writing. Tasks blocked on a
/// direction also observe the code through [`guard_write`](Self::guard_write)
/// and [`guard_read`](Self::guard_read).
#[derive(Clone)]
pub(crate) struct StreamAbort {
    write: Arc<watch::Sender<Option<u64>>>,
    read: Arc<watch::Sender<Option<u64>>>,
    reset: Option<AbortHandle>,
    stop: Option<AbortHandle>,
}

impl std::fmt::Debug for StreamAbort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAbort")
            .field("write", &*self.write.borrow())
            .field("read", &*self.read.borrow())
            .field("attached", &self.reset.is_some())
            .finish()
    }
}

impl StreamAbort {
    /// Aborts that are only recorded, for tasks that apply them themselves.
    pub(crate) fn new() -> Self {
        Self {
            write: Arc::new(watch::channel(None).0),
            read: Arc::new(watch::channel(None).0),
            reset: None,
            stop: None,
        }
    }

    /// Aborts that reset the send half and stop the receive half directly.
    pub(crate) fn attached(reset: AbortHandle, stop: AbortHandle) -> Self {
        Self {
            reset: Some(reset),
            stop: Some(stop),
            ..Self::new()
        }
    }

    pub(crate) fn abort_write(&self, code: ErrorCode) {
        if record(&self.write, code.value()) {
            if let Some(reset) = &self.reset {
                reset(code.value());
            }
        }
    }

    pub(crate) fn abort_read(&self, code: ErrorCode) {
        if record(&self.read, code.value()) {
            if let Some(stop) = &self.stop {
                stop(code.value());
            }
        }
    }

    pub(crate) fn abort_both(&self, code: ErrorCode) {
        self.abort_write(code);
        self.abort_read(code);
    }

    pub(crate) async fn write_aborted(&self) -> u64 {
        wait_code(&self.write).await
    }

    pub(crate) async fn read_aborted(&self) -> u64 {
        wait_code(&self.read).await
    }

    /// Run a write-side operation unless the write side is aborted first.
    /// `Err` carries the abort code.
    pub(crate) async fn guard_write<F: Future>(&self, op: F) -> Result<F::Output, u64> {
        tokio::select! {
            biased;
            code = self.write_aborted() => Err(code),
            out = op => Ok(out),
        }
    }

    /// Run a read-side operation unless the read side is aborted first.
    pub(crate) async fn guard_read<F: Future>(&self, op: F) -> Result<F::Output, u64> {
        tokio::select! {
            biased;
            code = self.read_aborted() => Err(code),
            out = op => Ok(out),
        }
    }
}

fn record(slot: &watch::Sender<Option<u64>>, code: u64) -> bool {
    slot.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(code);
        true
    })
}

async fn wait_code(slot: &watch::Sender<Option<u64>>) -> u64 {
    let mut rx = slot.subscribe();
    let code = rx.wait_for(Option::is_some).await.ok().and_then(|c| *c);
    code.unwrap_or(ErrorCode::RequestCanceled.value())
}

/// Per-request state shared between the coordinator and everything it spawns.
#[derive(Debug)]
pub(crate) struct RequestContext {
    pub(crate) stream_id: u64,
    /// Derived cancellation: records goaway and caller causes.
    pub(crate) token: CancelToken,
    pub(crate) caller: CallerContext,
    pub(crate) abort: StreamAbort,
    /// Fired when the response body is finished, closed or dropped.
    pub(crate) finished: Signal,
    /// Stops the caller-cancellation watcher.
    pub(crate) unwatch: Signal,
    body_error: Mutex<Option<Error>>,
    registration: Mutex<Option<Registration>>,
}

impl RequestContext {
    pub(crate) fn new(
        stream_id: u64,
        token: CancelToken,
        caller: CallerContext,
        abort: StreamAbort,
        registration: Option<Registration>,
    ) -> Self {
        Self {
            stream_id,
            token,
            caller,
            abort,
            finished: Signal::new(),
            unwatch: Signal::new(),
            body_error: Mutex::new(None),
            registration: Mutex::new(registration),
        }
    }

    /// Remember why sending the request body failed.
    pub(crate) fn set_body_error(&self, err: Error) {
        self.body_error.lock().get_or_insert(err);
    }

    /// Map an error observed on this request to what the caller sees.
    ///
    /// A recorded goaway wins, then the caller's own cancellation, then a
    /// request-body failure that made the peer abort the stream.
    pub(crate) fn normalize(&self, err: Error) -> Error {
        match self.token.cause() {
            Some(Cause::Goaway) => return Error::Goaway,
            Some(Cause::Canceled) => return Error::Canceled,
            Some(Cause::DeadlineExceeded) => return Error::Timeout,
            Some(Cause::Released) | None => {}
        }
        if let Some(caller) = self.caller.error() {
            return caller;
        }
        if matches!(err, Error::Stream { .. } | Error::Transport(_)) {
            if let Some(body) = self.body_error.lock().clone() {
                return body;
            }
        }
        err
    }

    /// Mark the exchange complete: stop the watchers, let a kept-open
    /// request stream finish and drop the stream from the in-flight registry.
    /// Idempotent.
    pub(crate) fn finish(&self) {
        self.token.cancel_with(Cause::Released);
        self.unwatch.fire();
        self.finished.fire();
        drop(self.registration.lock().take());
    }
}
