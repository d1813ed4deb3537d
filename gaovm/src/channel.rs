//! Bidirectional JSON-RPC channel over one byte stream.
//!
//! A channel owns both halves of a stream. Outbound frames are serialized
//! through a single writer lock so concurrent callers interleave at whole
//! message granularity. Inbound frames are classified by a reader task:
//! responses complete the pending future for their id, requests go to the
//! installed handler or to a one-shot method waiter registered during the
//! handshake.
//!
//! A broken channel is terminal. Framing errors, EOF and write failures all
//! close it, failing every pending request and waiter; the owner must build
//! a new channel on a new stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::proto::frame::{encode_frame, FrameDecoder, FrameError};
use crate::proto::message::{self, RpcError, RpcMessage};

/// Outbound request id allocation. Client-side channels count up from 1;
/// the daemon's own outbound requests count down from −1 so the two ranges
/// can never collide on a shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSpace {
    Positive,
    Negative,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed: {0}")]
    Closed(String),

    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("{method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error(transparent)]
    Remote(#[from] RpcError),
}

/// An inbound request handed to the handler or a method waiter. `id` is
/// `None` for notifications.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub id: Option<i64>,
    pub method: String,
    pub params: Option<Value>,
}

/// Handles inbound requests once the handshake has installed it. The return
/// value becomes the response for requests and is discarded for
/// notifications.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: InboundRequest) -> Result<Value, RpcError>;
}

type PendingSender = oneshot::Sender<Result<Value, RpcError>>;

struct Inner {
    closed: Option<String>,
    pending: HashMap<i64, PendingSender>,
    waiters: HashMap<String, oneshot::Sender<InboundRequest>>,
    handler: Option<Arc<dyn RequestHandler>>,
}

struct Shared {
    name: String,
    writer: AsyncMutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    reader: Mutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
    inner: Mutex<Inner>,
    next_id: AtomicI64,
    id_step: i64,
}

#[derive(Clone)]
pub struct RpcChannel {
    shared: Arc<Shared>,
}

impl RpcChannel {
    /// Wrap a stream. The reader task does not run until [`RpcChannel::start`]
    /// — install the handler or handshake waiter first, so an eager peer's
    /// opening frame cannot slip past them.
    pub fn new<R, W>(reader: R, writer: W, ids: IdSpace, name: impl Into<String>) -> RpcChannel
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (first, step) = match ids {
            IdSpace::Positive => (1, 1),
            IdSpace::Negative => (-1, -1),
        };
        let shared = Arc::new(Shared {
            name: name.into(),
            writer: AsyncMutex::new(Some(Box::new(writer))),
            reader: Mutex::new(Some(Box::new(reader))),
            inner: Mutex::new(Inner {
                closed: None,
                pending: HashMap::new(),
                waiters: HashMap::new(),
                handler: None,
            }),
            next_id: AtomicI64::new(first),
            id_step: step,
        });
        RpcChannel { shared }
    }

    /// Start the reader task. Idempotent.
    pub fn start(&self) {
        if let Some(reader) = self.shared.reader.lock().unwrap().take() {
            tokio::spawn(read_loop(self.shared.clone(), reader));
        }
    }

    /// [`RpcChannel::new`] plus [`RpcChannel::start`], for callers with no
    /// pre-start registration to do.
    pub fn spawn<R, W>(reader: R, writer: W, ids: IdSpace, name: impl Into<String>) -> RpcChannel
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let channel = RpcChannel::new(reader, writer, ids, name);
        channel.start();
        channel
    }

    /// Install the regular inbound-request handler. Until one is installed,
    /// inbound requests without a matching waiter are rejected with the
    /// handshake-required error.
    pub fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.handler = Some(handler);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().unwrap().closed.is_some()
    }

    fn register_pending(&self) -> Result<(i64, oneshot::Receiver<Result<Value, RpcError>>), ChannelError> {
        let id = self.shared.next_id.fetch_add(self.shared.id_step, Ordering::Relaxed);
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(reason) = &inner.closed {
            return Err(ChannelError::Closed(reason.clone()));
        }
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id, tx);
        Ok((id, rx))
    }

    fn forget_pending(&self, id: i64) {
        self.shared.inner.lock().unwrap().pending.remove(&id);
    }

    fn closed_reason(&self) -> String {
        self.shared
            .inner
            .lock()
            .unwrap()
            .closed
            .clone()
            .unwrap_or_else(|| "channel closed".to_owned())
    }

    /// Send a request and wait for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ChannelError> {
        let (id, rx) = self.register_pending()?;

        let frame = message::request(id, method, params.as_ref());
        if let Err(err) = self.send_value(&frame).await {
            self.forget_pending(id);
            return Err(err);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(ChannelError::Remote(error)),
            Err(_) => Err(ChannelError::Closed(self.closed_reason())),
        }
    }

    /// `request` with an upper bound on the wait. On timeout the pending
    /// entry is removed, so a late response is discarded.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ChannelError> {
        let (id, rx) = self.register_pending()?;

        let frame = message::request(id, method, params.as_ref());
        if let Err(err) = self.send_value(&frame).await {
            self.forget_pending(id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(ChannelError::Remote(error)),
            Ok(Err(_)) => Err(ChannelError::Closed(self.closed_reason())),
            Err(_) => {
                self.forget_pending(id);
                Err(ChannelError::Timeout {
                    method: method.to_owned(),
                    timeout,
                })
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ChannelError> {
        self.send_value(&message::notification(method, params.as_ref()))
            .await
    }

    /// Send a response for an inbound request id.
    pub async fn respond(
        &self,
        id: i64,
        result: Result<Value, RpcError>,
    ) -> Result<(), ChannelError> {
        let frame = match result {
            Ok(value) => message::response(id, value),
            Err(error) => message::error_response(id, &error),
        };
        self.send_value(&frame).await
    }

    /// Register a one-shot waiter for the next inbound request with the
    /// given method, bypassing the handler. Used to intercept the peer's
    /// opening `hello`. The receiver errors if the channel closes first.
    pub fn wait_for_request(&self, method: &str) -> oneshot::Receiver<InboundRequest> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.closed.is_none() {
            inner.waiters.insert(method.to_owned(), tx);
        }
        rx
    }

    /// Close the channel, failing all pending requests and waiters.
    pub async fn close(&self, reason: &str) {
        self.shared.close(reason).await;
    }

    async fn send_value(&self, value: &Value) -> Result<(), ChannelError> {
        let bytes = encode_frame(value)?;
        let mut guard = self.shared.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None => {
                let reason = self
                    .shared
                    .inner
                    .lock()
                    .unwrap()
                    .closed
                    .clone()
                    .unwrap_or_else(|| "channel closed".to_owned());
                return Err(ChannelError::Closed(reason));
            }
        };
        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                // Drop the writer in place; mark_closed must not retake the
                // async lock we already hold.
                *guard = None;
                drop(guard);
                self.shared.mark_closed(&format!("write failed: {err}"));
                Err(ChannelError::Write(err))
            }
        }
    }
}

impl Shared {
    /// Flag the channel closed and fail everything waiting on it. Returns
    /// false if some other path closed it first.
    fn mark_closed(&self, reason: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed.is_some() {
            return false;
        }
        inner.closed = Some(reason.to_owned());
        let pending: Vec<PendingSender> = inner.pending.drain().map(|(_, tx)| tx).collect();
        inner.waiters.clear();
        // Dropping the handler here breaks the reference cycle between a
        // session and its channel.
        inner.handler = None;
        drop(inner);
        for tx in pending {
            let _ = tx.send(Err(RpcError::internal(format!("channel closed: {reason}"))));
        }
        true
    }

    async fn close(self: &Arc<Self>, reason: &str) {
        if self.mark_closed(reason) {
            debug!(channel = %self.name, reason, "channel closed");
        }
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
    }

    fn take_waiter(&self, method: &str) -> Option<oneshot::Sender<InboundRequest>> {
        self.inner.lock().unwrap().waiters.remove(method)
    }

    fn handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.inner.lock().unwrap().handler.clone()
    }

    fn complete(&self, id: i64, result: Result<Value, RpcError>) {
        let tx = self.inner.lock().unwrap().pending.remove(&id);
        match tx {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(channel = %self.name, id, "response for unknown or expired id"),
        }
    }

    async fn dispatch(self: &Arc<Self>, value: Value) {
        let raw_id = value.get("id").and_then(Value::as_i64);
        let msg = match RpcMessage::classify(value) {
            Ok(msg) => msg,
            Err(error) => {
                warn!(channel = %self.name, %error, "dropping malformed message");
                if let Some(id) = raw_id {
                    let channel = RpcChannel {
                        shared: self.clone(),
                    };
                    let _ = channel.respond(id, Err(error)).await;
                }
                return;
            }
        };

        match msg {
            RpcMessage::Response { id, result } => self.complete(id, Ok(result)),
            RpcMessage::Error { id, error } => self.complete(id, Err(error)),
            RpcMessage::Request { id, method, params } => {
                let request = InboundRequest {
                    id: Some(id),
                    method: method.clone(),
                    params,
                };
                if let Some(waiter) = self.take_waiter(&method) {
                    if waiter.send(request).is_err() {
                        warn!(channel = %self.name, method, "handshake waiter went away");
                    }
                    return;
                }
                let channel = RpcChannel {
                    shared: self.clone(),
                };
                match self.handler() {
                    Some(handler) => {
                        tokio::spawn(async move {
                            let result = handler.handle(request).await;
                            if let Err(err) = channel.respond(id, result).await {
                                debug!(method, %err, "could not send response");
                            }
                        });
                    }
                    None => {
                        let _ = channel.respond(id, Err(RpcError::handshake_required())).await;
                    }
                }
            }
            RpcMessage::Notification { method, params } => {
                let request = InboundRequest {
                    id: None,
                    method: method.clone(),
                    params,
                };
                if let Some(handler) = self.handler() {
                    tokio::spawn(async move {
                        let _ = handler.handle(request).await;
                    });
                } else {
                    debug!(channel = %self.name, method, "notification before handler installed");
                }
            }
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: Box<dyn AsyncRead + Send + Unpin>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                shared.close("peer closed the stream").await;
                return;
            }
            Ok(n) => n,
            Err(err) => {
                shared.close(&format!("read failed: {err}")).await;
                return;
            }
        };
        decoder.push(&buf[..n]);
        loop {
            match decoder.next_frame() {
                Ok(Some(value)) => shared.dispatch(value).await,
                Ok(None) => break,
                Err(err) => {
                    shared.close(&format!("framing error: {err}")).await;
                    return;
                }
            }
        }
    }
}
