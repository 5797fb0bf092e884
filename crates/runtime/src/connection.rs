//! Request/response correlation layer on top of the transport.
//!
//! One [`Connection`] owns the framed stream to a worker process and keeps
//! the bookkeeping straight:
//!
//! - Generating strictly increasing request IDs
//! - Correlating responses with pending requests, whichever envelope
//!   convention they arrive in
//! - Enforcing a per-call deadline on every tracked request
//! - Dispatching worker-pushed events to registered remote objects
//! - Failing every pending request the moment the stream dies
//!
//! # Message Flow
//!
//! 1. Caller invokes `send()` with an action and params
//! 2. Connection allocates a unique ID and a oneshot channel
//! 3. The envelope is serialized and queued to the writer task
//! 4. Caller awaits the oneshot (bounded by the deadline)
//! 5. The dispatch loop receives the response frame from the transport
//! 6. The response is correlated by ID and resolves the oneshot
//!
//! Dropping the future returned by `send()` removes its pending entry, so
//! abandoned calls do not leak correlation state.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::{Notify, mpsc, oneshot};

use drover_protocol::envelope::{ErrorShape, EventFrame, IdTag, Inbound, Outbound};

use crate::error::{Error, Result};
use crate::events::RemoteEvent;
use crate::registry::{RemoteHandle, RemoteRegistry};
use crate::transport::{StreamEvent, Transport, TransportParts, TransportReceiver};

/// Deadline applied to tracked requests that do not ask for their own.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Pending request callbacks keyed by request ID.
type CallbackMap = Arc<TokioMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// RAII guard ensuring callback cleanup when a request future is dropped.
struct CancelGuard {
    id: u64,
    callbacks: CallbackMap,
    completed: bool,
}

impl CancelGuard {
    fn new(id: u64, callbacks: CallbackMap) -> Self {
        Self {
            id,
            callbacks,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        let id = self.id;
        let callbacks = Arc::clone(&self.callbacks);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if callbacks.lock().await.remove(&id).is_some() {
                    tracing::debug!(id, "removed orphaned request callback");
                }
            });
        }
    }
}

/// Future returned by tracked sends, with automatic cancellation cleanup.
struct ResponseFuture {
    rx: oneshot::Receiver<Result<Value>>,
    guard: CancelGuard,
}

impl Future for ResponseFuture {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.guard.complete();
                Poll::Ready(result.map_err(|_| Error::ChannelClosed).and_then(|r| r))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Correlated connection to a worker process.
pub struct Connection {
    /// Request ID counter; the first allocated ID is 1.
    last_id: AtomicU64,
    /// Pending request callbacks keyed by request ID.
    callbacks: CallbackMap,
    /// Queue feeding the writer task.
    outbound_tx: mpsc::UnboundedSender<Value>,
    /// Transport write half (taken by run() to start the writer task).
    transport_sender: Arc<TokioMutex<Option<Box<dyn Transport>>>>,
    /// Transport read half (taken by run() to start the read pump).
    transport_receiver: Arc<TokioMutex<Option<Box<dyn TransportReceiver>>>>,
    /// Decoded stream events from the read pump (taken by run()).
    event_rx: Arc<TokioMutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>>,
    /// Outbound queue receiver (taken by run() for the writer task).
    outbound_rx: Arc<TokioMutex<Option<mpsc::UnboundedReceiver<Value>>>>,
    /// Live remote objects, shared with the embedder.
    registry: Arc<RemoteRegistry>,
    /// Set once the worker's readiness handshake arrives.
    ready_seen: AtomicBool,
    ready: Notify,
    /// Set when the stream is gone; makes later sends fail fast.
    closed: AtomicBool,
    default_deadline: Duration,
}

impl Connection {
    /// Create a connection over the given transport. Call [`run`](Self::run)
    /// to start traffic flowing.
    pub fn new(parts: TransportParts, registry: Arc<RemoteRegistry>) -> Self {
        let TransportParts {
            sender,
            receiver,
            event_rx,
        } = parts;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Self {
            last_id: AtomicU64::new(0),
            callbacks: Arc::new(TokioMutex::new(HashMap::new())),
            outbound_tx,
            transport_sender: Arc::new(TokioMutex::new(Some(sender))),
            transport_receiver: Arc::new(TokioMutex::new(Some(receiver))),
            event_rx: Arc::new(TokioMutex::new(Some(event_rx))),
            outbound_rx: Arc::new(TokioMutex::new(Some(outbound_rx))),
            registry,
            ready_seen: AtomicBool::new(false),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            default_deadline: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn registry(&self) -> &Arc<RemoteRegistry> {
        &self.registry
    }

    /// Send an action-convention command and await its response.
    pub async fn send(&self, action: &str, params: Value) -> Result<Value> {
        self.send_tagged(IdTag::Action, action, params, self.default_deadline)
            .await
    }

    /// Send an action-convention command with an explicit deadline.
    pub async fn send_with_deadline(
        &self,
        action: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value> {
        self.send_tagged(IdTag::Action, action, params, deadline)
            .await
    }

    /// Send a JSON-RPC-convention command and await its response.
    pub async fn send_jsonrpc(&self, method: &str, params: Value) -> Result<Value> {
        self.send_tagged(IdTag::JsonRpc, method, params, self.default_deadline)
            .await
    }

    /// Fail fast if `handle` was disposed, then send on its behalf.
    pub async fn send_for(
        &self,
        handle: &RemoteHandle,
        action: &str,
        params: Value,
    ) -> Result<Value> {
        handle.ensure_live()?;
        self.send(action, params).await
    }

    /// Queue a command that gets no ID and therefore no response.
    pub fn send_async(&self, action: &str, params: Value) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Disconnected("connection is closed".to_string()));
        }
        let envelope = Outbound::action(None, action, params);
        tracing::debug!(action, "sending fire-and-forget command");
        self.outbound_tx
            .send(envelope.to_value())
            .map_err(|_| Error::ChannelClosed)
    }

    /// Resume a worker-side suspension. The correlation id rides in the
    /// `requestId` slot; no response will come back.
    pub fn continue_callback(&self, correlation_id: u64, result: Value) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Disconnected("connection is closed".to_string()));
        }
        let envelope = Outbound::action(
            Some(correlation_id),
            "callback.continue",
            serde_json::json!({ "callbackResult": result }),
        );
        tracing::debug!(correlation_id, "sending continuation");
        self.outbound_tx
            .send(envelope.to_value())
            .map_err(|_| Error::ChannelClosed)
    }

    async fn send_tagged(
        &self,
        tag: IdTag,
        action: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Disconnected("connection is closed".to_string()));
        }

        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(id, action, "sending command");

        let (tx, rx) = oneshot::channel();
        self.callbacks.lock().await.insert(id, tx);
        let guard = CancelGuard::new(id, Arc::clone(&self.callbacks));

        let envelope = match tag {
            IdTag::Action => Outbound::action(Some(id), action, params),
            IdTag::JsonRpc => Outbound::jsonrpc(id, action, params),
        };

        if self.outbound_tx.send(envelope.to_value()).is_err() {
            tracing::error!("failed to queue message: outbound channel closed");
            return Err(Error::ChannelClosed);
        }

        match tokio::time::timeout(deadline, ResponseFuture { rx, guard }).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "no response within {deadline:?} for '{action}' (id {id})"
            ))),
        }
    }

    /// Resolve once the worker's readiness handshake has been seen.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let notified = self.ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.ready_seen.load(Ordering::SeqCst) {
            return Ok(());
        }

        match tokio::time::timeout(timeout, notified).await {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::Timeout(format!(
                "worker did not report ready within {timeout:?}"
            ))),
        }
    }

    /// Fail every still-pending request immediately. Used on forced
    /// shutdown, before the worker process is told to exit.
    pub async fn cancel_pending_requests(&self) {
        self.fail_pending(|| Error::Disconnected("pending requests cancelled".to_string()))
            .await;
    }

    /// Mark the stream dead and fail everything in flight.
    pub(crate) async fn handle_disconnect(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        self.fail_pending(|| Error::Disconnected(reason.to_string()))
            .await;
    }

    /// Like [`handle_disconnect`](Self::handle_disconnect), but carries the
    /// crash details into every failed request.
    pub(crate) async fn handle_crash(&self, code: Option<i32>, stderr_tail: String) {
        self.closed.store(true, Ordering::SeqCst);
        self.fail_pending(|| Error::ProcessCrashed {
            code,
            stderr_tail: stderr_tail.clone(),
        })
        .await;
    }

    async fn fail_pending<F>(&self, mut make_error: F)
    where
        F: FnMut() -> Error,
    {
        let mut callbacks = self.callbacks.lock().await;
        if callbacks.is_empty() {
            return;
        }
        tracing::debug!(count = callbacks.len(), "failing all pending requests");
        for (_, tx) in callbacks.drain() {
            let _ = tx.send(Err(make_error()));
        }
    }

    /// Run the dispatch loop until the stream ends.
    pub async fn run(self: &Arc<Self>) {
        let transport_receiver = self
            .transport_receiver
            .lock()
            .await
            .take()
            .expect("run() can only be called once - transport receiver already taken");

        let mut transport_sender = self
            .transport_sender
            .lock()
            .await
            .take()
            .expect("run() can only be called once - transport sender already taken");

        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .expect("run() can only be called once - outbound receiver already taken");

        let mut event_rx = self
            .event_rx
            .lock()
            .await
            .take()
            .expect("run() can only be called once - event receiver already taken");

        let reader_handle = tokio::spawn(async move {
            if let Err(error) = transport_receiver.run().await {
                tracing::error!(%error, "transport read pump failed");
            }
        });

        let writer_conn = Arc::clone(self);
        let writer_handle = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(error) = transport_sender.send(message).await {
                    tracing::error!(%error, "transport write failed");
                    writer_conn
                        .handle_disconnect("write to worker failed")
                        .await;
                    break;
                }
            }
        });

        while let Some(event) = event_rx.recv().await {
            match event {
                StreamEvent::Frame(value) => {
                    if let Err(error) = self.dispatch_internal(Inbound::classify(value)).await {
                        tracing::error!(%error, "error dispatching message");
                    }
                }
                StreamEvent::Corrupt(error) => {
                    tracing::error!(%error, "worker stream corrupted");
                    self.fail_pending(|| Error::Framing(error.clone())).await;
                }
                StreamEvent::Closed { reason } => {
                    tracing::warn!(%reason, "worker stream closed");
                    self.handle_disconnect(&reason).await;
                    break;
                }
            }
        }
        self.handle_disconnect("connection loop ended").await;

        let _ = reader_handle.await;
        // The transport is gone; nothing further can be written.
        writer_handle.abort();
    }

    /// Dispatch an incoming message (test-only public version).
    #[cfg(test)]
    pub async fn dispatch(self: &Arc<Self>, inbound: Inbound) -> Result<()> {
        self.dispatch_internal(inbound).await
    }

    async fn dispatch_internal(self: &Arc<Self>, inbound: Inbound) -> Result<()> {
        match inbound {
            Inbound::Response(response) => {
                tracing::debug!(id = response.id, "processing response");
                let callback = self
                    .callbacks
                    .lock()
                    .await
                    .remove(&response.id)
                    .ok_or_else(|| {
                        Error::Protocol(format!(
                            "no pending request for response id {}",
                            response.id
                        ))
                    })?;

                let result = match response.error {
                    Some(shape) => Err(remote_error(shape)),
                    None => Ok(response.body),
                };

                let _ = callback.send(result);
                Ok(())
            }
            Inbound::Event(event) => {
                self.handle_event(event);
                Ok(())
            }
            Inbound::Ready { message } => {
                tracing::debug!(%message, "worker reported ready");
                self.ready_seen.store(true, Ordering::SeqCst);
                self.ready.notify_waiters();
                Ok(())
            }
            Inbound::Command(command) => {
                // Commands flow client-to-worker; one the other way is a
                // confused peer, not a fault.
                tracing::debug!(action = %command.action, "ignoring command frame from worker");
                Ok(())
            }
            Inbound::Unknown(value) => {
                tracing::debug!(
                    "unknown message shape (forward-compatible, ignored): {}",
                    serde_json::to_string(&value)
                        .unwrap_or_else(|_| "<serialization failed>".to_string())
                );
                Ok(())
            }
        }
    }

    fn handle_event(self: &Arc<Self>, frame: EventFrame) {
        let Some(target) = self.registry.try_get(&frame.object_id) else {
            // Teardown races make these benign: the object may have been
            // disposed locally while the event was in flight.
            tracing::debug!(
                object_id = %frame.object_id,
                event = %frame.event,
                "event for unknown object (ignored)"
            );
            return;
        };

        let event = RemoteEvent::normalize(&frame.event, frame.params);
        if let RemoteEvent::Dialog { dialog_id, kind, .. } = &event {
            // The worker allocated the dialog id; register a handle for it
            // so dialog.accept / dialog.dismiss have something to act on.
            tracing::debug!(dialog_id = %dialog_id, kind = %kind, "registering dialog");
            let dialog = RemoteHandle::new(dialog_id.as_str(), "dialog");
            self.registry.register_child(&target, dialog);
        }
        target.deliver(event);
    }
}

/// Map a worker-reported error payload onto a runtime error, inferring the
/// classification from the message text when the worker gave no name.
fn remote_error(shape: ErrorShape) -> Error {
    let message = shape.message().to_string();
    let name = match shape.name() {
        Some(name) => name.to_string(),
        None => classify_message(&message).to_string(),
    };
    Error::Remote { name, message }
}

fn classify_message(message: &str) -> &'static str {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("timeout") || lowered.contains("timed out") {
        "TimeoutError"
    } else if lowered.contains("net::err") || lowered.contains("network") {
        "NetworkError"
    } else {
        "Error"
    }
}
