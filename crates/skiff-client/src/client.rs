//! The client dispatch engine.
//!
//! One read-loop task decodes inbound frames and delivers each response to
//! the pending entry registered under its ID. Entries are registered only
//! after their request batch has been sent, so a transmission failure never
//! leaves orphans behind. Each entry is removed exactly once: by response
//! delivery, by its context watcher, or at channel teardown.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use skiff_jsonrpc::channel::Channel;
use skiff_jsonrpc::error::{ErrorObject, RpcError};
use skiff_jsonrpc::request::{encode_request_batch, marshal_params, normalize_params, Request};
use skiff_jsonrpc::response::{parse_reply_batch, ClientReply, Response};
use skiff_jsonrpc::types::RequestId;
use skiff_jsonrpc::CANCEL_METHOD;

use crate::context::{CallContext, CallEnd};
use crate::options::ClientOptions;

/// A JSON-RPC client bound to one channel. Cloning yields another handle to
/// the same client; calls may be issued concurrently from any number of
/// tasks.
#[derive(Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

/// One entry of a batch: a method, its parameters, and whether it is sent as
/// a notification.
#[derive(Debug, Clone)]
pub struct Spec {
    pub method: String,
    pub params: Option<Value>,
    pub notify: bool,
}

impl Spec {
    /// A batch entry expecting a response.
    pub fn call(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            notify: false,
        }
    }

    /// A batch entry sent as a notification.
    pub fn notify(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            notify: true,
        }
    }
}

enum StopReason {
    /// Shut down by an explicit close.
    Closed,
    /// The server closed the channel in an orderly way.
    Eof,
    /// The transport failed.
    Failed(String),
}

impl StopReason {
    fn to_error(&self) -> RpcError {
        match self {
            StopReason::Closed => RpcError::Stopped("the client"),
            StopReason::Eof => RpcError::Channel(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "channel closed",
            )),
            StopReason::Failed(msg) => RpcError::Channel(io::Error::other(msg.clone())),
        }
    }
}

struct PendingEntry {
    tx: oneshot::Sender<Response>,
    settled: CancellationToken,
}

impl PendingEntry {
    fn settle(self, rsp: Response) {
        self.settled.cancel();
        let _ = self.tx.send(rsp);
    }
}

struct PendingReply {
    rx: oneshot::Receiver<Response>,
}

impl PendingReply {
    async fn wait(self) -> Result<Response, RpcError> {
        // The sender is only ever dropped without a value at teardown races;
        // surface that the same way as an explicit cancellation.
        self.rx.await.map_err(|_| RpcError::Cancelled)
    }
}

struct Registry {
    pending: HashMap<RequestId, PendingEntry>,
    next_id: i64,
    stop_reason: Option<StopReason>,
}

struct ClientCore {
    channel: Arc<dyn Channel>,
    opts: ClientOptions,
    registry: StdMutex<Registry>,
    // Serializes outbound frames; never held while the registry lock is.
    send_lock: AsyncMutex<()>,
    root: CancellationToken,
    done: watch::Sender<bool>,
}

impl Client {
    /// Create a client speaking over `channel`. Must be called within a
    /// tokio runtime.
    pub fn new(channel: impl Channel, options: ClientOptions) -> Client {
        let (done, _) = watch::channel(false);
        let core = Arc::new(ClientCore {
            channel: Arc::new(channel),
            opts: options,
            registry: StdMutex::new(Registry {
                pending: HashMap::new(),
                // Start at 1: some servers treat 0 as equivalent to null.
                next_id: 1,
                stop_reason: None,
            }),
            send_lock: AsyncMutex::new(()),
            root: CancellationToken::new(),
            done,
        });
        tokio::spawn(Arc::clone(&core).run());
        Client { core }
    }

    /// Initiate a single call and block until its response arrives. A typed
    /// server error preserves its code, message and data; cancellation and
    /// deadline expiry surface as their own variants.
    pub async fn call(&self, method: &str, params: impl Serialize) -> Result<Response, RpcError> {
        self.call_with(CallContext::new(), method, params).await
    }

    /// [`Client::call`] governed by an explicit context.
    pub async fn call_with(
        &self,
        ctx: CallContext,
        method: &str,
        params: impl Serialize,
    ) -> Result<Response, RpcError> {
        let params = self.core.marshal(&params)?;
        let id = self.core.next_id()?;
        let req = Request::new(id.clone(), method, params);
        let replies = self.core.transmit(vec![req], vec![(id, ctx)]).await?;
        let rsp = match replies.into_iter().next() {
            Some(reply) => reply.wait().await?,
            None => return Err(RpcError::EmptyBatch),
        };
        match rsp.error() {
            Some(err) => Err(RpcError::from_error_object(err.clone())),
            None => Ok(rsp),
        }
    }

    /// Call `method` and decode its result into `T`.
    pub async fn call_result<T: DeserializeOwned>(
        &self,
        method: &str,
        params: impl Serialize,
    ) -> Result<T, RpcError> {
        self.call(method, params).await?.result()
    }

    /// Transmit a notification. Blocks until the frame has been sent; no
    /// response is expected or tracked.
    pub async fn notify(&self, method: &str, params: impl Serialize) -> Result<(), RpcError> {
        let params = self.core.marshal(&params)?;
        let req = Request::notification(method, params);
        self.core.transmit(vec![req], Vec::new()).await?;
        Ok(())
    }

    /// Send a batch of requests in one frame and wait for all the responses.
    ///
    /// Returns one response per non-notification spec, in spec order. There
    /// is no atomic batch failure: individual entries fail individually, as
    /// error responses in the returned vector.
    pub async fn batch(&self, ctx: CallContext, specs: Vec<Spec>) -> Result<Vec<Response>, RpcError> {
        if specs.is_empty() {
            return Err(RpcError::EmptyBatch);
        }
        let mut reqs = Vec::with_capacity(specs.len());
        let mut calls = Vec::new();
        for spec in specs {
            let params = self.core.marshal(&spec.params)?;
            if spec.notify {
                reqs.push(Request::notification(spec.method, params));
            } else {
                let id = self.core.next_id()?;
                reqs.push(Request::new(id.clone(), spec.method, params));
                calls.push((id, ctx.clone()));
            }
        }
        let replies = self.core.transmit(reqs, calls).await?;
        let mut responses = Vec::with_capacity(replies.len());
        for reply in replies {
            responses.push(reply.wait().await?);
        }
        Ok(responses)
    }

    /// Shut down the client: close the channel and cancel every pending
    /// call, which observes a cancellation error. An orderly close and EOF
    /// are not reported as failures; any other read-side error is.
    pub async fn close(&self) -> Result<(), RpcError> {
        {
            let mut reg = self.core.lock_registry();
            if reg.stop_reason.is_none() {
                reg.stop_reason = Some(StopReason::Closed);
            }
        }
        self.core.root.cancel();
        if let Err(err) = self.core.channel.close().await {
            debug!(error = %err, "channel close failed");
        }
        let mut done = self.core.done.subscribe();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
        let reg = self.core.lock_registry();
        match &reg.stop_reason {
            Some(StopReason::Failed(msg)) => Err(RpcError::Channel(io::Error::other(msg.clone()))),
            _ => Ok(()),
        }
    }
}

impl ClientCore {
    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Validate and encode caller-supplied parameters, applying the
    /// context-encoding hook.
    fn marshal(&self, params: &impl Serialize) -> Result<Option<Box<RawValue>>, RpcError> {
        let raw = marshal_params(params)?;
        match &self.opts.encode_context {
            Some(hook) => {
                let raw = hook(raw)?;
                normalize_params(raw).map_err(|err| RpcError::InvalidRequest(err.message))
            }
            None => Ok(raw),
        }
    }

    /// Allocate the next request ID. IDs are monotone, never zero, and never
    /// reused while the previous use is still pending.
    fn next_id(&self) -> Result<RequestId, RpcError> {
        let mut reg = self.lock_registry();
        if let Some(reason) = &reg.stop_reason {
            return Err(reason.to_error());
        }
        let id = RequestId::Number(reg.next_id);
        reg.next_id += 1;
        Ok(id)
    }

    /// Send one batch frame and register a pending entry (plus its context
    /// watcher) for every call in it. Registration happens strictly after a
    /// successful send.
    // Boxed rather than a plain `async fn` because `watch_call`, spawned from
    // within this function, itself calls back into `transmit`: the compiler
    // cannot resolve the auto-trait (Send) bound on a recursively-referenced
    // opaque future type. Boxing gives it a concrete type, breaking the cycle.
    fn transmit(
        self: &Arc<Self>,
        reqs: Vec<Request>,
        calls: Vec<(RequestId, CallContext)>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PendingReply>, RpcError>> + Send + '_>> {
        Box::pin(async move {
            if reqs.is_empty() {
                return Err(RpcError::EmptyBatch);
            }
            let frame = encode_request_batch(&reqs)?;
            let guard = self.send_lock.lock().await;
            {
                let reg = self.lock_registry();
                if let Some(reason) = &reg.stop_reason {
                    return Err(reason.to_error());
                }
            }
            debug!(count = reqs.len(), bytes = frame.len(), "sending request batch");
            self.channel.send(&frame).await?;

            let mut replies = Vec::with_capacity(calls.len());
            {
                let mut reg = self.lock_registry();
                for (id, ctx) in calls {
                    let (tx, rx) = oneshot::channel();
                    let settled = CancellationToken::new();
                    reg.pending.insert(
                        id.clone(),
                        PendingEntry {
                            tx,
                            settled: settled.clone(),
                        },
                    );
                    tokio::spawn(Arc::clone(self).watch_call(id, ctx, settled));
                    replies.push(PendingReply { rx });
                }
            }
            drop(guard);
            Ok(replies)
        })
    }

    /// Wait for the context governing a pending call. If the call is still
    /// registered when the context ends, remove it, deliver a synthetic
    /// error response, and tell the server, best effort.
    async fn watch_call(self: Arc<Self>, id: RequestId, ctx: CallContext, settled: CancellationToken) {
        let end = tokio::select! {
            _ = settled.cancelled() => return,
            _ = self.root.cancelled() => None,
            end = ctx.ended() => Some(end),
        };
        let entry = match self.lock_registry().pending.remove(&id) {
            Some(entry) => entry,
            // The response won the race; the cancellation arrived too late.
            None => return,
        };
        let error = match end {
            None => ErrorObject::cancelled("client channel terminated"),
            Some(CallEnd::Cancelled) => ErrorObject::cancelled("request cancelled"),
            Some(CallEnd::DeadlineExceeded) => ErrorObject::deadline_exceeded("deadline exceeded"),
        };
        debug!(id = %id, code = error.code, "context ended for pending call");
        entry.settle(Response::failure(Some(id.clone()), error));

        // The caller's context has already ended, so the notice goes out on
        // a detached task with the client's own lifetime.
        if self.opts.send_cancel && end.is_some() {
            let core = Arc::clone(&self);
            tokio::spawn(async move {
                let note = Request::notification(
                    CANCEL_METHOD,
                    marshal_params(&[&id]).ok().flatten(),
                );
                if let Err(err) = core.transmit(vec![note], Vec::new()).await {
                    debug!(id = %id, error = %err, "rpc.cancel notice failed");
                }
            });
        }
    }

    async fn run(self: Arc<Self>) {
        debug!("client starting");
        let reason = loop {
            tokio::select! {
                _ = self.root.cancelled() => break StopReason::Closed,
                received = self.channel.recv() => match received {
                    Ok(Some(frame)) => match parse_reply_batch(&frame) {
                        Ok(replies) => {
                            for reply in replies {
                                self.deliver(reply);
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "response frame failed to decode");
                            break StopReason::Failed(err.to_string());
                        }
                    },
                    Ok(None) => {
                        debug!("channel EOF");
                        break StopReason::Eof;
                    }
                    Err(err) => {
                        warn!(error = %err, "channel receive failed");
                        break StopReason::Failed(err.to_string());
                    }
                }
            }
        };
        {
            let mut reg = self.lock_registry();
            if reg.stop_reason.is_none() {
                reg.stop_reason = Some(reason);
            }
        }
        // Wake the watchers; they deliver the teardown error to every entry
        // still pending.
        self.root.cancel();
        if let Err(err) = self.channel.close().await {
            debug!(error = %err, "channel close failed");
        }
        let _ = self.done.send(true);
        debug!("client stopped");
    }

    /// Route one inbound reply: correlated responses settle their pending
    /// entry, ID-less replies are server notifications, and anything else is
    /// logged and dropped.
    fn deliver(&self, reply: ClientReply) {
        let id = match reply.id() {
            Some(id) => id,
            None => {
                match reply.into_notification() {
                    Some(note) => match &self.opts.on_notify {
                        Some(callback) => callback(note),
                        None => {
                            debug!(method = %note.method(), "discarding server notification")
                        }
                    },
                    None => debug!("discarding reply without an ID"),
                }
                return;
            }
        };
        let entry = match self.lock_registry().pending.remove(&id) {
            Some(entry) => entry,
            None => {
                debug!(id = %id, "discarding reply for unknown ID");
                return;
            }
        };
        if !reply.version_ok(self.opts.allow_v1) {
            let marker = reply.jsonrpc.as_deref().unwrap_or("");
            let error =
                ErrorObject::invalid_request(format!("incorrect version marker {:?}", marker));
            entry.settle(Response::failure(Some(id), error));
            return;
        }
        entry.settle(reply.into_response());
    }
}
