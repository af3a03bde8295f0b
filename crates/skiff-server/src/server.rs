//! The request dispatch engine.
//!
//! A [`Server`] owns one read-loop task that decodes inbound frames into
//! request batches. Each batch is served by its own task: accepted entries
//! are dispatched to handlers under a bounded-concurrency semaphore, and the
//! batch reply is assembled in request order and flushed in a single frame
//! once every entry expecting a response has one. Lifecycle:
//! `Start` spawns the loop; channel EOF, a transport failure, or [`Server::stop`]
//! begins shutdown; shutdown cancels every in-flight handler, waits for all
//! of them to return, and then releases [`Server::wait`].

use std::collections::HashMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::value::{to_raw_value, RawValue};
use serde_json::Value;
use tokio::sync::{watch, Mutex as AsyncMutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use skiff_jsonrpc::channel::Channel;
use skiff_jsonrpc::error::{ErrorObject, RpcError};
use skiff_jsonrpc::metrics::{Metrics, Snapshot};
use skiff_jsonrpc::request::{
    is_valid_method_name, marshal_params, normalize_params, parse_request_batch, BatchError,
    ParsedRequest, Request, RequestBatch,
};
use skiff_jsonrpc::response::{encode_response_batch, Response};
use skiff_jsonrpc::types::RequestId;
use skiff_jsonrpc::CANCEL_METHOD;

use crate::assigner::Assigner;
use crate::handler::{HandlerCtx, HandlerResult};
use crate::options::ServerOptions;

/// Built-in introspection method answered without consulting the assigner.
pub const SERVER_INFO_METHOD: &str = "rpc.serverInfo";

// Metric names are stable and part of the external contract.
const METRIC_REQUESTS: &str = "rpc.requests";
const METRIC_NOTIFICATIONS: &str = "rpc.notifications";
const METRIC_ERRORS: &str = "rpc.errors";
const METRIC_PANIC: &str = "handler.panic";
const METRIC_BATCH_SIZE: &str = "rpc.batch-size";

/// A JSON-RPC server bound to one channel. Cloning yields another handle to
/// the same server.
#[derive(Clone)]
pub struct Server {
    core: Arc<ServerCore>,
}

/// The reply of the built-in `rpc.serverInfo` method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Method names exported by the assigner, in lexicographic order.
    pub methods: Vec<String>,
    pub counters: HashMap<String, i64>,
    pub max_values: HashMap<String, i64>,
    pub labels: HashMap<String, Value>,
}

struct ServerCore {
    channel: Arc<dyn Channel>,
    assigner: Arc<dyn Assigner>,
    opts: ServerOptions,
    metrics: Arc<Metrics>,
    semaphore: Arc<Semaphore>,
    inflight: StdMutex<HashMap<RequestId, CancellationToken>>,
    root: CancellationToken,
    // Serializes outbound frames so batch replies and pushed notifications
    // interleave whole, in a stable order.
    write_lock: AsyncMutex<()>,
    failure: StdMutex<Option<String>>,
    done: watch::Sender<bool>,
}

impl Server {
    /// Start a server reading requests from `channel` and routing them
    /// through `assigner`. Must be called within a tokio runtime.
    pub fn start(
        channel: impl Channel,
        assigner: impl Assigner + 'static,
        options: ServerOptions,
    ) -> Server {
        let metrics = options
            .metrics
            .clone()
            .unwrap_or_else(|| Arc::new(Metrics::new()));
        let semaphore = Arc::new(Semaphore::new(options.effective_concurrency()));
        let (done, _) = watch::channel(false);
        let core = Arc::new(ServerCore {
            channel: Arc::new(channel),
            assigner: Arc::new(assigner),
            opts: options,
            metrics,
            semaphore,
            inflight: StdMutex::new(HashMap::new()),
            root: CancellationToken::new(),
            write_lock: AsyncMutex::new(()),
            failure: StdMutex::new(None),
            done,
        });
        tokio::spawn(Arc::clone(&core).run());
        Server { core }
    }

    /// Push a notification to the client, a non-standard extension that must
    /// be enabled with [`ServerOptions::allow_notify`].
    pub async fn notify(&self, method: &str, params: impl Serialize) -> Result<(), RpcError> {
        if !self.core.opts.allow_notify {
            return Err(RpcError::NotifyUnsupported);
        }
        if !is_valid_method_name(method) {
            return Err(RpcError::InvalidRequest(format!(
                "invalid method name {:?}",
                method
            )));
        }
        let note = Request::notification(method, marshal_params(&params)?);
        let frame = serde_json::to_vec(&note)?;
        let _guard = self.core.write_lock.lock().await;
        if self.core.root.is_cancelled() {
            return Err(RpcError::Stopped("the server"));
        }
        self.core.channel.send(&frame).await?;
        Ok(())
    }

    /// Begin shutdown: stop reading, cancel all in-flight handlers, and close
    /// the channel once they have drained.
    pub fn stop(&self) {
        debug!("server stop requested");
        self.core.root.cancel();
    }

    /// Block until the server has fully stopped. Returns the transport error
    /// that terminated the read loop, if any; orderly EOF and [`Server::stop`]
    /// both count as clean shutdown.
    pub async fn wait(&self) -> Result<(), RpcError> {
        let mut done = self.core.done.subscribe();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
        let failure = self
            .core
            .failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match failure {
            Some(msg) => Err(RpcError::Channel(io::Error::other(msg))),
            None => Ok(()),
        }
    }

    /// The metrics collector this server records into.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.core.metrics)
    }
}

impl ServerCore {
    async fn run(self: Arc<Self>) {
        debug!("server starting");
        let mut batches: JoinSet<()> = JoinSet::new();
        let failure = loop {
            tokio::select! {
                _ = self.root.cancelled() => break None,
                received = self.channel.recv() => match received {
                    Ok(Some(frame)) => self.accept(&frame, &mut batches),
                    Ok(None) => {
                        debug!("channel EOF");
                        break None;
                    }
                    Err(err) => {
                        warn!(error = %err, "channel receive failed");
                        break Some(err.to_string());
                    }
                }
            }
        };
        // Shutdown: signal every in-flight handler and wait for the batch
        // tasks to drain before releasing waiters.
        self.root.cancel();
        while batches.join_next().await.is_some() {}
        if let Err(err) = self.channel.close().await {
            debug!(error = %err, "channel close failed");
        }
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = failure;
        let _ = self.done.send(true);
        debug!("server stopped");
    }

    /// Turn one inbound frame into a batch task. Undecodable frames are
    /// answered with a synthesized error, best effort, and reading continues.
    fn accept(self: &Arc<Self>, frame: &[u8], batches: &mut JoinSet<()>) {
        match parse_request_batch(frame, self.opts.allow_v1) {
            Ok(batch) => {
                self.metrics
                    .set_max_value(METRIC_BATCH_SIZE, batch.items.len() as i64);
                batches.spawn(Arc::clone(self).serve_batch(batch));
            }
            Err(BatchError::Empty) => {
                let core = Arc::clone(self);
                batches.spawn(async move {
                    let rsp =
                        Response::failure(None, ErrorObject::invalid_request("empty request batch"));
                    core.send_responses(vec![rsp], true).await;
                });
            }
            Err(BatchError::Parse(err)) => {
                warn!(error = %err, "request frame failed to decode");
                let core = Arc::clone(self);
                batches.spawn(async move {
                    let rsp = Response::failure(
                        None,
                        ErrorObject::parse_error("invalid request frame"),
                    );
                    core.send_responses(vec![rsp], false).await;
                });
            }
        }
    }

    async fn serve_batch(self: Arc<Self>, batch: RequestBatch) {
        let count = batch.items.len();
        let mut slots: Vec<Option<Response>> = (0..count).map(|_| None).collect();
        let mut replies: Vec<(usize, JoinHandle<Option<Response>>)> = Vec::new();
        let mut notes: Vec<JoinHandle<Option<Response>>> = Vec::new();

        for (idx, item) in batch.items.into_iter().enumerate() {
            let req = match item {
                ParsedRequest::Valid(req) => req,
                ParsedRequest::Invalid { id, error, v1 } => {
                    slots[idx] = Some(Response::failure(id, error).with_v1(v1));
                    continue;
                }
            };
            if req.method() == CANCEL_METHOD && req.is_notification() {
                self.metrics.count(METRIC_NOTIFICATIONS, 1);
                self.cancel_requested(&req);
                continue;
            }
            match req.id().cloned() {
                None => {
                    self.metrics.count(METRIC_NOTIFICATIONS, 1);
                    let token = self.root.child_token();
                    notes.push(tokio::spawn(Arc::clone(&self).invoke(req, token)));
                }
                Some(id) => {
                    self.metrics.count(METRIC_REQUESTS, 1);
                    let token = self.root.child_token();
                    let duplicate = {
                        let mut inflight =
                            self.inflight.lock().unwrap_or_else(|e| e.into_inner());
                        if inflight.contains_key(&id) {
                            true
                        } else {
                            inflight.insert(id.clone(), token.clone());
                            false
                        }
                    };
                    if duplicate {
                        let error = ErrorObject::invalid_request(format!(
                            "duplicate request id {}",
                            id
                        ));
                        slots[idx] =
                            Some(Response::failure(Some(id), error).with_v1(req.is_v1()));
                        continue;
                    }
                    replies.push((idx, tokio::spawn(Arc::clone(&self).invoke(req, token))));
                }
            }
        }

        for (idx, handle) in replies {
            match handle.await {
                Ok(rsp) => slots[idx] = rsp,
                Err(err) => error!(error = %err, "request task failed"),
            }
        }
        let responses: Vec<Response> = slots.into_iter().flatten().collect();
        if !responses.is_empty() {
            self.send_responses(responses, batch.from_array).await;
        }
        // Notification handlers do not gate the batch reply, but they are
        // part of the in-flight set the shutdown path waits on.
        for handle in notes {
            if let Err(err) = handle.await {
                error!(error = %err, "notification task failed");
            }
        }
    }

    /// Run one accepted request through the concurrency gate and its handler,
    /// producing the response to slot into the batch (`None` for
    /// notifications).
    async fn invoke(self: Arc<Self>, req: Request, token: CancellationToken) -> Option<Response> {
        let _permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return None,
        };
        let id = req.id().cloned();
        let v1 = req.is_v1();
        let method = req.method().to_string();
        let outcome = self.invoke_handler(req, token.clone()).await;
        if let Some(id) = &id {
            self.inflight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(id);
        }
        // The request context ends when the handler returns.
        token.cancel();
        let id = match id {
            Some(id) => id,
            None => {
                if let Err(err) = outcome {
                    debug!(method = %method, error = %err, "notification handler failed");
                }
                return None;
            }
        };
        let rsp = match outcome {
            Ok(result) => Response::success(id, result),
            Err(error) => Response::failure(Some(id), error),
        };
        Some(rsp.with_v1(v1))
    }

    async fn invoke_handler(
        &self,
        req: Request,
        token: CancellationToken,
    ) -> Result<Option<Box<RawValue>>, ErrorObject> {
        let (req, metadata) = match &self.opts.decode_context {
            Some(hook) => {
                let params = req.params_raw().map(|raw| raw.to_owned());
                let (params, metadata) = hook(params)?;
                (req.with_params(normalize_params(params)?), metadata)
            }
            None => (req, None),
        };

        // The rpc. prefix is reserved for control methods and never reaches
        // the assigner.
        if req.method().starts_with("rpc.") {
            if req.method() == SERVER_INFO_METHOD && !req.is_notification() {
                return encode_value(&self.server_info());
            }
            return Err(ErrorObject::method_not_found(req.method()));
        }

        let handler = match self.assigner.assign(req.method()) {
            Some(handler) => handler,
            None => return Err(ErrorObject::method_not_found(req.method())),
        };
        let method = req.method().to_string();
        let ctx = HandlerCtx::new(token, metadata);
        let call: HandlerResult =
            match AssertUnwindSafe(handler.handle(ctx, req)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(method = %method, panic = %message, "handler panicked");
                    self.metrics.count(METRIC_PANIC, 1);
                    return Err(ErrorObject::internal(format!(
                        "handler panicked: {}",
                        message
                    )));
                }
            };
        encode_value(&call?)
    }

    /// Handle the `rpc.cancel` control notification: cancel the context of
    /// every named in-flight request. Unknown IDs are ignored, and repeated
    /// cancellation is a no-op.
    fn cancel_requested(&self, req: &Request) {
        let ids: Vec<RequestId> = match req.params() {
            Ok(ids) => ids,
            Err(err) => {
                debug!(error = %err, "ignoring malformed rpc.cancel");
                return;
            }
        };
        let inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            if let Some(token) = inflight.get(&id) {
                debug!(id = %id, "cancelling in-flight request");
                token.cancel();
            }
        }
    }

    async fn send_responses(&self, responses: Vec<Response>, as_array: bool) {
        let errors = responses.iter().filter(|rsp| rsp.is_error()).count();
        if errors > 0 {
            self.metrics.count(METRIC_ERRORS, errors as i64);
        }
        match encode_response_batch(&responses, as_array) {
            Ok(frame) => {
                let _guard = self.write_lock.lock().await;
                if let Err(err) = self.channel.send(&frame).await {
                    warn!(error = %err, "response transmission failed");
                }
            }
            Err(err) => error!(error = %err, "response encoding failed"),
        }
    }

    fn server_info(&self) -> ServerInfo {
        let mut snap = Snapshot::default();
        self.metrics.snapshot(&mut snap);
        ServerInfo {
            methods: self.assigner.names(),
            counters: snap.counters,
            max_values: snap.max_values,
            labels: snap.labels,
        }
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Option<Box<RawValue>>, ErrorObject> {
    match to_raw_value(value) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) => {
            error!(error = %err, "result encoding failed");
            Err(ErrorObject::internal("result encoding failed"))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unidentified panic value".to_string()
    }
}
