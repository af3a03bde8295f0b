//! Server configuration.

use std::sync::Arc;

use serde_json::value::RawValue;
use serde_json::Value;

use skiff_jsonrpc::error::ErrorObject;
use skiff_jsonrpc::metrics::Metrics;

/// Hook that extracts client-sent context metadata from the raw request
/// parameters before dispatch. Returns the replacement parameters and the
/// metadata value surfaced on the handler context.
pub type DecodeContextFn = Arc<
    dyn Fn(Option<Box<RawValue>>) -> Result<(Option<Box<RawValue>>, Option<Value>), ErrorObject>
        + Send
        + Sync,
>;

/// Options controlling the behaviour of a server. The default value provides
/// strict JSON-RPC 2.0 with handler parallelism matching the hardware.
#[derive(Clone, Default)]
pub struct ServerOptions {
    pub(crate) allow_v1: bool,
    pub(crate) allow_notify: bool,
    pub(crate) concurrency: usize,
    pub(crate) metrics: Option<Arc<Metrics>>,
    pub(crate) decode_context: Option<DecodeContextFn>,
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tolerate requests that do not include the `jsonrpc` version marker.
    /// Replies to such requests omit the marker as well.
    pub fn allow_v1(mut self, yes: bool) -> Self {
        self.allow_v1 = yes;
        self
    }

    /// Enable server-to-client notifications, a non-standard extension.
    pub fn allow_notify(mut self, yes: bool) -> Self {
        self.allow_notify = yes;
        self
    }

    /// Cap the number of handlers that may execute in parallel. A value of
    /// zero selects the hardware thread count.
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    /// Record server metrics into `metrics`. Servers created from the same
    /// collector share it; without this a fresh private collector is used.
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Install a context-decoding hook, called with the encoded request
    /// parameters before they are delivered to the handler.
    pub fn decode_context<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<Box<RawValue>>) -> Result<(Option<Box<RawValue>>, Option<Value>), ErrorObject>
            + Send
            + Sync
            + 'static,
    {
        self.decode_context = Some(Arc::new(hook));
        self
    }

    pub(crate) fn effective_concurrency(&self) -> usize {
        if self.concurrency >= 1 {
            self.concurrency
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}
