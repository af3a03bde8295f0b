//! Client configuration.

use std::sync::Arc;

use serde_json::value::RawValue;

use skiff_jsonrpc::error::RpcError;
use skiff_jsonrpc::request::Request;

/// Hook that injects context metadata into the encoded request parameters
/// before they are sent to the server.
pub type EncodeContextFn = Arc<
    dyn Fn(Option<Box<RawValue>>) -> Result<Option<Box<RawValue>>, RpcError> + Send + Sync,
>;

/// Callback for server-pushed notifications. At most one invocation is
/// active at a time.
pub type OnNotifyFn = Arc<dyn Fn(Request) + Send + Sync>;

/// Options controlling the behaviour of a client. The default value provides
/// strict JSON-RPC 2.0 with no cancellation notices.
#[derive(Clone, Default)]
pub struct ClientOptions {
    pub(crate) allow_v1: bool,
    pub(crate) send_cancel: bool,
    pub(crate) encode_context: Option<EncodeContextFn>,
    pub(crate) on_notify: Option<OnNotifyFn>,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tolerate responses that do not include the `jsonrpc` version marker.
    pub fn allow_v1(mut self, yes: bool) -> Self {
        self.allow_v1 = yes;
        self
    }

    /// Send an `rpc.cancel` notification to the server when a call's context
    /// ends before its response arrives. Best effort only.
    pub fn send_cancel(mut self, yes: bool) -> Self {
        self.send_cancel = yes;
        self
    }

    /// Install a context-encoding hook, called with the encoded parameters
    /// of every outbound request before transmission.
    pub fn encode_context<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<Box<RawValue>>) -> Result<Option<Box<RawValue>>, RpcError>
            + Send
            + Sync
            + 'static,
    {
        self.encode_context = Some(Arc::new(hook));
        self
    }

    /// Install a callback for notifications pushed by the server. Without
    /// one, server notifications are logged and discarded.
    pub fn on_notify<F>(mut self, callback: F) -> Self
    where
        F: Fn(Request) + Send + Sync + 'static,
    {
        self.on_notify = Some(Arc::new(callback));
        self
    }
}
