//! The uniform handler contract and adapters for binding plain async
//! functions to it.
//!
//! A [`Handler`] receives the per-request [`HandlerCtx`] and the immutable
//! [`Request`] view, and produces either a JSON result value or a coded
//! error. The adapter constructors in this module wrap the common function
//! shapes (no parameters, one decodable parameter, a variadic parameter
//! list, or raw request access) so most handlers never touch the wire
//! types. Construction is a one-time cost; the resulting handler is safe for
//! concurrent invocation and holds no per-call state.

use std::future::Future;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::error;

use skiff_jsonrpc::error::ErrorObject;
use skiff_jsonrpc::request::Request;

/// The uniform result of handling one request.
pub type HandlerResult = Result<Value, ErrorObject>;

/// The per-request context a handler runs under.
///
/// Cancellation is cooperative: the context is cancelled when an
/// `rpc.cancel` arrives for this request's ID, when the server shuts down,
/// or when the handler returns; the handler is expected to notice and return
/// promptly, but is never forcibly terminated.
#[derive(Clone)]
pub struct HandlerCtx {
    cancel: CancellationToken,
    metadata: Option<Value>,
}

impl HandlerCtx {
    pub(crate) fn new(cancel: CancellationToken, metadata: Option<Value>) -> Self {
        Self { cancel, metadata }
    }

    /// A context not attached to any server, for invoking handlers directly.
    pub fn background() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    /// Reports whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits until cancellation is signalled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Fails with a cancellation error if cancellation has been signalled.
    pub fn err_if_cancelled(&self) -> Result<(), ErrorObject> {
        if self.cancel.is_cancelled() {
            Err(ErrorObject::cancelled("request cancelled"))
        } else {
            Ok(())
        }
    }

    /// Context metadata extracted from the request by the server's
    /// `decode_context` hook, if any.
    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }
}

/// Processes a single request into a result or a coded error.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: HandlerCtx, req: Request) -> HandlerResult;
}

fn encode_result<Y: Serialize>(value: Y) -> HandlerResult {
    serde_json::to_value(value).map_err(|err| {
        error!(error = %err, "result encoding failed");
        ErrorObject::internal("result encoding failed")
    })
}

type RawFn = Box<dyn Fn(HandlerCtx, Request) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// The identity shape: full request in, encoded value out. Bound without any
/// adaptation.
pub struct MethodFn {
    f: RawFn,
}

/// Adapt `(ctx, request) -> Result<Value, ErrorObject>` as a handler.
pub fn from_fn<F, Fut>(f: F) -> MethodFn
where
    F: Fn(HandlerCtx, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    MethodFn {
        f: Box::new(move |ctx, req| -> BoxFuture<'static, HandlerResult> {
            Box::pin(f(ctx, req))
        }),
    }
}

#[async_trait]
impl Handler for MethodFn {
    async fn handle(&self, ctx: HandlerCtx, req: Request) -> HandlerResult {
        (self.f)(ctx, req).await
    }
}

/// A handler that accepts no parameters.
pub struct NullaryFn<Y> {
    f: Box<dyn Fn(HandlerCtx) -> BoxFuture<'static, Result<Y, ErrorObject>> + Send + Sync>,
}

/// Adapt `(ctx) -> Result<Y, ErrorObject>` as a handler. A request carrying
/// parameters fails with an invalid-params error.
pub fn nullary<Y, F, Fut>(f: F) -> NullaryFn<Y>
where
    Y: Serialize + Send + 'static,
    F: Fn(HandlerCtx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Y, ErrorObject>> + Send + 'static,
{
    NullaryFn {
        f: Box::new(move |ctx| -> BoxFuture<'static, Result<Y, ErrorObject>> {
            Box::pin(f(ctx))
        }),
    }
}

#[async_trait]
impl<Y: Serialize + Send + 'static> Handler for NullaryFn<Y> {
    async fn handle(&self, ctx: HandlerCtx, req: Request) -> HandlerResult {
        if req.has_params() {
            return Err(ErrorObject::invalid_params("no parameters accepted"));
        }
        encode_result((self.f)(ctx).await?)
    }
}

/// A handler whose parameters decode into a single value of type `X`.
pub struct TypedFn<X, Y> {
    f: Box<dyn Fn(HandlerCtx, X) -> BoxFuture<'static, Result<Y, ErrorObject>> + Send + Sync>,
}

/// Adapt `(ctx, X) -> Result<Y, ErrorObject>` as a handler.
///
/// The request parameters are decoded into `X`; decoder failures become
/// invalid-params errors carrying the decoder's message. Absent parameters
/// decode as JSON `null`, so an `Option<T>` (or other null-accepting) `X`
/// makes the parameters optional.
pub fn typed<X, Y, F, Fut>(f: F) -> TypedFn<X, Y>
where
    X: DeserializeOwned + Send + 'static,
    Y: Serialize + Send + 'static,
    F: Fn(HandlerCtx, X) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Y, ErrorObject>> + Send + 'static,
{
    TypedFn {
        f: Box::new(move |ctx, x| -> BoxFuture<'static, Result<Y, ErrorObject>> {
            Box::pin(f(ctx, x))
        }),
    }
}

#[async_trait]
impl<X, Y> Handler for TypedFn<X, Y>
where
    X: DeserializeOwned + Send + 'static,
    Y: Serialize + Send + 'static,
{
    async fn handle(&self, ctx: HandlerCtx, req: Request) -> HandlerResult {
        let x: X = req.params()?;
        encode_result((self.f)(ctx, x).await?)
    }
}

/// A handler whose parameters are a JSON array of uniformly-typed values.
pub struct VariadicFn<X, Y> {
    f: Box<dyn Fn(HandlerCtx, Vec<X>) -> BoxFuture<'static, Result<Y, ErrorObject>> + Send + Sync>,
}

/// Adapt `(ctx, Vec<X>) -> Result<Y, ErrorObject>` as a handler.
///
/// The parameters must be a JSON array whose elements each decode into `X`;
/// absent parameters yield an empty vector; any non-array value fails with an
/// invalid-params error.
pub fn variadic<X, Y, F, Fut>(f: F) -> VariadicFn<X, Y>
where
    X: DeserializeOwned + Send + 'static,
    Y: Serialize + Send + 'static,
    F: Fn(HandlerCtx, Vec<X>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Y, ErrorObject>> + Send + 'static,
{
    VariadicFn {
        f: Box::new(move |ctx, xs| -> BoxFuture<'static, Result<Y, ErrorObject>> {
            Box::pin(f(ctx, xs))
        }),
    }
}

#[async_trait]
impl<X, Y> Handler for VariadicFn<X, Y>
where
    X: DeserializeOwned + Send + 'static,
    Y: Serialize + Send + 'static,
{
    async fn handle(&self, ctx: HandlerCtx, req: Request) -> HandlerResult {
        let xs: Vec<X> = match req.params_raw() {
            None => Vec::new(),
            Some(raw) if raw.get().trim_start().starts_with('[') => req.params()?,
            Some(_) => {
                return Err(ErrorObject::invalid_params("parameters must be an array"));
            }
        };
        encode_result((self.f)(ctx, xs).await?)
    }
}

/// A handler with raw request access and a typed result.
pub struct RequestFn<Y> {
    f: Box<dyn Fn(HandlerCtx, Request) -> BoxFuture<'static, Result<Y, ErrorObject>> + Send + Sync>,
}

/// Adapt `(ctx, request) -> Result<Y, ErrorObject>` as a handler, encoding
/// the typed result.
pub fn with_request<Y, F, Fut>(f: F) -> RequestFn<Y>
where
    Y: Serialize + Send + 'static,
    F: Fn(HandlerCtx, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Y, ErrorObject>> + Send + 'static,
{
    RequestFn {
        f: Box::new(move |ctx, req| -> BoxFuture<'static, Result<Y, ErrorObject>> {
            Box::pin(f(ctx, req))
        }),
    }
}

#[async_trait]
impl<Y: Serialize + Send + 'static> Handler for RequestFn<Y> {
    async fn handle(&self, ctx: HandlerCtx, req: Request) -> HandlerResult {
        encode_result((self.f)(ctx, req).await?)
    }
}
