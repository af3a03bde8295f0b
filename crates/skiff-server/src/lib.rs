//! # JSON-RPC 2.0 Server Engine
//!
//! Dispatches requests read from a framed [`Channel`](skiff_jsonrpc::Channel)
//! to registered handlers under a bounded concurrency gate, with request
//! correlation, batch semantics, cooperative cancellation via the
//! `rpc.cancel` control method, and optional server-to-client notifications.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use skiff_jsonrpc::channel;
//! use skiff_server::{handler, MethodMap, Server, ServerOptions};
//!
//! # async fn run() {
//! let (local, _remote) = channel::direct();
//! let assigner = MethodMap::new().insert(
//!     "Add",
//!     handler::typed(|_ctx, (a, b): (i64, i64)| async move { Ok(a + b) }),
//! );
//! let server = Server::start(local, assigner, ServerOptions::new());
//! server.wait().await.unwrap();
//! # }
//! ```

pub mod assigner;
pub mod handler;
pub mod options;
pub mod params;
pub mod server;

pub use assigner::{Assigner, MethodMap, ServiceMap};
pub use handler::{Handler, HandlerCtx};
pub use options::ServerOptions;
pub use server::{Server, ServerInfo};
