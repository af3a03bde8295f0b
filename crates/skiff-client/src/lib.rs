//! # JSON-RPC 2.0 Client Engine
//!
//! Sends requests over a framed [`Channel`](skiff_jsonrpc::Channel), tracks
//! them in an in-flight registry, and demultiplexes responses back to their
//! callers by ID. Cancellation is context-driven: every call is governed by
//! a [`CallContext`], and when that context ends before the response
//! arrives, the caller observes a cancellation (or deadline) error and the
//! server is told, best effort, through the `rpc.cancel` extension.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use skiff_client::{Client, ClientOptions};
//! use skiff_jsonrpc::channel;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (local, _remote) = channel::direct();
//! let client = Client::new(local, ClientOptions::new());
//! let sum: i64 = client.call_result("Add", (2, 3)).await?;
//! assert_eq!(sum, 5);
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod context;
pub mod options;

pub use client::{Client, Spec};
pub use context::CallContext;
pub use options::ClientOptions;
