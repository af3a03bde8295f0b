//! # JSON-RPC 2.0 Wire Model
//!
//! The transport-agnostic core of the skiff RPC framework: request, response
//! and error value objects with their marshaling rules (including batch form),
//! the framed [`Channel`] abstraction both engines speak through, and a small
//! thread-safe metrics collector.
//!
//! The protocol implemented is JSON-RPC 2.0 plus two non-standard extensions:
//! server-to-client notifications and the `rpc.cancel` control method used to
//! propagate cancellation from a client to a server.
//!
//! ## Wire shapes
//!
//! ```rust,ignore
//! // Request:      {"jsonrpc":"2.0","id":1,"method":"Add","params":[2,3]}
//! // Notification: {"jsonrpc":"2.0","method":"Log","params":{"msg":"hi"}}
//! // Response:     {"jsonrpc":"2.0","id":1,"result":5}
//! // Error:        {"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"..."}}
//! ```
//!
//! A frame may also carry a batch (a top-level array) of any of the above.
//! Decoding accepts both shapes; encoding mirrors the inbound shape.

pub mod channel;
pub mod error;
pub mod metrics;
pub mod request;
pub mod response;
pub mod types;

pub use channel::Channel;
pub use error::{ErrorCode, ErrorObject, RpcError};
pub use metrics::{Metrics, Snapshot};
pub use request::{ParsedRequest, Request};
pub use response::Response;
pub use types::RequestId;

/// JSON-RPC 2.0 version marker.
pub const VERSION: &str = "2.0";

/// Name of the control method used to propagate cancellation.
pub const CANCEL_METHOD: &str = "rpc.cancel";
