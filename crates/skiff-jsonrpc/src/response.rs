use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

use crate::error::{ErrorObject, RpcError};
use crate::request::Request;
use crate::types::RequestId;
use crate::VERSION;

/// A JSON-RPC response, correlated to a request by ID.
///
/// Exactly one of result and error is present. The ID is null only on
/// synthesized failures for which no ID could be extracted (parse errors).
#[derive(Debug, Clone)]
pub struct Response {
    id: Option<RequestId>,
    result: Option<Box<RawValue>>,
    error: Option<ErrorObject>,
    v1: bool,
}

impl Response {
    /// A successful response carrying the handler's encoded result.
    pub fn success(id: RequestId, result: Option<Box<RawValue>>) -> Self {
        Self {
            id: Some(id),
            result,
            error: None,
            v1: false,
        }
    }

    /// An error response. `id` is `None` when no ID could be correlated.
    pub fn failure(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
            v1: false,
        }
    }

    /// Mark this response as belonging to the v1 dialect; its encoding omits
    /// the version marker, mirroring the request it answers.
    pub fn with_v1(mut self, v1: bool) -> Self {
        self.v1 = v1;
        self
    }

    pub fn id(&self) -> Option<&RequestId> {
        self.id.as_ref()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&ErrorObject> {
        self.error.as_ref()
    }

    /// The raw result bytes, if this is a successful response.
    pub fn result_raw(&self) -> Option<&RawValue> {
        self.result.as_deref()
    }

    /// Decode the result into `T`, mapping an error response onto the
    /// caller-visible error form (cancellation and deadline codes become
    /// their sentinels). A missing result decodes as JSON `null`.
    pub fn result<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        if let Some(err) = &self.error {
            return Err(RpcError::from_error_object(err.clone()));
        }
        let raw = self.result.as_deref().map(RawValue::get).unwrap_or("null");
        Ok(serde_json::from_str(raw)?)
    }
}

impl Serialize for Response {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if !self.v1 {
            map.serialize_entry("jsonrpc", VERSION)?;
        }
        map.serialize_entry("id", &self.id)?;
        if let Some(error) = &self.error {
            map.serialize_entry("error", error)?;
        } else {
            match &self.result {
                Some(result) => map.serialize_entry("result", result)?,
                None => map.serialize_entry("result", &Value::Null)?,
            }
        }
        map.end()
    }
}

/// Encode a batch of responses, mirroring the shape of the frame that
/// produced it: array-in, array-out; object-in, object-out.
pub fn encode_response_batch(
    responses: &[Response],
    as_array: bool,
) -> serde_json::Result<Vec<u8>> {
    if as_array || responses.len() != 1 {
        serde_json::to_vec(responses)
    } else {
        serde_json::to_vec(&responses[0])
    }
}

/// One element of an inbound frame on the client side.
///
/// The same stream carries correlated replies and, when the server pushes
/// them, ID-less notifications; the two are distinguished only by the
/// presence of an ID.
#[derive(Debug, Deserialize)]
pub struct ClientReply {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Option<Box<RawValue>>,
    #[serde(default)]
    error: Option<ErrorObject>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Box<RawValue>>,
}

impl ClientReply {
    /// The correlation ID. Invalid ID shapes are folded into "absent"; such
    /// replies are logged and dropped by the dispatcher.
    pub fn id(&self) -> Option<RequestId> {
        RequestId::from_wire(&self.id).ok().flatten()
    }

    /// Validates the version marker against the accepted dialects.
    pub fn version_ok(&self, allow_v1: bool) -> bool {
        match self.jsonrpc.as_deref() {
            Some(VERSION) => true,
            Some(_) => false,
            None => allow_v1,
        }
    }

    /// Reinterpret an ID-less reply as a server-pushed notification, if it
    /// carries a method name.
    pub fn into_notification(self) -> Option<Request> {
        let method = self.method?;
        Some(Request::notification(method, self.params))
    }

    /// The correlated response carried by this reply.
    pub fn into_response(self) -> Response {
        let id = RequestId::from_wire(&self.id).ok().flatten();
        let v1 = self.jsonrpc.is_none();
        Response {
            id,
            result: self.result,
            error: self.error,
            v1,
        }
    }
}

/// Decode one framed message into reply elements. Unlike the request side, a
/// frame that fails to decode here is fatal to the connection: the client has
/// no way to re-correlate a stream it cannot parse.
pub fn parse_reply_batch(frame: &[u8]) -> serde_json::Result<Vec<ClientReply>> {
    let text = std::str::from_utf8(frame)
        .map_err(|_| serde::de::Error::custom("frame is not valid UTF-8"))?;
    if text.trim_start().starts_with('[') {
        serde_json::from_str(text)
    } else {
        let one: ClientReply = serde_json::from_str(text)?;
        Ok(vec![one])
    }
}
