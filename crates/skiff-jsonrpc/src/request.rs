use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

use crate::error::ErrorObject;
use crate::types::RequestId;
use crate::VERSION;

/// Valid method names. Empty names are always rejected.
static METHOD_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]*$").expect("static pattern"));

/// Reports whether `name` is a well-formed method name.
pub fn is_valid_method_name(name: &str) -> bool {
    METHOD_NAME.is_match(name)
}

/// A single JSON-RPC request or notification.
///
/// On the server this is the immutable view handed to handlers: it lives from
/// the moment the request is accepted until the handler returns, and handlers
/// must not retain it past return. On the client it is also the shape handed
/// to the notification callback for server-pushed notifications.
#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    id: Option<RequestId>,
    params: Option<Box<RawValue>>,
    v1: bool,
}

impl Request {
    /// Construct a request expecting a response.
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Box<RawValue>>) -> Self {
        Self {
            method: method.into(),
            id: Some(id),
            params,
            v1: false,
        }
    }

    /// Construct a notification (no ID, no response expected).
    pub fn notification(method: impl Into<String>, params: Option<Box<RawValue>>) -> Self {
        Self {
            method: method.into(),
            id: None,
            params,
            v1: false,
        }
    }

    /// The method name being requested.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The request ID, or `None` for a notification.
    pub fn id(&self) -> Option<&RequestId> {
        self.id.as_ref()
    }

    /// Reports whether this request is a notification.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Reports whether the request carries parameters.
    pub fn has_params(&self) -> bool {
        self.params.is_some()
    }

    /// The raw parameter bytes, if any. When present the text is guaranteed
    /// to encode a JSON array or object.
    pub fn params_raw(&self) -> Option<&RawValue> {
        self.params.as_deref()
    }

    /// Decode the parameters into `T`. Absent parameters decode as JSON
    /// `null`, so an `Option<T>` destination accepts a request without
    /// parameters. Decoder failures are reported as invalid-params errors
    /// carrying the decoder's message in the error data.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, ErrorObject> {
        let raw = self.params.as_deref().map(RawValue::get).unwrap_or("null");
        serde_json::from_str(raw).map_err(|err| {
            ErrorObject::invalid_params("invalid parameters").with_data(&err.to_string())
        })
    }

    /// Reports whether the request was received without a version marker
    /// (only possible when the v1 dialect is tolerated). Replies to such a
    /// request mirror the dialect by omitting the marker.
    pub fn is_v1(&self) -> bool {
        self.v1
    }

    /// A copy of this request carrying `params` instead of its own, used
    /// when a context-decoding hook rewrites the parameters.
    pub fn with_params(mut self, params: Option<Box<RawValue>>) -> Self {
        self.params = params;
        self
    }
}

impl Serialize for Request {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if !self.v1 {
            map.serialize_entry("jsonrpc", VERSION)?;
        }
        if let Some(id) = &self.id {
            map.serialize_entry("id", id)?;
        }
        map.serialize_entry("method", &self.method)?;
        if let Some(params) = &self.params {
            map.serialize_entry("params", params)?;
        }
        map.end()
    }
}

/// The looser shape requests are decoded through before validation.
#[derive(Deserialize)]
struct WireRequest {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Value,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Box<RawValue>>,
}

/// One element of an inbound batch: either an accepted request, or the error
/// that must be reported for it (with the ID the error correlates to, when
/// one could be extracted).
#[derive(Debug)]
pub enum ParsedRequest {
    Valid(Request),
    Invalid {
        id: Option<RequestId>,
        error: ErrorObject,
        v1: bool,
    },
}

/// A decoded inbound frame of requests.
#[derive(Debug)]
pub struct RequestBatch {
    /// The elements in wire order.
    pub items: Vec<ParsedRequest>,
    /// Whether the frame used the top-level array form. Replies mirror it.
    pub from_array: bool,
}

/// Failures that prevent a frame from being interpreted at all.
#[derive(Debug)]
pub enum BatchError {
    /// The frame was not valid JSON.
    Parse(serde_json::Error),
    /// The frame was a top-level empty array.
    Empty,
}

/// Splits a frame into its elements: a top-level array yields its members,
/// anything else is a single-element batch. The split is purely syntactic;
/// element validation happens afterwards so one bad element cannot take down
/// its neighbours.
fn split_frame(frame: &[u8]) -> Result<(Vec<Box<RawValue>>, bool), BatchError> {
    let text = std::str::from_utf8(frame).map_err(|_| {
        BatchError::Parse(serde::de::Error::custom("frame is not valid UTF-8"))
    })?;
    if text.trim_start().starts_with('[') {
        let items: Vec<Box<RawValue>> =
            serde_json::from_str(text).map_err(BatchError::Parse)?;
        if items.is_empty() {
            return Err(BatchError::Empty);
        }
        Ok((items, true))
    } else {
        let item: Box<RawValue> = serde_json::from_str(text).map_err(BatchError::Parse)?;
        Ok((vec![item], false))
    }
}

/// Decode one framed message into a request batch.
///
/// Per-element failures are folded into the batch as [`ParsedRequest::Invalid`]
/// entries: an element that is not a JSON object is a parse error correlated
/// to a null ID; an object that fails validation (missing or malformed method,
/// wrong or missing version marker, non-structured params) is an
/// invalid-request error correlated to whatever ID could be extracted.
pub fn parse_request_batch(frame: &[u8], allow_v1: bool) -> Result<RequestBatch, BatchError> {
    let (raw_items, from_array) = split_frame(frame)?;
    let items = raw_items
        .into_iter()
        .map(|raw| parse_request(&raw, allow_v1))
        .collect();
    Ok(RequestBatch { items, from_array })
}

fn parse_request(raw: &RawValue, allow_v1: bool) -> ParsedRequest {
    let wire: WireRequest = match serde_json::from_str(raw.get()) {
        Ok(wire) => wire,
        Err(err) => {
            return ParsedRequest::Invalid {
                id: None,
                error: ErrorObject::parse_error(format!("invalid request: {}", err)),
                v1: false,
            }
        }
    };

    let (id, v1) = match RequestId::from_wire(&wire.id) {
        Ok(id) => (id, wire.jsonrpc.is_none()),
        Err(msg) => {
            return ParsedRequest::Invalid {
                id: None,
                error: ErrorObject::invalid_request(msg),
                v1: wire.jsonrpc.is_none() && allow_v1,
            }
        }
    };
    let invalid = |error: ErrorObject| ParsedRequest::Invalid {
        id: id.clone(),
        error,
        v1: v1 && allow_v1,
    };

    match wire.jsonrpc.as_deref() {
        Some(VERSION) => {}
        Some(other) => {
            return invalid(ErrorObject::invalid_request(format!(
                "incorrect version marker {:?}",
                other
            )))
        }
        None if allow_v1 => {}
        None => return invalid(ErrorObject::invalid_request("missing version marker")),
    }

    let method = match wire.method {
        Some(method) if !method.is_empty() => method,
        Some(_) => return invalid(ErrorObject::invalid_request("empty method name")),
        None => return invalid(ErrorObject::invalid_request("empty method name")),
    };
    if !is_valid_method_name(&method) {
        return invalid(ErrorObject::invalid_request(format!(
            "invalid method name {:?}",
            method
        )));
    }

    let params = match normalize_params(wire.params) {
        Ok(params) => params,
        Err(error) => return invalid(error),
    };

    ParsedRequest::Valid(Request {
        method,
        id,
        params,
        v1: v1 && allow_v1,
    })
}

/// Encode a batch of outbound requests. A single request is sent in the
/// single-object form; anything larger uses the array form.
pub fn encode_request_batch(requests: &[Request]) -> serde_json::Result<Vec<u8>> {
    if requests.len() == 1 {
        serde_json::to_vec(&requests[0])
    } else {
        serde_json::to_vec(requests)
    }
}

/// Encode a caller-supplied parameter value for transmission, enforcing the
/// JSON-RPC rule that parameters are an array, an object, or absent. A value
/// encoding as `null` (the unit value, `None`, ...) means "no parameters".
/// Any other JSON form is rejected locally, before any bytes are sent.
pub fn marshal_params<T: serde::Serialize>(
    params: &T,
) -> Result<Option<Box<RawValue>>, crate::error::RpcError> {
    let raw = serde_json::value::to_raw_value(params)?;
    let text = raw.get().trim_start();
    if text.starts_with('[') || text.starts_with('{') {
        Ok(Some(raw))
    } else if text == "null" {
        Ok(None)
    } else {
        Err(crate::error::RpcError::InvalidRequest(
            "invalid parameters: array or object required".into(),
        ))
    }
}

/// Enforce the JSON-RPC rule that parameters, when present, are an array or
/// an object. A literal `null` is accepted on the wire and folded into
/// "absent".
pub fn normalize_params(
    params: Option<Box<RawValue>>,
) -> Result<Option<Box<RawValue>>, ErrorObject> {
    match params {
        None => Ok(None),
        Some(raw) => {
            let text = raw.get().trim_start();
            if text.starts_with('[') || text.starts_with('{') {
                Ok(Some(raw))
            } else if text == "null" {
                Ok(None)
            } else {
                Err(ErrorObject::invalid_request(
                    "parameters must be an array or an object",
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn parse_one(text: &str, allow_v1: bool) -> ParsedRequest {
        let mut batch = parse_request_batch(text.as_bytes(), allow_v1).unwrap();
        assert_eq!(batch.items.len(), 1);
        batch.items.remove(0)
    }

    #[test]
    fn test_parse_simple_request() {
        let req = match parse_one(r#"{"jsonrpc":"2.0","id":1,"method":"Add","params":[2,3]}"#, false)
        {
            ParsedRequest::Valid(req) => req,
            other => panic!("unexpected parse: {:?}", other),
        };
        assert_eq!(req.method(), "Add");
        assert_eq!(req.id(), Some(&RequestId::Number(1)));
        assert!(req.has_params());
        assert_eq!(req.params::<Vec<i64>>().unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_parse_notification() {
        let req = match parse_one(r#"{"jsonrpc":"2.0","method":"Log","params":{"msg":"hi"}}"#, false)
        {
            ParsedRequest::Valid(req) => req,
            other => panic!("unexpected parse: {:?}", other),
        };
        assert!(req.is_notification());
        assert_eq!(req.id(), None);
    }

    #[test]
    fn test_null_id_is_notification() {
        let req = match parse_one(r#"{"jsonrpc":"2.0","id":null,"method":"Log"}"#, false) {
            ParsedRequest::Valid(req) => req,
            other => panic!("unexpected parse: {:?}", other),
        };
        assert!(req.is_notification());
    }

    #[test]
    fn test_missing_method_is_invalid_request() {
        match parse_one(r#"{"jsonrpc":"2.0","id":3}"#, false) {
            ParsedRequest::Invalid { id, error, .. } => {
                assert_eq!(id, Some(RequestId::Number(3)));
                assert_eq!(error.error_code(), ErrorCode::InvalidRequest);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_missing_version_rejected_unless_v1_allowed() {
        match parse_one(r#"{"id":1,"method":"M"}"#, false) {
            ParsedRequest::Invalid { error, .. } => {
                assert_eq!(error.error_code(), ErrorCode::InvalidRequest);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
        match parse_one(r#"{"id":1,"method":"M"}"#, true) {
            ParsedRequest::Valid(req) => assert!(req.is_v1()),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_non_object_element_is_parse_error() {
        match parse_one("17", false) {
            ParsedRequest::Invalid { id, error, .. } => {
                assert_eq!(id, None);
                assert_eq!(error.error_code(), ErrorCode::Parse);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_scalar_params_rejected() {
        match parse_one(r#"{"jsonrpc":"2.0","id":1,"method":"M","params":42}"#, false) {
            ParsedRequest::Invalid { error, .. } => {
                assert_eq!(error.error_code(), ErrorCode::InvalidRequest);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_null_params_folded_to_absent() {
        let req = match parse_one(r#"{"jsonrpc":"2.0","id":1,"method":"M","params":null}"#, false) {
            ParsedRequest::Valid(req) => req,
            other => panic!("unexpected parse: {:?}", other),
        };
        assert!(!req.has_params());
        assert_eq!(req.params::<Option<i64>>().unwrap(), None);
    }

    #[test]
    fn test_empty_batch_rejected() {
        assert!(matches!(
            parse_request_batch(b"[]", false),
            Err(BatchError::Empty)
        ));
    }

    #[test]
    fn test_bad_frame_is_parse_error() {
        assert!(matches!(
            parse_request_batch(b"{not json", false),
            Err(BatchError::Parse(_))
        ));
    }

    #[test]
    fn test_batch_shape_recorded() {
        let single = parse_request_batch(br#"{"jsonrpc":"2.0","id":1,"method":"M"}"#, false).unwrap();
        assert!(!single.from_array);
        let multi =
            parse_request_batch(br#"[{"jsonrpc":"2.0","id":1,"method":"M"}]"#, false).unwrap();
        assert!(multi.from_array);
    }

    #[test]
    fn test_bad_element_does_not_affect_neighbours() {
        let batch = parse_request_batch(
            br#"[{"jsonrpc":"2.0","id":1,"method":"M"},"bogus"]"#,
            false,
        )
        .unwrap();
        assert!(matches!(batch.items[0], ParsedRequest::Valid(_)));
        assert!(matches!(batch.items[1], ParsedRequest::Invalid { .. }));
    }

    #[test]
    fn test_method_name_validation() {
        assert!(is_valid_method_name("Add"));
        assert!(is_valid_method_name("svc.method"));
        assert!(is_valid_method_name("_x-1"));
        assert!(!is_valid_method_name(""));
        assert!(!is_valid_method_name("1abc"));
        assert!(!is_valid_method_name("has space"));
    }

    #[test]
    fn test_marshal_params() {
        assert!(marshal_params(&()).unwrap().is_none());
        assert!(marshal_params(&Option::<i64>::None).unwrap().is_none());
        assert_eq!(marshal_params(&(2, 3)).unwrap().unwrap().get(), "[2,3]");
        assert_eq!(
            marshal_params(&serde_json::json!({"k": 1})).unwrap().unwrap().get(),
            r#"{"k":1}"#
        );
        assert!(marshal_params(&42).is_err());
        assert!(marshal_params(&"str").is_err());
    }

    #[test]
    fn test_request_serialization() {
        let req = Request::new(RequestId::Number(1), "Add", None);
        let json: Value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "Add"})
        );
    }
}
