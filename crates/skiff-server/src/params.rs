//! Helpers for handlers that work with the raw request parameters.
//!
//! [`positional`] decodes a fixed-arity JSON array into a tuple of typed
//! destinations; [`Fields`] maps object keys onto typed destinations while
//! silently ignoring keys it was never asked about, matching JSON-RPC's
//! additional-fields-permitted disposition.

use serde::de::DeserializeOwned;
use serde_json::map::Map;
use serde_json::Value;

use skiff_jsonrpc::error::ErrorObject;
use skiff_jsonrpc::request::Request;

/// Decode the request parameters as a JSON array of exactly the arity of the
/// tuple `T`, element by element.
///
/// A missing element, an extra element, or a non-array value fails with an
/// invalid-params error whose message names the expected arity. Use
/// [`serde::de::IgnoredAny`] as a destination to discard an element.
///
/// ```rust,ignore
/// let (x, y, label): (i64, i64, String) = params::positional(&req)?;
/// ```
pub fn positional<T: DeserializeOwned>(req: &Request) -> Result<T, ErrorObject> {
    let raw = req.params_raw().map(|r| r.get()).unwrap_or("null");
    serde_json::from_str(raw)
        .map_err(|err| ErrorObject::invalid_params(format!("invalid parameters: {}", err)))
}

/// Build a positional parameter array for the encoding side. An empty slice
/// yields `[]`.
pub fn array(values: Vec<Value>) -> Value {
    Value::Array(values)
}

/// Keyed parameters: a JSON object whose fields decode on demand into typed
/// destinations.
#[derive(Debug, Clone)]
pub struct Fields {
    fields: Map<String, Value>,
}

impl Fields {
    /// Decode the request parameters as a JSON object. Anything else,
    /// including absent parameters, fails with an invalid-params error.
    pub fn decode(req: &Request) -> Result<Fields, ErrorObject> {
        let params: Value = req.params()?;
        match params {
            Value::Object(fields) => Ok(Fields { fields }),
            _ => Err(ErrorObject::invalid_params(
                "invalid parameters: object required",
            )),
        }
    }

    /// Reports whether the named field is present.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Decode the named field into `T`, or `None` if it is absent.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ErrorObject> {
        match self.fields.get(name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|err| {
                ErrorObject::invalid_params(format!("decoding {:?}: {}", name, err))
            }),
        }
    }

    /// Decode the named field into `T`, failing if it is absent.
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> Result<T, ErrorObject> {
        self.get(name)?.ok_or_else(|| {
            ErrorObject::invalid_params(format!("missing required parameter {:?}", name))
        })
    }
}
