// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC envelopes.
//!
//! Request:
//! `{"method": <string>, "params": {"vargs": [...], "kwargs": {...}}, "async": <bool>}`
//! with an optional `"resource"` profile when the call targets a resource
//! held by a session.
//!
//! Reply: `{"result": <any>}` or `{"exception": {"type", "message", "trace"}}`.

use crate::error::{RpcError, RpcResult};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

/// Positional and keyword arguments of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    pub vargs: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(vargs: Vec<Value>) -> Self {
        Self {
            vargs,
            kwargs: Map::new(),
        }
    }

    pub fn with_kwarg(mut self, name: &str, value: Value) -> Self {
        self.kwargs.insert(name.to_string(), value);
        self
    }

    /// The argument at `index`, or the keyword argument `name`.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.vargs.get(index).or_else(|| self.kwargs.get(name))
    }

    /// Decode a mandatory argument.
    #[track_caller]
    pub fn required<T: DeserializeOwned>(&self, index: usize, name: &str) -> RpcResult<T> {
        let value = self
            .get(index, name)
            .ok_or_else(|| RpcError::exception(format!("missing argument: {}", name)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| RpcError::exception(format!("bad argument \"{}\": {}", name, e)))
    }

    /// Decode an optional argument. `null` counts as absent.
    #[track_caller]
    pub fn optional<T: DeserializeOwned>(&self, index: usize, name: &str) -> RpcResult<Option<T>> {
        match self.get(index, name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| RpcError::exception(format!("bad argument \"{}\": {}", name, e))),
        }
    }

    /// Positional arguments from `from` onward.
    pub fn rest(&self, from: usize) -> &[Value] {
        self.vargs.get(from..).unwrap_or(&[])
    }

    pub fn to_value(&self) -> Value {
        json!({"vargs": self.vargs, "kwargs": self.kwargs})
    }
}

/// A decoded request envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub params: Params,
    pub is_async: bool,
    pub resource: Option<Value>,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Params) -> Self {
        Self {
            method: method.into(),
            params,
            is_async: false,
            resource: None,
        }
    }

    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn on_resource(mut self, resource: Value) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn to_value(&self) -> Value {
        let mut envelope = json!({
            "method": self.method,
            "params": self.params.to_value(),
            "async": self.is_async,
        });
        if let Some(resource) = &self.resource {
            envelope["resource"] = resource.clone();
        }
        envelope
    }

    /// Decode and check the envelope of an incoming frame.
    ///
    /// Checks run in a fixed order and the first failure is reported. The
    /// params are left raw: callers check access before decoding them.
    pub fn parse(frame: &[u8]) -> RpcResult<Envelope> {
        let malformed = || {
            RpcError::exception(format!(
                "malformed JSON: {}",
                String::from_utf8_lossy(frame)
            ))
        };
        let envelope: Value = serde_json::from_slice(frame).map_err(|_| malformed())?;
        let Value::Object(envelope) = envelope else {
            return Err(malformed());
        };
        let method = match envelope.get("method") {
            Some(Value::String(m)) => m.clone(),
            Some(other) => return Err(RpcError::exception(format!("no such RPC: {}", other))),
            None => return Err(RpcError::exception("the \"method\" attribute is missing")),
        };
        let Some(raw_params) = envelope.get("params") else {
            return Err(RpcError::exception("the \"params\" attribute is missing"));
        };
        let is_async = match envelope.get("async") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(RpcError::exception(format!(
                    "RPC async flag is not a boolean: {}",
                    Value::Object(envelope.clone())
                )))
            }
        };
        let resource = match envelope.get("resource") {
            None | Some(Value::Null) => None,
            Some(r) => Some(r.clone()),
        };
        Ok(Envelope {
            method,
            raw_params: raw_params.clone(),
            is_async,
            resource,
        })
    }
}

/// A request whose params have not been decoded yet.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub method: String,
    pub raw_params: Value,
    pub is_async: bool,
    pub resource: Option<Value>,
}

impl Envelope {
    /// Split the raw params into vargs and kwargs.
    pub fn into_request(self) -> RpcResult<Request> {
        let vargs = self.raw_params.get("vargs").and_then(Value::as_array).cloned();
        let kwargs = self.raw_params.get("kwargs").and_then(Value::as_object).cloned();
        match (vargs, kwargs) {
            (Some(vargs), Some(kwargs)) => Ok(Request {
                method: self.method,
                params: Params { vargs, kwargs },
                is_async: self.is_async,
                resource: self.resource,
            }),
            _ => Err(RpcError::exception(format!(
                "malformed arguments: {}",
                self.raw_params
            ))),
        }
    }
}

pub fn result_reply(value: Value) -> Value {
    json!({ "result": value })
}

pub fn exception_reply(error: &RpcError) -> Value {
    json!({ "exception": error.to_wire() })
}

/// Turn a reply envelope into the call's outcome.
pub fn parse_reply(reply: Value) -> RpcResult<Value> {
    match reply {
        Value::Object(mut map) => {
            if let Some(exception) = map.remove("exception") {
                return Err(RpcError::from_wire(&exception));
            }
            match map.remove("result") {
                Some(result) => Ok(result),
                None => Err(RpcError::exception(format!(
                    "malformed reply: {}",
                    Value::Object(map)
                ))),
            }
        }
        other => Err(RpcError::exception(format!("malformed reply: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn parse(value: Value) -> RpcResult<Envelope> {
        Request::parse(&serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn test_envelope_checks_in_order() {
        let err = Request::parse(b"{not json").unwrap_err();
        assert!(err.message().starts_with("malformed JSON"));

        let err = parse(json!({"params": {}})).unwrap_err();
        assert_eq!(err.message(), "the \"method\" attribute is missing");

        let err = parse(json!({"method": "get"})).unwrap_err();
        assert_eq!(err.message(), "the \"params\" attribute is missing");

        let err = parse(json!({"method": "get", "params": {}, "async": 1})).unwrap_err();
        assert!(err.message().starts_with("RPC async flag is not a boolean"));
    }

    #[test]
    fn test_params_decoded_late() {
        let envelope = parse(json!({"method": "get", "params": {"vargs": 1}})).unwrap();
        let err = envelope.into_request().unwrap_err();
        assert!(err.message().starts_with("malformed arguments"));

        let request = parse(json!({
            "method": "get",
            "params": {"vargs": [{"type": "handset"}], "kwargs": {"x": 1}},
            "async": true
        }))
        .unwrap()
        .into_request()
        .unwrap();
        assert!(request.is_async);
        assert_eq!(request.params.vargs.len(), 1);
        assert_eq!(request.params.get(5, "x"), Some(&json!(1)));
    }

    #[test]
    fn test_request_wire_form() {
        let request = Request::new("yield_resources", Params::positional(vec![json!(1)]))
            .asynchronous()
            .on_resource(json!({"type": "workspace", "uid": "w"}));
        let parsed = parse(request.to_value()).unwrap().into_request().unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_reply_parsing() {
        assert_eq!(parse_reply(result_reply(json!(5))).unwrap(), json!(5));
        let err = parse_reply(exception_reply(&RpcError::busy("busy"))).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Busy);
        assert!(parse_reply(json!({"foo": 1})).is_err());
    }

    #[test]
    fn test_params_helpers() {
        let params = Params::positional(vec![json!("a"), json!(null)]).with_kwarg("n", json!(3));
        assert_eq!(params.required::<String>(0, "name").unwrap(), "a");
        assert_eq!(params.optional::<String>(1, "other").unwrap(), None);
        assert_eq!(params.optional::<u32>(7, "n").unwrap(), Some(3));
        assert!(params.required::<u32>(4, "missing").is_err());
        assert_eq!(params.rest(1).len(), 1);
        assert!(params.rest(9).is_empty());
    }
}
