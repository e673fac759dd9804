// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire-visible error type shared by every Control process.
//!
//! Errors cross process boundaries as `{"exception": {type, message, trace}}`
//! objects. The `type` string selects an [`ErrorKind`] on the receiving side,
//! so clients can tell a retryable `Busy` from a final `NoSuch` without
//! parsing messages.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::panic::Location;
use thiserror::Error;

/// Result type for RPC handlers and client calls.
pub type RpcResult<T> = Result<T, RpcError>;

/// Error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Matching equipment exists but is allocated or blocked by collateral.
    Busy,
    /// Nothing matches the request.
    NoSuch,
    /// The broker is in the middle of a handover.
    Restarting,
    /// Internal signal: satisfy the request through a remote broker.
    Shared,
    Duplicate,
    NotOwner,
    NotAllocated,
    /// Graceful termination notice sent before a process exits.
    Exit,
    ConnectionClosed,
    ConnectionTimeout,
    AuthError,
    /// Anything without a more specific kind.
    Exception,
    /// A kind reported by a peer that this build does not know.
    Other(String),
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Busy => "Busy",
            Self::NoSuch => "NoSuch",
            Self::Restarting => "Restarting",
            Self::Shared => "Shared",
            Self::Duplicate => "Duplicate",
            Self::NotOwner => "NotOwner",
            Self::NotAllocated => "NotAllocated",
            Self::Exit => "Exit",
            Self::ConnectionClosed => "ConnectionClosed",
            Self::ConnectionTimeout => "ConnectionTimeout",
            Self::AuthError => "AuthError",
            Self::Exception => "Exception",
            Self::Other(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "Busy" => Self::Busy,
            "NoSuch" => Self::NoSuch,
            "Restarting" => Self::Restarting,
            "Shared" => Self::Shared,
            "Duplicate" => Self::Duplicate,
            "NotOwner" => Self::NotOwner,
            "NotAllocated" => Self::NotAllocated,
            "Exit" => Self::Exit,
            "ConnectionClosed" => Self::ConnectionClosed,
            "ConnectionTimeout" => Self::ConnectionTimeout,
            "AuthError" => Self::AuthError,
            "Exception" => Self::Exception,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a server-side trace: `[file, line, function, text]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry(pub String, pub u32, pub String, pub String);

/// Error raised by handlers or reported by a peer.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct RpcError {
    kind: ErrorKind,
    message: String,
    trace: Vec<TraceEntry>,
}

impl RpcError {
    #[track_caller]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let caller = Location::caller();
        Self {
            kind,
            message: message.into(),
            trace: vec![TraceEntry(
                caller.file().to_string(),
                caller.line(),
                String::new(),
                String::new(),
            )],
        }
    }

    #[track_caller]
    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    #[track_caller]
    pub fn no_such(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoSuch, message)
    }

    #[track_caller]
    pub fn restarting(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Restarting, message)
    }

    #[track_caller]
    pub fn shared() -> Self {
        Self::new(ErrorKind::Shared, "")
    }

    #[track_caller]
    pub fn not_owner(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotOwner, message)
    }

    #[track_caller]
    pub fn not_allocated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotAllocated, message)
    }

    #[track_caller]
    pub fn exit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exit, message)
    }

    #[track_caller]
    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionClosed, message)
    }

    #[track_caller]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionTimeout, message)
    }

    #[track_caller]
    pub fn exception(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exception, message)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    pub fn is(&self, kind: &ErrorKind) -> bool {
        &self.kind == kind
    }

    /// Tag the innermost trace row with the RPC method it surfaced through.
    pub fn in_method(mut self, method: &str) -> Self {
        if let Some(first) = self.trace.first_mut() {
            if first.2.is_empty() {
                first.2 = method.to_string();
                first.3 = self.message.clone();
            }
        }
        self
    }

    /// Body of the `exception` member of an error reply.
    pub fn to_wire(&self) -> Value {
        json!({
            "type": self.kind.as_str(),
            "message": self.message,
            "trace": self.trace,
        })
    }

    /// Decode the `exception` member of a reply. Accepts a bare string for
    /// peers that report validation failures that way.
    pub fn from_wire(body: &Value) -> Self {
        match body {
            Value::String(message) => Self {
                kind: ErrorKind::Exception,
                message: message.clone(),
                trace: Vec::new(),
            },
            Value::Object(map) => {
                let kind = map
                    .get("type")
                    .and_then(Value::as_str)
                    .map(ErrorKind::from_name)
                    .unwrap_or(ErrorKind::Exception);
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let trace = map
                    .get("trace")
                    .cloned()
                    .and_then(|t| serde_json::from_value(t).ok())
                    .unwrap_or_default();
                Self {
                    kind,
                    message,
                    trace,
                }
            }
            other => Self {
                kind: ErrorKind::Exception,
                message: other.to_string(),
                trace: Vec::new(),
            },
        }
    }
}

impl From<serde_json::Error> for RpcError {
    #[track_caller]
    fn from(e: serde_json::Error) -> Self {
        Self::exception(e.to_string())
    }
}

impl From<std::io::Error> for RpcError {
    #[track_caller]
    fn from(e: std::io::Error) -> Self {
        Self::exception(format!("I/O error: {}", e))
    }
}
