// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-service method registration and access control.

use super::protocol::Params;
use super::{Context, Followup};
use crate::config::Authkeys;
use crate::error::{RpcError, RpcResult};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

/// Signature of an RPC handler.
pub type Handler<S> = fn(&mut S, &mut Context<S>, Params) -> RpcResult<Reply<S>>;

/// Who may call a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Any caller, authenticated or not.
    Open,
    /// Callers that authenticated with a non-null key.
    Auth,
    /// Callers whose key is the secret of one of these accounts. Open to
    /// everyone when none of the accounts has a secret.
    Preauth(&'static [&'static str]),
}

impl Access {
    pub fn permits(&self, authkey: Option<&str>, keys: &Authkeys) -> RpcResult<()> {
        match self {
            Self::Open => Ok(()),
            Self::Auth => {
                if authkey.is_some() {
                    Ok(())
                } else {
                    Err(RpcError::exception("not authenticated to make this call"))
                }
            }
            Self::Preauth(accounts) => {
                let mut anonymous = true;
                for account in accounts.iter() {
                    if let Some(secret) = keys.get(account) {
                        anonymous = false;
                        if authkey == Some(secret) {
                            return Ok(());
                        }
                    }
                }
                if anonymous {
                    Ok(())
                } else {
                    Err(RpcError::exception("not authorized to make this call"))
                }
            }
        }
    }
}

/// Outcome of a handler.
pub enum Reply<S> {
    /// Reply immediately.
    Value(Value),
    /// Reply when the future completes. Its followup then runs on the loop.
    Deferred(BoxFuture<'static, Deferred<S>>),
}

impl<S> Reply<S> {
    pub fn value<T: Serialize>(value: T) -> RpcResult<Self> {
        Ok(Self::Value(serde_json::to_value(value)?))
    }

    pub fn none() -> RpcResult<Self> {
        Ok(Self::Value(Value::Null))
    }

    pub fn deferred<F>(future: F) -> RpcResult<Self>
    where
        F: Future<Output = Deferred<S>> + Send + 'static,
    {
        Ok(Self::Deferred(Box::pin(future)))
    }
}

/// Result of deferred work.
pub struct Deferred<S> {
    pub result: RpcResult<Value>,
    pub then: Option<Followup<S>>,
}

impl<S> Deferred<S> {
    pub fn reply(result: RpcResult<Value>) -> Self {
        Self { result, then: None }
    }

    pub fn then(
        result: RpcResult<Value>,
        then: impl FnOnce(&mut S, &mut Context<S>) + Send + 'static,
    ) -> Self {
        Self {
            result,
            then: Some(Box::new(then)),
        }
    }
}

struct Method<S> {
    handler: Handler<S>,
    access: Access,
}

/// Method name to handler, consulted by the dispatcher.
pub struct MethodTable<S> {
    methods: BTreeMap<&'static str, Method<S>>,
    internal: BTreeSet<&'static str>,
}

impl<S> Default for MethodTable<S> {
    fn default() -> Self {
        Self {
            methods: BTreeMap::new(),
            internal: BTreeSet::new(),
        }
    }
}

impl<S> MethodTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `handler` as `name`.
    pub fn rpc(&mut self, name: &'static str, access: Access, handler: Handler<S>) -> &mut Self {
        self.methods.insert(name, Method { handler, access });
        self
    }

    /// Declare a method that exists on the service but is not callable.
    pub fn internal(&mut self, name: &'static str) -> &mut Self {
        self.internal.insert(name);
        self
    }

    /// Resolve a method for a caller.
    pub fn lookup(
        &self,
        name: &str,
        authkey: Option<&str>,
        keys: &Authkeys,
    ) -> RpcResult<Handler<S>> {
        match self.methods.get(name) {
            Some(method) => {
                method.access.permits(authkey, keys)?;
                Ok(method.handler)
            }
            None if self.internal.contains(name) => {
                Err(RpcError::exception(format!("not an RPC: {}", name)))
            }
            None => Err(RpcError::exception(format!("no such RPC: {}", name))),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.methods.keys().copied()
    }
}
