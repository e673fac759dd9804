// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client handles for brokers, sessions and held resources.
//!
//! Allocation takes two steps. The broker answers `get` with the address
//! and key of the caller's session; the session then hands out the
//! coordinates of every resource. Dropping a [`RemoteBroker`] closes the
//! broker connection, which is what releases the allocation.

use crate::config::HostPort;
use crate::control::{Params, RemoteControl, Request, DEFAULT_TIMEOUT};
use crate::error::{RpcError, RpcResult};
use crate::profile::Profile;
use serde_json::Value;
use std::time::Duration;

fn expect_list(value: Value, what: &str) -> RpcResult<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(RpcError::exception(format!(
            "{} is not a list: {}",
            what, other
        ))),
    }
}

/// Session coordinates from a `get` or `get_resources` reply.
fn coordinates(value: &Value) -> RpcResult<(HostPort, String)> {
    let address = value
        .get("address")
        .and_then(HostPort::from_value)
        .ok_or_else(|| RpcError::exception(format!("reply has no valid address: {}", value)))?;
    let authkey = value
        .get("authkey")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::exception(format!("reply has no authkey: {}", value)))?;
    Ok((address, authkey.to_string()))
}

/// Connection to a broker.
#[derive(Debug)]
pub struct RemoteBroker {
    control: RemoteControl,
    session: Option<RemoteSession>,
}

impl RemoteBroker {
    pub fn new(address: HostPort, authkey: Option<String>, timeout: Option<Duration>) -> Self {
        Self {
            control: RemoteControl::new(address, authkey, timeout),
            session: None,
        }
    }

    pub fn address(&self) -> &HostPort {
        self.control.address()
    }

    pub fn session(&self) -> Option<&RemoteSession> {
        self.session.as_ref()
    }

    pub async fn connect(&mut self, timeout: Duration, optimist: bool) -> RpcResult<()> {
        self.control.connect(timeout, optimist).await
    }

    /// Plain RPC against the broker (listing, admin calls).
    pub async fn call(&mut self, method: &str, vargs: Vec<Value>) -> RpcResult<Value> {
        self.control.call(method, vargs).await
    }

    /// Allocate, returning the raw `{address, authkey, profile}` records.
    pub async fn get_resources_raw(&mut self, profiles: &[Value]) -> RpcResult<Vec<Value>> {
        let response = self.control.call("get", profiles.to_vec()).await?;
        if self.session.is_none() {
            let (address, authkey) = coordinates(&response)?;
            self.session = Some(RemoteSession::new(address, authkey, None));
        }
        let resources = expect_list(
            response.get("resources").cloned().unwrap_or(Value::Null),
            "resources",
        )?;
        let Some(session) = self.session.as_mut() else {
            return Err(RpcError::exception("no session"));
        };
        expect_list(session.get_resources(resources).await?, "session reply")
    }

    /// Allocate and return one handle per requested profile.
    pub async fn get(&mut self, profiles: Vec<Value>) -> RpcResult<Vec<ResourceHandle>> {
        for profile in &profiles {
            if profile.get("type").is_none() {
                return Err(RpcError::exception(format!(
                    "profile \"type\" field is missing: {}",
                    profile
                )));
            }
        }
        self.get_resources_raw(&profiles)
            .await?
            .iter()
            .map(ResourceHandle::from_record)
            .collect()
    }

    /// Allocate several groups at once, each placed on its own. Returns the
    /// raw records of every group, flattened in order.
    pub async fn get_multi_resources_raw(
        &mut self,
        groups: &[Vec<Value>],
    ) -> RpcResult<Vec<Value>> {
        let vargs = groups.iter().cloned().map(Value::Array).collect();
        let responses = expect_list(
            self.control.call("get_multi_resources", vargs).await?,
            "multi reply",
        )?;
        if self.session.is_none() {
            let first = responses
                .first()
                .ok_or_else(|| RpcError::exception("no groups allocated"))?;
            let (address, authkey) = coordinates(first)?;
            self.session = Some(RemoteSession::new(address, authkey, None));
        }
        let mut resources = Vec::with_capacity(responses.len());
        for response in &responses {
            resources.push(Value::Array(expect_list(
                response.get("resources").cloned().unwrap_or(Value::Null),
                "resources",
            )?));
        }
        let Some(session) = self.session.as_mut() else {
            return Err(RpcError::exception("no session"));
        };
        expect_list(session.get_multi_resource(resources).await?, "session reply")
    }

    /// Allocate groups of profiles and return one handle per profile.
    pub async fn get_multi(&mut self, groups: Vec<Vec<Value>>) -> RpcResult<Vec<ResourceHandle>> {
        for profile in groups.iter().flatten() {
            if profile.get("type").is_none() {
                return Err(RpcError::exception(format!(
                    "profile \"type\" field is missing: {}",
                    profile
                )));
            }
        }
        self.get_multi_resources_raw(&groups)
            .await?
            .iter()
            .map(ResourceHandle::from_record)
            .collect()
    }

    /// Give resources back. Whatever the broker could not release itself is
    /// yielded through the session.
    pub async fn yield_resources(&mut self, resources: &[Profile]) -> RpcResult<()> {
        if self.session.is_none() {
            return Err(RpcError::exception("no resources to yield"));
        }
        let vargs = resources.iter().map(Profile::to_value).collect();
        let deferred = self.control.call("yield_resources", vargs).await?;
        let deferred = expect_list(deferred, "yield reply")?;
        if deferred.is_empty() {
            return Ok(());
        }
        if let Some(session) = self.session.as_mut() {
            session.yield_resources(deferred).await?;
        }
        Ok(())
    }

    /// Drop the broker connection and with it the session.
    pub fn close(self) {}
}

/// Connection to a session.
#[derive(Debug)]
pub struct RemoteSession {
    control: RemoteControl,
}

impl RemoteSession {
    /// `timeout = None` waits for replies indefinitely: a deferred
    /// allocation may take as long as the remote broker needs.
    pub fn new(address: HostPort, authkey: String, timeout: Option<Duration>) -> Self {
        Self {
            control: RemoteControl::new(address, Some(authkey), timeout),
        }
    }

    pub fn address(&self) -> &HostPort {
        self.control.address()
    }

    pub fn authkey(&self) -> Option<&str> {
        self.control.authkey()
    }

    pub async fn get_resources(&mut self, profiles: Vec<Value>) -> RpcResult<Value> {
        self.control.call("get_resources", profiles).await
    }

    /// `groups` holds one list of profiles per allocated group.
    pub async fn get_multi_resource(&mut self, groups: Vec<Value>) -> RpcResult<Value> {
        self.control.call("get_multi_resource", groups).await
    }

    pub async fn yield_resources(&mut self, profiles: Vec<Value>) -> RpcResult<()> {
        self.control
            .call("yield_resources", vec![Value::Array(profiles)])
            .await
            .map(|_| ())
    }

    pub async fn call(&mut self, method: &str, vargs: Vec<Value>) -> RpcResult<Value> {
        self.control.call(method, vargs).await
    }

    /// Ask the session to stop without waiting for it.
    pub async fn stop(&mut self) -> RpcResult<()> {
        self.control.call_async("stop", Vec::new()).await
    }
}

/// RPC access to one held resource.
#[derive(Debug)]
pub struct ResourceHandle {
    profile: Profile,
    control: RemoteControl,
}

impl ResourceHandle {
    pub fn new(address: HostPort, authkey: String, profile: Profile) -> Self {
        Self {
            profile,
            control: RemoteControl::new(address, Some(authkey), Some(DEFAULT_TIMEOUT)),
        }
    }

    fn from_record(record: &Value) -> RpcResult<Self> {
        let (address, authkey) = coordinates(record)?;
        let profile = record
            .get("profile")
            .cloned()
            .ok_or_else(|| RpcError::exception(format!("record has no profile: {}", record)))?;
        Ok(Self::new(address, authkey, Profile::from_value(profile)?))
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Address of the session that holds the resource.
    pub fn address(&self) -> &HostPort {
        self.control.address()
    }

    pub fn authkey(&self) -> Option<&str> {
        self.control.authkey()
    }

    pub async fn call(&mut self, method: &str, vargs: Vec<Value>) -> RpcResult<Value> {
        let request = Request::new(method, Params::positional(vargs))
            .on_resource(self.profile.to_value());
        self.control.call_request(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coordinates_are_checked() {
        let (address, key) = coordinates(&json!({"address": ["h", 1], "authkey": "k"})).unwrap();
        assert_eq!(address, HostPort::new("h", 1));
        assert_eq!(key, "k");
        assert!(coordinates(&json!({"address": "h:1", "authkey": "k"})).is_err());
        assert!(coordinates(&json!({"address": ["h", 1]})).is_err());
    }

    #[test]
    fn test_handle_from_record() {
        let handle = ResourceHandle::from_record(&json!({
            "address": ["127.0.0.1", 4001],
            "authkey": "secret",
            "profile": {"type": "handset", "serial": "h1"},
        }))
        .unwrap();
        assert_eq!(handle.profile().get_str("serial"), Some("h1"));
        assert_eq!(handle.authkey(), Some("secret"));
        assert!(ResourceHandle::from_record(&json!({
            "address": ["127.0.0.1", 4001],
            "authkey": "secret",
        }))
        .is_err());
    }

    #[tokio::test]
    async fn test_yield_without_session_fails() {
        let mut broker = RemoteBroker::new(HostPort::new("127.0.0.1", 1), None, None);
        let err = broker.yield_resources(&[]).await.unwrap_err();
        assert_eq!(err.message(), "no resources to yield");
    }
}
