// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-client session process.
//!
//! A session fronts RPC access to the resources its client was allocated.
//! Resources from this broker are handed over by the broker itself with
//! `add_resource`. Resources found on another broker are fetched by the
//! session when the client asks for them, so that the broker never waits
//! on a peer. A multi allocation may defer several groups, each to its own
//! broker.
//!
//! The broker authenticates with the `broker` account, the client with the
//! `client` account. Losing the broker link, a remote broker or a remote
//! session ends the process.

use crate::config::{HostPort, WorkspaceConfig};
use crate::control::process;
use crate::control::{
    Access, ConnId, Connection, Context, Deferred, LinkHandle, MethodTable, Params, RemoteControl,
    Reply, Request, Service, DEFAULT_TIMEOUT,
};
use crate::error::{ErrorKind, RpcError, RpcResult};
use crate::profile::{Profile, ResourceId};
use crate::workspace::Workspace;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Protocol version reported by `get_version`.
pub const SESSION_VERSION: u32 = 1;

const BROKER_ACCOUNT: &[&str] = &["broker"];

/// A resource held by the session.
enum Held {
    Workspace { profile: Profile, workspace: Workspace },
    Equipment(Profile),
}

impl Held {
    fn profile(&self) -> &Profile {
        match self {
            Self::Workspace { profile, .. } | Self::Equipment(profile) => profile,
        }
    }
}

/// Links to a broker that allocated on our behalf.
struct RemoteBrokerLinks {
    broker: LinkHandle,
    session: Option<LinkHandle>,
}

pub struct Session {
    address: HostPort,
    ws_config: WorkspaceConfig,
    resources: BTreeMap<ResourceId, Held>,
    /// Remote resource to the broker it came from.
    remote_resources: BTreeMap<ResourceId, HostPort>,
    brokers: BTreeMap<HostPort, RemoteBrokerLinks>,
    watched: BTreeSet<ConnId>,
    deferred: Option<(HostPort, Vec<Value>)>,
    /// Deferred groups of a multi allocation, in the order they were added.
    mdeferred: Vec<(HostPort, Vec<Value>)>,
}

/// One group of a multi allocation as the session resolves it.
enum Group {
    Local(Vec<Value>),
    Remote(HostPort),
}

/// Profiles to allocate against a remote broker.
struct RemoteFetch {
    address: HostPort,
    broker: LinkHandle,
    session: Option<LinkHandle>,
    profiles: Vec<Value>,
}

/// Remote sessions opened while fetching, by remote broker address.
type Opened = BTreeMap<HostPort, (Connection, String)>;

impl Session {
    /// `address` is what clients are told to connect to.
    pub fn new(address: HostPort, ws_config: WorkspaceConfig) -> Self {
        Self {
            address,
            ws_config,
            resources: BTreeMap::new(),
            remote_resources: BTreeMap::new(),
            brokers: BTreeMap::new(),
            watched: BTreeSet::new(),
            deferred: None,
            mdeferred: Vec::new(),
        }
    }

    pub fn address(&self) -> &HostPort {
        &self.address
    }

    fn add_resource(&mut self, profile: Profile) -> RpcResult<()> {
        let id = profile.require_identity()?;
        let held = if profile.is_workspace() {
            let uid = profile
                .get_str("uid")
                .ok_or_else(|| RpcError::exception("workspace profile has no uid"))?;
            let workspace = Workspace::open(&self.ws_config, uid)?;
            Held::Workspace { profile, workspace }
        } else {
            Held::Equipment(profile)
        };
        debug!("holding {}", held.profile());
        self.resources.insert(id, held);
        Ok(())
    }

    /// Client records for resources held here.
    fn local_records(&self, profiles: &[Value], authkey: Option<&str>) -> RpcResult<Vec<Value>> {
        let mut result = Vec::with_capacity(profiles.len());
        for p in profiles {
            let held = Profile::from_value(p.clone())?
                .identity()
                .map_or(false, |id| self.resources.contains_key(&id));
            if !held {
                return Err(RpcError::exception(format!(
                    "INTERNAL ERROR: no local resource {}",
                    p
                )));
            }
            result.push(json!({
                "address": self.address.to_value(),
                "authkey": authkey,
                "profile": p,
            }));
        }
        Ok(result)
    }

    /// Links to the broker at `address`, connecting on first use.
    fn broker_links(
        &mut self,
        ctx: &mut Context<Self>,
        address: &HostPort,
    ) -> (LinkHandle, Option<LinkHandle>) {
        let entry = self.brokers.entry(address.clone()).or_insert_with(|| {
            let link = ctx.connect_link(address.clone(), None, DEFAULT_TIMEOUT);
            ctx.keep_watching(link.id());
            self.watched.insert(link.id());
            RemoteBrokerLinks {
                broker: link,
                session: None,
            }
        });
        (entry.broker.clone(), entry.session.clone())
    }

    fn remote_granted(
        &mut self,
        ctx: &mut Context<Self>,
        address: HostPort,
        resources: &[Value],
        session: Option<(Connection, String)>,
    ) {
        if let Some((conn, authkey)) = session {
            let link = ctx.adopt_link(conn, Some(authkey));
            ctx.keep_watching(link.id());
            self.watched.insert(link.id());
            if let Some(entry) = self.brokers.get_mut(&address) {
                entry.session = Some(link);
            }
        }
        for record in resources {
            let id = record
                .get("profile")
                .cloned()
                .and_then(|p| Profile::from_value(p).ok())
                .and_then(|p| p.identity());
            if let Some(id) = id {
                self.remote_resources.insert(id, address.clone());
            }
        }
        info!("got {} resources from {}", resources.len(), address);
    }
}

/// Ask each remote broker, then its session, for the resource records.
/// Groups for the same broker share one remote session.
async fn fetch_remote_groups(fetches: Vec<RemoteFetch>) -> RpcResult<(Vec<Vec<Value>>, Opened)> {
    let mut fetched = Vec::with_capacity(fetches.len());
    let mut opened: BTreeMap<HostPort, RemoteControl> = BTreeMap::new();
    for fetch in fetches {
        let response = fetch
            .broker
            .call(
                Request::new("get", Params::positional(fetch.profiles)),
                Some(DEFAULT_TIMEOUT),
            )
            .await?;
        let resources = match response.get("resources") {
            Some(Value::Array(resources)) => resources.clone(),
            _ => return Err(RpcError::exception(format!("malformed reply: {}", response))),
        };
        let request = Request::new("get_resources", Params::positional(resources));
        let reply = match fetch.session {
            Some(link) => link.call(request, None).await?,
            None => {
                if !opened.contains_key(&fetch.address) {
                    let address = response.get("address").and_then(HostPort::from_value);
                    let authkey = response.get("authkey").and_then(Value::as_str);
                    let (Some(address), Some(authkey)) = (address, authkey) else {
                        return Err(RpcError::exception(format!(
                            "malformed reply: {}",
                            response
                        )));
                    };
                    let remote = RemoteControl::new(address, Some(authkey.to_string()), None);
                    opened.insert(fetch.address.clone(), remote);
                }
                match opened.get_mut(&fetch.address) {
                    Some(remote) => remote.call_request(request).await?,
                    None => return Err(RpcError::exception("INTERNAL ERROR: lost remote session")),
                }
            }
        };
        fetched.push(as_list(reply)?);
    }
    let mut connections = Opened::new();
    for (address, remote) in opened {
        let authkey = remote.authkey().map(String::from).unwrap_or_default();
        let conn = remote
            .into_connection()
            .ok_or_else(|| RpcError::closed("remote session went away"))?;
        connections.insert(address, (conn, authkey));
    }
    Ok((fetched, connections))
}

/// Any failure to fetch remote resources ends the session.
fn fetch_failed(e: RpcError) -> RpcError {
    if e.is(&ErrorKind::ConnectionClosed) || e.is(&ErrorKind::ConnectionTimeout) {
        RpcError::exit("Broker connection failed")
    } else {
        RpcError::exit(e.message().to_string())
    }
}

fn remote_address(params: &Params) -> RpcResult<HostPort> {
    let raw = params
        .get(0, "remote_address")
        .cloned()
        .unwrap_or(Value::Null);
    match &raw {
        Value::Array(_) => HostPort::from_value(&raw),
        _ => None,
    }
    .ok_or_else(|| RpcError::exception("remote_address must be a [host,port] list"))
}

fn as_list(value: Value) -> RpcResult<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(RpcError::exception(format!("not a list: {}", other))),
    }
}

// handlers

fn add_resource(s: &mut Session, _: &mut Context<Session>, params: Params) -> RpcResult<Reply<Session>> {
    let profile: Value = params.required(0, "profile")?;
    s.add_resource(Profile::from_value(profile)?)?;
    Reply::none()
}

fn async_add_resources(
    s: &mut Session,
    _: &mut Context<Session>,
    params: Params,
) -> RpcResult<Reply<Session>> {
    let address = remote_address(&params)?;
    if let Some((pending, _)) = &s.deferred {
        return Err(RpcError::exception(format!(
            "INTERNAL ERROR: self.deferred = {}",
            pending
        )));
    }
    s.deferred = Some((address, params.rest(1).to_vec()));
    Reply::none()
}

fn multi_async_add_resources(
    s: &mut Session,
    _: &mut Context<Session>,
    params: Params,
) -> RpcResult<Reply<Session>> {
    let address = remote_address(&params)?;
    s.mdeferred.push((address, params.rest(1).to_vec()));
    Reply::none()
}

fn get_resources(
    s: &mut Session,
    ctx: &mut Context<Session>,
    params: Params,
) -> RpcResult<Reply<Session>> {
    let profiles = params.rest(0).to_vec();
    let Some((address, _)) = s.deferred.take() else {
        let authkey = ctx.authkeys().get("client").map(String::from);
        return Reply::value(s.local_records(&profiles, authkey.as_deref())?);
    };

    let (broker, session) = s.broker_links(ctx, &address);
    let fetch = RemoteFetch {
        address: address.clone(),
        broker,
        session,
        profiles,
    };
    Reply::deferred(async move {
        match fetch_remote_groups(vec![fetch]).await {
            Ok((fetched, mut opened)) => {
                let resources = fetched.into_iter().flatten().collect::<Vec<_>>();
                Deferred::then(
                    Ok(Value::Array(resources.clone())),
                    move |s: &mut Session, ctx| {
                        let session = opened.remove(&address);
                        s.remote_granted(ctx, address, &resources, session)
                    },
                )
            }
            Err(e) => Deferred::reply(Err(fetch_failed(e))),
        }
    })
}

/// Resolve the groups of a multi allocation: deferred groups are fetched
/// from their brokers, the rest must be held here. The records come back
/// flat, in group order.
fn get_multi_resource(
    s: &mut Session,
    ctx: &mut Context<Session>,
    params: Params,
) -> RpcResult<Reply<Session>> {
    let authkey = ctx.authkeys().get("client").map(String::from);
    let mut groups = Vec::new();
    let mut fetches = Vec::new();
    for raw in params.rest(0) {
        let profiles = as_list(raw.clone())?;
        match s.mdeferred.iter().position(|(_, p)| *p == profiles) {
            Some(i) => {
                let (address, profiles) = s.mdeferred.remove(i);
                let (broker, session) = s.broker_links(ctx, &address);
                groups.push(Group::Remote(address.clone()));
                fetches.push(RemoteFetch {
                    address,
                    broker,
                    session,
                    profiles,
                });
            }
            None => groups.push(Group::Local(s.local_records(&profiles, authkey.as_deref())?)),
        }
    }
    if fetches.is_empty() {
        let records: Vec<Value> = groups
            .into_iter()
            .flat_map(|g| match g {
                Group::Local(records) => records,
                Group::Remote(_) => Vec::new(),
            })
            .collect();
        return Reply::value(records);
    }

    Reply::deferred(async move {
        let (fetched, mut opened) = match fetch_remote_groups(fetches).await {
            Ok(fetched) => fetched,
            Err(e) => return Deferred::reply(Err(fetch_failed(e))),
        };
        let mut fetched = fetched.into_iter();
        let mut records = Vec::new();
        let mut granted = Vec::new();
        for group in groups {
            match group {
                Group::Local(local) => records.extend(local),
                Group::Remote(address) => {
                    let remote = fetched.next().unwrap_or_default();
                    records.extend(remote.iter().cloned());
                    granted.push((address, remote));
                }
            }
        }
        Deferred::then(Ok(Value::Array(records)), move |s: &mut Session, ctx| {
            for (address, resources) in granted {
                let session = opened.remove(&address);
                s.remote_granted(ctx, address, &resources, session);
            }
        })
    })
}

fn yield_resources(
    s: &mut Session,
    _: &mut Context<Session>,
    params: Params,
) -> RpcResult<Reply<Session>> {
    let resources: Vec<Value> = params.required(0, "resources")?;
    let mut remote: BTreeMap<HostPort, Vec<Value>> = BTreeMap::new();
    for raw in resources {
        let profile = Profile::from_value(raw.clone())?;
        let Some(id) = profile.identity() else {
            return Err(RpcError::no_such(format!("no such resource: {}", raw)));
        };
        if s.resources.remove(&id).is_some() {
            continue;
        }
        if let Some(address) = s.remote_resources.remove(&id) {
            remote.entry(address).or_default().push(raw);
            continue;
        }
        return Err(RpcError::no_such(format!("no such resource: {}", raw)));
    }
    let mut yields = Vec::new();
    for (address, profiles) in remote {
        let Some(entry) = s.brokers.get(&address) else {
            continue;
        };
        yields.push(remote_yield(
            entry.broker.clone(),
            entry.session.clone(),
            profiles,
        ));
    }
    if yields.is_empty() {
        return Reply::none();
    }
    Reply::deferred(async move {
        for outcome in futures::future::join_all(yields).await {
            // a remote broker that went away has released the resource anyway
            if let Err(e) = outcome {
                debug!("remote yield failed: {}", e);
            }
        }
        Deferred::reply(Ok(Value::Null))
    })
}

/// Yield through a remote broker, then let its session drop the handles.
async fn remote_yield(
    broker: LinkHandle,
    session: Option<LinkHandle>,
    profiles: Vec<Value>,
) -> RpcResult<()> {
    let request = Request::new("yield_resources", Params::positional(profiles));
    let deferred = as_list(broker.call(request, Some(DEFAULT_TIMEOUT)).await?)?;
    if let (Some(session), false) = (session, deferred.is_empty()) {
        let request = Request::new(
            "yield_resources",
            Params::positional(vec![Value::Array(deferred)]),
        );
        session.call(request, Some(DEFAULT_TIMEOUT)).await?;
    }
    Ok(())
}

fn stop(_: &mut Session, ctx: &mut Context<Session>, _: Params) -> RpcResult<Reply<Session>> {
    ctx.shutdown(None);
    Reply::none()
}

fn crash(_: &mut Session, _: &mut Context<Session>, _: Params) -> RpcResult<Reply<Session>> {
    warn!("crashing on request");
    process::kill(std::process::id())?;
    Reply::none()
}

fn get_version(_: &mut Session, _: &mut Context<Session>, _: Params) -> RpcResult<Reply<Session>> {
    Reply::value(SESSION_VERSION)
}

impl Service for Session {
    fn register(methods: &mut MethodTable<Self>) {
        methods
            .rpc("add_resource", Access::Preauth(BROKER_ACCOUNT), add_resource)
            .rpc(
                "async_add_resources",
                Access::Preauth(BROKER_ACCOUNT),
                async_add_resources,
            )
            .rpc(
                "multi_async_add_resources",
                Access::Preauth(BROKER_ACCOUNT),
                multi_async_add_resources,
            )
            .rpc("get_resources", Access::Auth, get_resources)
            .rpc("get_multi_resource", Access::Auth, get_multi_resource)
            .rpc("yield_resources", Access::Auth, yield_resources)
            .rpc("stop", Access::Auth, stop)
            .rpc("crash", Access::Auth, crash)
            .rpc("get_version", Access::Open, get_version)
            .internal("remote_granted");
    }

    fn lost_connection(&mut self, ctx: &mut Context<Self>, id: ConnId, authkey: Option<&str>) {
        if self.watched.remove(&id) {
            info!("lost remote connection {}, stopping", id);
            ctx.shutdown(Some(RpcError::exit("lost connection to remote broker")));
            return;
        }
        let broker_key = ctx.authkeys().get("broker");
        if authkey.is_some() && authkey == broker_key {
            info!("lost broker connection, stopping");
            ctx.shutdown(None);
        }
    }

    fn shutdown(&mut self, _: &mut Context<Self>, _: Option<&RpcError>) {
        self.resources.clear();
    }

    fn call_resource(
        &mut self,
        _: &mut Context<Self>,
        resource: &Value,
        request: Request,
    ) -> RpcResult<Reply<Self>> {
        let held = Profile::from_value(resource.clone())
            .ok()
            .and_then(|p| p.identity())
            .and_then(|id| self.resources.get(&id))
            .ok_or_else(|| RpcError::exception(format!("no such resource: {}", resource)))?;
        match (held, request.method.as_str()) {
            (held, "get_profile") => Reply::value(held.profile()),
            (Held::Workspace { workspace, .. }, "get_path") => {
                Reply::value(workspace.path().display().to_string())
            }
            (Held::Workspace { workspace, .. }, "make_tempdir") => {
                let rng = ring::rand::SystemRandom::new();
                Reply::value(workspace.make_tempdir(&rng)?.display().to_string())
            }
            (_, method) => Err(RpcError::exception(format!("no such RPC: {}", method))),
        }
    }

    fn dump(&self) -> Value {
        json!({
            "address": self.address.to_value(),
            "resources": self.resources.values().map(Held::profile).collect::<Vec<_>>(),
            "remote_resources": self.remote_resources.keys().map(ToString::to_string).collect::<Vec<_>>(),
            "brokers": self.brokers.keys().map(HostPort::to_value).collect::<Vec<_>>(),
            "deferred": self.deferred.as_ref().map(|(a, _)| a.to_value()),
            "mdeferred": self.mdeferred.iter().map(|(a, _)| a.to_value()).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Authkeys, Home};
    use crate::control::{Control, ControlOptions};
    use std::time::Duration;

    struct Running {
        address: HostPort,
        dir: tempfile::TempDir,
        handle: tokio::task::JoinHandle<Result<Session, crate::control::ControlError>>,
    }

    fn start() -> Running {
        let dir = tempfile::tempdir().unwrap();
        let home = Home::new(dir.path());
        let ws_config = WorkspaceConfig::from_value(
            json!({"root": dir.path().join("ws").display().to_string()}),
            &home,
        )
        .unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = HostPort::new("127.0.0.1", port);
        let keys: Authkeys = [
            ("broker".to_string(), Some("broker-key".to_string())),
            ("client".to_string(), Some("client-key".to_string())),
        ]
        .into_iter()
        .collect();
        let options = ControlOptions::new("lab-session-test", home)
            .with_authkeys(keys)
            .with_listener(listener)
            .with_interval(Duration::from_millis(100));
        let control = Control::new(Session::new(address.clone(), ws_config), options);
        let handle = tokio::spawn(control.run());
        Running {
            address,
            dir,
            handle,
        }
    }

    fn client(address: &HostPort, key: &str) -> RemoteControl {
        RemoteControl::new(address.clone(), Some(key.to_string()), Some(DEFAULT_TIMEOUT))
    }

    #[tokio::test]
    async fn test_add_resource_needs_broker_key() {
        let running = start();
        let profile = json!({"type": "handset", "serial": "h1"});
        let mut as_client = client(&running.address, "client-key");
        as_client.connect(DEFAULT_TIMEOUT, true).await.unwrap();
        let err = as_client
            .call("add_resource", vec![profile.clone()])
            .await
            .unwrap_err();
        assert_eq!(err.message(), "not authorized to make this call");

        let mut broker = client(&running.address, "broker-key");
        broker.call("add_resource", vec![profile.clone()]).await.unwrap();

        let records = as_client
            .call("get_resources", vec![profile.clone()])
            .await
            .unwrap();
        assert_eq!(records[0]["authkey"], json!("client-key"));
        assert_eq!(records[0]["address"], running.address.to_value());

        let request = Request::new("get_profile", Params::new()).on_resource(profile.clone());
        let held = as_client.call_request(request).await.unwrap();
        assert_eq!(held["serial"], json!("h1"));

        as_client
            .call("yield_resources", vec![json!([profile.clone()])])
            .await
            .unwrap();
        let err = as_client
            .call("get_resources", vec![profile])
            .await
            .unwrap_err();
        assert!(err.message().starts_with("INTERNAL ERROR: no local resource"));
        drop(broker);
        let _ = running.handle.await;
    }

    #[tokio::test]
    async fn test_workspace_resource_calls() {
        let running = start();
        let ws_root = running.dir.path().join("ws").display().to_string();
        let profile = json!({"type": "workspace", "uid": "w1", "root": ws_root});
        let mut broker = client(&running.address, "broker-key");
        broker.call("add_resource", vec![profile.clone()]).await.unwrap();

        let mut as_client = client(&running.address, "client-key");
        let request = Request::new("get_path", Params::new()).on_resource(profile.clone());
        let path = as_client.call_request(request).await.unwrap();
        assert!(path.as_str().unwrap().ends_with("/w1"));
        let request = Request::new("make_tempdir", Params::new()).on_resource(profile.clone());
        let tmp = as_client.call_request(request).await.unwrap();
        assert!(std::path::Path::new(tmp.as_str().unwrap()).is_dir());

        let request = Request::new("reboot", Params::new()).on_resource(profile);
        let err = as_client.call_request(request).await.unwrap_err();
        assert_eq!(err.message(), "no such RPC: reboot");
        drop(broker);
        let _ = running.handle.await;
    }

    #[tokio::test]
    async fn test_deferral_is_single_and_checked() {
        let running = start();
        let mut broker = client(&running.address, "broker-key");
        let err = broker
            .call("async_add_resources", vec![json!("h:1"), json!({"type": "handset"})])
            .await
            .unwrap_err();
        assert_eq!(err.message(), "remote_address must be a [host,port] list");
        broker
            .call("async_add_resources", vec![json!(["127.0.0.1", 1]), json!({"type": "handset"})])
            .await
            .unwrap();
        let err = broker
            .call("async_add_resources", vec![json!(["127.0.0.1", 1]), json!({"type": "handset"})])
            .await
            .unwrap_err();
        assert!(err.message().starts_with("INTERNAL ERROR: self.deferred"));
        assert_eq!(broker.call("get_version", vec![]).await.unwrap(), json!(1));
        drop(broker);
        let _ = running.handle.await;
    }

    #[tokio::test]
    async fn test_multi_resource_returns_groups_in_order() {
        let running = start();
        let h1 = json!({"type": "handset", "serial": "h1"});
        let r1 = json!({"type": "relay", "uid": "r1"});
        let mut broker = client(&running.address, "broker-key");
        broker.call("add_resource", vec![h1.clone()]).await.unwrap();
        broker.call("add_resource", vec![r1.clone()]).await.unwrap();
        let err = broker
            .call("multi_async_add_resources", vec![json!("h:1"), h1.clone()])
            .await
            .unwrap_err();
        assert_eq!(err.message(), "remote_address must be a [host,port] list");

        let mut as_client = client(&running.address, "client-key");
        let records = as_client
            .call("get_multi_resource", vec![json!([r1.clone()]), json!([h1.clone()])])
            .await
            .unwrap();
        let records = records.as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["profile"], r1);
        assert_eq!(records[1]["profile"], h1);
        assert_eq!(records[1]["authkey"], json!("client-key"));

        let h2 = json!({"type": "handset", "serial": "h2"});
        let err = as_client
            .call("get_multi_resource", vec![json!([h1]), json!([h2])])
            .await
            .unwrap_err();
        assert!(err.message().starts_with("INTERNAL ERROR: no local resource"));
        drop(broker);
        let _ = running.handle.await;
    }

    #[tokio::test]
    async fn test_losing_broker_link_stops_session() {
        let running = start();
        let mut broker = client(&running.address, "broker-key");
        broker.call("get_version", vec![]).await.unwrap();
        broker.disconnect();
        let stopped = tokio::time::timeout(Duration::from_secs(5), running.handle).await;
        assert!(stopped.is_ok());
    }
}
