// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The broker service.
//!
//! Every client that connects without a known key gets a generated key and
//! its own session process. `get` picks equipment from the allocators in key
//! order (local first), hands it to the session and answers with the
//! session's coordinates; the client then asks the session for the resources.
//! When a share peer holds the equipment, or the broker forwards everything,
//! the session is told to fetch the resources from the remote broker itself.
//!
//! Resources are reclaimed when the client connection, the session link or
//! the session process goes away.

mod handover;
mod sharing;

use crate::allocator::{Allocator, AllocatorKey, Allocators, Grant, LocalAllocator};
use crate::config::{Authkeys, BrokerConfig, HostPort, Policy, WorkspaceConfig};
use crate::control::process;
use crate::control::{
    Access, ConnId, Context, Deferred, LinkHandle, MethodTable, Params, Reply, Request, Service,
    DEFAULT_TIMEOUT,
};
use crate::error::{ErrorKind, RpcError, RpcResult};
use crate::handover::{FdSender, Serialized};
use crate::launcher::{child_listener, reachable, Launcher, SESSION_KEYS_ENV};
use crate::profile::{broker_profile, Profile, ProfileKind};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::OwnedFd;
use std::process::ExitStatus;
use tracing::{debug, error, info, warn};

pub use handover::DEFAULT_FDTX_DIR;

const ADMIN: &[&str] = &["admin"];
const SHARE: &[&str] = &["share"];

/// Sessions handed over by a previous broker, with their sockets.
pub struct Adopted {
    pub serialized: Serialized,
    pub sockets: BTreeMap<String, OwnedFd>,
}

/// A live session as the broker tracks it.
#[derive(Debug)]
struct SessionEntry {
    pid: u32,
    /// Address clients use to reach the session.
    address: HostPort,
    link: LinkHandle,
    /// Taken over from a previous broker: not our child.
    adopted: bool,
}

#[derive(Debug)]
struct NotifierEntry {
    pid: u32,
    link: LinkHandle,
}

pub struct Broker {
    config: BrokerConfig,
    launcher: Launcher,
    allocators: Allocators,
    /// Client authkey to session.
    sessions: BTreeMap<String, SessionEntry>,
    /// Session link to client authkey.
    links: BTreeMap<ConnId, String>,
    /// Share peer connection to the peer's address.
    shares: BTreeMap<ConnId, HostPort>,
    notifier: Option<NotifierEntry>,
    allocating: bool,
    fdtx: Option<FdSender>,
    handed_over: bool,
    adopted: Option<Adopted>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        ws_config: WorkspaceConfig,
        launcher: Launcher,
        adopted: Option<Adopted>,
    ) -> RpcResult<Self> {
        let mut local = LocalAllocator::new(ws_config);
        local.inventory_mut().set_stacks(config.stacks.clone())?;
        local.add_equipment(config.equipment.clone())?;
        Ok(Self {
            config,
            launcher,
            allocators: Allocators::new(local),
            sessions: BTreeMap::new(),
            links: BTreeMap::new(),
            shares: BTreeMap::new(),
            notifier: None,
            allocating: true,
            fdtx: None,
            handed_over: false,
            adopted,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn is_sharing(&self) -> bool {
        self.config.policy() == Some(Policy::Share)
    }

    fn is_forwarding(&self) -> bool {
        self.config.policy() == Some(Policy::Forward)
    }

    fn banner(&self, ctx: &Context<Self>) {
        let bind = ctx
            .local_addr()
            .map_or_else(|| "-".to_string(), |a| a.to_string());
        let policy = match &self.config.remote {
            Some(remote) => format!("{} {}", remote.policy, remote.address()),
            None => "none".to_string(),
        };
        let allocators: Vec<String> = self.allocators.keys().iter().map(ToString::to_string).collect();
        info!("+----------------------------------------------------+");
        info!("|       Lab Broker v{:32} |", env!("CARGO_PKG_VERSION"));
        info!("+----------------------------------------------------+");
        info!("|  Bind:       {:37} |", bind);
        info!("|  Advertise:  {:37} |", self.config.address().to_string());
        info!("|  Remote:     {:37} |", policy);
        info!("|  Stacks:     {:37} |", self.config.stacks.len());
        info!("|  Equipment:  {:37} |", self.allocators.local().inventory().list_equipment(None).len());
        info!("|  Allocators: {:37} |", allocators.join(", "));
        info!("|  Sessions:   {:37} |", self.sessions.len());
        info!("+----------------------------------------------------+");
    }

    fn listen_ip(ctx: &Context<Self>) -> IpAddr {
        ctx.local_addr()
            .map_or(IpAddr::V4(Ipv4Addr::LOCALHOST), |a| a.ip())
    }

    /// Start a session process for the client with `authkey`.
    fn new_session(&mut self, ctx: &mut Context<Self>, authkey: &str) -> RpcResult<()> {
        if self.sessions.contains_key(authkey) {
            return Err(RpcError::exception(
                "INTERNAL ERROR: session already added for authkey",
            ));
        }
        let ip = Self::listen_ip(ctx);
        let (listener, port) = child_listener(ip)?;
        let broker_key = ctx.rand_authkey()?;
        let keys: Authkeys = [
            ("broker".to_string(), Some(broker_key.clone())),
            ("client".to_string(), Some(authkey.to_string())),
        ]
        .into_iter()
        .collect();
        let args: Vec<OsString> = vec!["--host".into(), self.config.host.clone().into()];
        let child = self.launcher.spawn(
            "session",
            &listener,
            &args,
            &[(SESSION_KEYS_ENV, serde_json::to_string(&keys)?)],
        )?;
        drop(listener);
        let pid = child.id().unwrap_or_default();
        ctx.join_later(child);

        let target = HostPort::new(reachable(ip).to_string(), port);
        let link = ctx.connect_link(target, Some(broker_key), DEFAULT_TIMEOUT);
        self.links.insert(link.id(), authkey.to_string());
        self.sessions.insert(
            authkey.to_string(),
            SessionEntry {
                pid,
                address: HostPort::new(self.config.host.clone(), port),
                link,
                adopted: false,
            },
        );
        debug!("started session {} on port {}", pid, port);
        Ok(())
    }

    /// Release everything the session holds and stop its process.
    fn close_session(&mut self, ctx: &mut Context<Self>, authkey: &str) -> RpcResult<()> {
        let entry = self
            .sessions
            .remove(authkey)
            .ok_or_else(|| RpcError::no_such(format!("no such session: {}", authkey)))?;
        let mut released = Vec::new();
        for (_, allocator) in self.allocators.iter_mut() {
            released.extend(allocator.close_session(authkey));
        }
        if let Err(e) = process::terminate(entry.pid) {
            warn!("could not terminate session {}: {}", entry.pid, e);
        }
        if self.links.remove(&entry.link.id()).is_some() {
            ctx.close(entry.link.id());
        }
        info!(
            "closed session {} (pid {}), released {} resources",
            entry.address,
            entry.pid,
            released.len()
        );
        if !released.is_empty() {
            self.update_sharing();
        }
        if !self.allocating && self.sessions.is_empty() {
            ctx.shutdown(Some(RpcError::restarting("broker restarted. please reconnect")));
        }
        Ok(())
    }

    /// The session of the calling client.
    fn current_session(&self, ctx: &Context<Self>) -> RpcResult<String> {
        ctx.caller_authkey()
            .filter(|key| self.sessions.contains_key(*key))
            .map(String::from)
            .ok_or_else(|| RpcError::exception("session closed"))
    }

    /// Find a home for one group of profiles. Local equipment is granted on
    /// the spot, equipment held by a share peer or everything under the
    /// forward policy goes to a remote broker.
    fn place(&mut self, session: &str, profiles: &[Profile]) -> RpcResult<Placement> {
        let mut best_error: Option<RpcError> = None;
        for (key, allocator) in self.allocators.iter_mut() {
            match allocator.get_resources(profiles, session) {
                Ok(grant) => return Ok(Placement::Granted(grant)),
                Err(e) if e.is(&ErrorKind::Busy) => best_error = Some(e),
                Err(e) if e.is(&ErrorKind::NoSuch) => {
                    if best_error.is_none() {
                        best_error = Some(e);
                    }
                }
                Err(e) if e.is(&ErrorKind::Shared) => {
                    if let AllocatorKey::Remote(address) = key {
                        debug!("deferring allocation to share {}", address);
                        return Ok(Placement::Remote(address));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        if let (true, Some(remote)) = (self.is_forwarding(), &self.config.remote) {
            let address = remote.address();
            debug!("forwarding allocation to {}", address);
            return Ok(Placement::Remote(address));
        }
        Ok(Placement::Unplaced(
            best_error.unwrap_or_else(|| RpcError::no_such("no such resource")),
        ))
    }

    fn allocate(
        &mut self,
        ctx: &mut Context<Self>,
        session: &str,
        profiles: Vec<Profile>,
    ) -> RpcResult<Reply<Self>> {
        match self.place(session, &profiles)? {
            Placement::Granted(grant) => {
                self.update_sharing();
                self.hand_to_session(session, grant.allocated, grant.visible)
            }
            Placement::Remote(address) => self.defer_allocation(session, address, profiles),
            Placement::Unplaced(e) => {
                self.close_session(ctx, session)?;
                Err(e)
            }
        }
    }

    /// Place every group on its own. One unplaced group closes the session.
    fn allocate_groups(
        &mut self,
        ctx: &mut Context<Self>,
        session: &str,
        groups: Vec<Vec<Profile>>,
    ) -> RpcResult<Reply<Self>> {
        let (link, address) = match self.sessions.get(session) {
            Some(entry) => (entry.link.clone(), entry.address.clone()),
            None => return Err(RpcError::exception("session closed")),
        };
        let mut calls = Vec::new();
        let mut responses = Vec::with_capacity(groups.len());
        let mut granted = false;
        for profiles in groups {
            let resources = match self.place(session, &profiles)? {
                Placement::Granted(grant) => {
                    granted = true;
                    calls.extend(grant.allocated.iter().map(|p| {
                        link.call(
                            Request::new("add_resource", Params::positional(vec![p.to_value()])),
                            Some(DEFAULT_TIMEOUT),
                        )
                    }));
                    grant.visible
                }
                Placement::Remote(remote) => {
                    let mut vargs = vec![remote.to_value()];
                    vargs.extend(profiles.iter().map(Profile::to_value));
                    calls.push(link.call(
                        Request::new("multi_async_add_resources", Params::positional(vargs)),
                        Some(DEFAULT_TIMEOUT),
                    ));
                    profiles
                }
                Placement::Unplaced(e) => {
                    self.close_session(ctx, session)?;
                    return Err(e);
                }
            };
            responses.push(json!({
                "address": address.to_value(),
                "authkey": session,
                "resources": resources,
            }));
        }
        if granted {
            self.update_sharing();
        }
        reply_after(session, calls, Value::Array(responses))
    }

    /// Add granted resources to the session, then answer with its address.
    fn hand_to_session(
        &self,
        session: &str,
        allocated: Vec<Profile>,
        visible: Vec<Profile>,
    ) -> RpcResult<Reply<Self>> {
        let entry = self
            .sessions
            .get(session)
            .ok_or_else(|| RpcError::exception("session closed"))?;
        let calls: Vec<_> = allocated
            .iter()
            .map(|p| {
                entry.link.call(
                    Request::new("add_resource", Params::positional(vec![p.to_value()])),
                    Some(DEFAULT_TIMEOUT),
                )
            })
            .collect();
        let reply = json!({
            "address": entry.address.to_value(),
            "authkey": session,
            "resources": visible,
        });
        reply_after(session, calls, reply)
    }

    /// Let the session allocate against a remote broker.
    fn defer_allocation(
        &self,
        session: &str,
        address: HostPort,
        profiles: Vec<Profile>,
    ) -> RpcResult<Reply<Self>> {
        let entry = self
            .sessions
            .get(session)
            .ok_or_else(|| RpcError::exception("session closed"))?;
        let mut vargs = vec![address.to_value()];
        vargs.extend(profiles.iter().map(Profile::to_value));
        let call = entry.link.call(
            Request::new("async_add_resources", Params::positional(vargs)),
            Some(DEFAULT_TIMEOUT),
        );
        let reply = json!({
            "address": entry.address.to_value(),
            "authkey": session,
            "resources": profiles,
        });
        reply_after(session, vec![call], reply)
    }
}

/// Where one group of profiles ended up.
enum Placement {
    Granted(Grant),
    Remote(HostPort),
    Unplaced(RpcError),
}

/// Answer with `reply` once the session took every call. A failed call
/// closes the session.
fn reply_after<F>(session: &str, calls: Vec<F>, reply: Value) -> RpcResult<Reply<Broker>>
where
    F: Future<Output = RpcResult<Value>> + Send + 'static,
{
    let session = session.to_string();
    Reply::deferred(async move {
        for call in calls {
            if let Err(e) = call.await {
                return Deferred::then(Err(e), move |b: &mut Broker, ctx| {
                    if let Err(e) = b.close_session(ctx, &session) {
                        debug!("{}", e);
                    }
                });
            }
        }
        Deferred::reply(Ok(reply))
    })
}

/// Check and complete the profiles of a `get` request.
fn request_profiles(raw: &[Value]) -> RpcResult<Vec<Profile>> {
    let mut profiles = Vec::with_capacity(raw.len());
    for value in raw {
        let Some(kind) = value.get("type") else {
            return Err(RpcError::exception(format!(
                "profile \"type\" field is missing: {}",
                value
            )));
        };
        let kind = kind
            .as_str()
            .and_then(ProfileKind::parse)
            .filter(|k| k.is_allocatable())
            .ok_or_else(|| RpcError::exception(format!("unknown profile type {}", kind)))?;
        let mut profile = Profile::from_value(value.clone())?;
        match kind {
            ProfileKind::Handset if !profile.contains("power_state") => {
                profile.insert("power_state", json!("boot_completed"));
            }
            ProfileKind::Relay if !profile.contains("power_state") => {
                profile.insert("power_state", json!("online"));
            }
            _ => {}
        }
        profiles.push(profile);
    }
    Ok(profiles)
}

fn optional_profile(params: &Params, index: usize) -> RpcResult<Option<Profile>> {
    match params.optional::<Value>(index, "profile")? {
        Some(value) => Ok(Some(Profile::from_value(value)?)),
        None => Ok(None),
    }
}

// allocation

fn get(b: &mut Broker, ctx: &mut Context<Broker>, params: Params) -> RpcResult<Reply<Broker>> {
    if !b.allocating {
        return Err(RpcError::restarting("broker is restarting"));
    }
    let session = b.current_session(ctx)?;
    let profiles = request_profiles(params.rest(0))?;
    b.allocate(ctx, &session, profiles)
}

/// Each argument is a group of profiles, or a single profile standing for
/// a group of one. Groups are allocated independently and answered in order.
fn get_multi_resources(
    b: &mut Broker,
    ctx: &mut Context<Broker>,
    params: Params,
) -> RpcResult<Reply<Broker>> {
    if !b.allocating {
        return Err(RpcError::restarting("broker is restarting"));
    }
    let session = b.current_session(ctx)?;
    let mut groups = Vec::with_capacity(params.rest(0).len());
    for raw in params.rest(0) {
        let group = match raw {
            Value::Array(profiles) => request_profiles(profiles)?,
            profile => request_profiles(std::slice::from_ref(profile))?,
        };
        groups.push(group);
    }
    b.allocate_groups(ctx, &session, groups)
}

fn yield_resources(
    b: &mut Broker,
    ctx: &mut Context<Broker>,
    params: Params,
) -> RpcResult<Reply<Broker>> {
    let session = b.current_session(ctx)?;
    let mut released = Vec::new();
    let mut deferred = Vec::new();
    for raw in params.rest(0) {
        let resource = Profile::from_value(raw.clone())?;
        for (_, allocator) in b.allocators.iter_mut() {
            match allocator.yield_resource(&session, &resource) {
                Ok(freed) => {
                    released.extend(freed);
                    break;
                }
                Err(e) if e.is(&ErrorKind::NoSuch) => continue,
                Err(e) => return Err(e),
            }
        }
        // the session drops its handle in every case, and it alone knows
        // about resources from remote brokers
        deferred.push(resource);
    }
    if !released.is_empty() {
        b.update_sharing();
    }
    Reply::value(deferred)
}

fn close_session(
    b: &mut Broker,
    ctx: &mut Context<Broker>,
    params: Params,
) -> RpcResult<Reply<Broker>> {
    let authkey: String = params.required(0, "authkey")?;
    b.close_session(ctx, &authkey)?;
    Reply::none()
}

// listings

fn list_allocators(b: &mut Broker, _: &mut Context<Broker>, _: Params) -> RpcResult<Reply<Broker>> {
    Reply::value(
        b.allocators
            .keys()
            .iter()
            .map(AllocatorKey::to_value)
            .collect::<Vec<_>>(),
    )
}

fn list_equipment(
    b: &mut Broker,
    _: &mut Context<Broker>,
    params: Params,
) -> RpcResult<Reply<Broker>> {
    let profile = optional_profile(&params, 0)?;
    let only = match params.optional::<Value>(1, "allocator")? {
        Some(raw) => Some(
            AllocatorKey::from_value(&raw)
                .ok_or_else(|| RpcError::exception(format!("no such allocator: {}", raw)))?,
        ),
        None => None,
    };
    let mut result = Vec::new();
    for (key, allocator) in b.allocators.iter() {
        if only.as_ref().map_or(true, |o| *o == key) {
            result.extend(allocator.inventory().list_equipment(profile.as_ref()));
        }
    }
    Reply::value(result)
}

fn list_available(
    b: &mut Broker,
    _: &mut Context<Broker>,
    params: Params,
) -> RpcResult<Reply<Broker>> {
    let profile = optional_profile(&params, 0)?;
    let mut result = Vec::new();
    for (_, allocator) in b.allocators.iter() {
        result.extend(allocator.inventory().list_available(profile.as_ref()));
    }
    Reply::value(result)
}

fn list_workspaces(
    b: &mut Broker,
    _: &mut Context<Broker>,
    params: Params,
) -> RpcResult<Reply<Broker>> {
    let profile = optional_profile(&params, 0)?;
    let mut result = Vec::new();
    for (_, allocator) in b.allocators.iter() {
        result.extend(allocator.inventory().list_workspaces(profile.as_ref()));
    }
    Reply::value(result)
}

fn list_stacks(b: &mut Broker, _: &mut Context<Broker>, _: Params) -> RpcResult<Reply<Broker>> {
    Reply::value(b.all_stacks())
}

fn list_allocations(
    b: &mut Broker,
    ctx: &mut Context<Broker>,
    _: Params,
) -> RpcResult<Reply<Broker>> {
    let session = b.current_session(ctx)?;
    let mut result = Vec::new();
    for (_, allocator) in b.allocators.iter() {
        result.extend(allocator.inventory().list_allocations(Some(&session)));
    }
    Reply::value(result)
}

fn list_allocations_all(
    b: &mut Broker,
    _: &mut Context<Broker>,
    _: Params,
) -> RpcResult<Reply<Broker>> {
    let mut result = Vec::new();
    for (_, allocator) in b.allocators.iter() {
        result.extend(allocator.inventory().list_allocations(None));
    }
    Reply::value(result)
}

fn list_collateral(
    b: &mut Broker,
    ctx: &mut Context<Broker>,
    _: Params,
) -> RpcResult<Reply<Broker>> {
    let session = b.current_session(ctx)?;
    Reply::value(b.allocators.local().inventory().list_collateral(Some(&session)))
}

fn list_collateral_all(
    b: &mut Broker,
    _: &mut Context<Broker>,
    _: Params,
) -> RpcResult<Reply<Broker>> {
    Reply::value(b.allocators.local().inventory().list_collateral(None))
}

// introspection

fn get_profile(b: &mut Broker, _: &mut Context<Broker>, _: Params) -> RpcResult<Reply<Broker>> {
    Reply::value(broker_profile(&b.config.to_value()))
}

fn get_config(b: &mut Broker, _: &mut Context<Broker>, _: Params) -> RpcResult<Reply<Broker>> {
    Reply::value(b.config.to_value())
}

fn stop(_: &mut Broker, ctx: &mut Context<Broker>, _: Params) -> RpcResult<Reply<Broker>> {
    ctx.shutdown(Some(RpcError::exit("broker stopped")));
    Reply::value(true)
}

impl Service for Broker {
    fn register(methods: &mut MethodTable<Self>) {
        methods
            .rpc("get", Access::Auth, get)
            .rpc("get_resource", Access::Auth, get)
            .rpc("get_multi_resources", Access::Auth, get_multi_resources)
            .rpc("get_resources", Access::Auth, get)
            .rpc("yield_resources", Access::Auth, yield_resources)
            .rpc("close_session", Access::Preauth(ADMIN), close_session)
            .rpc("list_allocators", Access::Preauth(ADMIN), list_allocators)
            .rpc("list_equipment", Access::Preauth(ADMIN), list_equipment)
            .rpc("list_available", Access::Preauth(ADMIN), list_available)
            .rpc("list_workspaces", Access::Preauth(ADMIN), list_workspaces)
            .rpc("list_stacks", Access::Preauth(ADMIN), list_stacks)
            .rpc("list_allocations", Access::Auth, list_allocations)
            .rpc("list_allocations_all", Access::Open, list_allocations_all)
            .rpc("list_collateral", Access::Auth, list_collateral)
            .rpc("list_collateral_all", Access::Open, list_collateral_all)
            .rpc("get_profile", Access::Open, get_profile)
            .rpc("get_config", Access::Preauth(ADMIN), get_config)
            .rpc("stop", Access::Preauth(ADMIN), stop)
            .rpc("list_shares", Access::Preauth(ADMIN), sharing::list_shares)
            .rpc("start_sharing", Access::Preauth(ADMIN), sharing::start_sharing)
            .rpc("stop_sharing", Access::Preauth(ADMIN), sharing::stop_sharing)
            .rpc("restart_sharing", Access::Preauth(ADMIN), sharing::restart_sharing)
            .rpc("drop_share", Access::Preauth(ADMIN), sharing::drop_share)
            .rpc("drop_all_shares", Access::Preauth(ADMIN), sharing::drop_all_shares)
            .rpc("set_ws_profile", Access::Preauth(SHARE), sharing::set_ws_profile)
            .rpc("add_workspaces", Access::Preauth(SHARE), sharing::add_workspaces)
            .rpc("remove_workspaces", Access::Preauth(SHARE), sharing::remove_workspaces)
            .rpc("set_stacks", Access::Preauth(SHARE), sharing::set_stacks)
            .rpc("add_equipment", Access::Preauth(SHARE), sharing::add_equipment)
            .rpc("set_equipment", Access::Preauth(SHARE), sharing::set_equipment)
            .rpc("serialize", Access::Open, handover::serialize)
            .rpc("begin_handover", Access::Preauth(ADMIN), handover::begin_handover)
            .rpc("end_handover", Access::Preauth(ADMIN), handover::end_handover)
            .internal("new_session")
            .internal("update_sharing");
    }

    fn initialize(&mut self, ctx: &mut Context<Self>) -> RpcResult<()> {
        if let Some(adopted) = self.adopted.take() {
            self.adopt_sessions(ctx, adopted)?;
        }
        self.banner(ctx);
        if self.is_sharing() {
            if let Err(e) = self.start_sharing(ctx) {
                error!("could not start sharing: {}", e);
            }
        }
        Ok(())
    }

    fn idle(&mut self, ctx: &mut Context<Self>) {
        self.reap_adopted(ctx);
    }

    fn new_connection(&mut self, ctx: &mut Context<Self>, id: ConnId, authkey: Option<&str>) {
        if authkey.is_some() {
            return;
        }
        let key = match ctx.rand_authkey() {
            Ok(key) => key,
            Err(e) => {
                error!("could not make a session key: {}", e);
                ctx.close(id);
                return;
            }
        };
        ctx.set_authkey(id, key.clone());
        if let Err(e) = self.new_session(ctx, &key) {
            error!("could not start a session: {}", e);
            ctx.close(id);
        }
    }

    fn lost_connection(&mut self, ctx: &mut Context<Self>, id: ConnId, authkey: Option<&str>) {
        if let Some(address) = self.shares.remove(&id) {
            info!("lost share {}", address);
            self.allocators.remove_share(&address);
            self.update_sharing();
            return;
        }
        if let Some(session) = self.links.remove(&id) {
            info!("lost link to session {}", session);
            if let Err(e) = self.close_session(ctx, &session) {
                debug!("{}", e);
            }
            return;
        }
        if let Some(key) = authkey.filter(|k| self.sessions.contains_key(*k)) {
            let key = key.to_string();
            if let Err(e) = self.close_session(ctx, &key) {
                debug!("{}", e);
            }
        }
    }

    fn joined_process(&mut self, ctx: &mut Context<Self>, pid: u32, status: Option<ExitStatus>) {
        if self.notifier.as_ref().map(|n| n.pid) == Some(pid) {
            warn!("notifier exited ({:?})", status);
            self.notifier = None;
            if self.allocating && !ctx.is_shutting_down() {
                if let Err(e) = self.start_sharing(ctx) {
                    error!("could not restart sharing: {}", e);
                }
            }
            return;
        }
        let session = self
            .sessions
            .iter()
            .find(|(_, s)| s.pid == pid)
            .map(|(key, _)| key.clone());
        if let Some(key) = session {
            debug!("session {} exited ({:?})", pid, status);
            if let Err(e) = self.close_session(ctx, &key) {
                debug!("{}", e);
            }
        }
    }

    fn shutdown(&mut self, ctx: &mut Context<Self>, _: Option<&RpcError>) {
        self.stop_sharing(ctx);
        for session in self.sessions.values() {
            if let Err(e) = process::terminate(session.pid) {
                warn!("could not terminate session {}: {}", session.pid, e);
            }
        }
    }

    fn dump(&self) -> Value {
        json!({
            "config": self.config.to_value(),
            "allocating": self.allocating,
            "handed_over": self.handed_over,
            "allocators": self.allocators.keys().iter().map(AllocatorKey::to_value).collect::<Vec<_>>(),
            "sessions": self.sessions.iter().map(|(key, s)| json!({
                "authkey": key,
                "pid": s.pid,
                "address": s.address.to_value(),
                "adopted": s.adopted,
            })).collect::<Vec<_>>(),
            "shares": self.shares.values().map(HostPort::to_value).collect::<Vec<_>>(),
            "notifier": self.notifier.as_ref().map(|n| n.pid),
            "allocations": self.allocators.local().serialize(),
        })
    }
}
