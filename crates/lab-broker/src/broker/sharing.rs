// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sharing with a master broker, and the master side of it.
//!
//! A sharing broker runs a notifier process that pushes the workspace
//! profile, stacks, equipment and allocations to the master. The master
//! mirrors every share in a [`ShareAllocator`](crate::allocator::ShareAllocator)
//! keyed by the share's advertised address.

use super::{Broker, NotifierEntry};
use crate::allocator::{Allocator, AllocatorKey};
use crate::config::HostPort;
use crate::control::process;
use crate::control::{Context, Params, Reply, Request, DEFAULT_TIMEOUT};
use crate::error::{RpcError, RpcResult};
use crate::launcher::{child_listener, reachable, MASTER_KEY_ENV, NOTIFIER_KEY_ENV};
use crate::profile::Profile;
use serde_json::{json, Map, Value};
use std::ffi::OsString;
use tracing::{debug, info, warn};

impl Broker {
    /// Start the notifier. Returns its address.
    pub(super) fn start_sharing(&mut self, ctx: &mut Context<Self>) -> RpcResult<HostPort> {
        self.stop_sharing(ctx);
        let remote = self
            .config
            .remote
            .clone()
            .ok_or_else(|| RpcError::exception("broker is not configured to share"))?;

        let ip = Self::listen_ip(ctx);
        let (listener, port) = child_listener(ip)?;
        let key = ctx.rand_authkey()?;
        let args: Vec<OsString> = vec![
            "--master".into(),
            remote.address().to_string().into(),
            "--local".into(),
            self.config.address().to_string().into(),
        ];
        let mut envs = vec![(NOTIFIER_KEY_ENV, key.clone())];
        if let Some(master_key) = &remote.authkey {
            envs.push((MASTER_KEY_ENV, master_key.clone()));
        }
        let child = self.launcher.spawn("notifier", &listener, &args, &envs)?;
        drop(listener);
        let pid = child.id().unwrap_or_default();
        ctx.join_later(child);

        let address = HostPort::new(reachable(ip).to_string(), port);
        let link = ctx.connect_link(address.clone(), Some(key), DEFAULT_TIMEOUT);
        if let Some(profile) = self.allocators.local().inventory().ws_profile() {
            link.call_async(Request::new(
                "set_ws_profile",
                Params::positional(vec![profile.to_value(), json!(false)]),
            ))?;
        }
        link.call_async(Request::new(
            "set_stacks",
            Params::positional(vec![serde_json::to_value(self.all_stacks())?, json!(true)]),
        ))?;
        self.notifier = Some(NotifierEntry { pid, link });
        self.update_sharing();
        info!("sharing with {} through notifier {}", remote.address(), pid);
        Ok(address)
    }

    /// Kill the notifier. Its exit restarts sharing.
    pub(super) fn restart_sharing(&mut self) {
        if let Some(notifier) = &self.notifier {
            if let Err(e) = process::kill(notifier.pid) {
                warn!("could not kill notifier {}: {}", notifier.pid, e);
            }
        }
    }

    pub(super) fn stop_sharing(&mut self, ctx: &mut Context<Self>) {
        if let Some(notifier) = self.notifier.take() {
            debug!("stopping notifier {}", notifier.pid);
            if let Err(e) = process::kill(notifier.pid) {
                warn!("could not kill notifier {}: {}", notifier.pid, e);
            }
            ctx.close(notifier.link.id());
        }
    }

    /// Push the current equipment and allocations to the notifier.
    pub(super) fn update_sharing(&mut self) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let mut equipment = Vec::new();
        let mut allocations = Map::new();
        for (_, allocator) in self.allocators.iter() {
            let inventory = allocator.inventory();
            equipment.extend(inventory.list_equipment(None));
            for allocation in inventory.allocations() {
                allocations.insert(
                    allocations.len().to_string(),
                    Value::Array(vec![allocation.record()]),
                );
            }
        }
        let request = Request::new(
            "set_equipment",
            Params::positional(vec![json!(equipment), Value::Object(allocations)]),
        );
        if let Err(e) = notifier.link.call_async(request) {
            warn!("could not update notifier: {}", e);
            self.restart_sharing();
        }
    }

    /// Stacks of every allocator, local first.
    pub(super) fn all_stacks(&self) -> Vec<Vec<Profile>> {
        self.allocators
            .iter()
            .flat_map(|(_, a)| a.inventory().list_stacks().to_vec())
            .collect()
    }

    /// Resolve the allocator a share RPC is about. The first message from a
    /// share connection ties the connection to the share's address.
    fn share_target(&mut self, ctx: &Context<Self>, raw: &Value) -> RpcResult<AllocatorKey> {
        let key = AllocatorKey::from_value(raw)
            .ok_or_else(|| RpcError::exception(format!("no such allocator: {}", raw)))?;
        if let AllocatorKey::Remote(address) = &key {
            let (_, created) = self.allocators.share_entry(address);
            if created {
                info!("new share {}", address);
            }
            if let Some(id) = ctx.caller() {
                self.shares.entry(id).or_insert_with(|| address.clone());
            }
        }
        Ok(key)
    }

    fn drop_share(&mut self, ctx: &mut Context<Self>, address: &HostPort) -> bool {
        let ids: Vec<_> = self
            .shares
            .iter()
            .filter(|(_, a)| *a == address)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.shares.remove(&id);
            ctx.close(id);
        }
        self.allocators.remove_share(address).is_some()
    }

    pub(super) fn drop_all_shares(&mut self, ctx: &mut Context<Self>) {
        let addresses: Vec<HostPort> = self
            .allocators
            .keys()
            .into_iter()
            .filter_map(|k| match k {
                AllocatorKey::Remote(address) => Some(address),
                AllocatorKey::Local => None,
            })
            .collect();
        for address in addresses {
            self.drop_share(ctx, &address);
        }
    }
}

fn profiles(raw: Vec<Value>) -> RpcResult<Vec<Profile>> {
    raw.into_iter()
        .map(|v| Profile::from_value(v).map_err(RpcError::from))
        .collect()
}

// admin

pub(super) fn list_shares(
    b: &mut Broker,
    _: &mut Context<Broker>,
    _: Params,
) -> RpcResult<Reply<Broker>> {
    Reply::value(
        b.allocators
            .keys()
            .into_iter()
            .filter_map(|k| match k {
                AllocatorKey::Remote(address) => Some(address.to_value()),
                AllocatorKey::Local => None,
            })
            .collect::<Vec<_>>(),
    )
}

pub(super) fn start_sharing(
    b: &mut Broker,
    ctx: &mut Context<Broker>,
    _: Params,
) -> RpcResult<Reply<Broker>> {
    let address = b.start_sharing(ctx)?;
    Reply::value(address.to_value())
}

pub(super) fn stop_sharing(
    b: &mut Broker,
    ctx: &mut Context<Broker>,
    _: Params,
) -> RpcResult<Reply<Broker>> {
    b.stop_sharing(ctx);
    Reply::none()
}

pub(super) fn restart_sharing(
    b: &mut Broker,
    _: &mut Context<Broker>,
    _: Params,
) -> RpcResult<Reply<Broker>> {
    if b.notifier.is_none() {
        return Err(RpcError::exception("broker is not sharing"));
    }
    b.restart_sharing();
    Reply::none()
}

pub(super) fn drop_share(
    b: &mut Broker,
    ctx: &mut Context<Broker>,
    params: Params,
) -> RpcResult<Reply<Broker>> {
    let raw: Value = params.required(0, "address")?;
    let address = HostPort::from_value(&raw)
        .ok_or_else(|| RpcError::exception(format!("not a [host, port] address: {}", raw)))?;
    if !b.drop_share(ctx, &address) {
        return Err(RpcError::no_such(format!("no such share: {}", address)));
    }
    b.update_sharing();
    Reply::none()
}

pub(super) fn drop_all_shares(
    b: &mut Broker,
    ctx: &mut Context<Broker>,
    _: Params,
) -> RpcResult<Reply<Broker>> {
    b.drop_all_shares(ctx);
    b.update_sharing();
    Reply::none()
}

// pushed by share notifiers

pub(super) fn set_ws_profile(
    b: &mut Broker,
    ctx: &mut Context<Broker>,
    params: Params,
) -> RpcResult<Reply<Broker>> {
    let raw: Value = params.required(0, "allocator")?;
    let profile = Profile::from_value(params.required(1, "profile")?)?;
    let key = b.share_target(ctx, &raw)?;
    let allocator = b
        .allocators
        .get_mut(&key)
        .ok_or_else(|| RpcError::no_such(format!("no such allocator: {}", key)))?;
    allocator.inventory_mut().set_ws_profile(profile)?;
    Reply::none()
}

/// Workspaces travel with `set_equipment` now. Peers still pushing them
/// separately are told so.
pub(super) fn add_workspaces(
    b: &mut Broker,
    ctx: &mut Context<Broker>,
    params: Params,
) -> RpcResult<Reply<Broker>> {
    let raw: Value = params.required(0, "allocator")?;
    b.share_target(ctx, &raw)?;
    Err(RpcError::exception(
        "add_workspaces() is obsolete. use set_equipment() instead",
    ))
}

pub(super) fn remove_workspaces(
    b: &mut Broker,
    ctx: &mut Context<Broker>,
    params: Params,
) -> RpcResult<Reply<Broker>> {
    let raw: Value = params.required(0, "allocator")?;
    b.share_target(ctx, &raw)?;
    Err(RpcError::exception(
        "remove_workspaces() is obsolete. use set_equipment() instead",
    ))
}

pub(super) fn set_stacks(
    b: &mut Broker,
    ctx: &mut Context<Broker>,
    params: Params,
) -> RpcResult<Reply<Broker>> {
    let raw: Value = params.required(0, "allocator")?;
    let stacks: Vec<Vec<Value>> = params.required(1, "stacks")?;
    let stacks = stacks
        .into_iter()
        .map(profiles)
        .collect::<RpcResult<Vec<_>>>()?;
    let key = b.share_target(ctx, &raw)?;
    let allocator = b
        .allocators
        .get_mut(&key)
        .ok_or_else(|| RpcError::no_such(format!("no such allocator: {}", key)))?;
    allocator.inventory_mut().set_stacks(stacks)?;
    b.update_sharing_stacks();
    Reply::none()
}

pub(super) fn add_equipment(
    b: &mut Broker,
    ctx: &mut Context<Broker>,
    params: Params,
) -> RpcResult<Reply<Broker>> {
    let raw: Value = params.required(0, "allocator")?;
    let equipment = profiles(params.required(1, "equipment")?)?;
    if b.share_target(ctx, &raw)? != AllocatorKey::Local {
        return Err(RpcError::exception(
            "cannot use add_equipment() with non-local equipment. use set_equipment() instead",
        ));
    }
    b.allocators.local_mut().add_equipment(equipment)?;
    b.update_sharing();
    Reply::none()
}

pub(super) fn set_equipment(
    b: &mut Broker,
    ctx: &mut Context<Broker>,
    params: Params,
) -> RpcResult<Reply<Broker>> {
    let raw: Value = params.required(0, "allocator")?;
    let equipment = profiles(params.required(1, "equipment")?)?;
    let allocations: Value = params
        .optional(2, "allocations")?
        .unwrap_or_else(|| json!({}));
    match b.share_target(ctx, &raw)? {
        AllocatorKey::Local => b.allocators.local_mut().inventory_mut().set_equipment(equipment),
        AllocatorKey::Remote(address) => {
            let (share, _) = b.allocators.share_entry(&address);
            share.set_equipment(equipment, &allocations)?;
        }
    }
    b.update_sharing();
    Reply::none()
}

impl Broker {
    /// Push the stacks of every allocator to the notifier.
    fn update_sharing_stacks(&mut self) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let stacks = match serde_json::to_value(self.all_stacks()) {
            Ok(stacks) => stacks,
            Err(e) => {
                warn!("could not encode stacks: {}", e);
                return;
            }
        };
        let request = Request::new("set_stacks", Params::positional(vec![stacks, json!(true)]));
        if let Err(e) = notifier.link.call_async(request) {
            warn!("could not update notifier: {}", e);
            self.restart_sharing();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_rejects_non_objects() {
        assert!(profiles(vec![json!({"type": "relay", "uid": "r1"})]).is_ok());
        assert!(profiles(vec![json!("relay")]).is_err());
    }
}
