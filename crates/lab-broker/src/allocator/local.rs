// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Allocator for equipment attached to this broker.

use super::{Allocation, Allocator, Grant, Inventory, Owner};
use crate::config::WorkspaceConfig;
use crate::error::{RpcError, RpcResult};
use crate::handover::AllocationRecord;
use crate::profile::Profile;
use crate::workspace::{is_workspace_of, Workspace};
use ring::rand::SystemRandom;
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub struct LocalAllocator {
    inventory: Inventory,
    ws_config: WorkspaceConfig,
    rng: SystemRandom,
}

impl LocalAllocator {
    pub fn new(ws_config: WorkspaceConfig) -> Self {
        let mut inventory = Inventory::new();
        inventory.ws_profile = Some(ws_config.profile());
        Self {
            inventory,
            ws_config,
            rng: SystemRandom::new(),
        }
    }

    /// Add or replace equipment by identity. A replacement without `pretty`
    /// keeps the name of the profile it replaces.
    pub fn add_equipment(&mut self, profiles: Vec<Profile>) -> RpcResult<()> {
        for profile in &profiles {
            profile.require_identity()?;
        }
        for mut profile in profiles {
            let equipment = self.inventory.equipment_mut();
            if let Some(pos) = equipment.iter().position(|e| *e == profile) {
                let old = equipment.remove(pos);
                let unnamed = profile.get_str("pretty").map_or(true, str::is_empty);
                if unnamed {
                    if let Some(pretty) = old.get("pretty") {
                        profile.insert("pretty", pretty.clone());
                    }
                }
            }
            equipment.push(profile);
        }
        Ok(())
    }

    /// Replay allocations carried over from a previous broker.
    pub fn adopt(&mut self, session: &str, records: &[AllocationRecord]) -> RpcResult<()> {
        for record in records {
            self.inventory.allocate(
                record.profile.clone(),
                Owner::Session(session.to_string()),
                &record.collateral,
            )?;
        }
        Ok(())
    }

    /// Allocation records of `session`, in handover form.
    pub fn records_of(&self, session: &str) -> Vec<AllocationRecord> {
        self.inventory
            .allocations()
            .filter(|a| a.owner.session() == Some(session))
            .map(|a| AllocationRecord {
                profile: a.profile.clone(),
                collateral: a.collateral.clone(),
            })
            .collect()
    }

    /// Delete the storage of a workspace this allocator created.
    fn release_storage(&mut self, allocation: &Allocation) {
        let profile = &allocation.profile;
        if !profile.is_workspace() || !self.inventory.equipment.contains(profile) {
            return;
        }
        if is_workspace_of(profile, &self.ws_config) {
            if let Some(uid) = profile.get_str("uid") {
                match Workspace::new(&self.ws_config, uid).map(|w| w.delete()) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("could not delete workspace {}: {}", uid, e),
                    Err(e) => warn!("{}", e),
                }
            }
        }
        self.inventory.remove_equipment(profile);
    }

    fn check_workspaces(&self, intended: &[Profile], session: &str) -> RpcResult<()> {
        for resource in intended.iter().filter(|r| r.is_workspace()) {
            if let Some(Owner::Session(owner)) = self.inventory.owner_of(resource) {
                if owner != session {
                    return Err(RpcError::busy(format!(
                        "resource already allocated: {}",
                        resource
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Allocator for LocalAllocator {
    fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    fn inventory_mut(&mut self) -> &mut Inventory {
        &mut self.inventory
    }

    fn get_resources(&mut self, profiles: &[Profile], session: &str) -> RpcResult<Grant> {
        let (mut intended, collateral) = self.inventory.choose(profiles)?;
        for request in profiles.iter().filter(|p| p.is_workspace()) {
            let workspace = self
                .inventory
                .match_workspaces(request)
                .map_err(|_| RpcError::no_such("no such workspace"))?;
            intended.push(workspace);
        }

        for resource in intended.iter_mut() {
            if let Some(request) = profiles.iter().find(|p| p.kind() == resource.kind()) {
                let minimal = resource.minimize(Some(request));
                if minimal.identity().is_some() || resource.identity().is_none() {
                    *resource = minimal;
                }
            }
        }
        self.check_workspaces(&intended, session)?;

        for resource in intended.iter_mut() {
            if resource.is_workspace() && !resource.contains("uid") {
                let workspace = Workspace::create(&self.ws_config, &self.rng)?;
                debug!("created workspace {}", workspace.uid());
                *resource = workspace.profile();
                self.inventory.equipment_mut().push(resource.clone());
            }
        }

        for resource in &intended {
            self.inventory
                .allocate(resource.clone(), Owner::Session(session.to_string()), &collateral)?;
        }

        let mut unclaimed = intended.clone();
        let mut visible = Vec::with_capacity(profiles.len());
        for request in profiles {
            if let Some(pos) = unclaimed.iter().position(|r| r.kind() == request.kind()) {
                visible.push(unclaimed.remove(pos));
            }
        }
        Ok(Grant {
            allocated: intended,
            visible,
        })
    }

    fn yield_resource(&mut self, session: &str, resource: &Profile) -> RpcResult<Vec<Profile>> {
        let allocation = self.inventory.yield_resource(session, resource)?;
        self.release_storage(&allocation);
        let mut released: Vec<Profile> = allocation
            .collateral
            .iter()
            .filter(|c| self.inventory.is_available(c))
            .cloned()
            .collect();
        released.push(allocation.profile);
        Ok(released)
    }

    fn close_session(&mut self, session: &str) -> Vec<Profile> {
        let allocations = self.inventory.close_session(session);
        let mut released = Vec::new();
        for allocation in &allocations {
            self.release_storage(allocation);
        }
        for allocation in allocations {
            for c in allocation.collateral {
                if !released.contains(&c) {
                    released.push(c);
                }
            }
            released.push(allocation.profile);
        }
        released
    }

    /// Session authkey to that session's allocation records.
    fn serialize(&self) -> Value {
        let mut result = Map::new();
        for allocation in self.inventory.allocations() {
            let Some(session) = allocation.owner.session() else {
                continue;
            };
            let entry = result
                .entry(session.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(records) = entry {
                records.push(allocation.record());
            }
        }
        Value::Object(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Home;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn p(value: Value) -> Profile {
        Profile::from_value(value).unwrap()
    }

    fn allocator(dir: &std::path::Path) -> LocalAllocator {
        let cfg = WorkspaceConfig::from_value(
            json!({"root": dir.join("ws").display().to_string(),
                "tools": {"adb": "/usr/bin/adb", "git": "/usr/bin/git"}}),
            &Home::new(dir),
        )
        .unwrap();
        let mut local = LocalAllocator::new(cfg);
        local
            .add_equipment(vec![
                p(json!({"type": "handset", "serial": "h1", "pretty": "red",
                    "power_state": "boot_completed"})),
                p(json!({"type": "relay", "uid": "A", "power_state": "online",
                    "circuits": {"usb.pc.vcc": 1, "handset.battery": 2}})),
            ])
            .unwrap();
        local
    }

    #[test]
    fn test_add_equipment_keeps_pretty() {
        let dir = tempfile::tempdir().unwrap();
        let mut local = allocator(dir.path());
        local
            .add_equipment(vec![p(json!({"type": "handset", "serial": "h1",
                "power_state": "offline"}))])
            .unwrap();
        let eq = local.inventory().list_equipment(None);
        assert_eq!(eq.len(), 2);
        let h1 = eq.iter().find(|e| e.get_str("serial") == Some("h1")).unwrap();
        assert_eq!(h1.get_str("pretty"), Some("red"));
        assert_eq!(h1.get_str("power_state"), Some("offline"));

        let err = local
            .add_equipment(vec![p(json!({"type": "handset", "pretty": "x"}))])
            .unwrap_err();
        assert!(err.message().contains("no unique identity"));
    }

    #[test]
    fn test_workspace_and_handset_grant() {
        let dir = tempfile::tempdir().unwrap();
        let mut local = allocator(dir.path());
        let request = [
            p(json!({"type": "workspace", "tools": ["adb"]})),
            p(json!({"type": "handset"})),
        ];
        let grant = local.get_resources(&request, "s1").unwrap();
        assert_eq!(grant.visible.len(), 2);
        assert!(grant.visible[0].is_workspace());
        assert_eq!(grant.visible[1].get_str("serial"), Some("h1"));

        let ws = grant.visible[0].clone();
        let uid = ws.get_str("uid").unwrap().to_string();
        assert!(dir.path().join("ws").join(&uid).is_dir());
        assert_eq!(local.inventory().list_allocations(Some("s1")).len(), 2);

        // a second session can take the workspace only by uid, and cannot
        let err = local
            .get_resources(&[p(json!({"type": "workspace", "uid": uid}))], "s2")
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Busy);

        let released = local.close_session("s1");
        assert_eq!(released.len(), 2);
        assert!(!dir.path().join("ws").join(&uid).exists());
        assert!(local.inventory().list_workspaces(None).is_empty());
    }

    #[test]
    fn test_relay_visible_profile_is_minimized() {
        let dir = tempfile::tempdir().unwrap();
        let mut local = allocator(dir.path());
        let request = [p(json!({"type": "relay", "circuits": ["usb.pc.vcc"]}))];
        let grant = local.get_resources(&request, "s1").unwrap();
        assert_eq!(
            grant.visible[0].get("circuits"),
            Some(&json!({"usb.pc.vcc": 1}))
        );
        let released = local.yield_resource("s1", &grant.visible[0]).unwrap();
        assert_eq!(released.len(), 1);
        assert!(local.inventory().list_allocations(None).is_empty());
    }

    #[test]
    fn test_unmatched_workspace_is_no_such() {
        let dir = tempfile::tempdir().unwrap();
        let mut local = allocator(dir.path());
        let err = local
            .get_resources(&[p(json!({"type": "workspace", "tools": ["svn"]}))], "s1")
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::NoSuch);
        assert_eq!(err.message(), "no such workspace");
    }

    #[test]
    fn test_serialize_and_adopt() {
        let dir = tempfile::tempdir().unwrap();
        let mut local = allocator(dir.path());
        local
            .get_resources(&[p(json!({"type": "handset"}))], "s1")
            .unwrap();
        let serialized = local.serialize();
        assert_eq!(serialized["s1"].as_array().unwrap().len(), 1);
        let records = local.records_of("s1");

        let mut fresh = allocator(dir.path());
        fresh.adopt("s1", &records).unwrap();
        assert!(fresh
            .inventory()
            .is_allocated(&p(json!({"type": "handset", "serial": "h1"}))));
    }
}
