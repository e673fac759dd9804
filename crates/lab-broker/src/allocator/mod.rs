// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Resource inventories and the allocation algorithm.
//!
//! Every allocator owns an [`Inventory`]: equipment, stacks, allocation
//! records and the collateral index. [`LocalAllocator`] serves equipment
//! attached to this broker; one [`ShareAllocator`] per sharing peer mirrors
//! that peer's inventory and only ever answers with `Shared`.
//!
//! A resource in a stack with allocated equipment becomes collateral: it is
//! unavailable without being owned. The collateral index counts one entry
//! per allocation that blocks a resource, so a resource is available again
//! only when every such allocation is gone.

pub mod local;
pub mod share;

pub use local::LocalAllocator;
pub use share::ShareAllocator;

use crate::config::HostPort;
use crate::error::{RpcError, RpcResult};
use crate::profile::{Profile, ResourceId};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Allocator registry key. `Local` sorts before every remote address, which
/// is what makes local equipment preferred.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AllocatorKey {
    Local,
    Remote(HostPort),
}

impl AllocatorKey {
    /// `"local"` or a `[host, port]` pair.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if s == "local" => Some(Self::Local),
            other => HostPort::from_value(other).map(Self::Remote),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Local => json!("local"),
            Self::Remote(address) => address.to_value(),
        }
    }
}

impl fmt::Display for AllocatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote(address) => write!(f, "{}", address),
        }
    }
}

/// Who holds an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Owner {
    /// A session of this broker, by authkey.
    Session(String),
    /// Allocated through another broker. Only seen in share snapshots.
    Foreign,
}

impl Owner {
    pub fn session(&self) -> Option<&str> {
        match self {
            Self::Session(authkey) => Some(authkey),
            Self::Foreign => None,
        }
    }
}

/// One allocation record.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub profile: Profile,
    pub owner: Owner,
    pub collateral: Vec<Profile>,
}

impl Allocation {
    /// Wire form used by `serialize`.
    pub fn record(&self) -> Value {
        json!({"profile": self.profile, "collateral": self.collateral})
    }
}

/// Result of a successful local allocation.
#[derive(Debug, Clone, Default)]
pub struct Grant {
    /// Everything now owned by the session, stack members included.
    pub allocated: Vec<Profile>,
    /// One resource per requested profile, in request order.
    pub visible: Vec<Profile>,
}

/// Behaviour shared by local and share allocators.
pub trait Allocator {
    fn inventory(&self) -> &Inventory;

    fn inventory_mut(&mut self) -> &mut Inventory;

    /// Satisfy `profiles` on behalf of `session`.
    fn get_resources(&mut self, profiles: &[Profile], session: &str) -> RpcResult<Grant>;

    /// Release one resource. Returns what became available.
    fn yield_resource(&mut self, session: &str, resource: &Profile) -> RpcResult<Vec<Profile>>;

    /// Release everything `session` holds. Returns what became available.
    fn close_session(&mut self, session: &str) -> Vec<Profile>;

    /// JSON view of the allocation records.
    fn serialize(&self) -> Value;
}

/// Equipment, stacks and allocation state of one allocator.
#[derive(Debug, Default)]
pub struct Inventory {
    ws_profile: Option<Profile>,
    equipment: Vec<Profile>,
    stacks: Vec<Vec<Profile>>,
    allocations: BTreeMap<ResourceId, Allocation>,
    collateral: BTreeMap<ResourceId, Vec<Owner>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    // workspaces

    /// Set the generic profile every new workspace is allocated from.
    pub fn set_ws_profile(&mut self, profile: Profile) -> RpcResult<()> {
        if profile.contains("uid") {
            return Err(RpcError::exception(format!(
                "cannot set generic workspace profile with uid: {}",
                profile
            )));
        }
        if !profile.is_workspace() {
            return Err(RpcError::exception(format!(
                "not a workspace profile: {}",
                profile
            )));
        }
        self.ws_profile = Some(profile);
        Ok(())
    }

    pub fn ws_profile(&self) -> Option<&Profile> {
        self.ws_profile.as_ref()
    }

    pub fn list_workspaces(&self, profile: Option<&Profile>) -> Vec<Profile> {
        self.equipment
            .iter()
            .filter(|w| w.is_workspace())
            .filter(|w| profile.map_or(true, |p| w.matches(p)))
            .cloned()
            .collect()
    }

    /// Resolve a workspace request: an existing workspace by uid, else the
    /// generic profile.
    pub fn match_workspaces(&self, profile: &Profile) -> RpcResult<Profile> {
        if let Some(existing) = self.equipment.iter().find(|e| *e == profile) {
            if existing.matches(profile) {
                return Ok(existing.clone());
            }
            return Err(RpcError::exception(format!(
                "existing workspace does not fully match request: {}",
                existing
            )));
        }
        let generic = self
            .ws_profile
            .as_ref()
            .ok_or_else(|| RpcError::no_such("no generic workspace profile"))?;
        if !generic.matches(profile) {
            return Err(RpcError::exception(format!(
                "profile does not match generic configuration: {}",
                generic
            )));
        }
        Ok(generic.clone())
    }

    // equipment

    pub fn list_equipment(&self, profile: Option<&Profile>) -> Vec<Profile> {
        self.equipment
            .iter()
            .filter(|e| profile.map_or(true, |p| e.matches(p)))
            .cloned()
            .collect()
    }

    pub fn list_available(&self, profile: Option<&Profile>) -> Vec<Profile> {
        self.equipment
            .iter()
            .filter(|e| profile.map_or(true, |p| e.matches(p)))
            .filter(|e| !self.is_allocated(e) && !self.has_collateral(e))
            .cloned()
            .collect()
    }

    pub fn set_equipment(&mut self, equipment: Vec<Profile>) {
        self.equipment = equipment;
    }

    pub(crate) fn equipment_mut(&mut self) -> &mut Vec<Profile> {
        &mut self.equipment
    }

    pub fn remove_equipment(&mut self, profile: &Profile) {
        self.equipment.retain(|e| e != profile);
    }

    pub fn is_allocated(&self, profile: &Profile) -> bool {
        profile
            .identity()
            .map_or(false, |id| self.allocations.contains_key(&id))
    }

    pub fn has_collateral(&self, profile: &Profile) -> bool {
        profile
            .identity()
            .and_then(|id| self.collateral.get(&id))
            .map_or(false, |owners| !owners.is_empty())
    }

    pub fn is_available(&self, profile: &Profile) -> bool {
        !self.is_allocated(profile) && !self.has_collateral(profile)
    }

    /// How many allocations currently block `profile` as collateral.
    pub fn collateral_count(&self, profile: &Profile) -> usize {
        profile
            .identity()
            .and_then(|id| self.collateral.get(&id))
            .map_or(0, Vec::len)
    }

    pub fn owner_of(&self, profile: &Profile) -> Option<&Owner> {
        let id = profile.identity()?;
        self.allocations.get(&id).map(|a| &a.owner)
    }

    /// The live profile of the equipment identified by `profile`.
    pub fn fill_profile(&self, profile: &Profile) -> RpcResult<Profile> {
        profile.require_identity()?;
        self.equipment
            .iter()
            .find(|e| e.matches(profile))
            .cloned()
            .ok_or_else(|| RpcError::no_such(format!("no such equipment: {}", profile)))
    }

    // allocation records

    /// Record an allocation. Workspaces may be allocated to the same
    /// session any number of times and carry no collateral.
    pub fn allocate(
        &mut self,
        resource: Profile,
        owner: Owner,
        collateral: &[Profile],
    ) -> RpcResult<()> {
        let id = resource.require_identity()?;
        if resource.is_workspace() {
            match self.allocations.get(&id).map(|a| &a.owner) {
                Some(current) if *current == owner => {}
                None => {
                    self.allocations.insert(
                        id,
                        Allocation {
                            profile: resource,
                            owner,
                            collateral: Vec::new(),
                        },
                    );
                }
                Some(_) => {
                    return Err(RpcError::busy(format!(
                        "resource already allocated: {}",
                        resource
                    )))
                }
            }
            return Ok(());
        }
        if self.allocations.contains_key(&id) {
            return Err(RpcError::busy(format!(
                "resource already allocated: {}",
                resource
            )));
        }
        for c in collateral {
            if let Some(cid) = c.identity() {
                self.collateral.entry(cid).or_default().push(owner.clone());
            }
        }
        self.allocations.insert(
            id,
            Allocation {
                profile: resource,
                owner,
                collateral: collateral.to_vec(),
            },
        );
        Ok(())
    }

    pub fn allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.values()
    }

    /// Allocated profiles owned by `session`, or all of them.
    pub fn list_allocations(&self, session: Option<&str>) -> Vec<Profile> {
        self.allocations
            .values()
            .filter(|a| session.map_or(true, |s| a.owner.session() == Some(s)))
            .map(|a| a.profile.clone())
            .collect()
    }

    /// Collateral of allocations owned by `session`, or of all of them.
    pub fn list_collateral(&self, session: Option<&str>) -> Vec<Profile> {
        let mut result: Vec<Profile> = Vec::new();
        for allocation in self.allocations.values() {
            if session.map_or(false, |s| allocation.owner.session() != Some(s)) {
                continue;
            }
            for c in &allocation.collateral {
                if !result.contains(c) {
                    result.push(c.clone());
                }
            }
        }
        result
    }

    fn deallocate(&mut self, id: &ResourceId) -> Option<Allocation> {
        let allocation = self.allocations.remove(id)?;
        for c in &allocation.collateral {
            let Some(cid) = c.identity() else {
                continue;
            };
            if let Some(owners) = self.collateral.get_mut(&cid) {
                if let Some(pos) = owners.iter().position(|o| *o == allocation.owner) {
                    owners.remove(pos);
                }
                if owners.is_empty() {
                    self.collateral.remove(&cid);
                }
            }
        }
        Some(allocation)
    }

    /// Remove one allocation owned by `session`.
    pub fn yield_resource(&mut self, session: &str, resource: &Profile) -> RpcResult<Allocation> {
        let Some(id) = resource.identity() else {
            return Err(RpcError::no_such("no such resource"));
        };
        let Some(allocation) = self.allocations.get(&id) else {
            return Err(RpcError::no_such("no such resource"));
        };
        match allocation.owner.session() {
            None => {
                return Err(RpcError::not_allocated(format!(
                    "no one owns this resource: {}",
                    resource
                )))
            }
            Some(owner) if owner != session => {
                return Err(RpcError::not_owner(format!(
                    "not owner of this resource: {}",
                    resource
                )))
            }
            Some(_) => {}
        }
        self.deallocate(&id)
            .ok_or_else(|| RpcError::no_such("no such resource"))
    }

    /// Remove every allocation owned by `session`.
    pub fn close_session(&mut self, session: &str) -> Vec<Allocation> {
        let owned: Vec<ResourceId> = self
            .allocations
            .iter()
            .filter(|(_, a)| a.owner.session() == Some(session))
            .map(|(id, _)| id.clone())
            .collect();
        owned.iter().filter_map(|id| self.deallocate(id)).collect()
    }

    /// Replace the allocation records wholesale and rebuild the collateral
    /// index from them.
    pub(crate) fn replace_allocations(&mut self, allocations: Vec<Allocation>) {
        self.allocations = allocations
            .into_iter()
            .filter_map(|a| a.profile.identity().map(|id| (id, a)))
            .collect();
        self.collateral.clear();
        for allocation in self.allocations.values() {
            for c in &allocation.collateral {
                if let Some(cid) = c.identity() {
                    self.collateral
                        .entry(cid)
                        .or_default()
                        .push(allocation.owner.clone());
                }
            }
        }
    }

    pub(crate) fn take_allocations(&mut self) -> Vec<Allocation> {
        self.collateral.clear();
        std::mem::take(&mut self.allocations).into_values().collect()
    }

    // stacks

    pub fn set_stacks(&mut self, stacks: Vec<Vec<Profile>>) -> RpcResult<()> {
        for stack in &stacks {
            for member in stack {
                member.require_identity()?;
                if member.is_workspace() {
                    return Err(RpcError::exception(format!(
                        "the stacked profile \"{}\" is a workspace. workspaces cannot be stacked",
                        member
                    )));
                }
            }
        }
        self.stacks = stacks;
        Ok(())
    }

    pub fn list_stacks(&self) -> &[Vec<Profile>] {
        &self.stacks
    }

    /// Members of every stack that contains an intended resource, minus
    /// the intended resources themselves.
    pub fn find_collateral(&self, intended: &[Profile]) -> Vec<Profile> {
        let mut result: Vec<Profile> = Vec::new();
        for resource in intended.iter().filter(|r| !r.is_workspace()) {
            for stack in self.stacks.iter().filter(|s| s.contains(resource)) {
                for member in stack {
                    if !intended.contains(member) && !result.contains(member) {
                        result.push(member.clone());
                    }
                }
            }
        }
        result
    }

    /// Whether every non-workspace request can be served by a distinct
    /// member of `stack`.
    fn match_stack(stack: &[Profile], profiles: &[Profile]) -> bool {
        let mut unclaimed: Vec<&Profile> = stack.iter().collect();
        for request in profiles.iter().filter(|p| !p.is_workspace()) {
            match unclaimed.iter().position(|member| member.matches(request)) {
                Some(pos) => {
                    unclaimed.remove(pos);
                }
                None => return false,
            }
        }
        true
    }

    // allocation algorithm

    /// At most one physical resource: pick the first available match.
    pub fn simple_allocation(
        &self,
        profiles: &[Profile],
    ) -> RpcResult<(Vec<Profile>, Vec<Profile>)> {
        let mut intended = Vec::new();
        for request in profiles.iter().filter(|p| !p.is_workspace()) {
            if self.list_equipment(Some(request)).is_empty() {
                return Err(RpcError::no_such(format!("no such resource: {}", request)));
            }
            let Some(choice) = self.list_available(Some(request)).into_iter().next() else {
                return Err(RpcError::busy(format!("all such equipment busy: {}", request)));
            };
            intended.push(choice);
        }
        let collateral = self.find_collateral(&intended);
        if collateral.iter().any(|c| self.is_allocated(c)) {
            return Err(RpcError::busy(
                "equipment shares collateral with a prior allocation",
            ));
        }
        Ok((intended, collateral))
    }

    /// Several physical resources: allocate a whole stack.
    ///
    /// Candidates are stacks whose members are all available and reachable
    /// and can serve every request. The shortest candidate wins, equal
    /// lengths are ordered by the sorted identities of their members.
    /// Candidates whose collateral is allocated by someone else are skipped.
    pub fn complex_allocation(
        &self,
        profiles: &[Profile],
    ) -> RpcResult<(Vec<Profile>, Vec<Profile>)> {
        let mut candidates: Vec<(usize, Vec<ResourceId>, Vec<Profile>)> = Vec::new();
        'stacks: for stack in &self.stacks {
            let mut filled = Vec::with_capacity(stack.len());
            for member in stack {
                if !self.is_available(member) {
                    continue 'stacks;
                }
                match self.fill_profile(member) {
                    Ok(live) => filled.push(live),
                    Err(_) => continue 'stacks,
                }
            }
            if Self::match_stack(&filled, profiles) {
                let mut ids: Vec<ResourceId> =
                    filled.iter().filter_map(Profile::identity).collect();
                ids.sort();
                candidates.push((filled.len(), ids, filled));
            }
        }
        candidates.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        for (_, _, intended) in candidates {
            let collateral = self.find_collateral(&intended);
            if collateral.iter().any(|c| self.is_allocated(c)) {
                continue;
            }
            return Ok((intended, collateral));
        }
        Err(RpcError::busy("cannot allocate all equipment together"))
    }

    /// Simple or complex depending on the number of physical requests.
    pub fn choose(&self, profiles: &[Profile]) -> RpcResult<(Vec<Profile>, Vec<Profile>)> {
        if profiles.iter().filter(|p| !p.is_workspace()).count() > 1 {
            self.complex_allocation(profiles)
        } else {
            self.simple_allocation(profiles)
        }
    }
}

/// Allocators of one broker. Iteration yields the local allocator first,
/// then shares in address order.
pub struct Allocators {
    local: LocalAllocator,
    shares: BTreeMap<HostPort, ShareAllocator>,
}

impl Allocators {
    pub fn new(local: LocalAllocator) -> Self {
        Self {
            local,
            shares: BTreeMap::new(),
        }
    }

    pub fn local(&self) -> &LocalAllocator {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut LocalAllocator {
        &mut self.local
    }

    pub fn share(&self, address: &HostPort) -> Option<&ShareAllocator> {
        self.shares.get(address)
    }

    /// The share allocator for `address`, created on first use. The flag
    /// tells whether it was just created.
    pub fn share_entry(&mut self, address: &HostPort) -> (&mut ShareAllocator, bool) {
        let created = !self.shares.contains_key(address);
        let share = self
            .shares
            .entry(address.clone())
            .or_insert_with(|| ShareAllocator::new(address.clone()));
        (share, created)
    }

    pub fn remove_share(&mut self, address: &HostPort) -> Option<ShareAllocator> {
        self.shares.remove(address)
    }

    pub fn keys(&self) -> Vec<AllocatorKey> {
        std::iter::once(AllocatorKey::Local)
            .chain(self.shares.keys().cloned().map(AllocatorKey::Remote))
            .collect()
    }

    pub fn get(&self, key: &AllocatorKey) -> Option<&dyn Allocator> {
        match key {
            AllocatorKey::Local => Some(&self.local),
            AllocatorKey::Remote(address) => {
                self.shares.get(address).map(|s| s as &dyn Allocator)
            }
        }
    }

    pub fn get_mut(&mut self, key: &AllocatorKey) -> Option<&mut dyn Allocator> {
        match key {
            AllocatorKey::Local => Some(&mut self.local),
            AllocatorKey::Remote(address) => self
                .shares
                .get_mut(address)
                .map(|s| s as &mut dyn Allocator),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (AllocatorKey, &dyn Allocator)> {
        std::iter::once((AllocatorKey::Local, &self.local as &dyn Allocator)).chain(
            self.shares
                .iter()
                .map(|(a, s)| (AllocatorKey::Remote(a.clone()), s as &dyn Allocator)),
        )
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (AllocatorKey, &mut dyn Allocator)> {
        std::iter::once((AllocatorKey::Local, &mut self.local as &mut dyn Allocator)).chain(
            self.shares
                .iter_mut()
                .map(|(a, s)| (AllocatorKey::Remote(a.clone()), s as &mut dyn Allocator)),
        )
    }
}
