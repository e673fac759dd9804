// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mirror of a peer broker's inventory.
//!
//! The peer pushes its equipment, stacks and allocations through its
//! notifier. Allocating here only books the equipment so that concurrent
//! requests do not pick it as well; the client is then sent to the peer
//! with a `Shared` answer.

use super::{Allocation, Allocator, Grant, Inventory, Owner};
use crate::config::HostPort;
use crate::error::{RpcError, RpcResult};
use crate::profile::Profile;
use serde_json::{Map, Value};

pub struct ShareAllocator {
    address: HostPort,
    inventory: Inventory,
}

impl ShareAllocator {
    pub fn new(address: HostPort) -> Self {
        Self {
            address,
            inventory: Inventory::new(),
        }
    }

    pub fn address(&self) -> &HostPort {
        &self.address
    }

    /// Replace the mirrored equipment. Allocations made through this broker
    /// survive, every allocation the peer reports that is not already known
    /// is recorded as foreign.
    pub fn set_equipment(&mut self, equipment: Vec<Profile>, allocations: &Value) -> RpcResult<()> {
        let reported = parse_allocations(allocations)?;
        self.inventory.set_equipment(equipment);

        let mut kept: Vec<Allocation> = self
            .inventory
            .take_allocations()
            .into_iter()
            .filter(|a| matches!(a.owner, Owner::Session(_)))
            .collect();
        for (profile, collateral) in reported {
            if kept.iter().any(|a| a.profile == profile) {
                continue;
            }
            kept.push(Allocation {
                profile,
                owner: Owner::Foreign,
                collateral,
            });
        }
        self.inventory.replace_allocations(kept);
        Ok(())
    }
}

/// `{key: [{profile, collateral}, ...], ...}` to (profile, collateral) pairs.
fn parse_allocations(value: &Value) -> RpcResult<Vec<(Profile, Vec<Profile>)>> {
    let Value::Object(entries) = value else {
        return Err(RpcError::exception("allocations must be a dictionary"));
    };
    let mut result = Vec::new();
    for records in entries.values() {
        let Value::Array(records) = records else {
            return Err(RpcError::exception("allocation records must be a list"));
        };
        for record in records {
            let profile = record
                .get("profile")
                .cloned()
                .ok_or_else(|| RpcError::exception("allocation detail has no profile"))?;
            let collateral = match record.get("collateral") {
                Some(Value::Array(c)) => c.clone(),
                Some(_) => return Err(RpcError::exception("allocation collateral is not a list")),
                None => return Err(RpcError::exception("allocation detail has no collateral")),
            };
            let collateral = collateral
                .into_iter()
                .map(Profile::from_value)
                .collect::<Result<Vec<_>, _>>()?;
            result.push((Profile::from_value(profile)?, collateral));
        }
    }
    Ok(result)
}

impl Allocator for ShareAllocator {
    fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    fn inventory_mut(&mut self) -> &mut Inventory {
        &mut self.inventory
    }

    /// Book the equipment, then point the caller at the peer.
    fn get_resources(&mut self, profiles: &[Profile], session: &str) -> RpcResult<Grant> {
        let (intended, collateral) = self.inventory.choose(profiles)?;
        for resource in intended {
            self.inventory
                .allocate(resource, Owner::Session(session.to_string()), &collateral)?;
        }
        Err(RpcError::shared())
    }

    /// The equipment is gone from the mirror until the peer pushes again.
    fn yield_resource(&mut self, session: &str, resource: &Profile) -> RpcResult<Vec<Profile>> {
        let allocation = self.inventory.yield_resource(session, resource)?;
        self.inventory.remove_equipment(&allocation.profile);
        Ok(Vec::new())
    }

    fn close_session(&mut self, session: &str) -> Vec<Profile> {
        for allocation in self.inventory.close_session(session) {
            self.inventory.remove_equipment(&allocation.profile);
        }
        Vec::new()
    }

    /// Index-keyed, one record per allocation.
    fn serialize(&self) -> Value {
        let result: Map<String, Value> = self
            .inventory
            .allocations()
            .enumerate()
            .map(|(i, a)| (i.to_string(), Value::Array(vec![a.record()])))
            .collect();
        Value::Object(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn p(value: Value) -> Profile {
        Profile::from_value(value).unwrap()
    }

    fn share() -> ShareAllocator {
        let mut share = ShareAllocator::new(HostPort::new("peer", 4000));
        share
            .inventory_mut()
            .set_stacks(vec![vec![
                p(json!({"type": "relay", "uid": "A"})),
                p(json!({"type": "handset", "serial": "h1"})),
            ]])
            .unwrap();
        share
            .set_equipment(
                vec![
                    p(json!({"type": "relay", "uid": "A"})),
                    p(json!({"type": "handset", "serial": "h1"})),
                    p(json!({"type": "handset", "serial": "h2"})),
                ],
                &json!({}),
            )
            .unwrap();
        share
    }

    #[test]
    fn test_allocation_books_and_defers() {
        let mut share = share();
        let err = share
            .get_resources(&[p(json!({"type": "handset", "serial": "h2"}))], "s1")
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Shared);
        assert_eq!(share.inventory().list_allocations(Some("s1")).len(), 1);

        let err = share
            .get_resources(&[p(json!({"type": "handset", "serial": "h2"}))], "s2")
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Busy);

        assert!(share
            .yield_resource("s1", &p(json!({"type": "handset", "serial": "h2"})))
            .unwrap()
            .is_empty());
        assert_eq!(share.inventory().list_equipment(None).len(), 2);
    }

    #[test]
    fn test_foreign_allocations_and_collateral() {
        let mut share = share();
        share
            .set_equipment(
                share.inventory().list_equipment(None),
                &json!({"tok": [{"profile": {"type": "relay", "uid": "A"},
                    "collateral": [{"type": "handset", "serial": "h1"}]}]}),
            )
            .unwrap();
        let h1 = p(json!({"type": "handset", "serial": "h1"}));
        assert!(share.inventory().has_collateral(&h1));
        let relay = p(json!({"type": "relay", "uid": "A"}));
        assert_eq!(share.inventory().owner_of(&relay), Some(&Owner::Foreign));

        let err = share.yield_resource("s1", &relay).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::NotAllocated);

        let serialized = share.serialize();
        assert_eq!(serialized["0"][0]["profile"]["uid"], json!("A"));
    }

    #[test]
    fn test_push_keeps_local_bookings() {
        let mut share = share();
        let h2 = p(json!({"type": "handset", "serial": "h2"}));
        let _ = share.get_resources(&[h2.clone()], "s1");
        let equipment = share.inventory().list_equipment(None);
        share
            .set_equipment(
                equipment,
                &json!({"0": [{"profile": {"type": "handset", "serial": "h2"},
                    "collateral": []}]}),
            )
            .unwrap();
        assert_eq!(
            share.inventory().owner_of(&h2),
            Some(&Owner::Session("s1".into()))
        );
        assert!(share.set_equipment(vec![], &json!([])).is_err());
    }
}
