// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Resource profiles.
//!
//! A profile is a JSON object with a `type` discriminator. The discriminator
//! selects a [`ProfileKind`], which decides the identity fields, the match
//! rules and the minimize projection. Profiles travel over the wire as plain
//! objects and are rebuilt through [`Profile::from_value`] on arrival.

use crate::error::RpcError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Kinds a client may request from the broker.
pub const ALLOCATABLE_KINDS: [ProfileKind; 7] = [
    ProfileKind::Workspace,
    ProfileKind::Handset,
    ProfileKind::Relay,
    ProfileKind::Testdrive,
    ProfileKind::Beryllium,
    ProfileKind::Wlan,
    ProfileKind::Powermeter,
];

/// Profile discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    Handset,
    Relay,
    Workspace,
    Testdrive,
    Beryllium,
    Wlan,
    Powermeter,
    Broker,
}

impl ProfileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handset => "handset",
            Self::Relay => "relay",
            Self::Workspace => "workspace",
            Self::Testdrive => "testdrive",
            Self::Beryllium => "beryllium",
            Self::Wlan => "wlan",
            Self::Powermeter => "powermeter",
            Self::Broker => "broker",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "handset" => Some(Self::Handset),
            "relay" => Some(Self::Relay),
            "workspace" => Some(Self::Workspace),
            "testdrive" => Some(Self::Testdrive),
            "beryllium" => Some(Self::Beryllium),
            "wlan" => Some(Self::Wlan),
            "powermeter" => Some(Self::Powermeter),
            "broker" => Some(Self::Broker),
            _ => None,
        }
    }

    pub fn is_allocatable(self) -> bool {
        ALLOCATABLE_KINDS.contains(&self)
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Profile construction errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    #[error("profile is not an object: {0}")]
    NotAnObject(String),
    #[error("profile \"type\" attribute is missing")]
    MissingType,
    #[error("type {0} not supported in profiles")]
    Unsupported(String),
    #[error("profile has no unique identity: {0}")]
    NoIdentity(String),
}

impl From<ProfileError> for RpcError {
    #[track_caller]
    fn from(e: ProfileError) -> Self {
        RpcError::exception(e.to_string())
    }
}

/// Identity of one piece of equipment or one workspace.
///
/// Ordering is lexicographic on (kind, key) and is used wherever the
/// allocator needs a deterministic order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub kind: ProfileKind,
    pub key: String,
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.key)
    }
}

/// A typed key/value description of a resource.
#[derive(Debug, Clone)]
pub struct Profile {
    kind: ProfileKind,
    fields: Map<String, Value>,
}

impl Profile {
    /// Profile factory. The `type` field must name a known kind.
    pub fn from_value(value: Value) -> Result<Self, ProfileError> {
        let fields = match value {
            Value::Object(map) => map,
            other => return Err(ProfileError::NotAnObject(other.to_string())),
        };
        let kind = match fields.get("type") {
            None => return Err(ProfileError::MissingType),
            Some(Value::String(name)) => {
                ProfileKind::parse(name).ok_or_else(|| ProfileError::Unsupported(name.clone()))?
            }
            Some(other) => return Err(ProfileError::Unsupported(other.to_string())),
        };
        Ok(Self { kind, fields })
    }

    /// Build a profile of the given kind from attribute pairs.
    pub fn of_kind(kind: ProfileKind, attributes: Map<String, Value>) -> Self {
        let mut fields = attributes;
        fields.insert("type".into(), Value::String(kind.as_str().into()));
        Self { kind, fields }
    }

    pub fn kind(&self) -> ProfileKind {
        self.kind
    }

    pub fn is_workspace(&self) -> bool {
        self.kind == ProfileKind::Workspace
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if key != "type" {
            self.fields.insert(key, value);
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// The identity of the profile, if it carries one.
    pub fn identity(&self) -> Option<ResourceId> {
        let field = |name: &str| match self.fields.get(name) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        let key = match self.kind {
            ProfileKind::Handset => field("serial").or_else(|| field("imei")),
            ProfileKind::Broker => None,
            _ => field("uid"),
        }?;
        Some(ResourceId {
            kind: self.kind,
            key,
        })
    }

    /// Like [`identity`](Self::identity) but an error when absent.
    pub fn require_identity(&self) -> Result<ResourceId, ProfileError> {
        self.identity()
            .ok_or_else(|| ProfileError::NoIdentity(self.to_string()))
    }

    /// Check this profile against a query.
    pub fn matches(&self, query: &Profile) -> bool {
        if query.kind != self.kind {
            return false;
        }
        match self.kind {
            ProfileKind::Relay => self.match_relay(query),
            ProfileKind::Workspace => self.match_workspace(query),
            _ => self.match_subset(query, &[]),
        }
    }

    fn match_subset(&self, query: &Profile, skip: &[&str]) -> bool {
        query
            .fields
            .iter()
            .filter(|(key, _)| !skip.contains(&key.as_str()))
            .all(|(key, value)| self.fields.get(key) == Some(value))
    }

    fn match_relay(&self, query: &Profile) -> bool {
        if let Some(uid) = query.get("uid") {
            if self.get("uid") != Some(uid) {
                return false;
            }
        }
        if let Some(wanted) = query.get("circuits") {
            let Some(Value::Object(mine)) = self.get("circuits") else {
                return false;
            };
            let ok = match wanted {
                Value::Array(names) => names
                    .iter()
                    .all(|n| n.as_str().map_or(false, |n| mine.contains_key(n))),
                Value::Object(circuits) => circuits.iter().all(|(name, value)| {
                    match mine.get(name) {
                        None => false,
                        Some(have) => value.is_null() || have == value,
                    }
                }),
                _ => false,
            };
            if !ok {
                return false;
            }
        }
        self.match_subset(query, &["uid", "circuits"])
    }

    fn match_workspace(&self, query: &Profile) -> bool {
        if let Some(uid) = query.get("uid") {
            if self.get("uid") != Some(uid) {
                return false;
            }
        }
        if let Some(wanted) = query.get("tools") {
            let Some(Value::Object(mine)) = self.get("tools") else {
                return false;
            };
            let names: Vec<&str> = match wanted {
                Value::Array(names) => names.iter().filter_map(Value::as_str).collect(),
                Value::Object(tools) => tools.keys().map(String::as_str).collect(),
                _ => return false,
            };
            if !names.iter().all(|n| mine.contains_key(*n)) {
                return false;
            }
        }
        for key in ["pretty", "wifi-capable"] {
            if let Some(value) = query.get(key) {
                if self.get(key) != Some(value) {
                    return false;
                }
            }
        }
        true
    }

    /// Project this profile down to mandatory attributes plus whatever the
    /// request asked for.
    pub fn minimize(&self, request: Option<&Profile>) -> Profile {
        let mut out = Map::new();
        let copy = |out: &mut Map<String, Value>, key: &str| {
            if let Some(value) = self.fields.get(key) {
                out.insert(key.to_string(), value.clone());
            }
        };
        let overlay = |out: &mut Map<String, Value>| {
            if let Some(request) = request {
                for (key, value) in &request.fields {
                    out.insert(key.clone(), value.clone());
                }
            }
        };
        match self.kind {
            ProfileKind::Handset => {
                for key in [
                    "serial",
                    "sysfs_path",
                    "pretty",
                    "power_state",
                    "product.model",
                    "workstation",
                    "platform",
                    "usb.vid",
                ] {
                    copy(&mut out, key);
                }
                overlay(&mut out);
            }
            ProfileKind::Relay => {
                copy(&mut out, "uid");
                out.insert("circuits".into(), Value::Object(Map::new()));
                if let Some(request) = request {
                    self.project_named(&mut out, request, "circuits");
                }
            }
            ProfileKind::Workspace => {
                copy(&mut out, "root");
                copy(&mut out, "uid");
                out.insert("tools".into(), Value::Object(Map::new()));
                if let Some(request) = request {
                    self.project_named(&mut out, request, "tools");
                }
            }
            ProfileKind::Powermeter => {
                for key in ["uid", "product", "device_node"] {
                    copy(&mut out, key);
                }
                overlay(&mut out);
            }
            ProfileKind::Testdrive => {
                copy(&mut out, "uid");
                out.insert("vendor".into(), Value::String("spirent".into()));
                overlay(&mut out);
            }
            ProfileKind::Beryllium | ProfileKind::Wlan => {
                copy(&mut out, "uid");
                overlay(&mut out);
            }
            ProfileKind::Broker => {
                out = self.fields.clone();
            }
        }
        Profile::of_kind(self.kind, out)
    }

    /// Copy requested attributes from `self`. The `nested` attribute holds a
    /// map (circuits, tools) of which only the requested names are copied.
    fn project_named(&self, out: &mut Map<String, Value>, request: &Profile, nested: &str) {
        for (key, value) in &request.fields {
            if key == "type" {
                continue;
            }
            if key == nested {
                let names: Vec<String> = match value {
                    Value::Array(names) => names
                        .iter()
                        .filter_map(|n| n.as_str().map(String::from))
                        .collect(),
                    Value::Object(map) => map.keys().cloned().collect(),
                    _ => Vec::new(),
                };
                let mine = self.fields.get(nested).and_then(Value::as_object);
                let mut projected = Map::new();
                for name in names {
                    if let Some(v) = mine.and_then(|m| m.get(&name)) {
                        projected.insert(name, v.clone());
                    }
                }
                out.insert(nested.to_string(), Value::Object(projected));
            } else if let Some(mine) = self.fields.get(key) {
                out.insert(key.clone(), mine.clone());
            }
        }
    }
}

/// Equality is identity equality. Profiles without identity are never equal.
impl PartialEq for Profile {
    fn eq(&self, other: &Self) -> bool {
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.fields.clone()))
    }
}

impl Serialize for Profile {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Profile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Profile::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Strip secrets from a broker configuration to make its public profile.
pub fn broker_profile(config: &Value) -> Profile {
    let mut fields = config.as_object().cloned().unwrap_or_default();
    fields.remove("authkeys");
    if let Some(Value::Object(remote)) = fields.get_mut("remote") {
        remote.remove("authkey");
    }
    Profile::of_kind(ProfileKind::Broker, fields)
}
