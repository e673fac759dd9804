// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker, authkeys and workspace configuration.
//!
//! All files live under `<home>/.lab/config/`. Each file is checked on the
//! raw JSON value first so that problems are reported with the attribute
//! name and its required shape, then deserialized into typed structs.

use crate::profile::{Profile, ProfileKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Port the broker listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 4000;

/// Runtime home: the directory that holds `.lab/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Home {
    root: PathBuf,
}

impl Home {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `explicit`, else `$LAB_HOME`, else `$HOME`.
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        if let Some(root) = explicit {
            return Ok(Self::new(root));
        }
        for var in ["LAB_HOME", "HOME"] {
            if let Some(root) = std::env::var_os(var) {
                if !root.is_empty() {
                    return Ok(Self::new(root));
                }
            }
        }
        Err(ConfigError::InvalidValue(
            "home must be set (use --home, $LAB_HOME or $HOME)".into(),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join(".lab").join("config")
    }

    pub fn broker_config_path(&self) -> PathBuf {
        self.config_dir().join("broker.json")
    }

    pub fn authkeys_path(&self) -> PathBuf {
        self.config_dir().join("authkeys.json")
    }

    pub fn workspace_config_path(&self) -> PathBuf {
        self.config_dir().join("workspace.json")
    }

    /// Directory for diagnostic dumps.
    pub fn hickup_dir(&self) -> PathBuf {
        self.root.join(".lab").join("hickup")
    }
}

/// Federation policy toward the configured remote broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Share,
    Forward,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Share => f.write_str("share"),
            Self::Forward => f.write_str("forward"),
        }
    }
}

/// The `remote` section of the broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub policy: Policy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authkey: Option<String>,
}

impl RemoteConfig {
    pub fn address(&self) -> HostPort {
        HostPort::new(self.host.clone(), self.port)
    }
}

/// A `(host, port)` pair, serialized as a two element JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostPort(pub String, pub u16);

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self(host.into(), port)
    }

    pub fn host(&self) -> &str {
        &self.0
    }

    pub fn port(&self) -> u16 {
        self.1
    }

    /// Parse the `[host, port]` wire form.
    pub fn from_value(value: &Value) -> Option<Self> {
        let pair = value.as_array()?;
        if pair.len() != 2 {
            return None;
        }
        let host = pair[0].as_str()?;
        let port = u16::try_from(pair[1].as_u64()?).ok()?;
        Some(Self::new(host, port))
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!([self.0, self.1])
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

/// Broker configuration (`broker.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Host name advertised to clients (default: this host's name)
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port to listen on (default: 4000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Statically configured stacks
    #[serde(default)]
    pub stacks: Vec<Vec<Profile>>,

    /// Optional federation toward a master broker
    #[serde(default)]
    pub remote: Option<RemoteConfig>,

    /// Lowered to warnings when false
    #[serde(default = "default_true")]
    pub logging: bool,

    /// Static inventory handed to the local allocator at start
    #[serde(default)]
    pub equipment: Vec<Profile>,
}

fn default_host() -> String {
    hostname().unwrap_or_else(|| "localhost".to_string())
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            stacks: Vec::new(),
            remote: None,
            logging: true,
            equipment: Vec::new(),
        }
    }
}

const STACK_FORMAT: &str = "{\"stacks\":[<stack>, ...]}, where <stack> is a list that contains \
one or more profiles that uniquely identify equipment. e.g. \
[{\"type\":\"handset\", \"serial\":\"1\"}, {\"type\":\"relay\", \"uid\":\"2\"}]";

const EQUIPMENT_FORMAT: &str = "{\"equipment\":[<profile>, ...]}, where <profile> uniquely \
identifies one piece of equipment";

impl BrokerConfig {
    /// Load and validate `broker.json`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let value = load_json(path, "broker")?;
        Self::from_value(value)
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    /// Validate a raw configuration value and build the typed form.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let Value::Object(raw) = value else {
            return Err(ConfigError::InvalidValue(
                "broker configuration must be a JSON object".into(),
            ));
        };
        Self::validate_raw(&raw)?;
        serde_json::from_value(Value::Object(raw)).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn validate_raw(raw: &Map<String, Value>) -> Result<(), ConfigError> {
        if let Some(host) = raw.get("host") {
            if !host.is_string() {
                return Err(complain_format("broker", "host", "{\"host\":<string>}", host));
            }
        }
        if let Some(port) = raw.get("port") {
            if port.as_u64().and_then(|p| u16::try_from(p).ok()).is_none() {
                return Err(complain_format("broker", "port", "{\"port\":<integer>}", port));
            }
        }
        if let Some(logging) = raw.get("logging") {
            if !logging.is_boolean() {
                return Err(complain_format(
                    "broker",
                    "logging",
                    "{\"logging\":<bool>}",
                    logging,
                ));
            }
        }
        if let Some(stacks) = raw.get("stacks") {
            let Value::Array(stacks_list) = stacks else {
                return Err(complain_format("broker", "stacks", STACK_FORMAT, stacks));
            };
            for stack in stacks_list {
                let Value::Array(members) = stack else {
                    return Err(complain_format("broker", "stacks", STACK_FORMAT, stacks));
                };
                for member in members {
                    check_identified_profile(member, "stacks", STACK_FORMAT, stacks)?;
                    if member.get("type") == Some(&Value::String("workspace".into())) {
                        return Err(ConfigError::InvalidValue(format!(
                            "the stacked profile \"{}\" is a workspace. workspaces cannot be stacked",
                            member
                        )));
                    }
                }
            }
        }
        if let Some(equipment) = raw.get("equipment") {
            let Value::Array(profiles) = equipment else {
                return Err(complain_format("broker", "equipment", EQUIPMENT_FORMAT, equipment));
            };
            for profile in profiles {
                check_identified_profile(profile, "equipment", EQUIPMENT_FORMAT, equipment)?;
            }
        }
        match raw.get("remote") {
            None | Some(Value::Null) => {}
            Some(remote) => Self::validate_remote(remote)?,
        }
        Ok(())
    }

    fn validate_remote(remote: &Value) -> Result<(), ConfigError> {
        let shape_ok = remote.as_object().map_or(false, |r| {
            r.get("host").map_or(false, Value::is_string)
                && r
                    .get("port")
                    .and_then(Value::as_u64)
                    .map_or(false, |p| u16::try_from(p).is_ok())
                && r.get("policy").map_or(false, Value::is_string)
        });
        if !shape_ok {
            return Err(complain_format(
                "broker",
                "remote",
                "{\"remote\":{\"host\":<string>, \"port\":<integer>, \"policy\":<string>}",
                remote,
            ));
        }
        let policy = remote.get("policy").and_then(Value::as_str).unwrap_or_default();
        if policy != "share" && policy != "forward" {
            return Err(ConfigError::InvalidValue(
                "broker configuration: remote policy must be \"share\" or \"forward\"".into(),
            ));
        }
        if policy == "share" {
            match remote.get("authkey") {
                None => {
                    return Err(ConfigError::InvalidValue(
                        "broker configuration: remote sharing authkey not set. example:\n\
                         \"remote\":{\n    \"host\":\"hostname\", \"port\":4000,\n    \
                         \"policy\":\"share\", \"authkey\":\"admin_key\"\n}"
                            .into(),
                    ))
                }
                Some(Value::String(_)) => {}
                Some(_) => {
                    return Err(ConfigError::InvalidValue(
                        "broker configuration: remote sharing authkey must be a string".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn address(&self) -> HostPort {
        HostPort::new(self.host.clone(), self.port)
    }

    pub fn policy(&self) -> Option<Policy> {
        self.remote.as_ref().map(|r| r.policy)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn check_identified_profile(
    profile: &Value,
    attribute: &str,
    format: &str,
    current: &Value,
) -> Result<(), ConfigError> {
    let Value::Object(map) = profile else {
        return Err(complain_format("broker", attribute, format, current));
    };
    match map.get("type").and_then(Value::as_str) {
        None => {
            return Err(ConfigError::InvalidValue(format!(
                "the stacked profile \"{}\" does not contain the \"type\" attribute",
                profile
            )))
        }
        Some(kind) if ProfileKind::parse(kind).is_none() => {
            return Err(ConfigError::InvalidValue(format!(
                "the stacked profile \"{}\" has an unknown type: {}",
                profile, kind
            )))
        }
        Some(_) => {}
    }
    if !["serial", "imei", "uid"].iter().any(|k| map.contains_key(*k)) {
        return Err(ConfigError::InvalidValue(format!(
            "the stacked profile \"{}\" does not contain at least one attribute that \
             uniquely identifies any equipment. (use \"serial\" or \"imei\" for handsets, \
             \"uid\" for other equipment)",
            profile
        )));
    }
    Ok(())
}

fn complain_format(scope: &str, attribute: &str, format: &str, current: &Value) -> ConfigError {
    ConfigError::InvalidValue(format!(
        "{} attribute \"{}\" must be on the form {}. current value={} (type={})",
        scope,
        attribute,
        format,
        current,
        json_type_name(current)
    ))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn load_json(path: &Path, what: &str) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NoSuchFile(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| {
        ConfigError::Parse(format!("could not load {} configuration file: {}", what, e))
    })
}

/// Account name to secret. A `null` secret means the account is open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Authkeys(BTreeMap<String, Option<String>>);

impl Authkeys {
    /// Load `authkeys.json`. A missing file means no accounts.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let value = load_json(path, "authkeys")?;
        let Value::Object(map) = value else {
            return Err(ConfigError::InvalidValue(format!(
                "invalid config file {}: must be a JSON object",
                path.display()
            )));
        };
        let mut keys = BTreeMap::new();
        for (account, secret) in map {
            match secret {
                Value::Null => {
                    keys.insert(account, None);
                }
                Value::String(s) if s.is_empty() => {
                    keys.insert(account, None);
                }
                Value::String(s) => {
                    keys.insert(account, Some(s));
                }
                other => {
                    return Err(ConfigError::InvalidValue(format!(
                        "invalid config file {}: value of \"{}\" is not a string: {}",
                        path.display(),
                        account,
                        json_type_name(&other)
                    )))
                }
            }
        }
        Ok(Self(keys))
    }

    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    pub fn get(&self, account: &str) -> Option<&str> {
        self.0.get(account).and_then(|s| s.as_deref())
    }

    pub fn insert(&mut self, account: impl Into<String>, secret: Option<String>) {
        self.0.insert(account.into(), secret);
    }

    /// Every non-null secret, in account order.
    pub fn secrets(&self) -> impl Iterator<Item = &str> {
        self.0.values().filter_map(|s| s.as_deref())
    }
}

impl FromIterator<(String, Option<String>)> for Authkeys {
    fn from_iter<I: IntoIterator<Item = (String, Option<String>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Generic workspace configuration (`workspace.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Directory under which every workspace is created
    pub root: String,

    /// Tool name to path
    #[serde(default)]
    pub tools: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pretty: Option<String>,

    #[serde(
        rename = "wifi-capable",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub wifi_capable: Option<bool>,

    /// Attributes without dedicated handling
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkspaceConfig {
    pub fn default_for(home: &Home) -> Self {
        Self {
            root: home.path().join(".lab").join("workspaces").display().to_string(),
            tools: Map::new(),
            pretty: None,
            wifi_capable: None,
            extra: Map::new(),
        }
    }

    /// Load `workspace.json`, or the defaults when the file is absent.
    pub fn load(home: &Home) -> Result<Self, ConfigError> {
        let path = home.workspace_config_path();
        if !path.exists() {
            return Ok(Self::default_for(home));
        }
        let value = load_json(&path, "workspace")?;
        Self::from_value(value, home)
    }

    pub fn from_value(value: Value, home: &Home) -> Result<Self, ConfigError> {
        let Value::Object(mut raw) = value else {
            return Err(ConfigError::InvalidValue(
                "workspace configuration must be a JSON object".into(),
            ));
        };
        match raw.get("root") {
            None => {
                return Err(ConfigError::InvalidValue(
                    "workspace root directory is not configured".into(),
                ))
            }
            Some(Value::String(root)) => {
                let home = home.path().display().to_string();
                let expanded = root.replace("$HOME", &home).replace('~', &home);
                raw.insert("root".into(), Value::String(expanded));
            }
            Some(other) => {
                return Err(complain_format("workspace", "root", "{\"root\":<string>}", other))
            }
        }
        if let Some(tools) = raw.get("tools") {
            if !tools.is_object() {
                return Err(complain_format("workspace", "tools", "{\"tools\":<object>}", tools));
            }
        }
        if let Some(wifi) = raw.get("wifi-capable") {
            if !wifi.is_boolean() {
                return Err(complain_format(
                    "workspace",
                    "wifi-capable",
                    "{\"wifi-capable\": <bool>}",
                    wifi,
                ));
            }
        }
        if let Some(pretty) = raw.get("pretty") {
            if !pretty.is_string() {
                return Err(complain_format(
                    "workspace",
                    "pretty",
                    "{\"pretty\":<string>}",
                    pretty,
                ));
            }
        }
        raw.remove("uid");
        raw.remove("type");
        serde_json::from_value(Value::Object(raw)).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// The generic workspace profile: every configured attribute, no uid.
    pub fn profile(&self) -> Profile {
        let fields = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        Profile::of_kind(ProfileKind::Workspace, fields)
    }
}

/// Configuration error types.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialize error: {0}")]
    Serialize(String),
    #[error("{0}")]
    InvalidValue(String),
    #[error("no such configuration file: {}", .0.display())]
    NoSuchFile(PathBuf),
}

/// This host's name, if the system reports one.
pub fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes and gethostname NUL terminates
    // on success when the name fits.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).into_owned();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
