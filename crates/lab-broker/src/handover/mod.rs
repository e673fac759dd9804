// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Live handover between broker processes.
//!
//! The outgoing broker serializes every session that holds allocations,
//! then hands each session's supervising socket to the incoming broker over
//! an [`fdtx`] channel. The incoming broker validates the serialized state
//! strictly before it adopts anything.
//!
//! ```text
//! old: RUNNING -> HANDOVER_BEGUN -> DRAINING -> TERMINATED
//! new:            STARTING -> ADOPTING -> RUNNING
//! ```

pub mod fdtx;

pub use fdtx::{FdReceiver, FdSender};

use crate::config::{BrokerConfig, HostPort};
use crate::error::RpcError;
use crate::profile::Profile;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Handover failures.
#[derive(Debug, Error)]
pub enum HandoverError {
    #[error("directory not writable: {}", .0.display())]
    NotWritable(PathBuf),
    #[error("{0}")]
    Invalid(String),
    #[error("fd channel {op} failed on {}: {source}", .path.display())]
    Channel {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("fd channel is not connected")]
    NotConnected,
    #[error("no connection on the fd channel within {0:?}")]
    Timeout(Duration),
    #[error("fd channel protocol error: {0}")]
    Protocol(String),
}

impl HandoverError {
    pub(crate) fn channel(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Channel {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<HandoverError> for RpcError {
    #[track_caller]
    fn from(e: HandoverError) -> Self {
        RpcError::exception(e.to_string())
    }
}

/// One allocation of a session: the resource and the collateral it blocks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationRecord {
    pub profile: Profile,
    pub collateral: Vec<Profile>,
}

/// A session as the outgoing broker knows it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub pid: u32,
    pub address: HostPort,
    pub allocations: Vec<AllocationRecord>,
}

/// Sessions by authkey.
pub type Serialized = BTreeMap<String, SessionRecord>;

pub fn serialized_to_value(serialized: &Serialized) -> Value {
    serde_json::to_value(serialized).unwrap_or(Value::Null)
}

fn invalid(message: String) -> HandoverError {
    HandoverError::Invalid(message)
}

/// Check serialized broker state field by field and rebuild every profile
/// through the profile factory.
pub fn validate_serialized(serialized: &Value) -> Result<Serialized, HandoverError> {
    let Value::Object(sessions) = serialized else {
        return Err(invalid("serialized data must be a dictionary".into()));
    };
    let mut validated = Serialized::new();
    for (authkey, details) in sessions {
        let Value::Object(fields) = details else {
            return Err(invalid(format!("session details must be a dictionary: {}", details)));
        };
        let pid = match fields.get("pid") {
            None => return Err(invalid(format!("details do not include pid: {}", details))),
            Some(pid) => pid
                .as_u64()
                .and_then(|p| u32::try_from(p).ok())
                .ok_or_else(|| invalid(format!("\"pid\" detail is not an integer: {}", details)))?,
        };
        let address = match fields.get("address") {
            None => {
                return Err(invalid(format!(
                    "details do not include address: {}",
                    details
                )))
            }
            Some(Value::Array(_)) => {
                HostPort::from_value(&fields["address"]).ok_or_else(|| {
                    invalid(format!(
                        "\"address\" detail is not a (string,int) tuple: {}",
                        details
                    ))
                })?
            }
            Some(_) => {
                return Err(invalid(format!(
                    "\"address\" detail is not a list: {}",
                    details
                )))
            }
        };
        let raw_allocations = match fields.get("allocations") {
            None => {
                return Err(invalid(format!(
                    "details do not include allocations: {}",
                    details
                )))
            }
            Some(Value::Array(list)) => list,
            Some(_) => {
                return Err(invalid(format!(
                    "\"allocations\" detail is not a list: {}",
                    details
                )))
            }
        };
        let mut allocations = Vec::with_capacity(raw_allocations.len());
        for alloc in raw_allocations {
            allocations.push(validate_allocation(alloc)?);
        }
        validated.insert(
            authkey.clone(),
            SessionRecord {
                pid,
                address,
                allocations,
            },
        );
    }
    Ok(validated)
}

fn validate_allocation(alloc: &Value) -> Result<AllocationRecord, HandoverError> {
    let rebuild = |value: &Value| {
        Profile::from_value(value.clone())
            .map_err(|e| invalid(format!("invalid profile in allocation: {}: {}", value, e)))
    };
    let Some(profile) = alloc.get("profile") else {
        return Err(invalid(format!("allocation detail has no profile: {}", alloc)));
    };
    let collateral = match alloc.get("collateral") {
        None => {
            return Err(invalid(format!(
                "allocation detail has no collateral: {}",
                alloc
            )))
        }
        Some(Value::Array(list)) => list.iter().map(rebuild).collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(invalid(format!(
                "allocation collateral is not a list: {}",
                alloc
            )))
        }
    };
    Ok(AllocationRecord {
        profile: rebuild(profile)?,
        collateral,
    })
}

/// Everything a replacement broker needs to take over.
#[derive(Debug, Clone)]
pub struct Adoption {
    pub serialized: Serialized,
    pub config: BrokerConfig,
    pub fdtx_path: PathBuf,
}

impl Adoption {
    /// Build from the `[serialized, config, fdtx_path]` triple returned by
    /// `begin_handover`.
    pub fn from_handover(reply: &Value) -> Result<Self, HandoverError> {
        let parts = reply
            .as_array()
            .filter(|parts| parts.len() == 3)
            .ok_or_else(|| invalid(format!("malformed handover reply: {}", reply)))?;
        let mut map = Map::new();
        map.insert("serialized".into(), parts[0].clone());
        map.insert("config".into(), parts[1].clone());
        map.insert("fdtx_path".into(), parts[2].clone());
        Self::from_value(&Value::Object(map))
    }

    pub fn from_value(value: &Value) -> Result<Self, HandoverError> {
        let serialized = validate_serialized(value.get("serialized").unwrap_or(&Value::Null))?;
        let config = BrokerConfig::from_value(value.get("config").cloned().unwrap_or(Value::Null))
            .map_err(|e| invalid(format!("adopted configuration: {}", e)))?;
        let fdtx_path = value
            .get("fdtx_path")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| invalid("adoption data must come with an fdtx path".into()))?;
        Ok(Self {
            serialized,
            config,
            fdtx_path,
        })
    }

    pub fn to_value(&self) -> Value {
        json!({
            "serialized": serialized_to_value(&self.serialized),
            "config": self.config.to_value(),
            "fdtx_path": self.fdtx_path.display().to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, HandoverError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HandoverError::channel("read", path, e))?;
        let value: Value = serde_json::from_str(&content)
            .map_err(|e| invalid(format!("adoption file {}: {}", path.display(), e)))?;
        Self::from_value(&value)
    }

    pub fn to_file(&self, path: &Path) -> Result<(), HandoverError> {
        let content = serde_json::to_string_pretty(&self.to_value())
            .map_err(|e| invalid(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| HandoverError::channel("write", path, e))
    }

    /// Receive the session sockets from the outgoing broker. Blocks.
    ///
    /// Sockets of sessions missing from the serialized state are dropped:
    /// those sessions held nothing worth adopting.
    pub fn receive_sessions(
        &self,
        timeout: Duration,
    ) -> Result<BTreeMap<String, OwnedFd>, HandoverError> {
        let mut receiver = fdtx::FdReceiver::connect(&self.fdtx_path, timeout)?;
        let mut received = BTreeMap::new();
        while let Some((authkey, fd)) = receiver.get()? {
            if self.serialized.contains_key(&authkey) {
                received.insert(authkey, fd);
            } else {
                debug!("dropping socket of session {} without allocations", authkey);
            }
        }
        info!(
            "received {} of {} session sockets",
            received.len(),
            self.serialized.len()
        );
        Ok(received)
    }
}

/// Fail early when `dir` exists but cannot hold the fd channel.
pub fn check_fdtx_dir(dir: &Path) -> Result<(), HandoverError> {
    if !dir.is_dir() {
        return Ok(());
    }
    let Some(c_path) = dir
        .to_str()
        .and_then(|p| std::ffi::CString::new(p).ok())
    else {
        return Err(HandoverError::NotWritable(dir.to_path_buf()));
    };
    // SAFETY: c_path is a valid NUL terminated string.
    let rc = unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK | libc::X_OK) };
    if rc != 0 {
        return Err(HandoverError::NotWritable(dir.to_path_buf()));
    }
    Ok(())
}
