// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Workspace storage.
//!
//! A workspace is a directory `<root>/<uid>` created on first allocation.
//! The uid is ten random digits, prefixed by the configured `pretty` name.

use crate::config::WorkspaceConfig;
use crate::control::auth::rand_digits;
use crate::error::{RpcError, RpcResult};
use crate::profile::{Profile, ProfileKind};
use ring::rand::SystemRandom;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

const UID_DIGITS: usize = 10;

#[derive(Debug, Clone)]
pub struct Workspace {
    uid: String,
    config: WorkspaceConfig,
}

impl Workspace {
    /// Create a workspace with a fresh uid.
    pub fn create(config: &WorkspaceConfig, rng: &SystemRandom) -> RpcResult<Self> {
        let digits = rand_digits(rng, UID_DIGITS)?;
        let uid = match &config.pretty {
            Some(pretty) => format!("{}-{}", pretty, digits),
            None => digits,
        };
        Self::open(config, &uid)
    }

    /// Handle on workspace `uid` without touching the filesystem.
    pub fn new(config: &WorkspaceConfig, uid: &str) -> RpcResult<Self> {
        if uid.is_empty() || uid.contains('/') || uid == "." || uid == ".." {
            return Err(RpcError::exception(format!("invalid workspace uid: {}", uid)));
        }
        Ok(Self {
            uid: uid.to_string(),
            config: config.clone(),
        })
    }

    /// Open the workspace `uid`, creating its directory if needed.
    pub fn open(config: &WorkspaceConfig, uid: &str) -> RpcResult<Self> {
        let workspace = Self::new(config, uid)?;
        let path = workspace.path();
        std::fs::create_dir_all(&path).map_err(|e| {
            RpcError::exception(format!(
                "could not create directory at {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(workspace)
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn root(&self) -> &Path {
        Path::new(&self.config.root)
    }

    pub fn path(&self) -> PathBuf {
        self.root().join(&self.uid)
    }

    /// The generic profile plus this workspace's uid.
    pub fn profile(&self) -> Profile {
        let mut profile = self.config.profile();
        profile.insert("uid", Value::String(self.uid.clone()));
        profile
    }

    /// Remove the workspace directory. A directory someone else already
    /// removed is fine.
    pub fn delete(&self) -> io::Result<()> {
        match std::fs::remove_dir_all(self.path()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => {
                debug!("deleted workspace {}", self.uid);
                Ok(())
            }
        }
    }

    /// Create a new, uniquely named directory inside the workspace.
    pub fn make_tempdir(&self, rng: &SystemRandom) -> RpcResult<PathBuf> {
        let path = self.path().join(rand_digits(rng, UID_DIGITS)?);
        std::fs::create_dir(&path).map_err(|e| {
            RpcError::exception(format!(
                "could not create directory at {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(path)
    }

    /// Profiles of every workspace that exists under the configured root.
    pub fn list(config: &WorkspaceConfig) -> Vec<Profile> {
        let Ok(entries) = std::fs::read_dir(&config.root) else {
            return Vec::new();
        };
        let mut uids: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .collect();
        uids.sort();
        uids.into_iter()
            .map(|uid| {
                let mut profile = config.profile();
                profile.insert("uid", Value::String(uid));
                profile
            })
            .collect()
    }
}

/// Whether `profile` names a workspace that `config` could have created.
pub fn is_workspace_of(profile: &Profile, config: &WorkspaceConfig) -> bool {
    profile.kind() == ProfileKind::Workspace
        && profile.get_str("uid").is_some()
        && profile.get_str("root") == Some(config.root.as_str())
}
