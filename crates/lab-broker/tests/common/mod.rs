// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Test harness: brokers run as real processes in temporary homes.

#![allow(dead_code)]

use lab_broker::config::{Home, HostPort};
use lab_broker::control::RemoteControl;
use lab_broker::RemoteBroker;
use serde_json::{json, Value};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const ADMIN_KEY: &str = "admin-secret";
pub const SHARE_KEY: &str = "share-secret";

/// How long reclamation may take to show.
pub const SETTLE: Duration = Duration::from_secs(15);

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn handset(serial: &str) -> Value {
    json!({"type": "handset", "serial": serial, "power_state": "boot_completed"})
}

pub fn relay(uid: &str) -> Value {
    json!({"type": "relay", "uid": uid, "power_state": "online"})
}

/// A home directory with a broker configuration.
pub struct Lab {
    dir: TempDir,
    pub port: u16,
}

impl Lab {
    /// `config` is merged over `{"host": "127.0.0.1", "port": <free port>}`.
    pub fn new(config: Value) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let mut full = json!({"host": "127.0.0.1", "port": port});
        if let (Some(full), Value::Object(extra)) = (full.as_object_mut(), config) {
            full.extend(extra);
        }
        let home = Home::new(dir.path());
        std::fs::create_dir_all(home.config_dir()).unwrap();
        std::fs::write(home.broker_config_path(), full.to_string()).unwrap();
        std::fs::write(
            home.authkeys_path(),
            json!({"admin": ADMIN_KEY, "share": SHARE_KEY}).to_string(),
        )
        .unwrap();
        Self { dir, port }
    }

    pub fn home(&self) -> &Path {
        self.dir.path()
    }

    pub fn address(&self) -> HostPort {
        HostPort::new("127.0.0.1", self.port)
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_lab-broker"));
        command
            .arg("--home")
            .arg(self.home())
            .arg("--log-level")
            .arg("warn")
            .stdin(Stdio::null());
        command
    }

    pub fn start(&self) -> Process {
        Process::spawned(self.command().arg("serve").spawn().unwrap())
    }

    pub async fn admin(&self) -> RemoteControl {
        let mut admin =
            RemoteControl::new(self.address(), Some(ADMIN_KEY.to_string()), Some(SETTLE));
        admin.connect(SETTLE, true).await.unwrap();
        assert!(admin.is_authenticated());
        admin
    }

    pub async fn client(&self) -> RemoteBroker {
        let mut client = RemoteBroker::new(self.address(), None, Some(SETTLE));
        client.connect(SETTLE, true).await.unwrap();
        client
    }
}

/// A process that is stopped when the test ends.
pub struct Process {
    child: Option<Child>,
    pid: Option<u32>,
}

impl Process {
    /// A process we did not start ourselves.
    pub fn foreign(pid: u32) -> Self {
        Self {
            child: None,
            pid: Some(pid),
        }
    }

    pub fn spawned(child: Child) -> Self {
        Self {
            child: Some(child),
            pid: None,
        }
    }

    /// Whether the process ends within `limit`.
    pub async fn exits_within(&mut self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            match (self.child.as_mut(), self.pid) {
                (Some(child), _) => {
                    if child.try_wait().unwrap().is_some() {
                        return true;
                    }
                }
                (None, Some(pid)) => {
                    if !lab_broker::control::process::is_alive(pid) {
                        return true;
                    }
                }
                (None, None) => return true,
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(pid) = self.pid {
            let _ = lab_broker::control::process::terminate(pid);
        }
    }
}

pub async fn list(admin: &mut RemoteControl, method: &str) -> Vec<Value> {
    match admin.call(method, Vec::new()).await.unwrap() {
        Value::Array(items) => items,
        other => panic!("{} returned {}", method, other),
    }
}

pub fn serials(profiles: &[Value]) -> Vec<String> {
    let mut ids: Vec<String> = profiles
        .iter()
        .filter_map(|p| p.get("serial").or_else(|| p.get("uid")))
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    ids.sort();
    ids
}

/// Poll `method` until its identities equal `expected`.
pub async fn wait_for(admin: &mut RemoteControl, method: &str, expected: &[&str]) {
    let deadline = Instant::now() + SETTLE;
    loop {
        let got = serials(&list(admin, method).await);
        if got == expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "{} stuck at {:?}, expected {:?}",
            method,
            got,
            expected
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
