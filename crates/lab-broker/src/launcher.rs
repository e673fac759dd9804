// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Start helper processes from the running executable.
//!
//! Sessions and the notifier are the same binary started with another
//! subcommand. The parent binds the child's listener first so that it knows
//! the port before the child runs; the socket is inherited through
//! `--listen-fd`.

use crate::config::Home;
use crate::control::process::clear_cloexec;
use std::ffi::OsString;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

/// Environment variable carrying a session's account table.
pub const SESSION_KEYS_ENV: &str = "LAB_SESSION_AUTHKEYS";
/// Environment variable carrying the notifier's broker key.
pub const NOTIFIER_KEY_ENV: &str = "LAB_NOTIFIER_AUTHKEY";
/// Environment variable carrying the key used towards the master broker.
pub const MASTER_KEY_ENV: &str = "LAB_MASTER_AUTHKEY";

/// How to start a helper process.
#[derive(Debug, Clone)]
pub struct Launcher {
    program: PathBuf,
    home: PathBuf,
    log_level: String,
}

impl Launcher {
    pub fn new(program: PathBuf, home: &Home, log_level: impl Into<String>) -> Self {
        Self {
            program,
            home: home.path().to_path_buf(),
            log_level: log_level.into(),
        }
    }

    /// Launch helpers from the executable of this process.
    pub fn current(home: &Home, log_level: impl Into<String>) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, home, log_level))
    }

    /// Start `role` on `listener`. The caller keeps ownership of its copy of
    /// the listener and should drop it once the child runs.
    pub fn spawn(
        &self,
        role: &str,
        listener: &std::net::TcpListener,
        args: &[OsString],
        envs: &[(&str, String)],
    ) -> io::Result<Child> {
        let fd = listener.as_raw_fd();
        let mut command = Command::new(&self.program);
        command
            .arg("--home")
            .arg(&self.home)
            .arg("--log-level")
            .arg(&self.log_level)
            .arg(role)
            .arg("--listen-fd")
            .arg(fd.to_string())
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(false);
        for (name, value) in envs {
            command.env(name, value);
        }
        // SAFETY: the closure only calls fcntl, which is async-signal-safe.
        unsafe {
            command.pre_exec(move || clear_cloexec(fd));
        }
        let child = command.spawn()?;
        debug!("started {} as pid {:?}", role, child.id());
        Ok(child)
    }
}

/// Bind a listener for a child process on `ip`, any port.
pub fn child_listener(ip: IpAddr) -> io::Result<(std::net::TcpListener, u16)> {
    let listener = std::net::TcpListener::bind(SocketAddr::new(ip, 0))?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

/// Address to reach a local listener bound on `ip`.
pub fn reachable(ip: IpAddr) -> IpAddr {
    if ip.is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        ip
    }
}

/// Take over a listener inherited through `--listen-fd`.
///
/// # Safety
///
/// `fd` must be an open listening socket owned by nobody else in this
/// process.
pub unsafe fn inherit_listener(fd: RawFd) -> io::Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::from_raw_fd(fd);
    listener.local_addr()?;
    Ok(listener)
}
