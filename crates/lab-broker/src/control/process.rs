// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process plumbing: naming, listeners, signals and diagnostic dumps.

use serde_json::Value;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name prefix shared by every process of the system.
pub const PROC_PREFIX: &str = "lab-";

/// Set the kernel-visible name of the calling process (at most 15 bytes).
pub fn set_process_name(name: &str) {
    let mut buf = [0u8; 16];
    let bytes = name.as_bytes();
    let len = bytes.len().min(15);
    buf[..len].copy_from_slice(&bytes[..len]);
    // SAFETY: PR_SET_NAME reads a NUL terminated buffer of at most 16 bytes.
    let rc = unsafe { libc::prctl(libc::PR_SET_NAME, buf.as_ptr() as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
        debug!("could not set process name: {}", io::Error::last_os_error());
    }
}

/// Bind a listening TCP socket with `SO_REUSEADDR`.
pub fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(socket.into())
}

/// Let `fd` survive `exec` in a child process.
pub fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a caller-owned descriptor.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Send SIGTERM to a process that is not necessarily our child.
///
/// A process that is already gone is fine. One owned by another user is
/// left alone with a warning.
pub fn terminate(pid: u32) -> io::Result<()> {
    send_signal(pid, libc::SIGTERM)
}

/// Send SIGKILL. Same error policy as [`terminate`].
pub fn kill(pid: u32) -> io::Result<()> {
    send_signal(pid, libc::SIGKILL)
}

/// Whether `pid` still exists. Zombies count as alive until reaped.
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only performs the permission and existence checks.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"));
    };
    // SAFETY: kill has no memory safety requirements.
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(()),
        Some(libc::EPERM) => {
            warn!(
                "process {} not signalled because it is owned by a different user",
                pid
            );
            Ok(())
        }
        _ => Err(err),
    }
}

/// Children of this process whose name starts with [`PROC_PREFIX`]. Walks
/// `/proc`, so keep it off the control loop.
pub fn find_children() -> Vec<(u32, String)> {
    let me = std::process::id();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut children = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        // the comm field is parenthesized and may contain spaces
        let Some(after_comm) = stat.rfind(')').map(|i| &stat[i + 1..]) else {
            continue;
        };
        let ppid = after_comm
            .split_whitespace()
            .nth(1)
            .and_then(|p| p.parse::<u32>().ok());
        if ppid != Some(me) {
            continue;
        }
        let name = std::fs::read_to_string(entry.path().join("comm"))
            .map(|n| n.trim().to_string())
            .unwrap_or_default();
        if name.starts_with(PROC_PREFIX) {
            children.push((pid, name));
        }
    }
    children
}

/// Forward SIGUSR1 to every child of the system.
pub fn signal_children_dump() {
    for (pid, name) in find_children() {
        debug!("forwarding dump signal to {} ({})", name, pid);
        if let Err(e) = send_signal(pid, libc::SIGUSR1) {
            warn!("could not signal {} ({}): {}", name, pid, e);
        }
    }
}

/// Write a diagnostic dump: a backtrace captured by the caller and a
/// snapshot of the process state. Blocks.
pub fn write_dump(
    dir: &Path,
    proc_name: &str,
    backtrace: &str,
    snapshot: &Value,
) -> io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let path = dir.join(format!("{}-{}-{}", stamp, proc_name, std::process::id()));
    let state = serde_json::to_string_pretty(snapshot)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let content = format!(
        "process: {} ({})\n\nbacktrace:\n{}\n\nstate:\n{}\n",
        proc_name,
        std::process::id(),
        backtrace,
        state
    );
    std::fs::write(&path, content)?;
    Ok(path)
}
