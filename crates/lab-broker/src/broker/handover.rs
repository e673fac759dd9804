// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Handing sessions over to a replacement broker.
//!
//! `begin_handover` freezes allocation and opens the fd channel,
//! `end_handover` sends every session socket through it. The outgoing
//! broker then drains: it exits once its last client is gone. The incoming
//! broker adopts the sockets in [`Broker::initialize`].

use super::{Adopted, Broker, SessionEntry};
use crate::allocator::LocalAllocator;
use crate::config::HostPort;
use crate::control::process;
use crate::control::{Connection, Context, Deferred, Params, Reply};
use crate::error::{RpcError, RpcResult};
use crate::handover::{
    check_fdtx_dir, serialized_to_value, FdSender, HandoverError, Serialized, SessionRecord,
};
use serde_json::{json, Value};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where the fd channel is created unless `begin_handover` names a directory.
pub const DEFAULT_FDTX_DIR: &str = "/tmp/lab";

const DEFAULT_HANDOVER_TIMEOUT: f64 = 5.0;

impl Broker {
    /// Sessions holding local allocations, in handover form.
    pub(super) fn serialize(&self) -> Serialized {
        serialize_sessions(
            self.allocators.local(),
            self.sessions
                .iter()
                .map(|(key, s)| (key.as_str(), s.pid, &s.address)),
        )
    }

    /// Take over the sessions of the previous broker.
    pub(super) fn adopt_sessions(
        &mut self,
        ctx: &mut Context<Self>,
        adopted: Adopted,
    ) -> RpcResult<()> {
        let Adopted {
            serialized,
            sockets,
        } = adopted;
        for (authkey, fd) in sockets {
            let Some(record) = serialized.get(&authkey) else {
                continue;
            };
            let conn = Connection::from_std(std::net::TcpStream::from(fd))?;
            let link = ctx.adopt_link(conn, None);
            self.allocators
                .local_mut()
                .adopt(&authkey, &record.allocations)?;
            self.links.insert(link.id(), authkey.clone());
            info!(
                "adopted session {} (pid {}) with {} allocations",
                record.address,
                record.pid,
                record.allocations.len()
            );
            self.sessions.insert(
                authkey,
                SessionEntry {
                    pid: record.pid,
                    address: record.address.clone(),
                    link,
                    adopted: true,
                },
            );
        }
        let adopted = self.sessions.values().filter(|s| s.adopted).count();
        let skipped = serialized.len().saturating_sub(adopted);
        if skipped > 0 {
            warn!("{} sessions died during the handover", skipped);
        }
        Ok(())
    }

    /// Close adopted sessions whose process is gone. They are not our
    /// children, so nothing else reports their exit.
    pub(super) fn reap_adopted(&mut self, ctx: &mut Context<Self>) {
        let dead: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.adopted && !process::is_alive(s.pid))
            .map(|(key, _)| key.clone())
            .collect();
        for key in dead {
            if let Err(e) = self.close_session(ctx, &key) {
                warn!("{}", e);
            }
        }
    }

    /// Undo `begin_handover` after the sockets could not be sent. Sessions
    /// whose socket is lost are closed.
    fn abort_handover(
        &mut self,
        ctx: &mut Context<Self>,
        sockets: Vec<(String, TcpStream)>,
        mut lost: Vec<String>,
    ) {
        let mut kept = 0;
        for (authkey, stream) in sockets {
            let Some(entry) = self.sessions.get_mut(&authkey) else {
                continue;
            };
            match Connection::from_std(stream) {
                Ok(conn) => {
                    let link = ctx.adopt_link(conn, None);
                    self.links.insert(link.id(), authkey);
                    entry.link = link;
                    kept += 1;
                }
                Err(e) => {
                    warn!("could not take back session {}: {}", entry.address, e);
                    lost.push(authkey);
                }
            }
        }
        self.allocating = true;
        if let Err(e) = ctx.resume_listening() {
            error!("could not listen again: {}", e);
        }
        for authkey in lost {
            if let Err(e) = self.close_session(ctx, &authkey) {
                debug!("{}", e);
            }
        }
        if self.is_sharing() {
            if let Err(e) = self.start_sharing(ctx) {
                error!("could not restart sharing: {}", e);
            }
        }
        info!("handover aborted, kept {} sessions", kept);
    }

    fn handover_done(&mut self, ctx: &mut Context<Self>, sent: usize) {
        self.handed_over = true;
        info!("handed over {} sessions", sent);
        if self.sessions.is_empty() {
            ctx.shutdown(Some(RpcError::restarting("broker restarted. please reconnect")));
        }
    }
}

fn serialize_sessions<'a>(
    local: &LocalAllocator,
    sessions: impl Iterator<Item = (&'a str, u32, &'a HostPort)>,
) -> Serialized {
    sessions
        .filter_map(|(authkey, pid, address)| {
            let allocations = local.records_of(authkey);
            if allocations.is_empty() {
                return None;
            }
            Some((
                authkey.to_string(),
                SessionRecord {
                    pid,
                    address: address.clone(),
                    allocations,
                },
            ))
        })
        .collect()
}

pub(super) fn serialize(
    b: &mut Broker,
    _: &mut Context<Broker>,
    _: Params,
) -> RpcResult<Reply<Broker>> {
    Reply::value(serialized_to_value(&b.serialize()))
}

pub(super) fn begin_handover(
    b: &mut Broker,
    ctx: &mut Context<Broker>,
    params: Params,
) -> RpcResult<Reply<Broker>> {
    if !b.allocating {
        return Err(RpcError::restarting("handover already in progress"));
    }
    let dir = params
        .optional::<String>(0, "fdtx_dir")?
        .map_or_else(|| PathBuf::from(DEFAULT_FDTX_DIR), PathBuf::from);
    check_fdtx_dir(&dir)?;
    let name = format!("handover-{}", ctx.rand_authkey()?);
    let fdtx = FdSender::listen(&dir, &name)?;
    let path = fdtx.path().display().to_string();

    ctx.stop_listening();
    b.stop_sharing(ctx);
    b.drop_all_shares(ctx);
    b.allocating = false;
    b.fdtx = Some(fdtx);

    let serialized = b.serialize();
    info!(
        "handover begun: {} sessions, {} with allocations, channel {}",
        b.sessions.len(),
        serialized.len(),
        path
    );
    Reply::value(json!([
        serialized_to_value(&serialized),
        b.config.to_value(),
        path
    ]))
}

pub(super) fn end_handover(
    b: &mut Broker,
    ctx: &mut Context<Broker>,
    params: Params,
) -> RpcResult<Reply<Broker>> {
    let seconds = params
        .optional::<f64>(0, "timeout")?
        .unwrap_or(DEFAULT_HANDOVER_TIMEOUT);
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(RpcError::exception(format!("invalid timeout: {}", seconds)));
    }
    let timeout = Duration::from_secs_f64(seconds);
    let mut fdtx = b
        .fdtx
        .take()
        .ok_or_else(|| RpcError::exception("no handover in progress"))?;

    let mut pending = Vec::new();
    let mut unlinked = Vec::new();
    for (authkey, session) in &b.sessions {
        let id = session.link.id();
        if b.links.remove(&id).is_none() {
            continue;
        }
        match ctx.detach(id) {
            Some(rx) => pending.push((authkey.clone(), rx)),
            None => {
                warn!("session {} has no link to hand over", session.address);
                unlinked.push(authkey.clone());
            }
        }
    }

    Reply::deferred(async move {
        let mut sockets = Vec::with_capacity(pending.len());
        for (authkey, rx) in pending {
            match rx.await {
                Ok(Ok(stream)) => sockets.push((authkey, stream)),
                Ok(Err(e)) => {
                    warn!("could not take back session socket: {}", e);
                    unlinked.push(authkey);
                }
                Err(_) => {
                    warn!("session link went away before the handover");
                    unlinked.push(authkey);
                }
            }
        }
        // the sockets come back on failure so the sessions can be re-adopted
        let sent = tokio::task::spawn_blocking(move || {
            let sent = send_sockets(&mut fdtx, timeout, &sockets);
            (sent, sockets)
        })
        .await;
        match sent {
            Ok((Ok(count), _)) => Deferred::then(Ok(Value::Null), move |b: &mut Broker, ctx| {
                b.handover_done(ctx, count)
            }),
            Ok((Err(e), sockets)) => {
                error!("handover failed: {}", e);
                Deferred::then(Err(e.into()), move |b: &mut Broker, ctx| {
                    b.abort_handover(ctx, sockets, unlinked)
                })
            }
            Err(e) => Deferred::reply(Err(RpcError::exception(format!(
                "handover task failed: {}",
                e
            )))),
        }
    })
}

fn send_sockets(
    fdtx: &mut FdSender,
    timeout: Duration,
    sockets: &[(String, TcpStream)],
) -> Result<usize, HandoverError> {
    fdtx.accept(timeout)?;
    for (authkey, stream) in sockets {
        fdtx.put(authkey, stream.as_raw_fd())?;
    }
    Ok(sockets.len())
}
