// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection I/O tasks.
//!
//! Each connection is driven by one task that owns its [`Connection`]. The
//! task reports to the control loop over an mpsc channel and takes orders
//! from an [`Outbound`] channel, the way discovery-server connection
//! handlers select over socket reads and an outbound queue.

use super::auth;
use super::connection::{Connection, FrameError};
use super::protocol::{exception_reply, parse_reply, Request};
use super::ConnId;
use crate::error::{RpcError, RpcResult};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::process::ExitStatus;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Orders from the control loop to a connection task.
pub(crate) enum Outbound {
    /// Write one message.
    Frame(Value),
    /// Send a request and route the reply back. Links only.
    Call {
        request: Request,
        reply: Option<oneshot::Sender<RpcResult<Value>>>,
    },
    /// Stop serving and hand the socket back.
    Detach(oneshot::Sender<Result<std::net::TcpStream, FrameError>>),
    /// Flush and close.
    Close,
}

/// Reports from connection tasks and child watchers.
pub(crate) enum ConnEvent {
    Established {
        id: ConnId,
        authkey: Option<String>,
    },
    Request {
        id: ConnId,
        frame: Vec<u8>,
    },
    Lost {
        id: ConnId,
    },
    Joined {
        pid: u32,
        status: Option<ExitStatus>,
    },
}

fn closed() -> RpcError {
    RpcError::closed("connection closed")
}

/// Serve a connection accepted by the listener: challenge, then requests.
pub(crate) async fn serve_accepted(
    mut conn: Connection,
    id: ConnId,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<ConnEvent>,
    secrets: Vec<String>,
) {
    match challenge(&mut conn, &mut outbound, &secrets).await {
        Ok(Some(authkey)) => {
            let _ = events.send(ConnEvent::Established { id, authkey });
        }
        Ok(None) => return,
        Err(e) => {
            debug!("connection {}: authentication failed: {}", id, e);
            let _ = events.send(ConnEvent::Lost { id });
            return;
        }
    }

    loop {
        tokio::select! {
            incoming = conn.read_frame() => match incoming {
                Ok(frame) => {
                    if events.send(ConnEvent::Request { id, frame }).is_err() {
                        return;
                    }
                }
                Err(e) if e.is_closed() => break,
                Err(e) => {
                    warn!("connection {}: got invalid RPC from client: {}", id, e);
                    let error = RpcError::exception(format!(
                        "got invalid RPC from client, {}. disconnect",
                        e
                    ));
                    let _ = conn.write_message(&exception_reply(&error)).await;
                    break;
                }
            },
            order = outbound.recv() => match order {
                Some(Outbound::Frame(message)) => {
                    if let Err(e) = conn.write_message(&message).await {
                        debug!("connection {}: write failed: {}", id, e);
                        break;
                    }
                }
                Some(Outbound::Call { reply, .. }) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(RpcError::exception(
                            "cannot call a peer over an accepted connection",
                        )));
                    }
                }
                Some(Outbound::Detach(back)) => {
                    let _ = back.send(conn.into_std());
                    return;
                }
                Some(Outbound::Close) | None => {
                    let _ = conn.shutdown().await;
                    return;
                }
            },
        }
    }
    let _ = events.send(ConnEvent::Lost { id });
}

/// Server half of the handshake. `Ok(None)` when closed by the loop.
async fn challenge(
    conn: &mut Connection,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    secrets: &[String],
) -> Result<Option<Option<String>>, FrameError> {
    let salt = auth::make_salt(&ring::rand::SystemRandom::new())
        .map_err(|e| FrameError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    conn.write_frame(&auth::challenge_frame(&salt)).await?;

    let answer = loop {
        tokio::select! {
            answer = conn.read_frame() => break answer?,
            order = outbound.recv() => match order {
                Some(Outbound::Frame(message)) => conn.write_message(&message).await?,
                Some(Outbound::Call { reply, .. }) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(closed()));
                    }
                }
                Some(Outbound::Detach(back)) => {
                    let _ = back.send(Err(FrameError::Closed));
                }
                Some(Outbound::Close) | None => {
                    let _ = conn.shutdown().await;
                    return Ok(None);
                }
            },
        }
    };

    let authkey = auth::verify(&salt, &answer, secrets.iter().map(String::as_str));
    conn.write_message(&json!({ "authenticated": authkey.is_some() }))
        .await?;
    Ok(Some(authkey))
}

/// Serve an outgoing connection: send calls, route replies in order.
pub(crate) async fn serve_link(
    mut conn: Connection,
    id: ConnId,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    let mut waiting: VecDeque<Option<oneshot::Sender<RpcResult<Value>>>> = VecDeque::new();

    loop {
        tokio::select! {
            incoming = conn.read_message() => match incoming {
                Ok(message) => match waiting.pop_front() {
                    Some(Some(waiter)) => {
                        let _ = waiter.send(parse_reply(message));
                    }
                    Some(None) => {}
                    None => debug!("link {}: unsolicited message: {}", id, message),
                },
                Err(e) => {
                    if !e.is_closed() {
                        warn!("link {}: {}", id, e);
                    }
                    break;
                }
            },
            order = outbound.recv() => match order {
                Some(Outbound::Call { request, reply }) => {
                    let is_async = request.is_async;
                    if let Err(e) = conn.write_message(&request.to_value()).await {
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(RpcError::closed(e.to_string())));
                        }
                        break;
                    }
                    if !is_async {
                        waiting.push_back(reply);
                    }
                }
                Some(Outbound::Frame(message)) => {
                    if conn.write_message(&message).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Detach(back)) => {
                    let _ = back.send(conn.into_std());
                    return;
                }
                Some(Outbound::Close) | None => {
                    let _ = conn.shutdown().await;
                    return;
                }
            },
        }
    }

    for waiter in waiting.into_iter().flatten() {
        let _ = waiter.send(Err(closed()));
    }
    let _ = events.send(ConnEvent::Lost { id });
}
