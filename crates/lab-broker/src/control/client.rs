// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client side of a Control connection.

use super::auth;
use super::connection::Connection;
use super::protocol::{parse_reply, Params, Request};
use crate::config::HostPort;
use crate::error::{ErrorKind, RpcError, RpcResult};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// Connect and call timeout when none is given.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const RETRY_PERIOD: Duration = Duration::from_millis(100);

/// Client half of the challenge handshake.
pub async fn handshake(conn: &mut Connection, authkey: Option<&str>) -> RpcResult<bool> {
    let frame = conn.read_frame().await?;
    let salt = auth::parse_challenge(&frame)
        .ok_or_else(|| RpcError::new(ErrorKind::AuthError, "expected a challenge"))?;
    conn.write_frame(&auth::digest(salt, authkey)).await?;
    let reply = conn.read_message().await?;
    reply
        .get("authenticated")
        .and_then(Value::as_bool)
        .ok_or_else(|| {
            RpcError::new(
                ErrorKind::AuthError,
                format!("bad authentication reply: {}", reply),
            )
        })
}

/// Open a TCP connection and authenticate.
///
/// With `optimist` set, refused connections are retried until `timeout`
/// runs out, for peers that are still starting.
pub async fn connect(
    address: &HostPort,
    authkey: Option<&str>,
    timeout: Duration,
    optimist: bool,
) -> RpcResult<(Connection, bool)> {
    let deadline = Instant::now() + timeout;
    let stream = loop {
        let attempt = tokio::time::timeout_at(
            deadline,
            TcpStream::connect((address.host(), address.port())),
        )
        .await;
        match attempt {
            Ok(Ok(stream)) => break stream,
            Ok(Err(e))
                if optimist
                    && e.kind() == std::io::ErrorKind::ConnectionRefused
                    && Instant::now() + RETRY_PERIOD < deadline =>
            {
                tokio::time::sleep(RETRY_PERIOD).await;
            }
            Ok(Err(e)) => {
                return Err(RpcError::closed(format!(
                    "could not connect to {}: {}",
                    address, e
                )))
            }
            Err(_) => {
                return Err(RpcError::timeout(format!(
                    "timed out connecting to {}",
                    address
                )))
            }
        }
    };
    let _ = stream.set_nodelay(true);
    let mut conn = Connection::new(stream);
    match tokio::time::timeout_at(deadline, handshake(&mut conn, authkey)).await {
        Ok(Ok(authenticated)) => Ok((conn, authenticated)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(RpcError::timeout(format!(
            "timed out authenticating to {}",
            address
        ))),
    }
}

/// A lazily connected, sequential RPC client.
#[derive(Debug)]
pub struct RemoteControl {
    address: HostPort,
    authkey: Option<String>,
    timeout: Option<Duration>,
    connection: Option<Connection>,
    authenticated: bool,
}

impl RemoteControl {
    /// `timeout = None` waits for replies indefinitely.
    pub fn new(address: HostPort, authkey: Option<String>, timeout: Option<Duration>) -> Self {
        Self {
            address,
            authkey,
            timeout,
            connection: None,
            authenticated: false,
        }
    }

    pub fn address(&self) -> &HostPort {
        &self.address
    }

    pub fn authkey(&self) -> Option<&str> {
        self.authkey.as_deref()
    }

    /// Whether the server accepted our key on the current connection.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub async fn connect(&mut self, timeout: Duration, optimist: bool) -> RpcResult<()> {
        let (conn, authenticated) =
            connect(&self.address, self.authkey.as_deref(), timeout, optimist).await?;
        if self.authkey.is_some() && !authenticated {
            debug!("{} did not accept our authkey", self.address);
        }
        self.connection = Some(conn);
        self.authenticated = authenticated;
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.connection = None;
        self.authenticated = false;
    }

    pub async fn call(&mut self, method: &str, vargs: Vec<Value>) -> RpcResult<Value> {
        self.call_request(Request::new(method, Params::positional(vargs)))
            .await
    }

    pub async fn call_async(&mut self, method: &str, vargs: Vec<Value>) -> RpcResult<()> {
        self.call_request(Request::new(method, Params::positional(vargs)).asynchronous())
            .await
            .map(|_| ())
    }

    pub async fn call_request(&mut self, request: Request) -> RpcResult<Value> {
        if self.connection.is_none() {
            self.connect(self.timeout.unwrap_or(DEFAULT_TIMEOUT), false)
                .await?;
        }
        let Some(conn) = self.connection.as_mut() else {
            return Err(RpcError::closed("not connected"));
        };
        if let Err(e) = conn.write_message(&request.to_value()).await {
            self.disconnect();
            return Err(e.into());
        }
        if request.is_async {
            return Ok(Value::Null);
        }
        self.receive().await
    }

    /// Wait for the next message from the server and decode it as a reply.
    pub async fn receive(&mut self) -> RpcResult<Value> {
        let Some(conn) = self.connection.as_mut() else {
            return Err(RpcError::closed("not connected"));
        };
        let read = conn.read_message();
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.disconnect();
                    return Err(RpcError::timeout(format!(
                        "no reply from {} within {:?}",
                        self.address, limit
                    )));
                }
            },
            None => read.await,
        };
        match outcome {
            Ok(message) => parse_reply(message),
            Err(e) => {
                self.disconnect();
                Err(e.into())
            }
        }
    }

    /// Give up the connection, e.g. to let a control loop watch it.
    pub fn into_connection(self) -> Option<Connection> {
        self.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_refused_is_connection_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut client = RemoteControl::new(HostPort::new("127.0.0.1", port), None, None);
        let err = client
            .connect(Duration::from_millis(300), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_optimist_connect_gives_up_at_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let started = Instant::now();
        let result = connect(
            &HostPort::new("127.0.0.1", port),
            None,
            Duration::from_millis(350),
            true,
        )
        .await;
        assert!(result.is_err());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let err = connect(
            &HostPort::new("127.0.0.1", port),
            None,
            Duration::from_millis(200),
            false,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ConnectionTimeout);
    }
}
