// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event-driven RPC control loop.
//!
//! A [`Control`] owns one [`Service`] and drives it from a single task: the
//! listener, every connection, background work, child processes, the idle
//! timer and Unix signals all funnel into one `select!`. Handlers get
//! `&mut` access to the service and a [`Context`], so service state needs
//! no locks. Connection I/O runs in per-connection tasks (see `tasks`).
//!
//! Connection lifecycle:
//!
//! ```text
//! accept -> Authenticating -> Established -> (lost)
//!                                  \-> KeepWatching (liveness only)
//! ```

pub mod auth;
pub mod client;
pub mod connection;
pub mod methods;
pub mod process;
pub mod protocol;
mod tasks;

pub use client::{RemoteControl, DEFAULT_TIMEOUT};
pub use connection::{Connection, FrameError};
pub use methods::{Access, Deferred, MethodTable, Reply};
pub use protocol::{Params, Request};

use self::protocol::{exception_reply, result_reply, Envelope};
use self::tasks::{ConnEvent, Outbound};
use crate::config::{Authkeys, HostPort, Home};
use crate::error::{ErrorKind, RpcError, RpcResult};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Connection identifier, unique for the lifetime of a process.
pub type ConnId = u64;

/// Work to run on the loop with exclusive access to the service.
pub type Followup<S> = Box<dyn FnOnce(&mut S, &mut Context<S>) + Send>;

/// Default idle interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Box a closure as a [`Followup`].
pub fn followup<S>(f: impl FnOnce(&mut S, &mut Context<S>) + Send + 'static) -> Followup<S> {
    Box::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Authenticating,
    Established,
    /// Liveness only: requests are ignored, loss is still reported.
    KeepWatching,
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnRole {
    Accepted,
    Link,
}

struct ConnEntry {
    role: ConnRole,
    state: ConnState,
    authkey: Option<String>,
    peer: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

/// A process role served by a [`Control`] loop.
///
/// Every hook runs on the loop and must not block.
pub trait Service: Send + Sized + 'static {
    /// Register the RPC surface.
    fn register(methods: &mut MethodTable<Self>);

    /// Called once, before the first event.
    fn initialize(&mut self, _ctx: &mut Context<Self>) -> RpcResult<()> {
        Ok(())
    }

    /// Called on every idle interval tick.
    fn idle(&mut self, _ctx: &mut Context<Self>) {}

    /// A connection finished the handshake.
    fn new_connection(&mut self, _ctx: &mut Context<Self>, _id: ConnId, _authkey: Option<&str>) {
    }

    /// A connection went away. Not called for connections the service
    /// closed or detached itself.
    fn lost_connection(&mut self, _ctx: &mut Context<Self>, _id: ConnId, _authkey: Option<&str>) {
    }

    /// A child handed to [`Context::join_later`] exited.
    fn joined_process(
        &mut self,
        _ctx: &mut Context<Self>,
        _pid: u32,
        _status: Option<ExitStatus>,
    ) {
    }

    /// The loop is about to stop.
    fn shutdown(&mut self, _ctx: &mut Context<Self>, _details: Option<&RpcError>) {}

    /// Serve a request whose envelope names a held resource.
    fn call_resource(
        &mut self,
        _ctx: &mut Context<Self>,
        resource: &Value,
        _request: Request,
    ) -> RpcResult<Reply<Self>> {
        Err(RpcError::no_such(format!("no such resource: {}", resource)))
    }

    /// State snapshot for diagnostic dumps.
    fn dump(&self) -> Value {
        Value::Null
    }
}

enum Task<S> {
    Followup(Followup<S>),
    Deferred {
        id: ConnId,
        method: String,
        is_async: bool,
        deferred: Deferred<S>,
    },
}

/// A handle for calling a peer over an outgoing connection.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    id: ConnId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl LinkHandle {
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Call the peer. `timeout = None` waits until the link closes.
    pub fn call(
        &self,
        request: Request,
        timeout: Option<Duration>,
    ) -> impl Future<Output = RpcResult<Value>> + Send + 'static {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self.tx.send(Outbound::Call {
            request,
            reply: Some(reply_tx),
        });
        async move {
            if sent.is_err() {
                return Err(RpcError::closed("connection closed"));
            }
            let wait = async {
                reply_rx
                    .await
                    .unwrap_or_else(|_| Err(RpcError::closed("connection closed")))
            };
            match timeout {
                Some(limit) => tokio::time::timeout(limit, wait)
                    .await
                    .unwrap_or_else(|_| Err(RpcError::timeout("timed out"))),
                None => wait.await,
            }
        }
    }

    /// Fire and forget.
    pub fn call_async(&self, request: Request) -> RpcResult<()> {
        self.tx
            .send(Outbound::Call {
                request: request.asynchronous(),
                reply: None,
            })
            .map_err(|_| RpcError::closed("connection closed"))
    }
}

/// Loop-owned state handed to every hook and handler.
pub struct Context<S> {
    proc_name: String,
    home: Home,
    authkeys: Authkeys,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    connections: BTreeMap<ConnId, ConnEntry>,
    next_id: ConnId,
    caller: Option<ConnId>,
    interval: Duration,
    interval_changed: bool,
    exit: Option<Option<RpcError>>,
    conn_tx: mpsc::UnboundedSender<ConnEvent>,
    task_tx: mpsc::UnboundedSender<Task<S>>,
    rng: ring::rand::SystemRandom,
}

impl<S: Service> Context<S> {
    pub fn proc_name(&self) -> &str {
        &self.proc_name
    }

    pub fn home(&self) -> &Home {
        &self.home
    }

    pub fn authkeys(&self) -> &Authkeys {
        &self.authkeys
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Close the listener. Established connections are kept.
    pub fn stop_listening(&mut self) {
        if self.listener.take().is_some() {
            info!("{}: stopped listening", self.proc_name);
        }
    }

    /// Listen again on the address given up by `stop_listening`.
    pub fn resume_listening(&mut self) -> std::io::Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }
        let Some(addr) = self.local_addr else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "never listened",
            ));
        };
        let listener = process::bind_listener(addr)?;
        listener.set_nonblocking(true)?;
        self.listener = Some(TcpListener::from_std(listener)?);
        info!("{}: listening again on {}", self.proc_name, addr);
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        if interval != self.interval {
            self.interval = interval;
            self.interval_changed = true;
        }
    }

    /// The connection whose request is being handled.
    pub fn caller(&self) -> Option<ConnId> {
        self.caller
    }

    pub fn caller_authkey(&self) -> Option<&str> {
        self.caller.and_then(|id| self.authkey_of(id))
    }

    pub fn authkey_of(&self, id: ConnId) -> Option<&str> {
        self.connections.get(&id).and_then(|c| c.authkey.as_deref())
    }

    /// Rebind the authkey of a connection, e.g. to a generated session key.
    pub fn set_authkey(&mut self, id: ConnId, authkey: String) {
        if let Some(entry) = self.connections.get_mut(&id) {
            entry.authkey = Some(authkey);
        }
    }

    /// Stop serving requests on a connection but keep reporting its loss.
    pub fn keep_watching(&mut self, id: ConnId) {
        if let Some(entry) = self.connections.get_mut(&id) {
            entry.state = ConnState::KeepWatching;
        }
    }

    /// Queue a message on a connection.
    pub fn send(&self, id: ConnId, message: Value) {
        if let Some(entry) = self.connections.get(&id) {
            let _ = entry.tx.send(Outbound::Frame(message));
        }
    }

    /// Close a connection without a `lost_connection` upcall.
    pub fn close(&mut self, id: ConnId) {
        if let Some(entry) = self.connections.remove(&id) {
            let _ = entry.tx.send(Outbound::Close);
        }
    }

    /// Stop tracking a connection and take its socket back.
    pub fn detach(
        &mut self,
        id: ConnId,
    ) -> Option<oneshot::Receiver<Result<std::net::TcpStream, FrameError>>> {
        let entry = self.connections.remove(&id)?;
        let (back, rx) = oneshot::channel();
        entry.tx.send(Outbound::Detach(back)).ok()?;
        Some(rx)
    }

    /// Track an outgoing, already authenticated connection.
    pub fn adopt_link(&mut self, conn: Connection, authkey: Option<String>) -> LinkHandle {
        let id = self.next_id();
        let peer = conn.peer_addr();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(tasks::serve_link(conn, id, rx, self.conn_tx.clone()));
        debug!("{}: adopted link {} to {:?}", self.proc_name, id, peer);
        self.connections.insert(
            id,
            ConnEntry {
                role: ConnRole::Link,
                state: ConnState::Established,
                authkey,
                peer,
                tx: tx.clone(),
                task,
            },
        );
        LinkHandle { id, tx }
    }

    /// Open an outgoing connection in the background.
    ///
    /// The handle is usable at once: calls queue until the handshake is
    /// done. A failed connect is reported as a lost connection.
    pub fn connect_link(
        &mut self,
        address: HostPort,
        authkey: Option<String>,
        timeout: Duration,
    ) -> LinkHandle {
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let events = self.conn_tx.clone();
        let key = authkey.clone();
        let task = tokio::spawn(async move {
            match client::connect(&address, key.as_deref(), timeout, true).await {
                Ok((conn, _)) => tasks::serve_link(conn, id, rx, events).await,
                Err(e) => {
                    warn!("could not connect to {}: {}", address, e);
                    drop(rx);
                    let _ = events.send(ConnEvent::Lost { id });
                }
            }
        });
        self.connections.insert(
            id,
            ConnEntry {
                role: ConnRole::Link,
                state: ConnState::Established,
                authkey,
                peer: None,
                tx: tx.clone(),
                task,
            },
        );
        LinkHandle { id, tx }
    }

    pub fn link(&self, id: ConnId) -> Option<LinkHandle> {
        self.connections
            .get(&id)
            .filter(|c| c.role == ConnRole::Link)
            .map(|c| LinkHandle {
                id,
                tx: c.tx.clone(),
            })
    }

    /// Run `work` off the loop. Its followup, if any, runs on the loop.
    pub fn spawn<F>(&self, work: F)
    where
        F: Future<Output = Option<Followup<S>>> + Send + 'static,
    {
        let tasks = self.task_tx.clone();
        tokio::spawn(async move {
            if let Some(then) = work.await {
                let _ = tasks.send(Task::Followup(then));
            }
        });
    }

    /// Reap a child in the background and report it to `joined_process`.
    pub fn join_later(&self, mut child: tokio::process::Child) {
        let Some(pid) = child.id() else {
            return;
        };
        let events = self.conn_tx.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!("could not join process {}: {}", pid, e);
                    None
                }
            };
            let _ = events.send(ConnEvent::Joined { pid, status });
        });
    }

    pub fn rand_authkey(&self) -> RpcResult<String> {
        auth::rand_authkey(&self.rng)
    }

    pub fn rng(&self) -> &ring::rand::SystemRandom {
        &self.rng
    }

    /// Stop the loop after the current event. `details` is sent to every
    /// accepted connection before it closes.
    pub fn shutdown(&mut self, details: Option<RpcError>) {
        if self.exit.is_none() {
            self.exit = Some(details);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.exit.is_some()
    }

    fn next_id(&mut self) -> ConnId {
        self.next_id += 1;
        self.next_id
    }

    fn describe_connections(&self) -> Value {
        Value::Array(
            self.connections
                .iter()
                .map(|(id, c)| {
                    json!({
                        "id": id,
                        "role": c.role,
                        "state": c.state,
                        "peer": c.peer.map(|p| p.to_string()),
                        "authenticated": c.authkey.is_some(),
                    })
                })
                .collect(),
        )
    }
}

/// Construction parameters for a [`Control`].
pub struct ControlOptions {
    pub proc_name: String,
    pub home: Home,
    pub authkeys: Authkeys,
    pub listener: Option<std::net::TcpListener>,
    pub interval: Duration,
}

impl ControlOptions {
    pub fn new(proc_name: impl Into<String>, home: Home) -> Self {
        Self {
            proc_name: proc_name.into(),
            home,
            authkeys: Authkeys::default(),
            listener: None,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_authkeys(mut self, authkeys: Authkeys) -> Self {
        self.authkeys = authkeys;
        self
    }

    pub fn with_listener(mut self, listener: std::net::TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Control loop errors.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("initialization failed: {0}")]
    Initialize(RpcError),
}

/// The loop.
pub struct Control<S: Service> {
    service: S,
    ctx: Context<S>,
    methods: MethodTable<S>,
    listener: Option<std::net::TcpListener>,
    conn_rx: mpsc::UnboundedReceiver<ConnEvent>,
    task_rx: mpsc::UnboundedReceiver<Task<S>>,
}

impl<S: Service> Control<S> {
    pub fn new(service: S, options: ControlOptions) -> Self {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let mut methods = MethodTable::new();
        S::register(&mut methods);
        let local_addr = options
            .listener
            .as_ref()
            .and_then(|l| l.local_addr().ok());
        Self {
            service,
            ctx: Context {
                proc_name: options.proc_name,
                home: options.home,
                authkeys: options.authkeys,
                listener: None,
                local_addr,
                connections: BTreeMap::new(),
                next_id: 0,
                caller: None,
                interval: options.interval,
                interval_changed: false,
                exit: None,
                conn_tx,
                task_tx,
                rng: ring::rand::SystemRandom::new(),
            },
            methods,
            listener: options.listener,
            conn_rx,
            task_rx,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ctx.local_addr
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Run until shutdown. Returns the service for inspection.
    pub async fn run(mut self) -> Result<S, ControlError> {
        process::set_process_name(&self.ctx.proc_name);
        if let Some(listener) = self.listener.take() {
            listener.set_nonblocking(true)?;
            self.ctx.listener = Some(TcpListener::from_std(listener)?);
        }
        let mut dump_signal = signal(SignalKind::user_defined1())?;
        let mut term_signal = signal(SignalKind::terminate())?;
        let mut int_signal = signal(SignalKind::interrupt())?;

        self.service
            .initialize(&mut self.ctx)
            .map_err(ControlError::Initialize)?;
        if let Some(addr) = self.ctx.local_addr {
            info!("{} listening on {}", self.ctx.proc_name, addr);
        }

        let mut ticker = make_ticker(self.ctx.interval);
        while self.ctx.exit.is_none() {
            if std::mem::take(&mut self.ctx.interval_changed) {
                ticker = make_ticker(self.ctx.interval);
            }
            tokio::select! {
                accepted = accept(self.ctx.listener.as_ref()) => self.accept(accepted),
                Some(event) = self.conn_rx.recv() => self.handle_event(event),
                Some(task) = self.task_rx.recv() => self.handle_task(task),
                _ = ticker.tick() => self.service.idle(&mut self.ctx),
                _ = dump_signal.recv() => {
                    self.dump();
                }
                _ = term_signal.recv() => {
                    info!("{}: terminated", self.ctx.proc_name);
                    let details = RpcError::exit(format!("{} terminated", self.ctx.proc_name));
                    self.ctx.shutdown(Some(details));
                }
                _ = int_signal.recv() => {
                    info!("{}: interrupted", self.ctx.proc_name);
                    let details = RpcError::exit(format!("{} interrupted", self.ctx.proc_name));
                    self.ctx.shutdown(Some(details));
                }
            }
        }

        self.finish().await;
        Ok(self.service)
    }

    fn accept(&mut self, accepted: std::io::Result<(TcpStream, SocketAddr)>) {
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("{}: accept failed: {}", self.ctx.proc_name, e);
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY for {}: {}", peer, e);
        }
        let id = self.ctx.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let secrets = self.ctx.authkeys.secrets().map(String::from).collect();
        let task = tokio::spawn(tasks::serve_accepted(
            Connection::new(stream),
            id,
            rx,
            self.ctx.conn_tx.clone(),
            secrets,
        ));
        debug!("{}: accepted connection {} from {}", self.ctx.proc_name, id, peer);
        self.ctx.connections.insert(
            id,
            ConnEntry {
                role: ConnRole::Accepted,
                state: ConnState::Authenticating,
                authkey: None,
                peer: Some(peer),
                tx,
                task,
            },
        );
    }

    fn handle_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Established { id, authkey } => {
                let Some(entry) = self.ctx.connections.get_mut(&id) else {
                    return;
                };
                entry.state = ConnState::Established;
                entry.authkey = authkey.clone();
                debug!(
                    "{}: connection {} established (authenticated: {})",
                    self.ctx.proc_name,
                    id,
                    authkey.is_some()
                );
                self.service
                    .new_connection(&mut self.ctx, id, authkey.as_deref());
            }
            ConnEvent::Request { id, frame } => self.dispatch(id, frame),
            ConnEvent::Lost { id } => {
                // ids the service already closed or detached are not reported
                if let Some(entry) = self.ctx.connections.remove(&id) {
                    debug!("{}: lost connection {}", self.ctx.proc_name, id);
                    self.service
                        .lost_connection(&mut self.ctx, id, entry.authkey.as_deref());
                }
            }
            ConnEvent::Joined { pid, status } => {
                debug!("{}: joined process {} ({:?})", self.ctx.proc_name, pid, status);
                self.service.joined_process(&mut self.ctx, pid, status);
            }
        }
    }

    fn dispatch(&mut self, id: ConnId, frame: Vec<u8>) {
        let Some(entry) = self.ctx.connections.get(&id) else {
            return;
        };
        if entry.state != ConnState::Established {
            debug!("{}: ignoring request on connection {}", self.ctx.proc_name, id);
            return;
        }
        let authkey = entry.authkey.clone();
        let envelope = match protocol::Request::parse(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.ctx.send(id, exception_reply(&e));
                return;
            }
        };
        let method = envelope.method.clone();
        let is_async = envelope.is_async;

        self.ctx.caller = Some(id);
        let outcome = self.invoke(authkey.as_deref(), envelope);
        self.ctx.caller = None;

        match outcome {
            Ok(Reply::Value(value)) => {
                if !is_async {
                    self.ctx.send(id, result_reply(value));
                }
            }
            Ok(Reply::Deferred(work)) => {
                let tasks = self.ctx.task_tx.clone();
                tokio::spawn(async move {
                    let deferred = work.await;
                    let _ = tasks.send(Task::Deferred {
                        id,
                        method,
                        is_async,
                        deferred,
                    });
                });
            }
            Err(e) if e.is(&ErrorKind::Exit) => {
                info!("{}: {} requested exit: {}", self.ctx.proc_name, method, e.message());
                self.ctx.shutdown(Some(e));
            }
            Err(e) => self.reply_error(id, &method, is_async, e),
        }
    }

    fn invoke(&mut self, authkey: Option<&str>, envelope: Envelope) -> RpcResult<Reply<S>> {
        if envelope.resource.is_some() {
            Access::Auth.permits(authkey, &self.ctx.authkeys)?;
            let request = envelope.into_request()?;
            let resource = request.resource.clone().unwrap_or(Value::Null);
            return self
                .service
                .call_resource(&mut self.ctx, &resource, request);
        }
        let handler = self
            .methods
            .lookup(&envelope.method, authkey, &self.ctx.authkeys)?;
        let request = envelope.into_request()?;
        handler(&mut self.service, &mut self.ctx, request.params)
    }

    fn reply_error(&mut self, id: ConnId, method: &str, is_async: bool, error: RpcError) {
        let error = error.in_method(method);
        debug!("{}: {} failed: {}", self.ctx.proc_name, method, error);
        if !is_async {
            self.ctx.send(id, exception_reply(&error));
        }
    }

    fn handle_task(&mut self, task: Task<S>) {
        match task {
            Task::Followup(then) => then(&mut self.service, &mut self.ctx),
            Task::Deferred {
                id,
                method,
                is_async,
                deferred,
            } => {
                let mut exit = None;
                match deferred.result {
                    Ok(value) => {
                        if !is_async {
                            self.ctx.send(id, result_reply(value));
                        }
                    }
                    Err(e) if e.is(&ErrorKind::Exit) => exit = Some(e),
                    Err(e) => self.reply_error(id, &method, is_async, e),
                }
                if let Some(then) = deferred.then {
                    then(&mut self.service, &mut self.ctx);
                }
                if let Some(e) = exit {
                    self.ctx.shutdown(Some(e));
                }
            }
        }
    }

    /// Snapshot on the loop, then signal children and write the file on the
    /// blocking pool.
    fn dump(&mut self) -> JoinHandle<()> {
        let snapshot = json!({
            "proc_name": self.ctx.proc_name,
            "pid": std::process::id(),
            "listening": self.ctx.local_addr.map(|a| a.to_string()),
            "connections": self.ctx.describe_connections(),
            "state": self.service.dump(),
        });
        let backtrace = std::backtrace::Backtrace::force_capture().to_string();
        let dir = self.ctx.home.hickup_dir();
        let proc_name = self.ctx.proc_name.clone();
        tokio::task::spawn_blocking(move || {
            process::signal_children_dump();
            match process::write_dump(&dir, &proc_name, &backtrace, &snapshot) {
                Ok(path) => info!("{}: wrote dump to {}", proc_name, path.display()),
                Err(e) => warn!("{}: could not write dump: {}", proc_name, e),
            }
        })
    }

    async fn finish(&mut self) {
        let details = self.ctx.exit.take().flatten();
        self.service.shutdown(&mut self.ctx, details.as_ref());
        self.ctx.listener = None;

        let farewell = details.as_ref().map(exception_reply);
        let mut pending = Vec::new();
        for (_, entry) in std::mem::take(&mut self.ctx.connections) {
            if let (Some(message), ConnRole::Accepted) = (&farewell, entry.role) {
                let _ = entry.tx.send(Outbound::Frame(message.clone()));
            }
            let _ = entry.tx.send(Outbound::Close);
            pending.push(entry.task);
        }
        let flushed = futures::future::join_all(pending);
        if tokio::time::timeout(Duration::from_secs(1), flushed)
            .await
            .is_err()
        {
            debug!("{}: some connections did not flush", self.ctx.proc_name);
        }
        info!("{} stopped", self.ctx.proc_name);
    }
}

fn make_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn accept(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Echo {
        lost: usize,
        counter: u64,
    }

    fn echo(_: &mut Echo, _: &mut Context<Echo>, params: Params) -> RpcResult<Reply<Echo>> {
        Reply::value(params.vargs)
    }

    fn bump(svc: &mut Echo, _: &mut Context<Echo>, _: Params) -> RpcResult<Reply<Echo>> {
        svc.counter += 1;
        Reply::value(svc.counter)
    }

    fn whoami(_: &mut Echo, ctx: &mut Context<Echo>, _: Params) -> RpcResult<Reply<Echo>> {
        Reply::value(ctx.caller_authkey())
    }

    fn later(_: &mut Echo, _: &mut Context<Echo>, _: Params) -> RpcResult<Reply<Echo>> {
        Reply::deferred(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Deferred::then(Ok(json!("late")), |svc: &mut Echo, _| svc.counter += 100)
        })
    }

    fn busy(_: &mut Echo, _: &mut Context<Echo>, _: Params) -> RpcResult<Reply<Echo>> {
        Err(RpcError::busy("all such equipment busy"))
    }

    fn stop(_: &mut Echo, _: &mut Context<Echo>, _: Params) -> RpcResult<Reply<Echo>> {
        Err(RpcError::exit("stopping"))
    }

    fn deaf(_: &mut Echo, ctx: &mut Context<Echo>, _: Params) -> RpcResult<Reply<Echo>> {
        ctx.stop_listening();
        Reply::none()
    }

    fn hear(_: &mut Echo, ctx: &mut Context<Echo>, _: Params) -> RpcResult<Reply<Echo>> {
        ctx.resume_listening()
            .map_err(|e| RpcError::exception(e.to_string()))?;
        Reply::none()
    }

    impl Service for Echo {
        fn register(methods: &mut MethodTable<Self>) {
            methods
                .rpc("echo", Access::Open, echo)
                .rpc("bump", Access::Open, bump)
                .rpc("whoami", Access::Auth, whoami)
                .rpc("later", Access::Open, later)
                .rpc("busy", Access::Open, busy)
                .rpc("stop", Access::Preauth(&["admin"]), stop)
                .rpc("deaf", Access::Open, deaf)
                .rpc("hear", Access::Open, hear);
        }

        fn lost_connection(&mut self, _: &mut Context<Self>, _: ConnId, _: Option<&str>) {
            self.lost += 1;
        }
    }

    fn start() -> (HostPort, JoinHandle<Result<Echo, ControlError>>, tempfile::TempDir) {
        let home = tempfile::tempdir().unwrap();
        let listener = process::bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = listener.local_addr().unwrap().port();
        let keys: Authkeys = [("admin".to_string(), Some("admin-key".to_string()))]
            .into_iter()
            .collect();
        let options = ControlOptions::new("lab-test", Home::new(home.path()))
            .with_authkeys(keys)
            .with_listener(listener)
            .with_interval(Duration::from_millis(100));
        let control = Control::new(Echo::default(), options);
        let handle = tokio::spawn(control.run());
        (HostPort::new("127.0.0.1", port), handle, home)
    }

    #[tokio::test]
    async fn test_call_and_error_kinds() {
        let (addr, _handle, _home) = start();
        let mut client = RemoteControl::new(addr, None, Some(Duration::from_secs(5)));
        let result = client.call("echo", vec![json!(1), json!("two")]).await.unwrap();
        assert_eq!(result, json!([1, "two"]));

        let err = client.call("busy", vec![]).await.unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Busy);
        assert_eq!(err.trace()[0].2, "busy");

        let err = client.call("nothing", vec![]).await.unwrap_err();
        assert_eq!(err.message(), "no such RPC: nothing");

        // the connection survives errors
        assert_eq!(client.call("bump", vec![]).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_wrong_key_is_anonymous_not_fatal() {
        let (addr, _handle, _home) = start();
        let mut bad = RemoteControl::new(addr.clone(), Some("wrong".into()), None);
        let err = bad.call("whoami", vec![]).await.unwrap_err();
        assert_eq!(err.message(), "not authenticated to make this call");
        let err = bad.call("stop", vec![]).await.unwrap_err();
        assert_eq!(err.message(), "not authorized to make this call");

        let mut good = RemoteControl::new(addr, Some("admin-key".into()), None);
        assert_eq!(good.call("whoami", vec![]).await.unwrap(), json!("admin-key"));
    }

    #[tokio::test]
    async fn test_deferred_reply_runs_followup() {
        let (addr, _handle, _home) = start();
        let mut client = RemoteControl::new(addr, None, Some(Duration::from_secs(5)));
        assert_eq!(client.call("later", vec![]).await.unwrap(), json!("late"));
        assert_eq!(client.call("bump", vec![]).await.unwrap(), json!(101));
    }

    #[tokio::test]
    async fn test_async_call_gets_no_reply() {
        let (addr, _handle, _home) = start();
        let mut client = RemoteControl::new(addr, None, Some(Duration::from_secs(5)));
        client.call_async("bump", vec![]).await.unwrap();
        // the next reply belongs to the next call
        assert_eq!(client.call("bump", vec![]).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_exit_reaches_every_connection() {
        let (addr, handle, _home) = start();
        let mut watcher = RemoteControl::new(addr.clone(), None, None);
        watcher.call("echo", vec![]).await.unwrap();
        let mut admin = RemoteControl::new(addr, Some("admin-key".into()), None);
        let err = admin.call("stop", vec![]).await.unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Exit);

        let notice = watcher.receive().await.unwrap_err();
        assert_eq!(notice.kind(), &ErrorKind::Exit);
        assert_eq!(notice.message(), "stopping");

        let service = handle.await.unwrap().unwrap();
        assert_eq!(service.counter, 0);
    }

    #[tokio::test]
    async fn test_listening_resumes_on_the_same_port() {
        let (addr, _handle, _home) = start();
        let mut client = RemoteControl::new(addr.clone(), None, Some(Duration::from_secs(5)));
        client.call("deaf", vec![]).await.unwrap();

        let mut late = RemoteControl::new(addr.clone(), None, Some(Duration::from_millis(300)));
        assert!(late.call("echo", vec![]).await.is_err());

        client.call("hear", vec![]).await.unwrap();
        let mut again = RemoteControl::new(addr, None, Some(Duration::from_secs(5)));
        assert_eq!(again.call("echo", vec![json!(7)]).await.unwrap(), json!([7]));
    }

    #[tokio::test]
    async fn test_dump_writes_snapshot_off_the_loop() {
        let home = tempfile::tempdir().unwrap();
        let options = ControlOptions::new("lab-test", Home::new(home.path()));
        let mut control = Control::new(Echo::default(), options);
        control.dump().await.unwrap();

        let names: Vec<String> = std::fs::read_dir(Home::new(home.path()).hickup_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].contains("-lab-test-"));
    }

    #[tokio::test]
    async fn test_lost_connection_reported() {
        let (addr, handle, _home) = start();
        {
            let mut client = RemoteControl::new(addr.clone(), None, None);
            client.call("echo", vec![]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut admin = RemoteControl::new(addr, Some("admin-key".into()), None);
        let _ = admin.call("stop", vec![]).await;
        let service = handle.await.unwrap().unwrap();
        assert!(service.lost >= 1);
    }
}
