// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Push side of a share broker.
//!
//! The broker hands the notifier its workspace profile, stacks and
//! equipment snapshot. The notifier forwards them to the master broker,
//! retrying with exponential backoff while the master cannot be reached.
//! Once a push has gone through, losing the master ends the process and the
//! broker starts a fresh notifier.

use crate::config::HostPort;
use crate::control::{
    Access, ConnId, Context, LinkHandle, MethodTable, Params, Reply, Request, Service,
    DEFAULT_TIMEOUT,
};
use crate::error::{RpcError, RpcResult};
use crate::profile::Profile;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Idle interval while the master is in sync.
pub const PUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Upper bound of the retry backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(16);

const BROKER_ACCOUNT: &[&str] = &["broker"];

/// Next retry interval after a failed push.
pub fn backoff(interval: Duration) -> Duration {
    if interval < MAX_BACKOFF {
        (interval * 2).min(MAX_BACKOFF)
    } else {
        interval
    }
}

/// What still has to reach the master.
#[derive(Debug, Default, Clone, PartialEq)]
struct Pending {
    ws_profile: Option<Value>,
    stacks: Option<Value>,
    equipment: Option<(Value, Value)>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.ws_profile.is_none() && self.stacks.is_none() && self.equipment.is_none()
    }

    /// Forget what was pushed unless it changed in the meantime.
    fn settle(&mut self, pushed: &Pending) {
        if self.ws_profile == pushed.ws_profile {
            self.ws_profile = None;
        }
        if self.stacks == pushed.stacks {
            self.stacks = None;
        }
        if self.equipment == pushed.equipment {
            self.equipment = None;
        }
    }

    fn requests(&self, local: &HostPort) -> Vec<Request> {
        let mut requests = Vec::new();
        if let Some(profile) = &self.ws_profile {
            requests.push(Request::new(
                "set_ws_profile",
                Params::positional(vec![local.to_value(), profile.clone()]),
            ));
        }
        if let Some(stacks) = &self.stacks {
            requests.push(Request::new(
                "set_stacks",
                Params::positional(vec![local.to_value(), stacks.clone()]),
            ));
        }
        if let Some((equipment, allocations)) = &self.equipment {
            requests.push(Request::new(
                "set_equipment",
                Params::positional(vec![
                    local.to_value(),
                    equipment.clone(),
                    allocations.clone(),
                ]),
            ));
        }
        requests
    }
}

pub struct Notifier {
    master_address: HostPort,
    master_key: Option<String>,
    local: HostPort,
    master: Option<LinkHandle>,
    connected: bool,
    pushing: bool,
    pending: Pending,
}

impl Notifier {
    /// `local` is the address of the share broker as the master sees it.
    pub fn new(master_address: HostPort, master_key: Option<String>, local: HostPort) -> Self {
        Self {
            master_address,
            master_key,
            local,
            master: None,
            connected: false,
            pushing: false,
            pending: Pending::default(),
        }
    }

    fn execute(&mut self, ctx: &mut Context<Self>) {
        if self.pushing {
            return;
        }
        let master = match &self.master {
            Some(link) => link.clone(),
            None => {
                let link = ctx.connect_link(
                    self.master_address.clone(),
                    self.master_key.clone(),
                    DEFAULT_TIMEOUT,
                );
                ctx.keep_watching(link.id());
                debug!("connecting to master {}", self.master_address);
                self.master = Some(link.clone());
                link
            }
        };
        if self.pending.is_empty() {
            return;
        }
        let pushed = self.pending.clone();
        let requests = pushed.requests(&self.local);
        self.pushing = true;
        ctx.spawn(async move {
            let mut outcome = Ok(());
            for request in requests {
                let method = request.method.clone();
                if let Err(e) = master.call(request, Some(DEFAULT_TIMEOUT)).await {
                    outcome = Err((method, e));
                    break;
                }
            }
            Some(crate::control::followup(move |n: &mut Notifier, ctx| {
                n.pushed(ctx, pushed, outcome)
            }))
        });
    }

    fn pushed(
        &mut self,
        ctx: &mut Context<Self>,
        pushed: Pending,
        outcome: Result<(), (String, RpcError)>,
    ) {
        self.pushing = false;
        match outcome {
            Ok(()) => {
                if !self.connected {
                    info!("connected to master {}", self.master_address);
                }
                if let Some((equipment, _)) = &pushed.equipment {
                    debug!("shared equipment with {}: {}", self.master_address, equipment);
                }
                self.connected = true;
                self.pending.settle(&pushed);
                ctx.set_interval(PUSH_INTERVAL);
                if !self.pending.is_empty() {
                    self.execute(ctx);
                }
            }
            Err((method, e)) => {
                warn!("could not notify master: {}: {}", method, e);
                ctx.set_interval(backoff(ctx.interval()));
            }
        }
    }
}

// handlers

fn ping(_: &mut Notifier, _: &mut Context<Notifier>, _: Params) -> RpcResult<Reply<Notifier>> {
    Reply::value("pong")
}

fn set_ws_profile(
    n: &mut Notifier,
    ctx: &mut Context<Notifier>,
    params: Params,
) -> RpcResult<Reply<Notifier>> {
    let profile: Value = params.required(0, "profile")?;
    let execute: bool = params.optional(1, "execute")?.unwrap_or(false);
    Profile::from_value(profile.clone())?;
    n.pending.ws_profile = Some(profile);
    if execute {
        n.execute(ctx);
    }
    Reply::none()
}

fn set_stacks(
    n: &mut Notifier,
    ctx: &mut Context<Notifier>,
    params: Params,
) -> RpcResult<Reply<Notifier>> {
    let stacks: Vec<Vec<Value>> = params.required(0, "stacks")?;
    let execute: bool = params.optional(1, "execute")?.unwrap_or(false);
    n.pending.stacks = Some(json!(stacks));
    if execute {
        n.execute(ctx);
    }
    Reply::none()
}

fn set_equipment(
    n: &mut Notifier,
    ctx: &mut Context<Notifier>,
    params: Params,
) -> RpcResult<Reply<Notifier>> {
    let profiles: Vec<Value> = params.required(0, "profiles")?;
    let allocations: Value = params.required(1, "allocations")?;
    for profile in &profiles {
        Profile::from_value(profile.clone())?;
    }
    n.pending.equipment = Some((Value::Array(profiles), allocations));
    n.execute(ctx);
    Reply::none()
}

impl Service for Notifier {
    fn register(methods: &mut MethodTable<Self>) {
        methods
            .rpc("ping", Access::Open, ping)
            .rpc("set_ws_profile", Access::Preauth(BROKER_ACCOUNT), set_ws_profile)
            .rpc("set_stacks", Access::Preauth(BROKER_ACCOUNT), set_stacks)
            .rpc("set_equipment", Access::Preauth(BROKER_ACCOUNT), set_equipment)
            .internal("execute");
    }

    fn initialize(&mut self, ctx: &mut Context<Self>) -> RpcResult<()> {
        ctx.set_interval(PUSH_INTERVAL);
        Ok(())
    }

    fn idle(&mut self, ctx: &mut Context<Self>) {
        self.execute(ctx);
    }

    fn lost_connection(&mut self, ctx: &mut Context<Self>, id: ConnId, _: Option<&str>) {
        if self.master.as_ref().map(LinkHandle::id) != Some(id) {
            return;
        }
        self.master = None;
        if self.connected {
            info!("lost master {}, stopping", self.master_address);
            ctx.shutdown(None);
        } else {
            warn!("could not connect to master {}", self.master_address);
            ctx.set_interval(backoff(ctx.interval()));
        }
    }

    fn dump(&self) -> Value {
        json!({
            "master": self.master_address.to_value(),
            "local": self.local.to_value(),
            "connected": self.connected,
            "pushing": self.pushing,
            "pending": {
                "ws_profile": self.pending.ws_profile,
                "stacks": self.pending.stacks,
                "equipment": self.pending.equipment.as_ref().map(|(e, _)| e),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Authkeys, Home};
    use crate::control::{Control, ControlOptions, RemoteControl};
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(String, Value)>>>;

    struct Master {
        seen: Seen,
    }

    impl Master {
        fn record(&mut self, method: &str, params: &Params) -> RpcResult<Reply<Self>> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push((method.to_string(), params.to_value()));
            }
            Reply::none()
        }
    }

    fn master_ws(m: &mut Master, _: &mut Context<Master>, p: Params) -> RpcResult<Reply<Master>> {
        m.record("set_ws_profile", &p)
    }

    fn master_stacks(m: &mut Master, _: &mut Context<Master>, p: Params) -> RpcResult<Reply<Master>> {
        m.record("set_stacks", &p)
    }

    fn master_eq(m: &mut Master, _: &mut Context<Master>, p: Params) -> RpcResult<Reply<Master>> {
        m.record("set_equipment", &p)
    }

    impl Service for Master {
        fn register(methods: &mut MethodTable<Self>) {
            methods
                .rpc("set_ws_profile", Access::Preauth(&["share"]), master_ws)
                .rpc("set_stacks", Access::Preauth(&["share"]), master_stacks)
                .rpc("set_equipment", Access::Preauth(&["share"]), master_eq);
        }
    }

    fn keys(account: &str, secret: &str) -> Authkeys {
        [(account.to_string(), Some(secret.to_string()))]
            .into_iter()
            .collect()
    }

    fn listener() -> (std::net::TcpListener, HostPort) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, HostPort::new("127.0.0.1", port))
    }

    async fn wait_for(seen: &Seen, count: usize) -> Vec<(String, Value)> {
        for _ in 0..100 {
            let current = seen.lock().unwrap().clone();
            if current.len() >= count {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        seen.lock().unwrap().clone()
    }

    #[test]
    fn test_backoff_doubles_to_limit() {
        assert_eq!(backoff(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(backoff(Duration::from_secs(8)), Duration::from_secs(16));
        assert_eq!(backoff(Duration::from_secs(12)), Duration::from_secs(16));
        assert_eq!(backoff(Duration::from_secs(16)), Duration::from_secs(16));
    }

    #[test]
    fn test_settle_keeps_newer_values() {
        let pushed = Pending {
            ws_profile: Some(json!({"type": "workspace"})),
            stacks: Some(json!([])),
            equipment: None,
        };
        let mut current = pushed.clone();
        current.stacks = Some(json!([[{"type": "relay", "uid": "a"}]]));
        current.settle(&pushed);
        assert!(current.ws_profile.is_none());
        assert!(current.stacks.is_some());
        current.settle(&current.clone());
        assert!(current.is_empty());
    }

    #[tokio::test]
    async fn test_pushes_reach_master() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Seen::default();
        let (master_listener, master_address) = listener();
        let master = Control::new(
            Master { seen: seen.clone() },
            ControlOptions::new("lab-master-test", Home::new(dir.path()))
                .with_authkeys(keys("share", "share-key"))
                .with_listener(master_listener),
        );
        tokio::spawn(master.run());

        let (listener, address) = listener();
        let local = HostPort::new("share-host", 4000);
        let notifier = Control::new(
            Notifier::new(master_address, Some("share-key".into()), local.clone()),
            ControlOptions::new("lab-notifier-test", Home::new(dir.path()))
                .with_authkeys(keys("broker", "notifier-key"))
                .with_listener(listener),
        );
        tokio::spawn(notifier.run());

        let mut broker = RemoteControl::new(address, Some("notifier-key".into()), None);
        assert_eq!(broker.call("ping", vec![]).await.unwrap(), json!("pong"));
        broker
            .call("set_ws_profile", vec![json!({"type": "workspace"}), json!(false)])
            .await
            .unwrap();
        broker
            .call("set_stacks", vec![json!([]), json!(true)])
            .await
            .unwrap();
        let seen_now = wait_for(&seen, 2).await;
        assert_eq!(seen_now[0].0, "set_ws_profile");
        assert_eq!(seen_now[0].1["vargs"][0], local.to_value());
        assert_eq!(seen_now[1].0, "set_stacks");

        broker
            .call(
                "set_equipment",
                vec![json!([{"type": "handset", "serial": "h1"}]), json!({})],
            )
            .await
            .unwrap();
        let seen_now = wait_for(&seen, 3).await;
        assert_eq!(seen_now[2].0, "set_equipment");
        assert_eq!(seen_now[2].1["vargs"][1][0]["serial"], json!("h1"));
    }

    #[tokio::test]
    async fn test_only_broker_may_push() {
        let dir = tempfile::tempdir().unwrap();
        let (listener, address) = listener();
        let notifier = Control::new(
            Notifier::new(HostPort::new("127.0.0.1", 1), None, HostPort::new("h", 1)),
            ControlOptions::new("lab-notifier-test", Home::new(dir.path()))
                .with_authkeys(keys("broker", "notifier-key"))
                .with_listener(listener),
        );
        tokio::spawn(notifier.run());
        let mut stranger = RemoteControl::new(address, Some("other".into()), None);
        let err = stranger
            .call("set_stacks", vec![json!([]), json!(false)])
            .await
            .unwrap_err();
        assert_eq!(err.message(), "not authorized to make this call");
        let err = stranger.call("execute", vec![]).await.unwrap_err();
        assert!(err.message().starts_with("not an RPC"));
    }
}
