// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lab Broker
//!
//! One executable for every process role:
//! - `serve` runs the broker
//! - `session` and `notifier` are started by the broker itself
//! - `restart` hands a running broker over to a fresh process
//! - `call` sends one RPC and prints the JSON reply
//!
//! # Usage
//!
//! ```bash
//! # Start the broker described by ~/.lab/config/broker.json
//! lab-broker serve
//!
//! # Use another home and more logging
//! lab-broker --home /srv/lab --log-level debug serve
//!
//! # Restart without losing sessions
//! lab-broker restart --timeout 10
//!
//! # Admin calls use the "admin" key from authkeys.json
//! lab-broker call list_equipment '{"type": "handset"}'
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use lab_broker::broker::{Adopted, DEFAULT_FDTX_DIR};
use lab_broker::config::{Authkeys, BrokerConfig, Home, HostPort, WorkspaceConfig};
use lab_broker::control::process::bind_listener;
use lab_broker::control::{Control, ControlOptions, RemoteControl, DEFAULT_TIMEOUT};
use lab_broker::handover::Adoption;
use lab_broker::launcher::{
    inherit_listener, Launcher, MASTER_KEY_ENV, NOTIFIER_KEY_ENV, SESSION_KEYS_ENV,
};
use lab_broker::{Broker, Notifier, Session};
use serde_json::{json, Value};
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long a takeover broker waits for the session sockets.
const ADOPTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Lab Broker - allocation of shared test equipment
#[derive(Parser, Debug)]
#[command(name = "lab-broker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Home directory holding .lab/ (default: $LAB_HOME, then $HOME)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error or a directive list)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the broker
    Serve {
        /// Take over the sessions of a broker in handover
        #[arg(long)]
        adoption: Option<PathBuf>,
    },
    /// Run a session process (started by the broker)
    Session {
        /// Inherited listening socket
        #[arg(long)]
        listen_fd: RawFd,

        /// Host name advertised to the client
        #[arg(long)]
        host: String,
    },
    /// Run the notifier of a share broker (started by the broker)
    Notifier {
        /// Inherited listening socket
        #[arg(long)]
        listen_fd: RawFd,

        /// Master broker, host:port
        #[arg(long)]
        master: String,

        /// Address of the share broker as the master knows it, host:port
        #[arg(long)]
        local: String,
    },
    /// Replace the running broker with a new process, keeping its sessions
    Restart {
        /// Directory for the fd transfer channel
        #[arg(long)]
        fdtx_dir: Option<String>,

        /// Seconds to wait for the new broker
        #[arg(long, default_value_t = 5.0)]
        timeout: f64,
    },
    /// Call an RPC and print the reply
    Call {
        /// Target, host:port (default: the local broker)
        #[arg(long)]
        address: Option<String>,

        /// Account whose key from authkeys.json is used
        #[arg(long, default_value = "admin")]
        account: String,

        /// Method name
        method: String,

        /// Arguments, as JSON (plain words are taken as strings)
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let home = Home::resolve(args.home.clone())?;

    match args.command {
        Commands::Serve { adoption } => serve(home, args.log_level, adoption).await,
        Commands::Session { listen_fd, host } => {
            init_logging(args.log_level.as_deref().unwrap_or("info"));
            run_session(home, listen_fd, host).await
        }
        Commands::Notifier {
            listen_fd,
            master,
            local,
        } => {
            init_logging(args.log_level.as_deref().unwrap_or("info"));
            run_notifier(home, listen_fd, &master, &local).await
        }
        Commands::Restart { fdtx_dir, timeout } => {
            init_logging(args.log_level.as_deref().unwrap_or("warn"));
            restart(home, args.log_level, fdtx_dir, timeout).await
        }
        Commands::Call {
            address,
            account,
            method,
            args: call_args,
        } => {
            init_logging(args.log_level.as_deref().unwrap_or("warn"));
            call(home, address, &account, &method, call_args).await
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// `broker.json`, or the defaults when there is none.
fn load_broker_config(home: &Home) -> Result<BrokerConfig> {
    let path = home.broker_config_path();
    if !path.exists() {
        return Ok(BrokerConfig::default());
    }
    BrokerConfig::from_file(&path).with_context(|| format!("loading {}", path.display()))
}

fn parse_host_port(s: &str) -> Result<HostPort> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected host:port, got {:?}", s))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid port in {:?}", s))?;
    Ok(HostPort::new(host, port))
}

async fn serve(home: Home, log_level: Option<String>, adoption: Option<PathBuf>) -> Result<()> {
    let adoption = match adoption {
        Some(path) => {
            let adoption = Adoption::from_file(&path)?;
            if let Err(e) = std::fs::remove_file(&path) {
                eprintln!("could not remove {}: {}", path.display(), e);
            }
            Some(adoption)
        }
        None => None,
    };
    let config = match &adoption {
        Some(adoption) => adoption.config.clone(),
        None => load_broker_config(&home)?,
    };
    let level = log_level.unwrap_or_else(|| {
        if config.logging { "info" } else { "warn" }.to_string()
    });
    init_logging(&level);

    let authkeys = Authkeys::from_file(&home.authkeys_path())?;
    let ws_config = WorkspaceConfig::load(&home)?;
    let launcher = Launcher::current(&home, level)?;

    let adopted = match adoption {
        Some(adoption) => {
            info!("adopting from {}", adoption.fdtx_path.display());
            let adopted = tokio::task::spawn_blocking(move || {
                let sockets = adoption.receive_sessions(ADOPTION_TIMEOUT)?;
                Ok::<_, anyhow::Error>(Adopted {
                    serialized: adoption.serialized,
                    sockets,
                })
            })
            .await??;
            Some(adopted)
        }
        None => None,
    };

    let listener = bind_listener(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.port))
        .with_context(|| format!("binding port {}", config.port))?;
    let broker = Broker::new(config, ws_config, launcher, adopted)?;
    let options = ControlOptions::new("lab-broker", home)
        .with_authkeys(authkeys)
        .with_listener(listener);
    Control::new(broker, options).run().await?;
    info!("broker stopped");
    Ok(())
}

async fn run_session(home: Home, listen_fd: RawFd, host: String) -> Result<()> {
    let keys = std::env::var(SESSION_KEYS_ENV)
        .with_context(|| format!("{} is not set", SESSION_KEYS_ENV))?;
    let keys: Authkeys = serde_json::from_str(&keys)?;
    std::env::remove_var(SESSION_KEYS_ENV);
    // SAFETY: the broker passes a listener it bound for this process only.
    let listener = unsafe { inherit_listener(listen_fd) }?;
    let port = listener.local_addr()?.port();
    let ws_config = WorkspaceConfig::load(&home)?;

    let session = Session::new(HostPort::new(host, port), ws_config);
    let options = ControlOptions::new("lab-session", home)
        .with_authkeys(keys)
        .with_listener(listener);
    Control::new(session, options).run().await?;
    Ok(())
}

async fn run_notifier(home: Home, listen_fd: RawFd, master: &str, local: &str) -> Result<()> {
    let key = std::env::var(NOTIFIER_KEY_ENV)
        .with_context(|| format!("{} is not set", NOTIFIER_KEY_ENV))?;
    let master_key = std::env::var(MASTER_KEY_ENV).ok();
    std::env::remove_var(NOTIFIER_KEY_ENV);
    std::env::remove_var(MASTER_KEY_ENV);
    // SAFETY: as for sessions.
    let listener = unsafe { inherit_listener(listen_fd) }?;

    let keys: Authkeys = [("broker".to_string(), Some(key))].into_iter().collect();
    let notifier = Notifier::new(parse_host_port(master)?, master_key, parse_host_port(local)?);
    let options = ControlOptions::new("lab-notifier", home)
        .with_authkeys(keys)
        .with_listener(listener);
    Control::new(notifier, options).run().await?;
    Ok(())
}

fn admin_control(home: &Home, address: Option<&str>, account: &str) -> Result<RemoteControl> {
    let address = match address {
        Some(address) => parse_host_port(address)?,
        None => HostPort::new("127.0.0.1", load_broker_config(home)?.port),
    };
    let authkeys = Authkeys::from_file(&home.authkeys_path())?;
    let key = authkeys.get(account).map(String::from);
    Ok(RemoteControl::new(address, key, Some(DEFAULT_TIMEOUT)))
}

async fn restart(
    home: Home,
    log_level: Option<String>,
    fdtx_dir: Option<String>,
    timeout: f64,
) -> Result<()> {
    let mut broker = admin_control(&home, None, "admin")?;
    let dir = fdtx_dir.unwrap_or_else(|| DEFAULT_FDTX_DIR.to_string());
    let reply = broker.call("begin_handover", vec![json!(dir)]).await?;
    let adoption = Adoption::from_handover(&reply)?;
    info!(
        "handover begun with {} sessions to adopt",
        adoption.serialized.len()
    );

    let file = home
        .config_dir()
        .join(format!("adoption-{}.json", std::process::id()));
    adoption.to_file(&file)?;

    let mut command = std::process::Command::new(std::env::current_exe()?);
    command.arg("--home").arg(home.path());
    if let Some(level) = &log_level {
        command.arg("--log-level").arg(level);
    }
    let child = command
        .arg("serve")
        .arg("--adoption")
        .arg(&file)
        .stdin(Stdio::null())
        .spawn()
        .context("starting the new broker")?;

    if let Err(e) = broker.call("end_handover", vec![json!(timeout)]).await {
        warn!("end_handover: {}", e);
        return Err(e.into());
    }
    println!("{}", child.id());
    Ok(())
}

async fn call(
    home: Home,
    address: Option<String>,
    account: &str,
    method: &str,
    args: Vec<String>,
) -> Result<()> {
    let mut control = admin_control(&home, address.as_deref(), account)?;
    let vargs: Vec<Value> = args
        .into_iter()
        .map(|a| serde_json::from_str(&a).unwrap_or(Value::String(a)))
        .collect();
    let reply = control.call(method, vargs).await?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}
