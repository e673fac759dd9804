// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lab Equipment Broker
//!
//! Tracks test equipment (handsets, relays, workspaces, stacked rigs) spread
//! over cooperating brokers and allocates it exclusively to client sessions.
//!
//! # Features
//!
//! - **Allocation**: stacks, collateral and workspace creation per request
//! - **Sessions**: one process per client holds the allocated resources
//! - **Federation**: share brokers push their inventory to a master, forward
//!   brokers send every request upstream
//! - **Handover**: a replacement broker takes over live sessions without
//!   losing an allocation
//!
//! # Quick Start
//!
//! ```bash
//! # Run a broker from ~/.lab/config/broker.json
//! lab-broker serve
//!
//! # Replace it with a fresh process, keeping every session
//! lab-broker restart
//!
//! # Ask it something
//! lab-broker call list_available
//! ```
//!
//! # Configuration File
//!
//! ```json
//! {
//!     "host": "lab-host-1",
//!     "port": 4000,
//!     "stacks": [[{"type": "handset", "serial": "a1"},
//!                 {"type": "relay", "uid": "r1"}]],
//!     "remote": {"host": "master", "port": 4000, "policy": "share"},
//!     "equipment": [{"type": "relay", "uid": "r1", "power_state": "online"}]
//! }
//! ```

pub mod allocator;
pub mod broker;
pub mod config;
pub mod control;
pub mod error;
pub mod handover;
pub mod launcher;
pub mod notifier;
pub mod profile;
pub mod remote;
pub mod session;
pub mod workspace;

pub use allocator::{Allocator, AllocatorKey, Allocators, LocalAllocator, ShareAllocator};
pub use broker::{Adopted, Broker};
pub use config::{Authkeys, BrokerConfig, Home, HostPort, Policy, WorkspaceConfig};
pub use control::{Control, ControlOptions, RemoteControl};
pub use error::{ErrorKind, RpcError, RpcResult};
pub use handover::Adoption;
pub use notifier::Notifier;
pub use profile::{Profile, ProfileKind};
pub use remote::{RemoteBroker, RemoteSession, ResourceHandle};
pub use session::Session;
