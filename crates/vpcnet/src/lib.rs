//! Single-host VPC simulator control plane.
//!
//! Materializes cloud-style VPCs out of Linux primitives (one software
//! bridge and one dedicated filter chain per vpc, one network namespace per
//! subnet, veth pairs for wiring, iptables rules for policy) and keeps a
//! durable JSON document per vpc describing everything it created.
//!
//! ```text
//!            ┌──────────── vpc "myvpc" (10.10.0.0/16) ────────────┐
//!            │                  br-myvpc                           │
//!            │     10.10.1.1 ──────┴────── 10.10.2.1               │
//!            │         │ veth                  │ veth              │
//!            │  ns-myvpc-public        ns-myvpc-private            │
//!            │    10.10.1.2                10.10.2.2               │
//!            └──────────── chain vpc-myvpc in FORWARD ────────────┘
//! ```
//!
//! Every operation reads the store, plans, executes an ordered sequence of
//! idempotent kernel mutations, then rewrites the document atomically. The
//! document doubles as the teardown plan: `delete` replays the recorded rule
//! log in reverse and removes objects by their derived names. All mutating
//! commands honor dry-run.

pub mod app;
pub mod cidr;
pub mod command;
pub mod context;
pub mod error;
pub mod names;
pub mod nat;
pub mod net;
pub mod peering;
pub mod policy;
pub mod prereq;
pub mod rules;
pub mod store;
pub mod subnet;
pub mod types;
pub mod verify;
pub mod vpc;

pub use app::{AppSelector, deploy_app, stop_app};
pub use command::{ExecMode, Executor};
pub use context::{Context, ContextConfig};
pub use error::{Error, Result};
pub use nat::{NatScope, enable_nat};
pub use peering::peer;
pub use policy::{PolicyDoc, apply_policy};
pub use subnet::add_subnet;
pub use types::VpcDoc;
pub use verify::{VerifyReport, verify};
pub use vpc::{cleanup_all, create, delete, inspect, list};
