//! Guest lifecycle engine for the FleetVM request server.
//!
//! A single [`master::MasterGuest`] is booted once, driven to its quiescent
//! "waiting for requests" point, optionally warmed up ([`warmup`]), and
//! frozen as a copy-on-write template. A [`pool::Pool`] of [`worker::Worker`]
//! clones is forked from that template to service inbound connections, each
//! reset back to the template between clients.
//!
//! The virtualization back-end itself is a narrow trait boundary
//! ([`vm::Machine`]); this crate implements everything above that boundary:
//! the allow-list [`policy`], the [`policy::path_resolver`] longest-prefix
//! search, the [`sandbox`] syscall-interception hooks, and the master/worker
//! lifecycle state machines.

pub mod banner;
pub mod config;
pub mod gdb;
pub mod lifecycle;
pub mod master;
pub mod policy;
pub mod pool;
pub mod sandbox;
pub mod storage_guest;
pub mod vm;
pub mod warmup;
pub mod worker;

pub use fleetvm_shared::{FleetError, FleetResult};

pub use config::Configuration;
pub use policy::Policy;
pub use pool::Pool;
