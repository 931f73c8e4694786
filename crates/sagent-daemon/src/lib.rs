//! Sashimono contract-instance agent.
//!
//! A long-running local service that allocates, configures, starts, stops,
//! inspects and destroys tenant-isolated contract workloads on one Linux
//! host. Clients drive it over a permissioned unix socket with a
//! length-prefixed JSON protocol; allocations persist in a SQLite catalog
//! that survives restarts and feeds port recycling.
//!
//! # Module overview
//!
//! - [`protocol`]: frame codec and the request/response envelope
//! - [`dispatch`]: one frame in, one response out
//! - [`catalog`]: the SQLite instance catalog and the lease view
//! - [`ports`]: deterministic port assignment with a vacancy free-list
//! - [`host`]: argv-based adapters for the engine, user helpers, hpfs,
//!   filesystem trees and the startup readiness probe
//! - [`contract`]: contract materialization and config overlays
//! - [`lifecycle`]: the create/initiate/start/stop/destroy/inspect state
//!   machine with reverse-order compensations
//! - [`server`]: the one-session-at-a-time admin socket server

pub mod catalog;
pub mod contract;
pub mod dispatch;
pub mod host;
pub mod lifecycle;
pub mod ports;
pub mod protocol;
pub mod server;

pub use lifecycle::{Agent, LifecycleError};
pub use server::{AdminServer, ServerError};
