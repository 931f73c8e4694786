//! Core types for the Sashimono contract-instance agent.
//!
//! This crate is deliberately free of host side effects: it holds the
//! configuration document, the neutral data-transfer records exchanged
//! between the protocol layer and the lifecycle controller, the
//! `create.config` overlay schema, and signing-key generation. The daemon
//! crate (`sagent-daemon`) owns all I/O.

pub mod config;
pub mod instance;
pub mod keys;
pub mod overlay;

pub use config::AgentConfig;
pub use instance::{InstanceInfo, InstanceStatus, LeaseInfo, Ports, Resources};
pub use keys::SigningKeypair;
pub use overlay::ConfigOverlay;
