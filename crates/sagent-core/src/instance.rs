//! Instance, port, lease and resource records.
//!
//! These are the neutral records exchanged between the protocol layer and
//! the lifecycle controller: the parser produces them, the controller and
//! catalog consume them, and the response builder serializes them back out.

use serde::{Deserialize, Serialize};

/// The four port numbers reserved for one instance.
///
/// `peer_port` and `user_port` are single ports; the two general-purpose
/// starts each reserve a contiguous pair (start and start + 1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ports {
    /// Mesh (peer) port, published TCP and UDP.
    #[serde(rename = "peer")]
    pub peer_port: u16,
    /// User (client) port, published TCP.
    #[serde(rename = "user")]
    pub user_port: u16,
    /// First of two reserved general-purpose TCP ports.
    pub gp_tcp_port_start: u16,
    /// First of two reserved general-purpose UDP ports.
    pub gp_udp_port_start: u16,
}

impl Ports {
    /// The tuple that follows `self` in the monotonic assignment order.
    ///
    /// Peer and user advance by one, the general-purpose starts by two
    /// (each instance holds a pair).
    #[must_use]
    pub const fn next(self) -> Self {
        Self {
            peer_port: self.peer_port + 1,
            user_port: self.user_port + 1,
            gp_tcp_port_start: self.gp_tcp_port_start + 2,
            gp_udp_port_start: self.gp_udp_port_start + 2,
        }
    }

    /// True when any of the four reservations overlap between the tuples.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        // Each GP start reserves a pair, so adjacency collides too.
        let pair = |a: u16, b: u16| u32::from(a).abs_diff(u32::from(b)) <= 1;
        self.peer_port == other.peer_port
            || self.user_port == other.user_port
            || pair(self.gp_tcp_port_start, other.gp_tcp_port_start)
            || pair(self.gp_udp_port_start, other.gp_udp_port_start)
    }
}

/// Catalog status of an instance.
///
/// `Destroyed` is terminal; `Exited` is never written to the catalog, it is
/// only observed through the engine's inspect output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Allocated and materialized, never started.
    Created,
    /// Container started.
    Running,
    /// Container stopped by request.
    Stopped,
    /// Torn down (only reachable when soft deletion is in play).
    Destroyed,
    /// Container exited on its own; observed, never persisted.
    Exited,
}

impl InstanceStatus {
    /// The catalog string for this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
            Self::Exited => "exited",
        }
    }

    /// Parses a catalog string.
    #[must_use]
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "destroyed" => Some(Self::Destroyed),
            "exited" => Some(Self::Exited),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tenant workload: OS user, quotas, contract dir, container, ports and
/// signing key.
///
/// The username serializes as `"user"` on the wire; the CLI's attach flow
/// reads it under that key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Unique container name.
    pub container_name: String,
    /// Hex public key of the tenant that owns the instance.
    pub owner_pubkey: String,
    /// Contract id (UUID).
    pub contract_id: String,
    /// Hex public key of the instance's own signing keypair.
    pub pubkey: String,
    /// Contract directory under the instance user's home.
    pub contract_dir: String,
    /// Image reference the container was created from.
    pub image_name: String,
    /// Host address the instance is reachable at.
    pub ip: String,
    /// Instance OS username.
    #[serde(rename = "user")]
    pub username: String,
    /// The reserved port tuple.
    pub assigned_ports: Ports,
    /// Catalog status.
    pub status: InstanceStatus,
}

/// A lease row from the message-board database (read-only collaborator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    /// Lease acquisition timestamp.
    pub timestamp: u64,
    /// Container the lease is bound to.
    pub container_name: String,
    /// Tenant's XRP address.
    pub tenant_xrp_address: String,
    /// Ledger sequence the lease was created on.
    pub created_on_ledger: u64,
    /// Purchased life in moments.
    pub life_moments: u64,
}

/// Per-instance quota derived once at startup from the host caps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resources {
    /// CPU time in microseconds per cgroup period.
    pub cpu_us: u64,
    /// Memory in kilobytes.
    pub mem_kbytes: u64,
    /// Swap in kilobytes (memory share plus swap share).
    pub swap_kbytes: u64,
    /// Disk in kilobytes.
    pub storage_kbytes: u64,
}

impl Resources {
    /// Divides the host caps evenly among `max_instance_count` slots.
    ///
    /// Swap is charged on top of the memory share because the cgroup
    /// `memsw` limit counts memory and swap together.
    #[must_use]
    pub fn per_instance(system: &crate::config::SystemConfig) -> Self {
        let n = system.max_instance_count as u64;
        let mem_kbytes = system.max_mem_kbytes / n;
        Self {
            cpu_us: system.max_cpu_us / n,
            mem_kbytes,
            swap_kbytes: mem_kbytes + system.max_swap_kbytes / n,
            storage_kbytes: system.max_storage_kbytes / n,
        }
    }
}
