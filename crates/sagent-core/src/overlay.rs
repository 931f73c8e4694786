//! The `create.config` overlay document.
//!
//! Every field is optional; only provided fields are written into the
//! instance's `hp.cfg`. Unknown keys are ignored, ill-typed values fail the
//! parse (and surface as a wire format error). Enumerated fields that the
//! agent itself interprets are validated here; constraints that depend on
//! the merged config document (history shards, the hpfs log level actually
//! in effect) are checked by the materializer after merging.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Overlay values that failed validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OverlayError {
    /// `node.role` is not one of `observer` or `validator`.
    #[error("invalid node role `{0}`, expected observer|validator")]
    InvalidRole(String),

    /// `node.history` is not one of `full` or `custom`.
    #[error("invalid history mode `{0}`, expected full|custom")]
    InvalidHistory(String),

    /// `hpfs.log.log_level` is not one of the known levels.
    #[error("invalid hpfs log level `{0}`, expected dbg|inf|wrn|err")]
    InvalidHpfsLogLevel(String),

    /// A UNL entry is not a hex string.
    #[error("invalid unl entry `{0}`, expected hex public key")]
    InvalidUnlEntry(String),
}

/// Valid hpfs log levels, also used by the materializer's read-back check.
pub const HPFS_LOG_LEVELS: [&str; 4] = ["dbg", "inf", "wrn", "err"];

/// One known-peer endpoint, serialized into `hp.cfg` as `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Peer host address.
    pub host_address: String,
    /// Peer mesh port.
    pub port: u16,
}

/// `contract.consensus` overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusOverlay {
    /// Consensus mode.
    pub mode: Option<String>,
    /// Round time in milliseconds.
    pub roundtime: Option<u64>,
    /// Stage slice percentage.
    pub stage_slice: Option<u64>,
    /// Voting threshold percentage.
    pub threshold: Option<u64>,
}

/// `contract.npl` overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NplOverlay {
    /// Node-party-line mode.
    pub mode: Option<String>,
}

/// `contract.round_limits` overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundLimitsOverlay {
    /// Max user input bytes per round.
    pub user_input_bytes: Option<u64>,
    /// Max user output bytes per round.
    pub user_output_bytes: Option<u64>,
    /// Max NPL output bytes per round.
    pub npl_output_bytes: Option<u64>,
    /// Contract process CPU seconds per round.
    pub proc_cpu_seconds: Option<u64>,
    /// Contract process memory bytes.
    pub proc_mem_bytes: Option<u64>,
    /// Contract process open-fd count.
    pub proc_ofd_count: Option<u64>,
    /// Contract execution timeout.
    pub exec_timeout: Option<u64>,
}

/// Rolling-log limits shared by `contract.log` and the top-level `log`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSizeOverlay {
    /// Max megabytes per log file.
    pub max_mbytes_per_file: Option<u64>,
    /// Max number of rotated files.
    pub max_file_count: Option<u64>,
}

/// `contract` section overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractOverlay {
    /// Replacement UNL (hex public keys).
    pub unl: Vec<String>,
    /// Whether the contract binary is executed each round.
    pub execute: Option<bool>,
    /// Environment variables for the contract process.
    pub environment: BTreeMap<String, String>,
    /// Max ledger offset for queued user inputs.
    pub max_input_ledger_offset: Option<u64>,
    /// Consensus overrides.
    pub consensus: ConsensusOverlay,
    /// NPL overrides.
    pub npl: NplOverlay,
    /// Round limit overrides.
    pub round_limits: RoundLimitsOverlay,
    /// Contract log limits.
    pub log: LogSizeOverlay,
}

/// `node.history_config` overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfigOverlay {
    /// Max primary shards retained (must be non-zero in custom mode).
    pub max_primary_shards: Option<u64>,
    /// Max raw shards retained.
    pub max_raw_shards: Option<u64>,
}

/// `node` section overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeOverlay {
    /// Node role: `observer` or `validator`.
    pub role: Option<String>,
    /// History mode: `full` or `custom`.
    pub history: Option<String>,
    /// History retention overrides.
    pub history_config: HistoryConfigOverlay,
}

/// `mesh.peer_discovery` overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerDiscoveryOverlay {
    /// Whether dynamic peer discovery is on.
    pub enabled: Option<bool>,
    /// Discovery interval in milliseconds.
    pub interval: Option<u64>,
}

/// `mesh` section overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshOverlay {
    /// Idle connection timeout.
    pub idle_timeout: Option<u64>,
    /// Seed peers.
    pub known_peers: Vec<PeerAddress>,
    /// Whether messages are forwarded between peers.
    pub msg_forwarding: Option<bool>,
    /// Max total peer connections.
    pub max_connections: Option<u64>,
    /// Max connections kept toward known peers.
    pub max_known_connections: Option<u64>,
    /// Max inbound connections per host.
    pub max_in_connections_per_host: Option<u64>,
    /// Max bytes per message.
    pub max_bytes_per_msg: Option<u64>,
    /// Max bytes per minute.
    pub max_bytes_per_min: Option<u64>,
    /// Max malformed messages per minute.
    pub max_bad_msgs_per_min: Option<u64>,
    /// Max bad message signatures per minute.
    pub max_bad_msgsigs_per_min: Option<u64>,
    /// Max duplicate messages per minute.
    pub max_dup_msgs_per_min: Option<u64>,
    /// Peer discovery overrides.
    pub peer_discovery: PeerDiscoveryOverlay,
}

/// `user` section overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserOverlay {
    /// Idle connection timeout.
    pub idle_timeout: Option<u64>,
    /// Max bytes per message.
    pub max_bytes_per_msg: Option<u64>,
    /// Max bytes per minute.
    pub max_bytes_per_min: Option<u64>,
    /// Max malformed messages per minute.
    pub max_bad_msgs_per_min: Option<u64>,
    /// Max total user connections.
    pub max_connections: Option<u64>,
    /// Max inbound connections per host.
    pub max_in_connections_per_host: Option<u64>,
    /// Max concurrent read requests.
    pub concurrent_read_requests: Option<u64>,
}

/// `hpfs.log` overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HpfsLogOverlay {
    /// hpfs log level: `dbg`, `inf`, `wrn` or `err`.
    pub log_level: Option<String>,
}

/// `hpfs` section overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HpfsOverlay {
    /// Log overrides.
    pub log: HpfsLogOverlay,
}

/// Top-level `log` section overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOverlay {
    /// Instance log level.
    pub log_level: Option<String>,
    /// Max megabytes per log file.
    pub max_mbytes_per_file: Option<u64>,
    /// Max number of rotated files.
    pub max_file_count: Option<u64>,
    /// Enabled logger sinks.
    pub loggers: Vec<String>,
}

/// The whole overlay carried in `create.config`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverlay {
    /// Contract overrides.
    pub contract: ContractOverlay,
    /// Node overrides.
    pub node: NodeOverlay,
    /// Mesh overrides.
    pub mesh: MeshOverlay,
    /// User overrides.
    pub user: UserOverlay,
    /// hpfs overrides.
    pub hpfs: HpfsOverlay,
    /// Log overrides.
    pub log: LogOverlay,
}

impl ConfigOverlay {
    /// Validates the enumerations the agent itself interprets.
    ///
    /// # Errors
    ///
    /// Returns the first offending field as an [`OverlayError`].
    pub fn validate(&self) -> Result<(), OverlayError> {
        if let Some(role) = &self.node.role {
            if role != "observer" && role != "validator" {
                return Err(OverlayError::InvalidRole(role.clone()));
            }
        }
        if let Some(history) = &self.node.history {
            if history != "full" && history != "custom" {
                return Err(OverlayError::InvalidHistory(history.clone()));
            }
        }
        if let Some(level) = &self.hpfs.log.log_level {
            if !HPFS_LOG_LEVELS.contains(&level.as_str()) {
                return Err(OverlayError::InvalidHpfsLogLevel(level.clone()));
            }
        }
        for entry in &self.contract.unl {
            if entry.is_empty() || hex::decode(entry).is_err() {
                return Err(OverlayError::InvalidUnlEntry(entry.clone()));
            }
        }
        Ok(())
    }
}
