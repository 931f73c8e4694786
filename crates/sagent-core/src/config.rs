//! Agent configuration.
//!
//! Loaded from a TOML file (default `/etc/sashimono/sa.toml`). Every field
//! has a default so a missing file yields a usable development
//! configuration; production installs ship the real file alongside the
//! daemon.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML or has ill-typed fields.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// A field value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Filesystem locations used by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Data directory holding the catalog database and the admin socket.
    pub data_dir: PathBuf,
    /// Admin socket path. Empty means `<data_dir>/sa.sock`.
    pub socket: Option<PathBuf>,
    /// Template tree copied for every new contract.
    pub contract_template: PathBuf,
    /// Shell helper creating the instance user and its quota wiring.
    pub user_install_script: PathBuf,
    /// Shell helper removing the instance user and everything it owns.
    pub user_uninstall_script: PathBuf,
    /// The container engine CLI binary.
    pub docker_bin: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/etc/sashimono"),
            socket: None,
            contract_template: PathBuf::from("/usr/bin/sashimono/contract_template"),
            user_install_script: PathBuf::from("/usr/bin/sashimono/user-install.sh"),
            user_uninstall_script: PathBuf::from("/usr/bin/sashimono/user-uninstall.sh"),
            docker_bin: PathBuf::from("/usr/bin/sashimono/dockerbin/docker"),
        }
    }
}

/// Port bases and the public address handed to instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HpConfig {
    /// First peer (mesh) port.
    pub init_peer_port: u16,
    /// First user port.
    pub init_user_port: u16,
    /// First general-purpose TCP port; each instance reserves two.
    pub init_gp_tcp_port: u16,
    /// First general-purpose UDP port; each instance reserves two.
    pub init_gp_udp_port: u16,
    /// Host address reported in instance records.
    pub host_address: String,
}

impl Default for HpConfig {
    fn default() -> Self {
        Self {
            init_peer_port: 22861,
            init_user_port: 26201,
            init_gp_tcp_port: 36525,
            init_gp_udp_port: 39064,
            host_address: String::new(),
        }
    }
}

/// Whole-host capacity caps divided evenly among instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Maximum number of live instances.
    pub max_instance_count: usize,
    /// Total CPU time budget in microseconds per cgroup period.
    pub max_cpu_us: u64,
    /// Total memory budget in kilobytes.
    pub max_mem_kbytes: u64,
    /// Total swap budget in kilobytes.
    pub max_swap_kbytes: u64,
    /// Total disk budget in kilobytes.
    pub max_storage_kbytes: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            max_instance_count: 3,
            max_cpu_us: 900_000,
            max_mem_kbytes: 3_145_728,
            max_swap_kbytes: 3_145_728,
            max_storage_kbytes: 5_242_880,
        }
    }
}

/// Container-engine settings forwarded to the install helper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Registry the install helper pulls images from.
    pub registry_address: String,
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Filesystem locations.
    pub paths: PathsConfig,
    /// Port bases and host address.
    pub hp: HpConfig,
    /// Host capacity caps.
    pub system: SystemConfig,
    /// Engine settings.
    pub docker: DockerConfig,
}

impl AgentConfig {
    /// Loads the configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, parsed, or
    /// fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a cap is zero or the port
    /// bases cannot accommodate `max_instance_count` reservations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.system.max_instance_count == 0 {
            return Err(ConfigError::Invalid(
                "system.max_instance_count must be at least 1".into(),
            ));
        }
        let n = self.system.max_instance_count as u64;
        for (name, value) in [
            ("system.max_cpu_us", self.system.max_cpu_us),
            ("system.max_mem_kbytes", self.system.max_mem_kbytes),
            ("system.max_storage_kbytes", self.system.max_storage_kbytes),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        // Two GP ports are reserved per instance, so the GP bases advance
        // twice as fast as the peer/user bases.
        let fits = |base: u16, step: u64| u64::from(base) + step * n <= u64::from(u16::MAX);
        if !fits(self.hp.init_peer_port, 1)
            || !fits(self.hp.init_user_port, 1)
            || !fits(self.hp.init_gp_tcp_port, 2)
            || !fits(self.hp.init_gp_udp_port, 2)
        {
            return Err(ConfigError::Invalid(
                "port bases leave no room for max_instance_count reservations".into(),
            ));
        }
        Ok(())
    }

    /// The admin socket path (`paths.socket`, or `<data_dir>/sa.sock`).
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.paths
            .socket
            .clone()
            .unwrap_or_else(|| self.paths.data_dir.join("sa.sock"))
    }

    /// The instance catalog database path.
    #[must_use]
    pub fn catalog_db_path(&self) -> PathBuf {
        self.paths.data_dir.join("sa.sqlite")
    }

    /// The read-only message-board (lease) database path.
    #[must_use]
    pub fn lease_db_path(&self) -> PathBuf {
        self.paths.data_dir.join("mb-xrpl").join("mb-xrpl.sqlite")
    }
}
