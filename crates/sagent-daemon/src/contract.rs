//! Contract materialization and config management.
//!
//! A contract is seeded by copying the template tree into a scratch
//! directory under `/tmp`, rewriting `cfg/hp.cfg` with the instance's
//! freshly generated signing keypair, identity and ports, then moving the
//! tree onto the instance user's contract directory and transferring
//! ownership. Nothing appears under the contract directory until the move,
//! so a failure before it leaves no state behind (the scratch dir cleans
//! itself up).
//!
//! The same module applies the `create.config` overlay at initiation and
//! re-reads the settings the hpfs sidecar needs (log level, history mode).

use std::path::{Path, PathBuf};

use sagent_core::keys::SigningKeypair;
use sagent_core::overlay::{ConfigOverlay, HPFS_LOG_LEVELS};
use sagent_core::Ports;
use serde_json::{Map, Value, json};
use tracing::info;

use crate::host::{HostError, fs_ops};

/// Relative path of the instance config inside a contract tree.
const CONFIG_RELPATH: &str = "cfg/hp.cfg";

/// Prefix of the materializer's scratch directories under `/tmp`.
const SCRATCH_PREFIX: &str = "sashi";

/// Contract materialization / configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// The instance config file could not be opened or read.
    #[error("cannot read instance config: {0}")]
    ConfigOpen(std::io::Error),

    /// The instance config or the supplied overlay is invalid.
    #[error("invalid instance config: {0}")]
    ConfigFormat(String),

    /// The instance config could not be written back.
    #[error("cannot write instance config: {0}")]
    ConfigWrite(std::io::Error),

    /// A filesystem or ownership operation failed.
    #[error(transparent)]
    Host(#[from] HostError),
}

/// Settings the hpfs sidecar is configured from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HpfsSettings {
    /// hpfs log level (`dbg`, `inf`, `wrn`, `err`).
    pub log_level: String,
    /// True when the node retains full history.
    pub is_full_history: bool,
}

/// Result of a successful materialization.
#[derive(Debug)]
pub struct MaterializedContract {
    /// The populated contract directory.
    pub contract_dir: PathBuf,
    /// Hex public key of the instance's new signing keypair.
    pub pubkey: String,
}

/// Builds contract trees from the configured template.
#[derive(Debug)]
pub struct ContractMaterializer {
    template_path: PathBuf,
    contract_uid: u32,
    contract_gid: u32,
}

impl ContractMaterializer {
    /// Creates a materializer for the given template and in-container
    /// contract uid/gid.
    #[must_use]
    pub fn new(template_path: impl Into<PathBuf>, contract_uid: u32, contract_gid: u32) -> Self {
        Self {
            template_path: template_path.into(),
            contract_uid,
            contract_gid,
        }
    }

    /// Seeds the contract directory for a new instance and returns its
    /// generated public key.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError`]; before the final move no state exists
    /// under the contract directory, afterwards the caller compensates by
    /// uninstalling the user.
    pub fn materialize(
        &self,
        username: &str,
        home_dir: &Path,
        container_name: &str,
        owner_pubkey: &str,
        contract_id: &str,
        ports: Ports,
    ) -> Result<MaterializedContract, ContractError> {
        let scratch = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir()
            .map_err(ContractError::ConfigWrite)?;
        fs_ops::copy_tree(&self.template_path, scratch.path())?;

        let config_path = scratch.path().join(CONFIG_RELPATH);
        let mut doc = read_config_doc(&config_path)?;

        let keys = SigningKeypair::generate();
        set_path(&mut doc, &["node", "public_key"], json!(keys.public_key_hex));
        set_path(
            &mut doc,
            &["node", "private_key"],
            json!(*keys.secret_key_hex),
        );
        set_path(&mut doc, &["contract", "id"], json!(contract_id));
        set_path(
            &mut doc,
            &["contract", "run_as"],
            json!(format!("{}:{}", self.contract_uid, self.contract_gid)),
        );
        set_path(
            &mut doc,
            &["contract", "unl"],
            json!([keys.public_key_hex]),
        );
        set_path(&mut doc, &["contract", "bin_path"], json!("bootstrap_contract"));
        set_path(&mut doc, &["contract", "bin_args"], json!(owner_pubkey));
        set_path(&mut doc, &["mesh", "port"], json!(ports.peer_port));
        set_path(&mut doc, &["user", "port"], json!(ports.user_port));
        set_path(&mut doc, &["hpfs", "external"], json!(true));

        write_config_doc(&config_path, &doc)?;

        let contract_dir = home_dir.join(container_name);
        fs_ops::move_dir(scratch.path(), &contract_dir)?;
        fs_ops::chown_r(username, &contract_dir)?;
        // Group write so the in-container contract user (whose gid maps to
        // the instance user's group) can write the tree.
        fs_ops::chmod_r(0o775, &contract_dir)?;

        info!(container = %container_name, dir = %contract_dir.display(), "contract materialized");
        Ok(MaterializedContract {
            contract_dir,
            pubkey: keys.public_key_hex,
        })
    }

    /// Applies the initiation overlay to an existing contract and returns
    /// the settings the hpfs sidecar needs.
    ///
    /// # Errors
    ///
    /// [`ContractError::ConfigOpen`] when the config cannot be read,
    /// [`ContractError::ConfigFormat`] for overlay or post-merge
    /// violations, [`ContractError::ConfigWrite`] when the rewrite fails.
    pub fn initiate_config(
        &self,
        contract_dir: &Path,
        overlay: &ConfigOverlay,
    ) -> Result<HpfsSettings, ContractError> {
        overlay
            .validate()
            .map_err(|err| ContractError::ConfigFormat(err.to_string()))?;

        let config_path = contract_dir.join(CONFIG_RELPATH);
        let mut doc = read_config_doc(&config_path)?;
        apply_overlay(&mut doc, overlay)?;
        let settings = read_settings(&doc)?;
        write_config_doc(&config_path, &doc)?;
        Ok(settings)
    }

    /// Re-reads the hpfs settings of an existing contract (start path; no
    /// overlay involved).
    ///
    /// # Errors
    ///
    /// [`ContractError::ConfigOpen`] or [`ContractError::ConfigFormat`].
    pub fn read_config(&self, contract_dir: &Path) -> Result<HpfsSettings, ContractError> {
        let doc = read_config_doc(&contract_dir.join(CONFIG_RELPATH))?;
        read_settings(&doc)
    }
}

fn read_config_doc(path: &Path) -> Result<Value, ContractError> {
    let raw = std::fs::read_to_string(path).map_err(ContractError::ConfigOpen)?;
    serde_json::from_str(&raw)
        .map_err(|err| ContractError::ConfigFormat(format!("config is not valid JSON: {err}")))
}

fn write_config_doc(path: &Path, doc: &Value) -> Result<(), ContractError> {
    let rendered = serde_json::to_string_pretty(doc)
        .map_err(|err| ContractError::ConfigFormat(err.to_string()))?;
    std::fs::write(path, rendered).map_err(ContractError::ConfigWrite)
}

/// Sets `doc[path[0]][path[1]]... = value`, creating intermediate objects.
fn set_path(doc: &mut Value, path: &[&str], value: Value) {
    let mut cursor = doc;
    for key in &path[..path.len() - 1] {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        cursor = &mut cursor[*key];
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    cursor[path[path.len() - 1]] = value;
}

fn set_opt<T: Into<Value>>(doc: &mut Value, path: &[&str], value: &Option<T>)
where
    T: Clone,
{
    if let Some(v) = value {
        set_path(doc, path, v.clone().into());
    }
}

/// Writes every provided overlay field into the config document, then
/// checks the post-merge history constraint.
fn apply_overlay(doc: &mut Value, overlay: &ConfigOverlay) -> Result<(), ContractError> {
    // Contract section.
    let contract = &overlay.contract;
    if !contract.unl.is_empty() {
        let unl: Vec<Value> = contract
            .unl
            .iter()
            .map(|key| json!(key.to_lowercase()))
            .collect();
        set_path(doc, &["contract", "unl"], Value::Array(unl));
    }
    set_opt(doc, &["contract", "execute"], &contract.execute);
    if !contract.environment.is_empty() {
        let env: Map<String, Value> = contract
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect();
        set_path(doc, &["contract", "environment"], Value::Object(env));
    }
    set_opt(
        doc,
        &["contract", "max_input_ledger_offset"],
        &contract.max_input_ledger_offset,
    );
    set_opt(doc, &["contract", "consensus", "mode"], &contract.consensus.mode);
    set_opt(
        doc,
        &["contract", "consensus", "roundtime"],
        &contract.consensus.roundtime,
    );
    set_opt(
        doc,
        &["contract", "consensus", "stage_slice"],
        &contract.consensus.stage_slice,
    );
    set_opt(
        doc,
        &["contract", "consensus", "threshold"],
        &contract.consensus.threshold,
    );
    set_opt(doc, &["contract", "npl", "mode"], &contract.npl.mode);
    let limits = &contract.round_limits;
    set_opt(
        doc,
        &["contract", "round_limits", "user_input_bytes"],
        &limits.user_input_bytes,
    );
    set_opt(
        doc,
        &["contract", "round_limits", "user_output_bytes"],
        &limits.user_output_bytes,
    );
    set_opt(
        doc,
        &["contract", "round_limits", "npl_output_bytes"],
        &limits.npl_output_bytes,
    );
    set_opt(
        doc,
        &["contract", "round_limits", "proc_cpu_seconds"],
        &limits.proc_cpu_seconds,
    );
    set_opt(
        doc,
        &["contract", "round_limits", "proc_mem_bytes"],
        &limits.proc_mem_bytes,
    );
    set_opt(
        doc,
        &["contract", "round_limits", "proc_ofd_count"],
        &limits.proc_ofd_count,
    );
    set_opt(
        doc,
        &["contract", "round_limits", "exec_timeout"],
        &limits.exec_timeout,
    );
    set_opt(
        doc,
        &["contract", "log", "max_mbytes_per_file"],
        &contract.log.max_mbytes_per_file,
    );
    set_opt(
        doc,
        &["contract", "log", "max_file_count"],
        &contract.log.max_file_count,
    );

    // Node section. Role/history enum validation already ran with the
    // overlay; here only the merged-document constraint remains.
    set_opt(doc, &["node", "role"], &overlay.node.role);
    set_opt(doc, &["node", "history"], &overlay.node.history);
    set_opt(
        doc,
        &["node", "history_config", "max_primary_shards"],
        &overlay.node.history_config.max_primary_shards,
    );
    set_opt(
        doc,
        &["node", "history_config", "max_raw_shards"],
        &overlay.node.history_config.max_raw_shards,
    );
    if doc["node"]["history"].as_str() == Some("custom")
        && doc["node"]["history_config"]["max_primary_shards"]
            .as_u64()
            .unwrap_or(0)
            == 0
    {
        return Err(ContractError::ConfigFormat(
            "max_primary_shards cannot be zero in history=custom mode".into(),
        ));
    }

    // Mesh section.
    let mesh = &overlay.mesh;
    set_opt(doc, &["mesh", "idle_timeout"], &mesh.idle_timeout);
    if !mesh.known_peers.is_empty() {
        let peers: Vec<Value> = mesh
            .known_peers
            .iter()
            .map(|peer| json!(format!("{}:{}", peer.host_address, peer.port)))
            .collect();
        set_path(doc, &["mesh", "known_peers"], Value::Array(peers));
    }
    set_opt(doc, &["mesh", "msg_forwarding"], &mesh.msg_forwarding);
    set_opt(doc, &["mesh", "max_connections"], &mesh.max_connections);
    set_opt(
        doc,
        &["mesh", "max_known_connections"],
        &mesh.max_known_connections,
    );
    set_opt(
        doc,
        &["mesh", "max_in_connections_per_host"],
        &mesh.max_in_connections_per_host,
    );
    set_opt(doc, &["mesh", "max_bytes_per_msg"], &mesh.max_bytes_per_msg);
    set_opt(doc, &["mesh", "max_bytes_per_min"], &mesh.max_bytes_per_min);
    set_opt(
        doc,
        &["mesh", "max_bad_msgs_per_min"],
        &mesh.max_bad_msgs_per_min,
    );
    set_opt(
        doc,
        &["mesh", "max_bad_msgsigs_per_min"],
        &mesh.max_bad_msgsigs_per_min,
    );
    set_opt(
        doc,
        &["mesh", "max_dup_msgs_per_min"],
        &mesh.max_dup_msgs_per_min,
    );
    set_opt(
        doc,
        &["mesh", "peer_discovery", "enabled"],
        &mesh.peer_discovery.enabled,
    );
    set_opt(
        doc,
        &["mesh", "peer_discovery", "interval"],
        &mesh.peer_discovery.interval,
    );

    // User section.
    let user = &overlay.user;
    set_opt(doc, &["user", "idle_timeout"], &user.idle_timeout);
    set_opt(doc, &["user", "max_bytes_per_msg"], &user.max_bytes_per_msg);
    set_opt(doc, &["user", "max_bytes_per_min"], &user.max_bytes_per_min);
    set_opt(
        doc,
        &["user", "max_bad_msgs_per_min"],
        &user.max_bad_msgs_per_min,
    );
    set_opt(doc, &["user", "max_connections"], &user.max_connections);
    set_opt(
        doc,
        &["user", "max_in_connections_per_host"],
        &user.max_in_connections_per_host,
    );
    set_opt(
        doc,
        &["user", "concurrent_read_requests"],
        &user.concurrent_read_requests,
    );

    // hpfs and log sections.
    set_opt(doc, &["hpfs", "log", "log_level"], &overlay.hpfs.log.log_level);
    set_opt(doc, &["log", "log_level"], &overlay.log.log_level);
    set_opt(
        doc,
        &["log", "max_mbytes_per_file"],
        &overlay.log.max_mbytes_per_file,
    );
    set_opt(doc, &["log", "max_file_count"], &overlay.log.max_file_count);
    if !overlay.log.loggers.is_empty() {
        let loggers: Vec<Value> = overlay.log.loggers.iter().map(|l| json!(l)).collect();
        set_path(doc, &["log", "loggers"], Value::Array(loggers));
    }

    Ok(())
}

/// Extracts the settings the hpfs sidecar is driven from, validating the
/// values actually in effect after any merge.
fn read_settings(doc: &Value) -> Result<HpfsSettings, ContractError> {
    let log_level = doc["hpfs"]["log"]["log_level"]
        .as_str()
        .ok_or_else(|| ContractError::ConfigFormat("hpfs.log.log_level is missing".into()))?;
    if !HPFS_LOG_LEVELS.contains(&log_level) {
        return Err(ContractError::ConfigFormat(format!(
            "invalid hpfs log level `{log_level}`, expected dbg|inf|wrn|err"
        )));
    }

    let is_full_history = match doc["node"]["history"].as_str() {
        Some("full") => true,
        Some("custom") => false,
        _ => {
            return Err(ContractError::ConfigFormat(
                "node.history must be `full` or `custom`".into(),
            ));
        }
    };

    Ok(HpfsSettings {
        log_level: log_level.to_string(),
        is_full_history,
    })
}
