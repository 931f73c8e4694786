//! Instance user install/uninstall through the shell helpers.
//!
//! The helpers own user creation, cgroup and disk-quota wiring, rootless
//! engine setup and (on uninstall) container and contract-dir removal. The
//! daemon drives them as black boxes through a positional-parameter
//! contract and reads a sentinel token from the last stdout line:
//! `INST_SUC`/`INST_ERR` for install, `UNINST_SUC`/`UNINST_ERR` for
//! uninstall. Any other terminal token is a hard failure.

use std::path::PathBuf;

use async_trait::async_trait;
use sagent_core::{Ports, Resources};
use tracing::{error, info};

use super::{HostError, run_command};

/// Install sentinel for success.
const INSTALL_OK: &str = "INST_SUC";
/// Install sentinel for failure.
const INSTALL_ERR: &str = "INST_ERR";
/// Uninstall sentinel for success.
const UNINSTALL_OK: &str = "UNINST_SUC";
/// Uninstall sentinel for failure.
const UNINSTALL_ERR: &str = "UNINST_ERR";

/// Parameters for one user installation.
#[derive(Debug)]
pub struct UserInstallRequest<'a> {
    /// Quotas for the new user.
    pub resources: Resources,
    /// Container name the user is created for.
    pub container_name: &'a str,
    /// Uid the contract runs as inside the container.
    pub contract_uid: u32,
    /// Gid the contract runs as inside the container.
    pub contract_gid: u32,
    /// Ports reserved for the instance.
    pub ports: Ports,
    /// Full image reference, including any `--<size>` marker.
    pub image: &'a str,
    /// Registry the helper pulls from.
    pub registry_address: &'a str,
    /// Outbound IPv6 address, empty when unset.
    pub outbound_ipv6: &'a str,
    /// Outbound network interface, empty when unset.
    pub outbound_net_interface: &'a str,
}

/// A successfully installed instance user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledUser {
    /// The new user's uid.
    pub uid: u32,
    /// The new user's name.
    pub username: String,
    /// The new user's home directory.
    pub home_dir: PathBuf,
}

/// The user install/uninstall collaborator.
#[async_trait]
pub trait UserSetup: Send + Sync {
    /// Creates the instance user with quota wiring.
    async fn install(&self, request: &UserInstallRequest<'_>) -> Result<InstalledUser, HostError>;

    /// Removes the instance user, its container and its contract dir.
    async fn uninstall(
        &self,
        username: &str,
        ports: &Ports,
        container_name: &str,
    ) -> Result<(), HostError>;
}

/// Shell-helper implementation of [`UserSetup`].
#[derive(Debug)]
pub struct ScriptUserSetup {
    install_script: PathBuf,
    uninstall_script: PathBuf,
}

impl ScriptUserSetup {
    /// Creates the adapter around the two helper scripts.
    #[must_use]
    pub fn new(install_script: impl Into<PathBuf>, uninstall_script: impl Into<PathBuf>) -> Self {
        Self {
            install_script: install_script.into(),
            uninstall_script: uninstall_script.into(),
        }
    }
}

/// Interprets the install helper's stdout.
fn parse_install_output(lines: &[&str]) -> Result<(u32, String), HostError> {
    let terminal = lines.last().copied().unwrap_or_default();
    match terminal {
        INSTALL_OK => {
            let uid = lines
                .first()
                .and_then(|line| line.parse::<u32>().ok())
                .ok_or_else(|| HostError::CommandFailed {
                    program: "user install".into(),
                    detail: "helper did not report a numeric uid".into(),
                })?;
            let username = lines
                .get(1)
                .map(|line| (*line).to_string())
                .ok_or_else(|| HostError::CommandFailed {
                    program: "user install".into(),
                    detail: "helper did not report a username".into(),
                })?;
            Ok((uid, username))
        }
        INSTALL_ERR => Err(HostError::CommandFailed {
            program: "user install".into(),
            detail: lines.first().copied().unwrap_or("unspecified error").into(),
        }),
        other => Err(HostError::CommandFailed {
            program: "user install".into(),
            detail: format!("unknown terminal token `{other}`"),
        }),
    }
}

/// Interprets the uninstall helper's stdout.
fn parse_uninstall_output(lines: &[&str]) -> Result<(), HostError> {
    match lines.last().copied().unwrap_or_default() {
        UNINSTALL_OK => Ok(()),
        UNINSTALL_ERR => Err(HostError::CommandFailed {
            program: "user uninstall".into(),
            detail: lines.first().copied().unwrap_or("unspecified error").into(),
        }),
        other => Err(HostError::CommandFailed {
            program: "user uninstall".into(),
            detail: format!("unknown terminal token `{other}`"),
        }),
    }
}

#[async_trait]
impl UserSetup for ScriptUserSetup {
    async fn install(&self, request: &UserInstallRequest<'_>) -> Result<InstalledUser, HostError> {
        let args = [
            request.resources.cpu_us.to_string(),
            request.resources.mem_kbytes.to_string(),
            request.resources.swap_kbytes.to_string(),
            request.resources.storage_kbytes.to_string(),
            request.container_name.to_string(),
            request.contract_uid.to_string(),
            request.contract_gid.to_string(),
            request.ports.peer_port.to_string(),
            request.ports.user_port.to_string(),
            request.ports.gp_tcp_port_start.to_string(),
            request.ports.gp_udp_port_start.to_string(),
            request.image.to_string(),
            request.registry_address.to_string(),
            request.outbound_ipv6.to_string(),
            request.outbound_net_interface.to_string(),
        ];

        let mut argv = vec![self.install_script.to_string_lossy().into_owned()];
        argv.extend(args);
        let output = run_command("/bin/bash", &argv, &[], None).await?;
        match parse_install_output(&output.lines()) {
            Ok((uid, username)) => {
                info!(username = %username, uid, "installed instance user");
                Ok(InstalledUser {
                    uid,
                    home_dir: PathBuf::from("/home").join(&username),
                    username,
                })
            }
            Err(err) => {
                error!(container = %request.container_name, error = %err, "user install failed");
                Err(err)
            }
        }
    }

    async fn uninstall(
        &self,
        username: &str,
        ports: &Ports,
        container_name: &str,
    ) -> Result<(), HostError> {
        let argv = [
            self.uninstall_script.to_string_lossy().into_owned(),
            username.to_string(),
            ports.peer_port.to_string(),
            ports.user_port.to_string(),
            ports.gp_tcp_port_start.to_string(),
            ports.gp_udp_port_start.to_string(),
            container_name.to_string(),
        ];
        let output = run_command("/bin/bash", &argv, &[], None).await?;
        match parse_uninstall_output(&output.lines()) {
            Ok(()) => {
                info!(username = %username, "removed instance user");
                Ok(())
            }
            Err(err) => {
                error!(username = %username, error = %err, "user uninstall failed");
                Err(err)
            }
        }
    }
}
