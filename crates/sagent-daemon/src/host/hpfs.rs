//! Sidecar filesystem (hpfs) control.
//!
//! One hpfs service runs per instance user. The daemon only pushes
//! configuration (log level, history mode) and toggles the service; the
//! service itself is an opaque collaborator owned by its own package.

use async_trait::async_trait;
use tracing::info;

use super::{HostError, resolve_user, run_command};

/// The hpfs unit name under the instance user's systemd manager.
const HPFS_UNIT: &str = "hpfs";

/// Name of the environment file the unit reads from the user's home.
const HPFS_ENV_FILE: &str = ".hpfs.env";

/// The hpfs collaborator, keyed by the instance username.
#[async_trait]
pub trait HpfsControl: Send + Sync {
    /// Rewrites the service configuration for the user's hpfs instance.
    async fn update_service_conf(
        &self,
        username: &str,
        log_level: &str,
        is_full_history: bool,
    ) -> Result<(), HostError>;

    /// Starts the user's hpfs service.
    async fn start(&self, username: &str) -> Result<(), HostError>;

    /// Stops the user's hpfs service.
    async fn stop(&self, username: &str) -> Result<(), HostError>;
}

/// systemd-user implementation of [`HpfsControl`].
///
/// Units run under the instance user's manager, so `systemctl --user` is
/// invoked as that user with the runtime dir and bus address of the user's
/// session.
#[derive(Debug, Default)]
pub struct SystemdHpfs;

impl SystemdHpfs {
    async fn systemctl(&self, username: &str, verbs: &[&str]) -> Result<(), HostError> {
        let user = resolve_user(username)?;
        let runtime_dir = format!("/run/user/{}", user.uid);
        let mut args = vec!["-u", username, "systemctl", "--user"];
        args.extend_from_slice(verbs);
        let envs = [
            ("XDG_RUNTIME_DIR", runtime_dir.clone()),
            (
                "DBUS_SESSION_BUS_ADDRESS",
                format!("unix:path={runtime_dir}/bus"),
            ),
        ];
        let output = run_command("sudo", args, &envs, None).await?;
        if !output.success {
            return Err(HostError::CommandFailed {
                program: "systemctl".into(),
                detail: format!("`{}` failed for {username}", verbs.join(" ")),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl HpfsControl for SystemdHpfs {
    async fn update_service_conf(
        &self,
        username: &str,
        log_level: &str,
        is_full_history: bool,
    ) -> Result<(), HostError> {
        let user = resolve_user(username)?;
        let env_path = user.dir.join(HPFS_ENV_FILE);
        let contents = format!(
            "HPFS_TRACE={log_level}\nHPFS_MERGE={}\n",
            if is_full_history { "false" } else { "true" }
        );
        tokio::fs::write(&env_path, contents).await?;
        std::os::unix::fs::chown(&env_path, Some(user.uid.as_raw()), Some(user.gid.as_raw()))?;

        info!(username = %username, log_level = %log_level, "updated hpfs service conf");
        self.systemctl(username, &["daemon-reload"]).await
    }

    async fn start(&self, username: &str) -> Result<(), HostError> {
        self.systemctl(username, &["start", HPFS_UNIT]).await
    }

    async fn stop(&self, username: &str) -> Result<(), HostError> {
        self.systemctl(username, &["stop", HPFS_UNIT]).await
    }
}
