//! Container engine adapter.
//!
//! The engine is contacted through the docker CLI against the instance
//! user's rootless socket (`/run/user/<uid>/docker.sock`). The daemon
//! never shares a socket with another daemon; the per-user socket is the
//! isolation boundary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sagent_core::Ports;
use tracing::info;

use super::{HostError, resolve_user, run_command};

/// Wall-clock budget for `docker create` (image pulls included).
pub const CREATE_TIMEOUT: Duration = Duration::from_secs(120);

/// The container engine collaborator, keyed by the instance username.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Creates the container with the instance's ports published and the
    /// contract directory bind-mounted at `/contract`.
    async fn create(
        &self,
        username: &str,
        image: &str,
        name: &str,
        contract_dir: &Path,
        ports: &Ports,
    ) -> Result<(), HostError>;

    /// Starts the named container.
    async fn start(&self, username: &str, name: &str) -> Result<(), HostError>;

    /// Stops the named container.
    async fn stop(&self, username: &str, name: &str) -> Result<(), HostError>;

    /// Force-removes the named container.
    async fn remove(&self, username: &str, name: &str) -> Result<(), HostError>;

    /// Returns the engine's view of the container state (`created`,
    /// `running`, `exited`, ...).
    async fn inspect(&self, username: &str, name: &str) -> Result<String, HostError>;
}

/// Docker CLI implementation of [`ContainerEngine`].
#[derive(Debug)]
pub struct DockerCli {
    bin: PathBuf,
    create_timeout: Duration,
}

impl DockerCli {
    /// Creates an adapter around the given docker binary.
    #[must_use]
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            create_timeout: CREATE_TIMEOUT,
        }
    }

    /// Overrides the create timeout. Test seam.
    #[must_use]
    pub const fn with_create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = timeout;
        self
    }

    fn docker_host_env(username: &str) -> Result<Vec<(&'static str, String)>, HostError> {
        let user = resolve_user(username)?;
        Ok(vec![(
            "DOCKER_HOST",
            format!("unix:///run/user/{}/docker.sock", user.uid),
        )])
    }

    async fn run(
        &self,
        username: &str,
        args: Vec<String>,
        limit: Option<Duration>,
    ) -> Result<super::CommandOutput, HostError> {
        let envs = Self::docker_host_env(username)?;
        let output = run_command(&self.bin, &args, &envs, limit).await?;
        if !output.success {
            return Err(HostError::CommandFailed {
                program: self.bin.to_string_lossy().into_owned(),
                detail: format!("docker {} failed", args.first().map_or("", String::as_str)),
            });
        }
        Ok(output)
    }
}

/// The argv for `docker create`, shared with the adapter tests.
#[must_use]
pub fn create_args(image: &str, name: &str, contract_dir: &Path, ports: &Ports) -> Vec<String> {
    let publish = |port: u16, proto: &str| format!("{port}:{port}{proto}");
    vec![
        "create".into(),
        "-t".into(),
        "-i".into(),
        "--stop-signal=SIGINT".into(),
        "--log-driver".into(),
        "local".into(),
        "--log-opt".into(),
        "max-size=5m".into(),
        "--log-opt".into(),
        "max-file=2".into(),
        "--name".into(),
        name.into(),
        "-p".into(),
        publish(ports.user_port, ""),
        "-p".into(),
        publish(ports.peer_port, ""),
        "-p".into(),
        publish(ports.peer_port, "/udp"),
        "-p".into(),
        publish(ports.gp_tcp_port_start, ""),
        "-p".into(),
        publish(ports.gp_tcp_port_start + 1, ""),
        "-p".into(),
        publish(ports.gp_udp_port_start, "/udp"),
        "-p".into(),
        publish(ports.gp_udp_port_start + 1, "/udp"),
        "--restart".into(),
        "unless-stopped".into(),
        "--mount".into(),
        format!(
            "type=bind,source={},target=/contract",
            contract_dir.display()
        ),
        image.into(),
        "run".into(),
        "/contract".into(),
    ]
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn create(
        &self,
        username: &str,
        image: &str,
        name: &str,
        contract_dir: &Path,
        ports: &Ports,
    ) -> Result<(), HostError> {
        info!(name = %name, image = %image, "creating container");
        self.run(
            username,
            create_args(image, name, contract_dir, ports),
            Some(self.create_timeout),
        )
        .await?;
        Ok(())
    }

    async fn start(&self, username: &str, name: &str) -> Result<(), HostError> {
        self.run(username, vec!["start".into(), name.into()], None)
            .await?;
        Ok(())
    }

    async fn stop(&self, username: &str, name: &str) -> Result<(), HostError> {
        self.run(username, vec!["stop".into(), name.into()], None)
            .await?;
        Ok(())
    }

    async fn remove(&self, username: &str, name: &str) -> Result<(), HostError> {
        self.run(username, vec!["rm".into(), "-f".into(), name.into()], None)
            .await?;
        Ok(())
    }

    async fn inspect(&self, username: &str, name: &str) -> Result<String, HostError> {
        let output = self
            .run(
                username,
                vec![
                    "inspect".into(),
                    "--format".into(),
                    "{{json .State.Status}}".into(),
                    name.into(),
                ],
                None,
            )
            .await?;
        Ok(strip_status_quotes(&output.stdout))
    }
}

/// Unwraps the `"status"` JSON string printed by `docker inspect`.
#[must_use]
pub fn strip_status_quotes(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_args_publish_all_reserved_ports() {
        let ports = Ports {
            peer_port: 22861,
            user_port: 26201,
            gp_tcp_port_start: 36525,
            gp_udp_port_start: 39064,
        };
        let args = create_args("repo/app:1", "c1", Path::new("/home/sashi1/c1"), &ports);

        let publishes: Vec<&String> = args
            .iter()
            .zip(args.iter().skip(1))
            .filter(|(flag, _)| *flag == "-p")
            .map(|(_, value)| value)
            .collect();
        assert_eq!(
            publishes,
            vec![
                "26201:26201",
                "22861:22861",
                "22861:22861/udp",
                "36525:36525",
                "36526:36526",
                "39064:39064/udp",
                "39065:39065/udp",
            ]
        );

        // Image argv and bind mount are positional at the tail.
        assert_eq!(
            &args[args.len() - 3..],
            ["repo/app:1", "run", "/contract"]
        );
        assert!(args
            .iter()
            .any(|a| a == "type=bind,source=/home/sashi1/c1,target=/contract"));
        assert!(args.iter().any(|a| a == "--stop-signal=SIGINT"));
        assert!(args.iter().any(|a| a == "unless-stopped"));
    }

    #[test]
    fn inspect_output_loses_quotes_and_newline() {
        assert_eq!(strip_status_quotes("\"running\"\n"), "running");
        assert_eq!(strip_status_quotes("\"exited\""), "exited");
        assert_eq!(strip_status_quotes("created\n"), "created");
    }
}
