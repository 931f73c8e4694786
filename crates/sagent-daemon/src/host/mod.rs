//! Host adapters: safe invocation of external tools and host probes.
//!
//! Everything that leaves the process goes through [`run_command`], which
//! spawns argv arrays with an explicit environment. User-supplied values
//! (container names, image references, interface names) are validated
//! before they reach any command line; there is no shell interpolation
//! anywhere in the daemon.

pub mod engine;
pub mod fs_ops;
pub mod hpfs;
pub mod readiness;
pub mod users;

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Errors from host adapters.
#[derive(Debug, Error)]
pub enum HostError {
    /// The child process could not be spawned.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The child exceeded its wall-clock budget and was killed.
    #[error("`{program}` exceeded the {limit_secs}s time limit")]
    Timeout {
        /// Program that overran.
        program: String,
        /// The enforced limit in seconds.
        limit_secs: u64,
    },

    /// The child exited unsuccessfully.
    #[error("`{program}` failed: {detail}")]
    CommandFailed {
        /// Program that failed.
        program: String,
        /// Exit status and captured stderr.
        detail: String,
    },

    /// A username did not resolve to an OS user.
    #[error("no such user `{0}`")]
    UnknownUser(String),

    /// A request value failed validation before command construction.
    #[error("invalid {field}: `{value}`")]
    InvalidArgument {
        /// The offending field.
        field: &'static str,
        /// The rejected value.
        value: String,
    },

    /// Filesystem operation failed.
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured result of a finished child process.
#[derive(Debug)]
pub struct CommandOutput {
    /// Whether the child exited with status zero.
    pub success: bool,
    /// Captured stdout, lossily decoded.
    pub stdout: String,
}

impl CommandOutput {
    /// Stdout split into non-empty trimmed lines.
    #[must_use]
    pub fn lines(&self) -> Vec<&str> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect()
    }
}

/// Runs `program` with `args` and `envs`, capturing stdout and stderr.
///
/// A non-zero exit is reported in the returned [`CommandOutput`], not as an
/// error; callers decide what failure means. `limit` bounds the child's
/// wall clock; on overrun the child is killed and [`HostError::Timeout`]
/// is returned.
///
/// # Errors
///
/// Returns [`HostError::Spawn`] or [`HostError::Timeout`].
pub async fn run_command<I, S>(
    program: impl AsRef<OsStr>,
    args: I,
    envs: &[(&str, String)],
    limit: Option<Duration>,
) -> Result<CommandOutput, HostError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program_name = program.as_ref().to_string_lossy().into_owned();

    let mut cmd = Command::new(program.as_ref());
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|source| HostError::Spawn {
        program: program_name.clone(),
        source,
    })?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let work = async {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let read_out = async {
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stdout).await;
            }
        };
        let read_err = async {
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stderr).await;
            }
        };
        tokio::join!(read_out, read_err);
        let status = child.wait().await;
        (status, stdout, stderr)
    };

    let (status, stdout, stderr) = match limit {
        None => work.await,
        Some(duration) => match tokio::time::timeout(duration, work).await {
            Ok(done) => done,
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(HostError::Timeout {
                    program: program_name,
                    limit_secs: duration.as_secs(),
                });
            }
        },
    };

    let status = status.map_err(|source| HostError::Spawn {
        program: program_name.clone(),
        source,
    })?;

    let output = CommandOutput {
        success: status.success(),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
    };
    if output.success {
        debug!(program = %program_name, "command succeeded");
    } else {
        warn!(
            program = %program_name,
            status = ?status.code(),
            stderr = %String::from_utf8_lossy(&stderr),
            "command failed"
        );
    }
    Ok(output)
}

/// Validates a container name: 1..=64 chars of `[A-Za-z0-9_-]`.
///
/// # Errors
///
/// Returns [`HostError::InvalidArgument`] on violation.
pub fn validate_container_name(name: &str) -> Result<(), HostError> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(HostError::InvalidArgument {
            field: "container name",
            value: name.to_string(),
        })
    }
}

/// Validates an image reference: registry/path, optional tag or digest,
/// optional trailing `--<size>` marker. The character set is restricted so
/// the value is inert on a command line.
///
/// # Errors
///
/// Returns [`HostError::InvalidArgument`] on violation.
pub fn validate_image_ref(image: &str) -> Result<(), HostError> {
    let ok = !image.is_empty()
        && image.len() <= 256
        && !image.starts_with('-')
        && image
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '@'));
    if ok {
        Ok(())
    } else {
        Err(HostError::InvalidArgument {
            field: "image reference",
            value: image.to_string(),
        })
    }
}

/// Validates an outbound interface name (empty means unset).
///
/// # Errors
///
/// Returns [`HostError::InvalidArgument`] on violation.
pub fn validate_net_interface(iface: &str) -> Result<(), HostError> {
    let ok = iface.is_empty()
        || (iface.len() <= 15
            && !iface.starts_with('-')
            && iface
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
    if ok {
        Ok(())
    } else {
        Err(HostError::InvalidArgument {
            field: "network interface",
            value: iface.to_string(),
        })
    }
}

/// Validates an outbound IPv6 address (empty means unset).
///
/// # Errors
///
/// Returns [`HostError::InvalidArgument`] on violation.
pub fn validate_outbound_ipv6(addr: &str) -> Result<(), HostError> {
    if addr.is_empty() || addr.parse::<std::net::Ipv6Addr>().is_ok() {
        Ok(())
    } else {
        Err(HostError::InvalidArgument {
            field: "outbound IPv6 address",
            value: addr.to_string(),
        })
    }
}

/// Resolves a username to its uid, gid and home directory.
///
/// # Errors
///
/// Returns [`HostError::UnknownUser`] when the user does not exist.
pub fn resolve_user(username: &str) -> Result<nix::unistd::User, HostError> {
    nix::unistd::User::from_name(username)
        .map_err(|_| HostError::UnknownUser(username.to_string()))?
        .ok_or_else(|| HostError::UnknownUser(username.to_string()))
}
