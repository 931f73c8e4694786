//! The admin-socket connection server.
//!
//! A single worker alternates between a short accept poll and one-shot
//! request/response sessions: read one framed request, dispatch it, write
//! the framed response, close. Sessions are strictly serial; the lifecycle
//! controller is never shared. Shutdown lets the in-flight session drain,
//! then unlinks the socket file.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use nix::sys::socket::{AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{info, warn};

use crate::dispatch::handle_frame;
use crate::lifecycle::Agent;
use crate::protocol::{FrameCodec, ProtocolError};

/// Group granted access to the admin socket.
const SOCKET_GROUP: &str = "sashiadmin";

/// Socket file mode: read/write for owner and group only.
const SOCKET_MODE: u32 = 0o660;

/// Listen backlog.
const BACKLOG: i32 = 20;

/// Accept poll interval.
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Consecutive empty reads after which a data socket is dropped.
const EMPTY_READ_THRESHOLD: u32 = 5;

/// Read chunk size.
const READ_BUFFER_SIZE: usize = 4096;

/// Server setup errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Creating, binding or configuring the listening socket failed.
    #[error("cannot bind admin socket at {path}: {detail}")]
    Bind {
        /// The socket path.
        path: PathBuf,
        /// What failed.
        detail: String,
    },
}

/// The admin socket server.
pub struct AdminServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl AdminServer {
    /// Binds the admin socket: stale file removed, mode 0660, group
    /// `sashiadmin` (best effort), backlog 20.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] when the socket cannot be set up.
    pub fn bind(socket_path: &Path) -> Result<Self, ServerError> {
        let bind_err = |detail: String| ServerError::Bind {
            path: socket_path.to_path_buf(),
            detail,
        };

        if socket_path.exists() {
            std::fs::remove_file(socket_path).map_err(|e| bind_err(e.to_string()))?;
        }

        let fd: OwnedFd = nix::sys::socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(|e| bind_err(e.to_string()))?;

        let addr = UnixAddr::new(socket_path).map_err(|e| bind_err(e.to_string()))?;
        nix::sys::socket::bind(fd.as_raw_fd(), &addr).map_err(|e| bind_err(e.to_string()))?;

        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))
            .map_err(|e| bind_err(e.to_string()))?;
        grant_socket_group(socket_path);

        let backlog = Backlog::new(BACKLOG).map_err(|e| bind_err(e.to_string()))?;
        nix::sys::socket::listen(&fd, backlog).map_err(|e| bind_err(e.to_string()))?;

        let std_listener = std::os::unix::net::UnixListener::from(fd);
        std_listener
            .set_nonblocking(true)
            .map_err(|e| bind_err(e.to_string()))?;
        let listener =
            UnixListener::from_std(std_listener).map_err(|e| bind_err(e.to_string()))?;

        info!(path = %socket_path.display(), "admin socket bound");
        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
        })
    }

    /// Runs the accept loop until `shutdown` is raised. The current
    /// session always drains before the flag is honored.
    pub async fn run(&self, agent: &mut Agent, shutdown: &Arc<AtomicBool>) {
        info!("message processor started");
        while !shutdown.load(Ordering::SeqCst) {
            match tokio::time::timeout(ACCEPT_POLL, self.listener.accept()).await {
                Ok(Ok((stream, _addr))) => {
                    if let Err(err) = handle_session(agent, stream).await {
                        warn!(error = %err, "session ended with error");
                    }
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "accept failed");
                }
                Err(_) => {
                    // Poll timeout; re-check the shutdown flag.
                }
            }
        }
        info!("message processor stopped");
    }

    /// Removes the socket file.
    pub fn cleanup(&self) {
        if let Err(err) = std::fs::remove_file(&self.socket_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %err, "failed to remove socket file");
            }
        }
    }
}

/// Hands the socket file to the admin group. Failure (a dev host without
/// the group) is logged, not fatal; the 0660 mode still gates access.
fn grant_socket_group(socket_path: &Path) {
    match nix::unistd::Group::from_name(SOCKET_GROUP) {
        Ok(Some(group)) => {
            if let Err(err) = nix::unistd::chown(socket_path, None, Some(group.gid)) {
                warn!(group = SOCKET_GROUP, error = %err, "socket group change failed");
            }
        }
        Ok(None) => warn!(group = SOCKET_GROUP, "socket group does not exist"),
        Err(err) => warn!(group = SOCKET_GROUP, error = %err, "socket group lookup failed"),
    }
}

/// One request/response session: read a frame, dispatch, respond, close.
///
/// Empty reads are liveness signals, not errors; after
/// [`EMPTY_READ_THRESHOLD`] consecutive empties the socket is dropped
/// without a response. A connection that closes inside a partial frame is
/// a connection error.
async fn handle_session(agent: &mut Agent, mut stream: UnixStream) -> Result<(), ProtocolError> {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut empty_reads = 0u32;

    let frame = loop {
        if let Some(frame) = codec.decode(&mut buf)? {
            break frame;
        }
        let read = stream.read_buf(&mut buf).await?;
        if read == 0 {
            if !buf.is_empty() {
                return Err(ProtocolError::TruncatedFrame);
            }
            empty_reads += 1;
            if empty_reads >= EMPTY_READ_THRESHOLD {
                return Ok(());
            }
        } else {
            empty_reads = 0;
        }
    };

    let response = handle_frame(agent, &frame).await;

    let mut out = BytesMut::new();
    codec.encode(Bytes::from(response), &mut out)?;
    stream.write_all(&out).await?;
    stream.flush().await?;
    // Connection closes after one response; drop shuts the socket down.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_applies_mode_and_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sa.sock");
        std::fs::write(&path, "stale").unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();

        let server = AdminServer::bind(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, SOCKET_MODE);

        server.cleanup();
        assert!(!path.exists());
    }
}
