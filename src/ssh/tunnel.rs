use crate::error::Result;
use crate::shared::HostName;
use crate::ssh::SshHandle;
use log::{debug, error, warn};
use russh::ChannelStream;
use russh::client::Msg;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

pub const REMOTE_DOCKER_SOCKET: &str = "/var/run/docker.sock";
pub const REMOTE_DOCKER_TCP_HOST: &str = "127.0.0.1";
pub const REMOTE_DOCKER_TCP_PORT: u32 = 2375;
const TUNNEL_SOCKET: &str = "docker.sock";

/// Opens a stream to the remote docker daemon: the unix socket first, the
/// loopback tcp port as fallback.
pub async fn dial(handle: &SshHandle, host: &HostName) -> Result<ChannelStream<Msg>> {
    match handle
        .channel_open_direct_streamlocal(REMOTE_DOCKER_SOCKET)
        .await
    {
        Ok(channel) => Ok(channel.into_stream()),
        Err(e) => {
            warn!(
                "{host}: dialing unix:{REMOTE_DOCKER_SOCKET} failed ({e}), retrying tcp:{REMOTE_DOCKER_TCP_HOST}:{REMOTE_DOCKER_TCP_PORT}"
            );
            let channel = handle
                .channel_open_direct_tcpip(
                    REMOTE_DOCKER_TCP_HOST,
                    REMOTE_DOCKER_TCP_PORT,
                    "127.0.0.1",
                    0,
                )
                .await?;
            Ok(channel.into_stream())
        }
    }
}

/// Unix socket, private to this process's user, that forwards every accepted
/// connection to the remote docker daemon over the ssh session. The socket
/// lives in a 0700 directory removed together with the tunnel.
pub struct DockerTunnel {
    dir: TempDir,
    socket: PathBuf,
    task: JoinHandle<()>,
}

impl DockerTunnel {
    pub async fn start(handle: Arc<SshHandle>, host: HostName) -> Result<Self> {
        let dir = private_dir()?;
        let socket = dir.path().join(TUNNEL_SOCKET);
        let listener = UnixListener::bind(&socket)?;
        debug!("{host}: docker tunnel listening on {}", socket.display());

        let task = tokio::spawn(async move {
            loop {
                let mut local = match listener.accept().await {
                    Ok((conn, _)) => conn,
                    Err(e) => {
                        error!("{host}: docker tunnel accept failed: {e}");
                        break;
                    }
                };
                let handle = handle.clone();
                let host = host.clone();
                tokio::spawn(async move {
                    let mut remote = match dial(&handle, &host).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            error!("{host}: could not reach remote docker daemon: {e}");
                            return;
                        }
                    };
                    if let Err(e) = tokio::io::copy_bidirectional(&mut local, &mut remote).await {
                        debug!("{host}: tunnel connection closed: {e}");
                    }
                });
            }
        });

        Ok(Self { dir, socket, task })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }
}

/// Directory only the current user can enter.
fn private_dir() -> Result<TempDir> {
    let dir = tempfile::Builder::new()
        .prefix("dockman-tunnel-")
        .tempdir()?;
    std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))?;
    Ok(dir)
}

impl Drop for DockerTunnel {
    fn drop(&mut self) {
        self.task.abort();
        debug!("removing docker tunnel at {}", self.dir.path().display());
    }
}
