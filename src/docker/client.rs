use crate::domain::machines::models::Machine;
use crate::domain::machines::ports::{KeyRepository, MachineRepository};
use crate::domain::machines::service::Service as MachineService;
use crate::error::{Error, Result};
use crate::shared::HostName;
use crate::ssh::tunnel::DockerTunnel;
use crate::ssh::{self, SshConnection};
use bollard::{API_DEFAULT_VERSION, Docker};
use log::{debug, info};
use russh_sftp::client::SftpSession;
use std::sync::Arc;

const DOCKER_TIMEOUT_SECS: u64 = 120;

struct RemoteTransport {
    tunnel: DockerTunnel,
    ssh: SshConnection,
}

/// A docker client that answered its health check. Remote clients also own the
/// ssh session, the SFTP channel and the tunnel the docker client talks through.
pub struct ConnectedClient {
    name: HostName,
    docker: Docker,
    remote: Option<RemoteTransport>,
}

impl ConnectedClient {
    /// Connects to the local daemon using the environment (`DOCKER_HOST`, ...).
    pub async fn local() -> Result<Self> {
        let name = HostName::local();
        let docker = Docker::connect_with_defaults().map_err(|e| connect_failed(&name, e))?;
        let docker = negotiate_and_ping(&name, docker).await?;
        info!("connected to local docker daemon");
        Ok(Self {
            name,
            docker,
            remote: None,
        })
    }

    /// Connects to a remote daemon over ssh. Returns the machine as stored
    /// after a successful connect, which carries a pinned host key.
    pub async fn remote<R: MachineRepository + KeyRepository>(
        machine: &Machine,
        credentials: &MachineService<R>,
    ) -> Result<(Self, Machine)> {
        let name = machine.name.clone();
        let (ssh, machine) = ssh::connect(machine, credentials).await?;
        let tunnel = match DockerTunnel::start(ssh.handle.clone(), name.clone()).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                ssh.close().await;
                return Err(e);
            }
        };

        let socket = tunnel.socket_path().to_string_lossy().into_owned();
        let docker = match Docker::connect_with_unix(
            &socket,
            DOCKER_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        ) {
            Ok(docker) => docker,
            Err(e) => {
                drop(tunnel);
                ssh.close().await;
                return Err(connect_failed(&name, e));
            }
        };
        let docker = match negotiate_and_ping(&name, docker).await {
            Ok(docker) => docker,
            Err(e) => {
                drop(tunnel);
                ssh.close().await;
                return Err(e);
            }
        };
        info!("connected to {name} ({})", machine.address());
        Ok((
            Self {
                name,
                docker,
                remote: Some(RemoteTransport { tunnel, ssh }),
            },
            machine,
        ))
    }

    /// Wraps an existing docker client without probing it.
    pub fn from_docker(name: HostName, docker: Docker) -> Self {
        Self {
            name,
            docker,
            remote: None,
        }
    }

    pub fn name(&self) -> &HostName {
        &self.name
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    /// `None` for the local daemon.
    pub fn sftp(&self) -> Option<Arc<SftpSession>> {
        self.remote.as_ref().map(|r| r.ssh.sftp.clone())
    }

    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Releases docker client, tunnel and ssh session, in that order.
    pub async fn close(self) {
        debug!("closing client {}", self.name);
        let Self { docker, remote, .. } = self;
        drop(docker);
        if let Some(RemoteTransport { tunnel, ssh }) = remote {
            drop(tunnel);
            ssh.close().await;
        }
    }
}

async fn negotiate_and_ping(name: &HostName, docker: Docker) -> Result<Docker> {
    let docker = docker
        .negotiate_version()
        .await
        .map_err(|e| connect_failed(name, e))?;
    let info = docker.info().await.map_err(|e| connect_failed(name, e))?;
    debug!(
        "{name}: docker {} on {}",
        info.server_version.unwrap_or_default(),
        info.operating_system.unwrap_or_default()
    );
    Ok(docker)
}

fn connect_failed(name: &HostName, e: bollard::errors::Error) -> Error {
    Error::ConnectFailed {
        host: name.to_string(),
        reason: e.to_string(),
    }
}
