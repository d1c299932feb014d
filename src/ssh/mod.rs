//! SSH transport to remote docker hosts.
//!
//! A [`SshConnection`] owns the ssh session of one machine and an SFTP channel
//! opened on the same transport. The docker socket is reached through
//! [`tunnel::DockerTunnel`].

pub mod keys;
pub mod tunnel;

use crate::domain::machines::models::{AuthMethod, DEFAULT_KEY_NAME, Machine, SaveMachineRequest};
use crate::domain::machines::ports::{KeyRepository, MachineRepository};
use crate::domain::machines::service::Service as MachineService;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use russh::client::{self, Handle};
use russh::Disconnect;
use russh_keys::PublicKeyBase64;
use russh_keys::key::{KeyPair, PublicKey};
use russh_sftp::client::SftpSession;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Host-key verifier. An empty pin accepts and records the first key
/// presented; otherwise the presented key must match the pin.
pub struct HostKeyPinner {
    machine: String,
    pinned: String,
    captured: Arc<Mutex<Option<String>>>,
    mismatch: Arc<Mutex<bool>>,
}

impl HostKeyPinner {
    fn new(machine: &Machine) -> Self {
        Self {
            machine: machine.name.to_string(),
            pinned: machine.remote_public_key.clone(),
            captured: Arc::new(Mutex::new(None)),
            mismatch: Arc::new(Mutex::new(false)),
        }
    }

    fn verify(&self, key_type: &str, base64: &str) -> bool {
        if self.pinned.trim().is_empty() {
            let line = keys::format_authorized_key(key_type, base64, &self.machine, Utc::now());
            if let Ok(mut captured) = self.captured.lock() {
                *captured = Some(line);
            }
            return true;
        }
        let matches = keys::pinned_key_matches(&self.pinned, key_type, base64);
        if !matches {
            if let Ok(mut mismatch) = self.mismatch.lock() {
                *mismatch = true;
            }
        }
        matches
    }
}

#[async_trait]
impl client::Handler for HostKeyPinner {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(self.verify(server_public_key.name(), &server_public_key.public_key_base64()))
    }
}

pub type SshHandle = Handle<HostKeyPinner>;

pub struct SshConnection {
    pub handle: Arc<SshHandle>,
    pub sftp: Arc<SftpSession>,
}

impl SshConnection {
    pub async fn close(&self) {
        if let Err(e) = self.sftp.close().await {
            debug!("closing sftp channel: {e}");
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("closing ssh session: {e}");
        }
    }
}

/// Connects to `machine`, authenticates and opens an SFTP channel. On the
/// first connect the presented host key is pinned and written back to the
/// store; the returned machine reflects that.
pub async fn connect<R: MachineRepository + KeyRepository>(
    machine: &Machine,
    credentials: &MachineService<R>,
) -> Result<(SshConnection, Machine)> {
    let connect_failed = |reason: String| Error::ConnectFailed {
        host: machine.name.to_string(),
        reason,
    };

    let pinner = HostKeyPinner::new(machine);
    let captured = pinner.captured.clone();
    let mismatch = pinner.mismatch.clone();

    let config = Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        ..Default::default()
    });

    debug!("dialing ssh {} ({})", machine.name, machine.address());
    let connecting = client::connect(config, (machine.host.as_str(), machine.port), pinner);
    let mut handle = match tokio::time::timeout(CONNECT_TIMEOUT, connecting).await {
        Err(_) => return Err(connect_failed("timed out".to_string())),
        Ok(Err(e)) => {
            if mismatch.lock().map(|m| *m).unwrap_or(false) {
                return Err(Error::HostKeyMismatch {
                    host: machine.name.to_string(),
                });
            }
            return Err(connect_failed(e.to_string()));
        }
        Ok(Ok(handle)) => handle,
    };

    let sftp = open_session(&mut handle, machine, credentials)
        .await
        .map_err(|e| session_failed(machine, e))?;

    let mut machine = machine.clone();
    let captured = captured.lock().ok().and_then(|mut c| c.take());
    if let Some(line) = captured {
        info!("pinning host key of {}", machine.name);
        let mut req = SaveMachineRequest::from(&machine);
        req.remote_public_key = line;
        machine = credentials.save_machine(&req).await?;
    }

    Ok((
        SshConnection {
            handle: Arc::new(handle),
            sftp: Arc::new(sftp),
        },
        machine,
    ))
}

async fn open_session<R: MachineRepository + KeyRepository>(
    handle: &mut SshHandle,
    machine: &Machine,
    credentials: &MachineService<R>,
) -> Result<SftpSession> {
    let authenticated = match machine.auth_method() {
        AuthMethod::KeyPair => {
            let key = credentials.get_key(DEFAULT_KEY_NAME).await?;
            let key = keys::decode_private_key(&key.private_key)?;
            handle
                .authenticate_publickey(machine.user.as_str(), Arc::new(key))
                .await?
        }
        AuthMethod::Password => {
            handle
                .authenticate_password(machine.user.as_str(), machine.password.as_str())
                .await?
        }
        AuthMethod::HomeDirectoryKeys => authenticate_with_home_keys(handle, machine).await?,
    };
    if !authenticated {
        return Err(Error::Ssh(russh::Error::NotAuthenticated));
    }

    let channel = handle.channel_open_session().await?;
    channel.request_subsystem(true, "sftp").await?;
    Ok(SftpSession::new(channel.into_stream()).await?)
}

/// Transport and authentication failures after the handshake are reported
/// as ConnectFailed. Store and key errors keep their kind.
fn session_failed(machine: &Machine, e: Error) -> Error {
    let host = machine.name.to_string();
    match e {
        Error::Ssh(russh::Error::NotAuthenticated) => Error::ConnectFailed {
            host,
            reason: format!("authentication failed for user {}", machine.user),
        },
        Error::Ssh(_) | Error::Sftp(_) | Error::Io(_) => Error::ConnectFailed {
            host,
            reason: e.to_string(),
        },
        e => e,
    }
}

async fn authenticate_with_home_keys(handle: &mut SshHandle, machine: &Machine) -> Result<bool> {
    let paths = keys::home_directory_keys();
    if paths.is_empty() {
        warn!("no password or key pair configured for {} and no keys found in ~/.ssh", machine.name);
    }
    for path in paths {
        let key: KeyPair = match russh_keys::load_secret_key(&path, None) {
            Ok(key) => key,
            Err(e) => {
                debug!("skipping {}: {e}", path.display());
                continue;
            }
        };
        if handle
            .authenticate_publickey(machine.user.as_str(), Arc::new(key))
            .await?
        {
            debug!("authenticated {} with {}", machine.name, path.display());
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::machines::models::MachineId;
    use crate::error::ErrorKind;
    use crate::shared::HostName;

    fn machine(pinned: &str) -> Machine {
        Machine {
            id: MachineId(1),
            name: HostName::new("nas"),
            enabled: true,
            host: "nas.lan".to_string(),
            port: 22,
            user: "admin".to_string(),
            password: String::new(),
            use_key_pair: true,
            remote_public_key: pinned.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn first_connect_captures_the_key() {
        let pinner = HostKeyPinner::new(&machine(""));
        assert!(pinner.verify("ssh-ed25519", "AAAA"));
        let captured = pinner.captured.lock().unwrap().clone().unwrap();
        assert!(captured.starts_with("ssh-ed25519 AAAA added by dockman for nas on "));
    }

    #[test]
    fn pinned_key_rejects_a_different_key() {
        let pinner = HostKeyPinner::new(&machine("ssh-ed25519 AAAA added by dockman"));
        assert!(pinner.verify("ssh-ed25519", "AAAA"));
        assert!(!*pinner.mismatch.lock().unwrap());

        assert!(!pinner.verify("ssh-ed25519", "BBBB"));
        assert!(*pinner.mismatch.lock().unwrap());
        assert!(pinner.captured.lock().unwrap().is_none());
    }

    #[test]
    fn rejected_logins_are_connect_failures() {
        let nas = machine("");
        let err = session_failed(&nas, Error::Ssh(russh::Error::NotAuthenticated));
        assert_eq!(err.kind(), ErrorKind::ConnectFailed);
        assert!(err.to_string().contains("authentication failed for user admin"), "{err}");

        let err = session_failed(&nas, Error::Ssh(russh::Error::Disconnect));
        assert_eq!(err.kind(), ErrorKind::ConnectFailed);

        let err = session_failed(&nas, Error::not_found("ssh key", DEFAULT_KEY_NAME));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
