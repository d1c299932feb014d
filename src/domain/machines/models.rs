use crate::shared::HostName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_KEY_NAME: &str = "default";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MachineId(pub i64);

/// A remote docker host reachable over ssh.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: MachineId,
    pub name: HostName,
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    pub use_key_pair: bool,
    /// authorized_keys formatted key captured on first connect. Empty until then.
    pub remote_public_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Machine {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn auth_method(&self) -> AuthMethod {
        if self.use_key_pair {
            AuthMethod::KeyPair
        } else if !self.password.is_empty() {
            AuthMethod::Password
        } else {
            AuthMethod::HomeDirectoryKeys
        }
    }
}

/// Order in which the connector picks credentials for a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    KeyPair,
    Password,
    HomeDirectoryKeys,
}

/// Payload for creating or replacing a machine. `id` is `None` for new records.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SaveMachineRequest {
    #[serde(default)]
    pub id: Option<MachineId>,
    pub name: HostName,
    #[serde(default)]
    pub enabled: bool,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub use_key_pair: bool,
    #[serde(default)]
    pub remote_public_key: String,
}

fn default_ssh_port() -> u16 {
    22
}

impl From<&Machine> for SaveMachineRequest {
    fn from(machine: &Machine) -> Self {
        Self {
            id: Some(machine.id),
            name: machine.name.clone(),
            enabled: machine.enabled,
            host: machine.host.clone(),
            port: machine.port,
            user: machine.user.clone(),
            password: machine.password.clone(),
            use_key_pair: machine.use_key_pair,
            remote_public_key: machine.remote_public_key.clone(),
        }
    }
}

/// Lookup key for a machine.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineRef {
    Id(MachineId),
    Name(HostName),
}

impl From<&HostName> for MachineRef {
    fn from(name: &HostName) -> Self {
        MachineRef::Name(name.clone())
    }
}

impl From<MachineId> for MachineRef {
    fn from(id: MachineId) -> Self {
        MachineRef::Id(id)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    pub name: String,
    pub public_key: Vec<u8>,
    #[serde(skip_serializing)]
    pub private_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
