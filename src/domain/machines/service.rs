use crate::domain::machines::models::{
    DEFAULT_KEY_NAME, KeyPair, Machine, MachineRef, SaveMachineRequest,
};
use crate::domain::machines::ports::{KeyRepository, MachineRepository};
use crate::error::{Error, ErrorKind, Result};
use crate::ssh::keys::generate_key_pair;
use log::info;

/// Credential & host store. Wraps a repository and adds the behaviour the
/// rest of the system relies on: validation and the bootstrapped default key.
#[derive(Clone)]
pub struct Service<R: MachineRepository + KeyRepository> {
    repository: R,
}

impl<R: MachineRepository + KeyRepository> Service<R> {
    pub fn new(repository: R) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub async fn save_machine(&self, req: &SaveMachineRequest) -> Result<Machine> {
        if req.name.as_str().trim().is_empty() {
            return Err(Error::invalid("machine name must not be empty"));
        }
        if req.name.is_local() {
            return Err(Error::invalid("the name `local` is reserved"));
        }
        if req.host.trim().is_empty() {
            return Err(Error::invalid("machine host must not be empty"));
        }
        self.repository.save_machine(req).await
    }

    pub async fn delete_machine(&self, machine: &MachineRef) -> Result<()> {
        self.repository.delete_machine(machine).await
    }

    pub async fn list_machines(&self) -> Result<Vec<Machine>> {
        self.repository.list_machines().await
    }

    pub async fn get_machine(&self, machine: &MachineRef) -> Result<Machine> {
        self.repository.get_machine(machine).await
    }

    /// Looks up a key pair. A missing `default` key is generated and stored.
    pub async fn get_key(&self, name: &str) -> Result<KeyPair> {
        match self.repository.get_key(name).await {
            Err(e) if e.kind() == ErrorKind::NotFound && name == DEFAULT_KEY_NAME => {
                info!("no default key pair found, generating a new one");
                let (public_key, private_key) = generate_key_pair(DEFAULT_KEY_NAME)?;
                match self
                    .repository
                    .save_key(DEFAULT_KEY_NAME, &public_key, &private_key)
                    .await
                {
                    Ok(key) => Ok(key),
                    // lost a race against a concurrent bootstrap
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                        self.repository.get_key(DEFAULT_KEY_NAME).await
                    }
                    Err(e) => Err(e),
                }
            }
            other => other,
        }
    }

    pub async fn save_key(
        &self,
        name: &str,
        public_key: &[u8],
        private_key: &[u8],
    ) -> Result<KeyPair> {
        if name.trim().is_empty() {
            return Err(Error::invalid("key name must not be empty"));
        }
        self.repository.save_key(name, public_key, private_key).await
    }

    pub async fn list_keys(&self) -> Result<Vec<KeyPair>> {
        self.repository.list_keys().await
    }

    pub async fn delete_key(&self, name: &str) -> Result<()> {
        if name == DEFAULT_KEY_NAME {
            return Err(Error::invalid("the default key pair cannot be deleted"));
        }
        self.repository.delete_key(name).await
    }
}
