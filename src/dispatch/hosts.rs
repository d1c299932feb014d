use crate::dispatch::Dispatcher;
use crate::docker::client::ConnectedClient;
use crate::docker::pool::ClientEntry;
use crate::domain::Store;
use crate::domain::machines::models::{KeyPair, Machine, MachineRef, SaveMachineRequest};
use crate::error::{Error, Result};
use crate::git::History;
use crate::shared::HostName;
use crate::ssh::keys::{generate_key_pair, import_key_pair};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewKeyRequest {
    pub name: String,
    /// PEM or OpenSSH private key to import; a new ed25519 key is generated
    /// when absent.
    #[serde(default)]
    pub private_key: Option<String>,
}

impl<S: Store, H: History> Dispatcher<S, H> {
    /// Connects `machine` and puts it into the pool. Returns the machine
    /// with its pinned host key.
    async fn connect(&self, machine: &Machine) -> Result<Machine> {
        let (client, machine) = ConnectedClient::remote(machine, &self.machines).await?;
        self.pool.insert(client).await;
        Ok(machine)
    }

    /// Removes a host from the pool. When it was the active host, pending
    /// edits are committed and the worktree follows the new active host.
    async fn disconnect(&self, name: &HostName) -> Result<()> {
        let _switching = self.switching.lock().await;
        if !self.pool.contains(name).await {
            return Ok(());
        }
        let was_active = self.pool.active_name().await == *name;
        self.pool.delete(name).await?;
        if was_active {
            let next = self.pool.active_name().await;
            self.history.commit_on_switch(&next).await?;
        }
        info!("host {name} disconnected");
        Ok(())
    }

    /// Stores a new machine and connects it when enabled. The record is kept
    /// when connecting fails.
    pub async fn host_new(&self, req: SaveMachineRequest) -> Result<Machine> {
        if req.id.is_some() {
            return Err(Error::invalid("a new host must not carry an id"));
        }
        if self.pool.contains(&req.name).await {
            return Err(Error::already_exists("host", req.name.as_str()));
        }
        let machine = self.machines.save_machine(&req).await?;
        info!("added host {}", machine.name);
        if !machine.enabled {
            return Ok(machine);
        }
        self.connect(&machine).await.inspect_err(|e| {
            error!("host {} saved but could not connect: {e}", machine.name);
        })
    }

    pub async fn host_list(&self) -> Result<Vec<Machine>> {
        self.machines.list_machines().await
    }

    pub async fn host_get(&self, name: &HostName) -> Result<Machine> {
        self.machines.get_machine(&MachineRef::from(name)).await
    }

    /// Replaces a machine's settings and reconnects it.
    pub async fn host_edit(&self, req: SaveMachineRequest) -> Result<Machine> {
        let id = req
            .id
            .ok_or_else(|| Error::invalid("editing a host needs its id"))?;
        let previous = self.machines.get_machine(&MachineRef::Id(id)).await?;
        let machine = self.machines.save_machine(&req).await?;
        if previous.name != machine.name {
            self.disconnect(&previous.name).await?;
        }
        if machine.enabled {
            self.connect(&machine).await
        } else {
            self.disconnect(&machine.name).await?;
            Ok(machine)
        }
    }

    /// Enables and connects, or disables and disconnects a machine.
    pub async fn host_toggle(&self, name: &HostName, enable: bool) -> Result<Machine> {
        let mut machine = self.host_get(name).await?;
        machine.enabled = enable;
        let machine = self
            .machines
            .save_machine(&SaveMachineRequest::from(&machine))
            .await?;
        if enable {
            self.connect(&machine).await
        } else {
            self.disconnect(name).await?;
            Ok(machine)
        }
    }

    pub async fn host_delete(&self, name: &HostName) -> Result<()> {
        if name.is_local() {
            return Err(Error::invalid("the local host cannot be deleted"));
        }
        self.disconnect(name).await?;
        self.machines.delete_machine(&MachineRef::from(name)).await?;
        info!("deleted host {name}");
        Ok(())
    }

    /// Makes `name` the active host. Pending edits are committed on the
    /// current host's branch and the worktree moves to the branch of `name`.
    pub async fn host_switch(&self, name: &HostName) -> Result<()> {
        let _switching = self.switching.lock().await;
        if !self.pool.contains(name).await {
            return Err(Error::not_found("host", name.as_str()));
        }
        if self.pool.active_name().await == *name {
            return Ok(());
        }
        self.history.commit_on_switch(name).await?;
        self.pool.switch(name).await
    }

    pub async fn list_clients(&self) -> Vec<ClientEntry> {
        self.pool.list().await
    }

    pub async fn ssh_new(&self, req: NewKeyRequest) -> Result<KeyPair> {
        let (public_key, private_key) = match &req.private_key {
            Some(private_key) => import_key_pair(private_key.as_bytes(), &req.name)?,
            None => generate_key_pair(&req.name)?,
        };
        let key = self
            .machines
            .save_key(&req.name, &public_key, &private_key)
            .await?;
        info!("stored ssh key {}", key.name);
        Ok(key)
    }

    pub async fn ssh_list(&self) -> Result<Vec<KeyPair>> {
        self.machines.list_keys().await
    }

    pub async fn ssh_get(&self, name: &str) -> Result<KeyPair> {
        self.machines.get_key(name).await
    }

    pub async fn ssh_delete(&self, name: &str) -> Result<()> {
        self.machines.delete_key(name).await.inspect_err(|e| {
            warn!("could not delete ssh key {name}: {e}");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::{fixture, offline_client};
    use crate::domain::machines::models::DEFAULT_KEY_NAME;
    use crate::error::ErrorKind;

    fn request(name: &str, enabled: bool) -> SaveMachineRequest {
        SaveMachineRequest {
            id: None,
            name: HostName::new(name),
            enabled,
            host: "10.0.0.7".to_string(),
            port: 22,
            user: "deploy".to_string(),
            password: String::new(),
            use_key_pair: true,
            remote_public_key: String::new(),
        }
    }

    #[tokio::test]
    async fn switching_hosts_moves_the_worktree() {
        let fx = fixture(&["local", "remote-a"]).await;
        let d = &fx.dispatcher;
        assert_eq!(d.pool().active_name().await, HostName::local());

        std::fs::write(fx.root.path().join("foo.yaml"), "edited: true\n").unwrap();
        d.host_switch(&HostName::new("remote-a")).await.unwrap();
        assert_eq!(d.pool().active_name().await, HostName::new("remote-a"));
        assert_eq!(fx.historian.current_branch().await.unwrap(), "remote-a");

        d.host_switch(&HostName::local()).await.unwrap();
        assert_eq!(fx.historian.current_branch().await.unwrap(), "local");
        let content = std::fs::read_to_string(fx.root.path().join("foo.yaml")).unwrap();
        assert_eq!(content, "edited: true\n");
    }

    #[tokio::test]
    async fn concurrent_switches_keep_branch_and_host_together() {
        let fx = fixture(&["local", "nas"]).await;
        let d = &fx.dispatcher;
        let nas = HostName::new("nas");
        let local = HostName::local();
        for _ in 0..5 {
            let (a, b) = tokio::join!(d.host_switch(&nas), d.host_switch(&local));
            a.unwrap();
            b.unwrap();
            let active = d.pool().active_name().await;
            assert_eq!(fx.historian.current_branch().await.unwrap(), active.as_str());
        }
    }

    #[tokio::test]
    async fn switching_to_an_unknown_host_fails() {
        let fx = fixture(&["local"]).await;
        let err = fx
            .dispatcher
            .host_switch(&HostName::new("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(fx.dispatcher.pool().active_name().await, HostName::local());
    }

    #[tokio::test]
    async fn disabled_hosts_are_stored_without_connecting() {
        let fx = fixture(&["local"]).await;
        let d = &fx.dispatcher;
        let machine = d.host_new(request("nas", false)).await.unwrap();
        assert!(!machine.enabled);
        assert_eq!(d.host_list().await.unwrap().len(), 1);
        assert!(!d.pool().contains(&HostName::new("nas")).await);

        let err = d.host_new(request("local", false)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn deleting_the_active_host_switches_away() {
        let fx = fixture(&["local"]).await;
        let d = &fx.dispatcher;
        d.machines().save_machine(&request("nas-db", false)).await.unwrap();

        d.pool().insert(offline_client("nas-db")).await;
        d.host_switch(&HostName::new("nas-db")).await.unwrap();
        d.host_delete(&HostName::new("nas-db")).await.unwrap();

        assert_eq!(d.pool().active_name().await, HostName::local());
        assert_eq!(fx.historian.current_branch().await.unwrap(), "local");
        let err = d.host_get(&HostName::new("nas-db")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn ssh_keys_can_be_generated_and_imported() {
        let fx = fixture(&["local"]).await;
        let d = &fx.dispatcher;
        let generated = d
            .ssh_new(NewKeyRequest {
                name: "deploy".to_string(),
                private_key: None,
            })
            .await
            .unwrap();
        assert!(generated.public_key.starts_with(b"ssh-ed25519 "));

        let pem = String::from_utf8(generated.private_key.clone()).unwrap();
        let imported = d
            .ssh_new(NewKeyRequest {
                name: "imported".to_string(),
                private_key: Some(pem),
            })
            .await
            .unwrap();
        let material = |k: &KeyPair| {
            String::from_utf8_lossy(&k.public_key)
                .split_whitespace()
                .nth(1)
                .map(str::to_string)
        };
        assert_eq!(material(&generated), material(&imported));

        let err = d
            .ssh_new(NewKeyRequest {
                name: "deploy".to_string(),
                private_key: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let err = d.ssh_delete(DEFAULT_KEY_NAME).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        d.ssh_delete("imported").await.unwrap();
        assert_eq!(d.ssh_get("imported").await.unwrap_err().kind(), ErrorKind::NotFound);
    }
}
