use crate::docker::client::ConnectedClient;
use crate::domain::machines::models::Machine;
use crate::domain::machines::ports::{KeyRepository, MachineRepository};
use crate::domain::machines::service::Service as MachineService;
use crate::error::{Error, Result};
use crate::shared::HostName;
use bollard::Docker;
use log::{debug, error, info};
use russh_sftp::client::SftpSession;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;

/// The client bundle of the active host, borrowed for the duration of one
/// operation.
#[derive(Clone)]
pub struct ActiveHost {
    pub name: HostName,
    pub client: Arc<ConnectedClient>,
}

impl ActiveHost {
    pub fn docker(&self) -> &Docker {
        self.client.docker()
    }

    /// `None` when the active host is the local daemon.
    pub fn sftp(&self) -> Option<Arc<SftpSession>> {
        self.client.sftp()
    }
}

/// Source of the client bundle every non-host-management operation runs against.
pub trait ActiveClient: Send + Sync {
    fn active_client(&self) -> impl Future<Output = Result<ActiveHost>> + Send;
}

#[derive(Debug, Clone, Default)]
pub struct BootstrapOptions {
    pub disable_local: bool,
    pub default_host: Option<HostName>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEntry {
    pub name: HostName,
    pub active: bool,
    pub remote: bool,
}

/// Connected docker clients by host name plus the active host.
///
/// Lock order is always `active` before `clients`.
pub struct HostPool {
    clients: RwLock<HashMap<HostName, Arc<ConnectedClient>>>,
    active: RwLock<HostName>,
}

impl HostPool {
    /// Connects every enabled machine and the local daemon concurrently.
    /// Hosts that fail to connect are logged and left out.
    pub async fn bootstrap<R: MachineRepository + KeyRepository>(
        credentials: &MachineService<R>,
        options: &BootstrapOptions,
    ) -> Result<Self> {
        let machines = credentials.list_machines().await?;
        let mut workers: JoinSet<(HostName, Result<ConnectedClient>)> = JoinSet::new();

        if !options.disable_local {
            workers.spawn(async { (HostName::local(), ConnectedClient::local().await) });
        }
        for machine in machines.into_iter().filter(|m| m.enabled) {
            let credentials = credentials.clone();
            workers.spawn(async move {
                let name = machine.name.clone();
                let result = connect_machine(&machine, &credentials).await;
                (name, result)
            });
        }

        let mut clients = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(client))) => clients.push(client),
                Ok((name, Err(e))) => error!("host {name} is unavailable: {e}"),
                Err(e) => error!("host bootstrap worker failed: {e}"),
            }
        }

        Self::from_clients(clients, options.default_host.as_ref())
    }

    /// Builds a pool from already connected clients. The active host is the
    /// preferred one if present, else `local`, else the first by name.
    pub fn from_clients(clients: Vec<ConnectedClient>, preferred: Option<&HostName>) -> Result<Self> {
        let clients: HashMap<HostName, Arc<ConnectedClient>> = clients
            .into_iter()
            .map(|c| (c.name().clone(), Arc::new(c)))
            .collect();
        let active = pick_default(clients.keys(), preferred).ok_or(Error::PoolEmpty)?;
        info!(
            "host pool ready with {} host(s), active host is {active}",
            clients.len()
        );
        Ok(Self {
            clients: RwLock::new(clients),
            active: RwLock::new(active),
        })
    }

    pub async fn active(&self) -> Result<ActiveHost> {
        let active = self.active.read().await;
        let clients = self.clients.read().await;
        let client = clients
            .get(&*active)
            .cloned()
            .ok_or_else(|| Error::not_found("host", active.as_str()))?;
        Ok(ActiveHost {
            name: active.clone(),
            client,
        })
    }

    pub async fn active_name(&self) -> HostName {
        self.active.read().await.clone()
    }

    pub async fn get(&self, name: &HostName) -> Option<Arc<ConnectedClient>> {
        self.clients.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &HostName) -> bool {
        self.clients.read().await.contains_key(name)
    }

    pub async fn list(&self) -> Vec<ClientEntry> {
        let active = self.active.read().await;
        let clients = self.clients.read().await;
        let mut entries: Vec<ClientEntry> = clients
            .iter()
            .map(|(name, client)| ClientEntry {
                name: name.clone(),
                active: *name == *active,
                remote: client.is_remote(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Adds or replaces a client. A replaced client is closed.
    pub async fn insert(&self, client: ConnectedClient) {
        let name = client.name().clone();
        let previous = self
            .clients
            .write()
            .await
            .insert(name.clone(), Arc::new(client));
        if let Some(previous) = previous {
            debug!("replaced client {name}");
            release(previous).await;
        }
    }

    pub async fn switch(&self, name: &HostName) -> Result<()> {
        let mut active = self.active.write().await;
        if !self.clients.read().await.contains_key(name) {
            return Err(Error::not_found("host", name.as_str()));
        }
        info!("switching active host {} -> {name}", *active);
        *active = name.clone();
        Ok(())
    }

    /// Closes and removes a client. When it is the active host the pool
    /// switches away first; removing the only host is refused.
    pub async fn delete(&self, name: &HostName) -> Result<()> {
        let mut active = self.active.write().await;
        let mut clients = self.clients.write().await;
        if !clients.contains_key(name) {
            return Err(Error::not_found("host", name.as_str()));
        }
        if *active == *name {
            let next = pick_default(clients.keys().filter(|n| *n != name), None)
                .ok_or_else(|| Error::invalid(format!("{name} is the only connected host")))?;
            info!("switching active host {name} -> {next} before removing it");
            *active = next;
        }
        let removed = clients.remove(name);
        drop(clients);
        drop(active);
        if let Some(client) = removed {
            release(client).await;
        }
        Ok(())
    }

    pub async fn close_all(&self) {
        let clients: Vec<_> = self.clients.write().await.drain().map(|(_, c)| c).collect();
        for client in clients {
            release(client).await;
        }
    }
}

impl ActiveClient for HostPool {
    async fn active_client(&self) -> Result<ActiveHost> {
        self.active().await
    }
}

pub async fn connect_machine<R: MachineRepository + KeyRepository>(
    machine: &Machine,
    credentials: &MachineService<R>,
) -> Result<ConnectedClient> {
    let (client, _) = ConnectedClient::remote(machine, credentials).await?;
    Ok(client)
}

async fn release(client: Arc<ConnectedClient>) {
    match Arc::try_unwrap(client) {
        Ok(client) => client.close().await,
        // an in-flight operation still holds it; dropping the last handle closes it
        Err(shared) => debug!("client {} still in use, closing on drop", shared.name()),
    }
}

fn pick_default<'a>(
    names: impl Iterator<Item = &'a HostName>,
    preferred: Option<&HostName>,
) -> Option<HostName> {
    let mut names: Vec<&HostName> = names.collect();
    names.sort();
    if let Some(preferred) = preferred
        && names.contains(&preferred)
    {
        return Some(preferred.clone());
    }
    if let Some(local) = names.iter().find(|n| n.is_local()) {
        return Some((*local).clone());
    }
    names.first().map(|n| (*n).clone())
}
