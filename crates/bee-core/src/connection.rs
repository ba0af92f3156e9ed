// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection manager.
//!
//! Produces one transport client per host on first use and caches it.
//! Clients are built by a [`Connector`]; the default [`TransportConnector`]
//! reads the host's variables:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `bee_connect` | `ssh`, `winrm` or `grpc` | `ssh` |
//! | `bee_host` | Address (a `:port` suffix is ignored) | host name |
//! | `bee_part` | Port | host port, else 22 / 5985 / 15450 |
//! | `bee_user` | Remote user | `root` / `Administrator` |
//! | `bee_ssh_passwd` | SSH password | |
//! | `bee_ssh_private_key` | SSH key path | `~/.ssh/id_rsa` |
//! | `bee_ssh_passphrase` | Key passphrase | |
//! | `bee_winrm_passwd` | WinRM password | |
//!
//! Passwords are looked up in the secret store first, then in the variables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::client::{Client, GrpcClient, SshClient, SshConfig, WinrmClient, WinrmConfig, ssh, winrm};
use crate::error::{Error, Result};
use crate::inventory::{Host, Inventory};
use crate::secret::SecretStore;

/// Builds a client for a host.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &Host, secrets: &dyn SecretStore) -> Result<Arc<dyn Client>>;
}

// ============================================================================
// Transport connector
// ============================================================================

/// Transport selected by `bee_connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Ssh,
    Winrm,
    Grpc,
}

impl Transport {
    pub fn of(host: &Host) -> Result<Self> {
        match host.var("bee_connect").unwrap_or("") {
            "" | "ssh" => Ok(Transport::Ssh),
            "winrm" => Ok(Transport::Winrm),
            "grpc" => Ok(Transport::Grpc),
            other => Err(Error::InvalidClient(other.to_string())),
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Transport::Ssh => ssh::DEFAULT_PORT,
            Transport::Winrm => winrm::DEFAULT_PORT,
            Transport::Grpc => bee_protocol::DEFAULT_PORT,
        }
    }

    fn default_user(self) -> &'static str {
        match self {
            Transport::Winrm => "Administrator",
            _ => "root",
        }
    }

    /// Secret store namespace of the transport's password.
    fn namespace(self) -> &'static str {
        match self {
            Transport::Ssh => "ssh",
            Transport::Winrm => "winrm",
            Transport::Grpc => "grpc",
        }
    }
}

/// Address and port a host is reached at.
pub fn endpoint(host: &Host, transport: Transport) -> Result<(String, u16)> {
    let raw = host.var("bee_host").filter(|h| !h.is_empty()).unwrap_or(&host.name);
    let address = match raw.rsplit_once(':') {
        Some((address, port)) if port.parse::<u16>().is_ok() => address,
        _ => raw,
    };

    let port = match host.var("bee_part").filter(|p| !p.is_empty()) {
        Some(port) => port
            .parse()
            .map_err(|_| Error::Parse(format!("invalid bee_part '{}' on {}", port, host.name)))?,
        None => host.port.unwrap_or_else(|| transport.default_port()),
    };
    Ok((address.to_string(), port))
}

async fn password(
    host: &Host,
    secrets: &dyn SecretStore,
    transport: Transport,
    variable: &str,
) -> Result<Option<String>> {
    match secrets.get(&host.name, transport.namespace()).await {
        Ok(secret) => return secret.reveal().map(Some),
        Err(e) if e.is_not_exists() => {}
        Err(e) => warn!(host = %host.name, error = %e, "secret store lookup failed"),
    }
    Ok(host.var(variable).map(str::to_string))
}

/// Connector for the real transports.
#[derive(Debug, Default, Clone)]
pub struct TransportConnector;

#[async_trait]
impl Connector for TransportConnector {
    #[instrument(skip(self, host, secrets), fields(host = %host.name))]
    async fn connect(&self, host: &Host, secrets: &dyn SecretStore) -> Result<Arc<dyn Client>> {
        let transport = Transport::of(host)?;
        let (address, port) = endpoint(host, transport)?;
        let user = host
            .var("bee_user")
            .filter(|u| !u.is_empty())
            .unwrap_or(transport.default_user())
            .to_string();
        debug!(?transport, %address, port, %user, "building client");

        let client: Arc<dyn Client> = match transport {
            Transport::Ssh => {
                let private_key = host
                    .var("bee_ssh_private_key")
                    .map(PathBuf::from)
                    .or_else(|| dirs::home_dir().map(|home| home.join(".ssh").join("id_rsa")));
                let config = SshConfig {
                    port,
                    password: password(host, secrets, transport, "bee_ssh_passwd").await?,
                    private_key,
                    passphrase: host.var("bee_ssh_passphrase").map(str::to_string),
                    ..SshConfig::new(address, user)
                };
                Arc::new(SshClient::connect(config).await?)
            }
            Transport::Winrm => {
                let password = password(host, secrets, transport, "bee_winrm_passwd")
                    .await?
                    .ok_or_else(|| Error::MissingVariable("bee_winrm_passwd".to_string()))?;
                let config = WinrmConfig {
                    port,
                    ..WinrmConfig::new(address, user, password)
                };
                Arc::new(WinrmClient::new(config)?)
            }
            Transport::Grpc => Arc::new(GrpcClient::connect(&format!("{}:{}", address, port)).await?),
        };
        Ok(client)
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Per-host client cache.
pub struct ConnectionManager {
    inventory: Arc<Inventory>,
    secrets: Arc<dyn SecretStore>,
    connector: Arc<dyn Connector>,
    clients: RwLock<HashMap<String, Arc<dyn Client>>>,
}

impl ConnectionManager {
    pub fn new(
        inventory: Arc<Inventory>,
        secrets: Arc<dyn SecretStore>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            inventory,
            secrets,
            connector,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// The cached client of `name`, connecting on first use.
    ///
    /// Concurrent callers for the same host get the same handle.
    pub async fn get_client(&self, name: &str) -> Result<Arc<dyn Client>> {
        if let Some(client) = self.clients.read().await.get(name) {
            return Ok(client.clone());
        }

        let host = self
            .inventory
            .host(name)
            .ok_or_else(|| Error::HostNotExists(name.to_string()))?;
        let client = self.connector.connect(host, self.secrets.as_ref()).await?;

        let mut clients = self.clients.write().await;
        if let Some(existing) = clients.get(name) {
            let existing = existing.clone();
            drop(clients);
            if let Err(e) = client.close().await {
                debug!(host = name, error = %e, "failed to close duplicate client");
            }
            return Ok(existing);
        }
        clients.insert(name.to_string(), client.clone());
        info!(host = name, kind = client.kind(), "client created");
        Ok(client)
    }

    /// Close and evict the client of `name`.
    pub async fn remove_client(&self, name: &str) -> Result<()> {
        let client = self.clients.write().await.remove(name);
        match client {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }

    /// Close every client; the errors are combined into one.
    pub async fn cleanup(&self) -> Result<()> {
        let clients: Vec<_> = self.clients.write().await.drain().collect();
        let mut errors = Vec::new();
        for (name, client) in clients {
            if let Err(e) = client.close().await {
                errors.push(format!("{}: {}", name, e));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Request(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(vars: &[(&str, &str)]) -> Host {
        let mut host = Host::new("web1");
        for (k, v) in vars {
            host.vars.insert(k.to_string(), v.to_string());
        }
        host
    }

    #[test]
    fn test_transport_selection() {
        assert_eq!(Transport::of(&host(&[])).unwrap(), Transport::Ssh);
        assert_eq!(
            Transport::of(&host(&[("bee_connect", "winrm")])).unwrap(),
            Transport::Winrm
        );
        assert!(matches!(
            Transport::of(&host(&[("bee_connect", "telnet")])),
            Err(Error::InvalidClient(kind)) if kind == "telnet"
        ));
    }

    #[test]
    fn test_endpoint_resolution() {
        assert_eq!(
            endpoint(&host(&[]), Transport::Ssh).unwrap(),
            ("web1".to_string(), 22)
        );
        assert_eq!(
            endpoint(&host(&[("bee_host", "10.0.0.1:2222")]), Transport::Winrm).unwrap(),
            ("10.0.0.1".to_string(), 5985)
        );

        let mut with_port = host(&[("bee_host", "10.0.0.1")]);
        with_port.port = Some(2222);
        assert_eq!(
            endpoint(&with_port, Transport::Ssh).unwrap(),
            ("10.0.0.1".to_string(), 2222)
        );

        assert_eq!(
            endpoint(&host(&[("bee_part", "15451")]), Transport::Grpc).unwrap(),
            ("web1".to_string(), 15451)
        );
        assert!(endpoint(&host(&[("bee_part", "x")]), Transport::Ssh).is_err());
    }
}
