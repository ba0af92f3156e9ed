// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gRPC client helpers for connecting to a bee-agent.

use std::time::Duration;

use thiserror::Error;
use tonic::transport::{Channel, Endpoint};
use tracing::{info, instrument};

use crate::DEFAULT_PORT;
use crate::rpc::bee_client::BeeClient;

/// Errors that can occur while dialing an agent
#[derive(Debug, Error)]
pub enum DialError {
    #[error("invalid agent address '{0}'")]
    InvalidAddress(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("connection timed out after {0}ms")]
    Timeout(u64),
}

/// Configuration for the agent channel
#[derive(Debug, Clone)]
pub struct DialConfig {
    /// `host:port` of the agent
    pub addr: String,
    /// Dial timeout
    pub connect_timeout: Duration,
    /// HTTP/2 keep-alive ping interval
    pub keep_alive_interval: Duration,
    /// How long to wait for a keep-alive ack before dropping the connection
    pub keep_alive_timeout: Duration,
    /// Send keep-alive pings even when no stream is open
    pub keep_alive_while_idle: bool,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            connect_timeout: Duration::from_secs(15),
            keep_alive_interval: Duration::from_secs(5 * 60),
            keep_alive_timeout: Duration::from_secs(60),
            keep_alive_while_idle: true,
        }
    }
}

impl DialConfig {
    /// Configuration with default timeouts for the given address.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    fn uri(&self) -> String {
        if self.addr.starts_with("http://") || self.addr.starts_with("https://") {
            self.addr.clone()
        } else {
            format!("http://{}", self.addr)
        }
    }
}

/// Open a channel to an agent and wrap it in the generated client.
#[instrument(skip(config), fields(addr = %config.addr))]
pub async fn dial(config: &DialConfig) -> Result<BeeClient<Channel>, DialError> {
    let endpoint = Endpoint::from_shared(config.uri())
        .map_err(|_| DialError::InvalidAddress(config.addr.clone()))?
        .connect_timeout(config.connect_timeout)
        .http2_keep_alive_interval(config.keep_alive_interval)
        .keep_alive_timeout(config.keep_alive_timeout)
        .keep_alive_while_idle(config.keep_alive_while_idle);

    let channel = tokio::time::timeout(config.connect_timeout, endpoint.connect())
        .await
        .map_err(|_| DialError::Timeout(config.connect_timeout.as_millis() as u64))??;

    info!("connected to bee-agent");
    Ok(BeeClient::new(channel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DialConfig::default();
        assert_eq!(config.addr, "127.0.0.1:15450");
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.keep_alive_interval, Duration::from_secs(300));
        assert_eq!(config.keep_alive_timeout, Duration::from_secs(60));
        assert!(config.keep_alive_while_idle);
    }

    #[test]
    fn test_uri_adds_scheme() {
        assert_eq!(DialConfig::new("host:1").uri(), "http://host:1");
        assert_eq!(DialConfig::new("https://host:1").uri(), "https://host:1");
    }

    #[tokio::test]
    async fn test_dial_invalid_address() {
        let config = DialConfig::new("not a uri at all");
        let err = dial(&config).await.unwrap_err();
        assert!(matches!(err, DialError::InvalidAddress(_)));
    }
}
