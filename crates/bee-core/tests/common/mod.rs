// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for bee-core integration tests.
//!
//! Provides an in-process gRPC agent, a mock-backed runtime, and the
//! environment lookups for tests against real hosts.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use bee_core::agent::AgentService;
use bee_core::client::{ExecOptions, MockClient, MockConnector, MockReply};
use bee_core::inventory::loader;
use bee_core::runtime::{Runtime, RuntimeOptions};

/// A bee-agent serving a scratch directory on a loopback port.
pub struct AgentContext {
    pub addr: SocketAddr,
    pub root: TempDir,
    shutdown: Option<oneshot::Sender<()>>,
}

impl AgentContext {
    pub async fn start() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (tx, rx) = oneshot::channel::<()>();

        let service = AgentService::new(root.path());
        tokio::spawn(async move {
            let shutdown = async {
                let _ = rx.await;
            };
            if let Err(e) = service.serve(listener, shutdown).await {
                eprintln!("Test agent error: {}", e);
            }
        });

        Self {
            addr,
            root,
            shutdown: Some(tx),
        }
    }
}

impl Drop for AgentContext {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Answers like the interpreter would: `-version` succeeds and a script run
/// echoes its `--data=` flag.
pub fn tengo_handler(shell: &str, options: &ExecOptions) -> bee_core::Result<MockReply> {
    if !shell.ends_with("tengo") && !shell.ends_with("tengo.exe") {
        return Ok(MockReply::exit(127, format!("{}: not found", shell)));
    }
    if options.args.first().map(String::as_str) == Some("-version") {
        return Ok(MockReply::ok("v2.17.0\n"));
    }
    let data = options
        .args
        .iter()
        .find_map(|arg| arg.strip_prefix("--data="))
        .unwrap_or("pong");
    Ok(MockReply::ok(format!("{}\n", data)))
}

/// A runtime over mock transports, with `host1` and `host2` in the inventory.
pub struct RuntimeContext {
    pub runtime: Arc<Runtime>,
    pub connector: Arc<MockConnector>,
    pub dir: TempDir,
}

impl RuntimeContext {
    pub async fn new() -> Self {
        Self::with_connector(MockConnector::with_factory(|_| {
            MockClient::with_handler(tengo_handler)
        }))
        .await
    }

    pub async fn with_connector(connector: MockConnector) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let inventory = loader::parse("host1 bee_host=10.0.0.1:22 bee_user=root\nhost2\n")
            .expect("inventory");
        let connector = Arc::new(connector);

        let runtime = Runtime::builder(inventory)
            .connector(connector.clone())
            .options(RuntimeOptions::default().dir(dir.path()).parallel(4))
            .build()
            .await
            .expect("runtime");

        Self {
            runtime: Arc::new(runtime),
            connector,
            dir,
        }
    }
}

/// SSH endpoint for tests against a real host.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
}

impl SshTarget {
    /// Read `BEE_TEST_SSH_HOST` (required), `BEE_TEST_SSH_PORT`,
    /// `BEE_TEST_SSH_USER`, `BEE_TEST_SSH_PASSWORD` and `BEE_TEST_SSH_KEY`.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("BEE_TEST_SSH_HOST").ok()?;
        let port = std::env::var("BEE_TEST_SSH_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(22);
        Some(Self {
            host,
            port,
            user: std::env::var("BEE_TEST_SSH_USER").unwrap_or_else(|_| "root".to_string()),
            password: std::env::var("BEE_TEST_SSH_PASSWORD").ok(),
            private_key: std::env::var("BEE_TEST_SSH_KEY").ok(),
        })
    }

    /// Inventory line for the target, named `host1`.
    pub fn inventory(&self) -> String {
        let mut line = format!(
            "host1 bee_host={} bee_part={} bee_user={}",
            self.host, self.port, self.user
        );
        if let Some(password) = &self.password {
            line.push_str(&format!(" bee_ssh_passwd={}", password));
        }
        if let Some(key) = &self.private_key {
            line.push_str(&format!(" bee_ssh_private_key={}", key));
        }
        line.push('\n');
        line
    }
}
