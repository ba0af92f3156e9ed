// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock transport for testing.
//!
//! Records every call and answers executes through a scripted handler, so
//! the runtime can be exercised without any remote host.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::command::{PipedCommand, RemoteIo, RemoteProcess};
use super::transfer::{join_remote, remote_base_name, walk_local};
use super::{Client, Command, ExecOptions, FileStat, GetOptions, PutOptions};
use crate::connection::Connector;
use crate::error::{Error, Result};
use crate::inventory::Host;
use crate::secret::SecretStore;

/// Scripted answer of a mock command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockReply {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl MockReply {
    /// Successful exit printing `stdout`.
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    /// Failed exit printing `stderr`.
    pub fn exit(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }
}

/// Answers a command line (program and options).
pub type ExecHandler = Arc<dyn Fn(&str, &ExecOptions) -> Result<MockReply> + Send + Sync>;

#[derive(Default)]
struct MockState {
    paths: BTreeSet<String>,
    dirs: BTreeSet<String>,
    puts: Vec<String>,
    gets: Vec<String>,
    stats: Vec<String>,
    executes: Vec<String>,
}

/// Mock client recording calls.
pub struct MockClient {
    state: Mutex<MockState>,
    handler: ExecHandler,
    closed: AtomicUsize,
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClient {
    /// Every command succeeds without output.
    pub fn new() -> Self {
        Self::with_handler(|_, _| Ok(MockReply::default()))
    }

    /// Commands are answered by `handler`.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&str, &ExecOptions) -> Result<MockReply> + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(MockState::default()),
            handler: Arc::new(handler),
            closed: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `path` visible to `stat`.
    pub fn add_path(&self, path: &str, is_dir: bool) {
        let mut state = self.state();
        state.paths.insert(path.to_string());
        if is_dir {
            state.dirs.insert(path.to_string());
        }
    }

    /// Remote targets of every uploaded entry, in order.
    pub fn puts(&self) -> Vec<String> {
        self.state().puts.clone()
    }

    /// Remote sources of every download, in order.
    pub fn gets(&self) -> Vec<String> {
        self.state().gets.clone()
    }

    pub fn stats(&self) -> Vec<String> {
        self.state().stats.clone()
    }

    /// Command lines run, program and arguments joined by spaces.
    pub fn executes(&self) -> Vec<String> {
        self.state().executes.clone()
    }

    /// How many times [`Client::close`] was called.
    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Client for MockClient {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn stat(&self, cancel: &CancellationToken, path: &str) -> Result<FileStat> {
        if cancel.is_cancelled() {
            return Err(Error::Timeout);
        }
        let mut state = self.state();
        state.stats.push(path.to_string());
        if !state.paths.contains(path) {
            return Err(Error::NotExists(path.to_string()));
        }
        Ok(FileStat {
            name: remote_base_name(path).to_string(),
            is_dir: state.dirs.contains(path),
            mode: 0o644,
            size: 0,
            mod_time: Utc::now(),
        })
    }

    async fn get(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        local: &Path,
        _options: GetOptions,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Timeout);
        }
        {
            let mut state = self.state();
            state.gets.push(remote.to_string());
            if !state.paths.contains(remote) {
                return Err(Error::NotExists(remote.to_string()));
            }
        }
        tokio::fs::write(local, remote.as_bytes()).await?;
        Ok(())
    }

    async fn put(
        &self,
        cancel: &CancellationToken,
        local: &Path,
        remote: &str,
        options: PutOptions,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Timeout);
        }
        let entries = walk_local(local)?;
        if entries.first().is_some_and(|e| e.is_dir) && !options.dir {
            return Err(Error::Request(format!("{} is a directory", local.display())));
        }

        let mut state = self.state();
        for entry in entries {
            let target = join_remote(remote, &entry.relative);
            state.puts.push(target.clone());
            state.paths.insert(target.clone());
            if entry.is_dir {
                state.dirs.insert(target);
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        shell: &str,
        options: ExecOptions,
    ) -> Result<Box<dyn Command>> {
        let mut line = shell.to_string();
        for arg in &options.args {
            line.push(' ');
            line.push_str(arg);
        }
        self.state().executes.push(line.clone());

        let process = MockProcess {
            reply: (self.handler)(shell, &options),
        };
        Ok(Box::new(PipedCommand::new(line, Box::new(process), cancel)))
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockProcess {
    reply: Result<MockReply>,
}

#[async_trait]
impl RemoteProcess for MockProcess {
    async fn run(self: Box<Self>, mut io: RemoteIo, _cancel: CancellationToken) -> Result<i32> {
        let reply = self.reply?;
        io.stdout.write_all(&reply.stdout).await?;
        io.stderr.write_all(&reply.stderr).await?;
        io.stdout.flush().await?;
        io.stderr.flush().await?;
        Ok(reply.code)
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Hands out one [`MockClient`] per host.
pub struct MockConnector {
    clients: Mutex<HashMap<String, Arc<MockClient>>>,
    factory: Box<dyn Fn(&str) -> MockClient + Send + Sync>,
    connects: AtomicUsize,
    /// Simulated connection latency
    pub delay: Duration,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self::with_factory(|_| MockClient::new())
    }

    /// Build each host's client with `factory`.
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn(&str) -> MockClient + Send + Sync + 'static,
    {
        Self {
            clients: Mutex::new(HashMap::new()),
            factory: Box::new(factory),
            connects: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// The client of `host`, created on first use.
    pub fn client(&self, host: &str) -> Arc<MockClient> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients
            .entry(host.to_string())
            .or_insert_with(|| Arc::new((self.factory)(host)))
            .clone()
    }

    /// How many times [`Connector::connect`] was called.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, host: &Host, _secrets: &dyn SecretStore) -> Result<Arc<dyn Client>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.client(&host.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_makes_paths_visible() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("ping")).unwrap();
        std::fs::write(dir.path().join("ping/bee.yml"), "name: ping").unwrap();

        let client = MockClient::new();
        let cancel = CancellationToken::new();
        let options = PutOptions {
            dir: true,
            ..Default::default()
        };
        client
            .put(&cancel, &dir.path().join("ping"), ".bee/modules/ping", options)
            .await
            .unwrap();

        assert_eq!(client.puts(), vec![".bee/modules/ping", ".bee/modules/ping/bee.yml"]);
        let stat = client.stat(&cancel, ".bee/modules/ping").await.unwrap();
        assert!(stat.is_dir);
        assert!(client.stat(&cancel, ".bee/other").await.unwrap_err().is_not_exists());
    }

    #[tokio::test]
    async fn test_scripted_execute() {
        let client = MockClient::with_handler(|shell, _| match shell {
            "true" => Ok(MockReply::ok("yes")),
            _ => Ok(MockReply::exit(127, "not found")),
        });
        let cancel = CancellationToken::new();

        let mut cmd = client.execute(&cancel, "true", ExecOptions::default()).await.unwrap();
        assert_eq!(cmd.output().await.unwrap().stdout, b"yes");

        let mut cmd = client.execute(&cancel, "nope", ExecOptions::args(["-x"])).await.unwrap();
        assert!(matches!(cmd.output().await, Err(Error::Exit { code: 127, .. })));
        assert_eq!(client.executes(), vec!["true", "nope -x"]);
    }
}
