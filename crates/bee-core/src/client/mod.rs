// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport clients.
//!
//! Every transport implements [`Client`]: stat, download, upload and remote
//! command execution. Commands are returned as [`Command`] handles with the
//! familiar start/wait/pipe contract:
//!
//! ```text
//!                 ┌──────────────┐
//!  stat/get/put ─▶│  dyn Client  │──▶ SshClient    (SSH + SFTP, ssh2)
//!  execute ──────▶│              │──▶ WinrmClient  (WS-Management + PowerShell)
//!                 └──────┬───────┘──▶ GrpcClient   (bee-agent)
//!                        │
//!                        ▼
//!                 Box<dyn Command>  stdin/stdout/stderr pipes, start, wait
//! ```

pub mod command;
pub mod grpc;
pub mod mock;
pub mod ssh;
pub mod transfer;
pub mod winrm;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use command::{Output, PipedCommand, RemoteIo, RemoteProcess};
pub use grpc::GrpcClient;
pub use mock::{MockClient, MockConnector, MockReply};
pub use ssh::{SshClient, SshConfig};
pub use winrm::{WinrmClient, WinrmConfig};

/// Default chunk size for transfers (32 KiB).
pub const DEFAULT_CACHE_SIZE: usize = 32 * 1024;

// ============================================================================
// Types
// ============================================================================

/// Metadata of a remote path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub name: String,
    pub is_dir: bool,
    /// Permission bits
    pub mode: u32,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
}

/// Progress of a streaming transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct IoTrace {
    pub name: String,
    pub src: String,
    pub dst: String,
    pub total: u64,
    pub transferred: u64,
    pub bytes_per_second: f64,
}

/// Callback receiving transfer progress.
pub type TraceFn = Arc<dyn Fn(&IoTrace) + Send + Sync>;

/// Options of [`Client::get`].
#[derive(Clone)]
pub struct GetOptions {
    /// Download a directory tree
    pub dir: bool,
    /// Chunk size
    pub cache_size: usize,
    pub trace: Option<TraceFn>,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            dir: false,
            cache_size: DEFAULT_CACHE_SIZE,
            trace: None,
        }
    }
}

impl fmt::Debug for GetOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetOptions")
            .field("dir", &self.dir)
            .field("cache_size", &self.cache_size)
            .field("trace", &self.trace.as_ref().map(|_| "..."))
            .finish()
    }
}

/// Options of [`Client::put`].
#[derive(Clone)]
pub struct PutOptions {
    /// Upload a directory tree
    pub dir: bool,
    /// Chunk size
    pub cache_size: usize,
    /// Create missing remote parent directories
    pub mkdir: bool,
    pub trace: Option<TraceFn>,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            dir: false,
            cache_size: DEFAULT_CACHE_SIZE,
            mkdir: false,
            trace: None,
        }
    }
}

impl fmt::Debug for PutOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutOptions")
            .field("dir", &self.dir)
            .field("cache_size", &self.cache_size)
            .field("mkdir", &self.mkdir)
            .field("trace", &self.trace.as_ref().map(|_| "..."))
            .finish()
    }
}

/// Options of [`Client::execute`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Working directory
    pub root: Option<String>,
}

impl ExecOptions {
    pub fn args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// Caller side of a command's stdin.
pub type StdinPipe = Box<dyn AsyncWrite + Send + Unpin>;
/// Caller side of a command's stdout or stderr.
pub type OutputPipe = Box<dyn AsyncRead + Send + Unpin>;

// ============================================================================
// Traits
// ============================================================================

/// A connected transport to one host.
#[async_trait]
pub trait Client: Send + Sync {
    /// Transport name (`ssh`, `winrm`, `grpc`, `mock`).
    fn kind(&self) -> &'static str;

    /// Metadata of a remote path; [`Error::NotExists`](crate::Error::NotExists)
    /// when absent.
    async fn stat(&self, cancel: &CancellationToken, path: &str) -> Result<FileStat>;

    /// Download `remote` into `local`.
    async fn get(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        local: &Path,
        options: GetOptions,
    ) -> Result<()>;

    /// Upload `local` to `remote`.
    async fn put(
        &self,
        cancel: &CancellationToken,
        local: &Path,
        remote: &str,
        options: PutOptions,
    ) -> Result<()>;

    /// Prepare a remote command; it runs once started.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        shell: &str,
        options: ExecOptions,
    ) -> Result<Box<dyn Command>>;

    /// Release the connection.
    async fn close(&self) -> Result<()>;
}

/// A remote command.
///
/// Pipes must be claimed before [`Command::start`]; afterwards the setters
/// fail with [`Error::AlreadyStarted`](crate::Error::AlreadyStarted).
#[async_trait]
pub trait Command: Send {
    fn stdin_pipe(&mut self) -> Result<StdinPipe>;
    fn stdout_pipe(&mut self) -> Result<OutputPipe>;
    fn stderr_pipe(&mut self) -> Result<OutputPipe>;

    async fn start(&mut self) -> Result<()>;

    /// Wait for the command to exit; a non-zero exit is
    /// [`Error::Exit`](crate::Error::Exit).
    async fn wait(&mut self) -> Result<()>;

    async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.wait().await
    }

    /// Run and return stdout and stderr interleaved.
    async fn combined_output(&mut self) -> Result<Vec<u8>>;

    /// Run and return stdout and stderr separately.
    async fn output(&mut self) -> Result<Output>;

    /// Tear the command down, waiting for it to stop.
    async fn close(&mut self) -> Result<()>;
}
