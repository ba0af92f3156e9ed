// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WinRM transport.
//!
//! Talks WS-Management over HTTP with Basic authentication. Every operation
//! opens a remote shell, runs one or more commands in it and deletes it:
//!
//! | Operation | Remote side |
//! |-----------|-------------|
//! | stat | `Get-Item ... \| ConvertTo-Xml`, exit 2 when missing |
//! | put | base64 chunks appended with `Add-Content` to `$env:TEMP\bee-<uuid>.tmp`, decoded by a restore script |
//! | get | `Get-Content -Raw` streamed back, BOM stripped |
//! | execute | `& 'cmd' 'args'; exit $LASTEXITCODE` |

pub mod powershell;
pub mod soap;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::command::{PipedCommand, RemoteIo, RemoteProcess};
use super::transfer::{self, Progress, join_remote, remote_base_name, remote_parent, walk_local};
use super::{Client, Command, ExecOptions, FileStat, GetOptions, PutOptions};
use crate::error::{Error, Result};

/// Default WinRM HTTP port.
pub const DEFAULT_PORT: u16 = 5985;

/// Server-side wait of one Receive round.
const OPERATION_TIMEOUT_SECS: u64 = 60;

/// WinRM connection parameters.
#[derive(Clone)]
pub struct WinrmConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Connect timeout
    pub timeout: Duration,
}

impl WinrmConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            user: user.into(),
            password: password.into(),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}:{}/wsman", self.host, self.port)
    }
}

impl std::fmt::Debug for WinrmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WinrmConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ============================================================================
// WS-Management session
// ============================================================================

/// HTTP side of the protocol. Cheap to clone.
#[derive(Clone)]
struct Wsman {
    endpoint: String,
    user: String,
    password: String,
    http: reqwest::Client,
}

/// One finished command.
struct Finished {
    code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Wsman {
    async fn post(&self, envelope: String) -> Result<std::result::Result<String, soap::Fault>> {
        let response = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .header(reqwest::header::CONTENT_TYPE, "application/soap+xml;charset=UTF-8")
            .body(envelope)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Connect(format!("{}: unauthorized", self.endpoint)));
        }
        let body = response.text().await?;
        if status.is_success() {
            return Ok(Ok(body));
        }
        match soap::parse_fault(&body) {
            Some(fault) => Ok(Err(fault)),
            None => Err(Error::Request(format!("{}: HTTP {}", self.endpoint, status))),
        }
    }

    async fn call(&self, envelope: String) -> Result<String> {
        self.post(envelope)
            .await?
            .map_err(|fault| Error::Request(fault.reason))
    }

    async fn open_shell(&self) -> Result<String> {
        let reply = self
            .call(soap::create_shell(&self.endpoint, OPERATION_TIMEOUT_SECS))
            .await?;
        soap::parse_shell_id(&reply)
    }

    async fn close_shell(&self, shell: &str) {
        if let Err(e) = self
            .call(soap::delete_shell(&self.endpoint, OPERATION_TIMEOUT_SECS, shell))
            .await
        {
            debug!(shell, error = %e, "failed to delete remote shell");
        }
    }

    async fn start(&self, shell: &str, command: &str) -> Result<String> {
        let reply = self
            .call(soap::command(&self.endpoint, OPERATION_TIMEOUT_SECS, shell, command))
            .await?;
        soap::parse_command_id(&reply)
    }

    async fn send(&self, shell: &str, command: &str, data: &[u8], end: bool) -> Result<()> {
        self.call(soap::send(
            &self.endpoint,
            OPERATION_TIMEOUT_SECS,
            shell,
            command,
            data,
            end,
        ))
        .await
        .map(|_| ())
    }

    /// One Receive round; `None` when the server timed out without output.
    async fn receive(&self, shell: &str, command: &str) -> Result<Option<soap::Received>> {
        match self
            .post(soap::receive(&self.endpoint, OPERATION_TIMEOUT_SECS, shell, command))
            .await?
        {
            Ok(reply) => soap::parse_receive(&reply).map(Some),
            Err(fault) if fault.timed_out => Ok(None),
            Err(fault) => Err(Error::Request(fault.reason)),
        }
    }

    async fn terminate(&self, shell: &str, command: &str) {
        if let Err(e) = self
            .call(soap::terminate(&self.endpoint, OPERATION_TIMEOUT_SECS, shell, command))
            .await
        {
            debug!(shell, command, error = %e, "failed to terminate remote command");
        }
    }

    /// Run a command line in `shell` to completion.
    async fn run(&self, cancel: &CancellationToken, shell: &str, line: &str) -> Result<Finished> {
        let command = self.start(shell, line).await?;
        self.send(shell, &command, &[], true).await?;

        let mut finished = Finished {
            code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        loop {
            let round = tokio::select! {
                _ = cancel.cancelled() => {
                    self.terminate(shell, &command).await;
                    return Err(Error::Timeout);
                }
                round = self.receive(shell, &command) => round?,
            };
            let Some(received) = round else { continue };
            finished.stdout.extend(received.stdout);
            finished.stderr.extend(received.stderr);
            if received.done {
                finished.code = received.exit_code.unwrap_or(0);
                break;
            }
        }
        self.terminate(shell, &command).await;
        Ok(finished)
    }

    /// Run a PowerShell script; a non-zero exit is [`Error::Exit`].
    async fn powershell(&self, cancel: &CancellationToken, shell: &str, script: &str) -> Result<Vec<u8>> {
        let finished = self.run(cancel, shell, &powershell::encode(script)).await?;
        if finished.code != 0 {
            return Err(Error::Exit {
                code: finished.code,
                stderr: String::from_utf8_lossy(&finished.stderr).trim().to_string(),
            });
        }
        Ok(finished.stdout)
    }
}

// ============================================================================
// Client
// ============================================================================

/// WinRM client.
pub struct WinrmClient {
    wsman: Wsman,
}

impl WinrmClient {
    pub fn new(config: WinrmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .build()?;
        info!(endpoint = %config.endpoint(), user = %config.user, "WinRM client created");
        Ok(Self {
            wsman: Wsman {
                endpoint: config.endpoint(),
                user: config.user,
                password: config.password,
                http,
            },
        })
    }

    async fn stat_in(&self, cancel: &CancellationToken, shell: &str, path: &str) -> Result<FileStat> {
        let finished = self
            .wsman
            .run(cancel, shell, &powershell::encode(&powershell::stat(path)))
            .await?;
        match finished.code {
            0 => {}
            powershell::EXIT_NOT_EXISTS => return Err(Error::NotExists(path.to_string())),
            code => {
                return Err(Error::Exit {
                    code,
                    stderr: String::from_utf8_lossy(&finished.stderr).trim().to_string(),
                });
            }
        }
        let stats = powershell::parse_stats(&String::from_utf8_lossy(&finished.stdout))?;
        stats
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotExists(path.to_string()))
    }

    async fn download_file(
        &self,
        cancel: &CancellationToken,
        shell: &str,
        remote: &str,
        local: &Path,
        options: &GetOptions,
    ) -> Result<()> {
        let content = self
            .wsman
            .powershell(cancel, shell, &powershell::read(remote))
            .await?;
        let content = powershell::strip_bom(&content);

        if let Some(parent) = local.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(local).await?;
        let mut progress = Progress::new(
            options.trace.clone(),
            remote_base_name(remote),
            remote,
            &local.to_string_lossy(),
            content.len() as u64,
        );
        let mut reader = content;
        transfer::copy(cancel, &mut reader, &mut file, options.cache_size, &mut progress).await?;
        Ok(())
    }

    fn download_dir<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        shell: &'a str,
        remote: &'a str,
        local: &'a Path,
        options: &'a GetOptions,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(local).await?;
            let listing = self
                .wsman
                .powershell(cancel, shell, &powershell::list(remote))
                .await?;
            let entries = if listing.iter().all(u8::is_ascii_whitespace) {
                Vec::new()
            } else {
                powershell::parse_stats(&String::from_utf8_lossy(&listing))?
            };

            for entry in entries {
                let child_remote = join_remote(remote, &entry.name);
                let child_local = local.join(&entry.name);
                if entry.is_dir {
                    self.download_dir(cancel, shell, &child_remote, &child_local, options)
                        .await?;
                } else {
                    self.download_file(cancel, shell, &child_remote, &child_local, options)
                        .await?;
                }
            }
            Ok(())
        })
    }

    async fn upload_file(
        &self,
        cancel: &CancellationToken,
        shell: &str,
        local: &Path,
        remote: &str,
        size: u64,
        options: &PutOptions,
    ) -> Result<()> {
        let temp = powershell::temp_name();
        let result = self
            .upload_chunks(cancel, shell, local, remote, &temp, size, options)
            .await;

        // Runs whatever the outcome, on a fresh token so a cancelled upload
        // still removes its temporary file.
        if let Err(e) = self
            .wsman
            .powershell(&CancellationToken::new(), shell, &powershell::cleanup(&temp))
            .await
        {
            warn!(temp = %temp, error = %e, "failed to remove temporary upload file");
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_chunks(
        &self,
        cancel: &CancellationToken,
        shell: &str,
        local: &Path,
        remote: &str,
        temp: &str,
        size: u64,
        options: &PutOptions,
    ) -> Result<()> {
        let mut file = tokio::fs::File::open(local).await?;
        let mut buf = vec![0u8; powershell::chunk_size(temp)];
        let mut progress = Progress::new(
            options.trace.clone(),
            remote_base_name(remote),
            &local.to_string_lossy(),
            remote,
            size,
        );

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Timeout);
            }
            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }

            let finished = self
                .wsman
                .run(cancel, shell, &powershell::append_chunk(temp, &buf[..filled]))
                .await?;
            if finished.code != 0 {
                return Err(Error::InvalidWrite);
            }
            progress.advance(filled as u64);
        }

        self.wsman
            .powershell(cancel, shell, &powershell::restore(temp, remote, options.mkdir))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Client for WinrmClient {
    fn kind(&self) -> &'static str {
        "winrm"
    }

    async fn stat(&self, cancel: &CancellationToken, path: &str) -> Result<FileStat> {
        let shell = self.wsman.open_shell().await?;
        let result = self.stat_in(cancel, &shell, path).await;
        self.wsman.close_shell(&shell).await;
        result
    }

    #[instrument(skip(self, cancel, local, options), fields(endpoint = %self.wsman.endpoint))]
    async fn get(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        local: &Path,
        options: GetOptions,
    ) -> Result<()> {
        let shell = self.wsman.open_shell().await?;
        let result = async {
            let stat = self.stat_in(cancel, &shell, remote).await?;
            if stat.is_dir {
                if !options.dir {
                    return Err(Error::Request(format!("{} is a directory", remote)));
                }
                self.download_dir(cancel, &shell, remote, local, &options).await
            } else {
                self.download_file(cancel, &shell, remote, local, &options).await
            }
        }
        .await;
        self.wsman.close_shell(&shell).await;
        result
    }

    #[instrument(skip(self, cancel, local, options), fields(endpoint = %self.wsman.endpoint))]
    async fn put(
        &self,
        cancel: &CancellationToken,
        local: &Path,
        remote: &str,
        options: PutOptions,
    ) -> Result<()> {
        let entries = walk_local(local)?;
        if entries.first().is_some_and(|e| e.is_dir) && !options.dir {
            return Err(Error::Request(format!("{} is a directory", local.display())));
        }

        let shell = self.wsman.open_shell().await?;
        let result = async {
            if options.mkdir
                && let Some(parent) = remote_parent(remote)
            {
                self.wsman
                    .powershell(cancel, &shell, &powershell::mkdir(parent))
                    .await?;
            }
            for entry in &entries {
                let target = join_remote(remote, &entry.relative);
                if entry.is_dir {
                    self.wsman
                        .powershell(cancel, &shell, &powershell::mkdir(&target))
                        .await?;
                } else {
                    self.upload_file(cancel, &shell, &entry.path, &target, entry.size, &options)
                        .await?;
                }
            }
            Ok(())
        }
        .await;
        self.wsman.close_shell(&shell).await;
        result
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        shell: &str,
        options: ExecOptions,
    ) -> Result<Box<dyn Command>> {
        let script = powershell::exec(shell, &options);
        debug!(endpoint = %self.wsman.endpoint, script = %script, "preparing WinRM command");
        let process = WinrmProcess {
            wsman: self.wsman.clone(),
            line: powershell::encode(&script),
        };
        Ok(Box::new(PipedCommand::new(shell, Box::new(process), cancel)))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Remote process
// ============================================================================

struct WinrmProcess {
    wsman: Wsman,
    line: String,
}

impl WinrmProcess {
    async fn pump(&self, shell: &str, io: &mut RemoteIo, cancel: &CancellationToken) -> Result<i32> {
        let command = self.wsman.start(shell, &self.line).await?;

        let stdin_task = {
            let wsman = self.wsman.clone();
            let shell = shell.to_string();
            let command = command.clone();
            let stdin = io.stdin.take();
            tokio::spawn(async move {
                let Some(mut stdin) = stdin else {
                    return wsman.send(&shell, &command, &[], true).await;
                };
                let mut buf = vec![0u8; 16 * 1024];
                loop {
                    let n = stdin.read(&mut buf).await?;
                    if n == 0 {
                        return wsman.send(&shell, &command, &[], true).await;
                    }
                    wsman.send(&shell, &command, &buf[..n], false).await?;
                }
            })
        };

        let outcome = loop {
            let round = tokio::select! {
                _ = cancel.cancelled() => break Err(Error::Timeout),
                round = self.wsman.receive(shell, &command) => round,
            };
            let received = match round {
                Ok(Some(received)) => received,
                Ok(None) => continue,
                Err(e) => break Err(e),
            };
            if let Err(e) = io.stdout.write_all(&received.stdout).await {
                break Err(e.into());
            }
            if let Err(e) = io.stderr.write_all(&received.stderr).await {
                break Err(e.into());
            }
            if received.done {
                break Ok(received.exit_code.unwrap_or(0));
            }
        };

        stdin_task.abort();
        self.wsman.terminate(shell, &command).await;
        io.stdout.flush().await?;
        io.stderr.flush().await?;
        outcome
    }
}

#[async_trait]
impl RemoteProcess for WinrmProcess {
    async fn run(self: Box<Self>, mut io: RemoteIo, cancel: CancellationToken) -> Result<i32> {
        let shell = self.wsman.open_shell().await?;
        let outcome = self.pump(&shell, &mut io, &cancel).await;
        self.wsman.close_shell(&shell).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint() {
        let mut config = WinrmConfig::new("win1", "Administrator", "pw");
        config.port = 5986;
        assert_eq!(config.endpoint(), "http://win1:5986/wsman");
        assert!(!format!("{:?}", config).contains("pw\""));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connect_error() {
        let mut config = WinrmConfig::new("127.0.0.1", "Administrator", "pw");
        config.port = 1;
        config.timeout = Duration::from_millis(500);
        let client = WinrmClient::new(config).unwrap();

        let err = client
            .stat(&CancellationToken::new(), r"C:\bee")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connect(_)), "unexpected {:?}", err);
    }
}
