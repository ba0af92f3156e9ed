// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SSH transport.
//!
//! Commands run over an SSH channel, files move over SFTP. Uses the native
//! `ssh2` library; every operation runs on a blocking thread and holds the
//! session for its whole duration, so operations on one host are serialised.
//!
//! Authentication tries the password first, then the private key (with its
//! optional passphrase). Host keys are not verified.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ssh2::Session;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::command::{PipedCommand, RemoteIo, RemoteProcess};
use super::transfer::{
    self, Progress, copy_blocking, join_remote, remote_base_name, remote_parent, walk_local,
};
use super::{Client, Command, ExecOptions, FileStat, GetOptions, PutOptions};
use crate::error::{Error, Result};
use crate::shell::{join_posix, quote_posix};

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// libssh2 "would block".
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

// ============================================================================
// Configuration
// ============================================================================

/// SSH connection parameters.
#[derive(Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    pub passphrase: Option<String>,
    /// Connect and handshake timeout
    pub timeout: Duration,
}

impl SshConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            user: user.into(),
            password: None,
            private_key: None,
            passphrase: None,
            timeout: Duration::from_secs(15),
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn open_session(config: &SshConfig) -> Result<Session> {
    let address = config.address();
    let socket = address
        .to_socket_addrs()
        .map_err(|e| Error::Connect(format!("{}: {}", address, e)))?
        .next()
        .ok_or_else(|| Error::Connect(format!("{}: no address", address)))?;

    let tcp = TcpStream::connect_timeout(&socket, config.timeout)
        .map_err(|e| Error::Connect(format!("{}: {}", address, e)))?;

    let mut session =
        Session::new().map_err(|e| Error::Connect(format!("failed to create SSH session: {}", e)))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(config.timeout.as_millis() as u32);
    session
        .handshake()
        .map_err(|e| Error::Connect(format!("SSH handshake with {} failed: {}", address, e)))?;

    if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty())
        && let Err(e) = session.userauth_password(&config.user, password)
    {
        debug!(host = %address, error = %e, "password authentication failed");
    }

    if !session.authenticated()
        && let Some(key) = config.private_key.as_deref().filter(|k| k.is_file())
        && let Err(e) =
            session.userauth_pubkey_file(&config.user, None, key, config.passphrase.as_deref())
    {
        debug!(host = %address, error = %e, "private key authentication failed");
    }

    if !session.authenticated() {
        return Err(Error::Connect(format!(
            "SSH authentication failed for {}@{}",
            config.user, address
        )));
    }

    // The timeout only guards connection setup; commands may run for long.
    session.set_timeout(0);
    Ok(session)
}

// ============================================================================
// Client
// ============================================================================

/// SSH + SFTP client.
pub struct SshClient {
    address: String,
    session: Arc<Mutex<Session>>,
}

impl SshClient {
    /// Connect and authenticate.
    #[instrument(skip(config), fields(host = %config.host, port = config.port))]
    pub async fn connect(config: SshConfig) -> Result<Self> {
        let address = config.address();
        let session = tokio::task::spawn_blocking(move || open_session(&config))
            .await
            .map_err(|e| Error::Connect(e.to_string()))??;

        info!(host = %address, "SSH session established");
        Ok(Self {
            address,
            session: Arc::new(Mutex::new(session)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Session) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || {
            let session = session
                .lock()
                .map_err(|_| Error::Request("SSH session lock poisoned".to_string()))?;
            f(&session)
        })
        .await
        .map_err(|e| Error::Request(e.to_string()))?
    }
}

fn file_stat(path: &str, stat: &ssh2::FileStat) -> FileStat {
    FileStat {
        name: remote_base_name(path).to_string(),
        is_dir: stat.is_dir(),
        mode: stat.perm.unwrap_or(0) & 0o7777,
        size: stat.size.unwrap_or(0),
        mod_time: stat
            .mtime
            .and_then(|t| DateTime::<Utc>::from_timestamp(t as i64, 0))
            .unwrap_or_default(),
    }
}

fn mkdir_all(sftp: &ssh2::Sftp, path: &str) -> Result<()> {
    let mut current = String::new();
    if path.starts_with('/') {
        current.push('/');
    }
    for part in path.split('/').filter(|p| !p.is_empty()) {
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(part);
        if sftp.stat(Path::new(&current)).is_err() {
            sftp.mkdir(Path::new(&current), 0o755)?;
        }
    }
    Ok(())
}

fn download_file(
    sftp: &ssh2::Sftp,
    cancel: &CancellationToken,
    remote: &str,
    local: &Path,
    stat: &ssh2::FileStat,
    options: &GetOptions,
) -> Result<()> {
    if let Some(parent) = local.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut source = sftp.open(Path::new(remote))?;
    let mut target = std::fs::File::create(local)?;
    let mut progress = Progress::new(
        options.trace.clone(),
        remote_base_name(remote),
        remote,
        &local.to_string_lossy(),
        stat.size.unwrap_or(0),
    );
    copy_blocking(cancel, &mut source, &mut target, options.cache_size, &mut progress)?;
    transfer::set_local_mode(local, stat.perm.unwrap_or(0) & 0o7777)
}

fn download_dir(
    sftp: &ssh2::Sftp,
    cancel: &CancellationToken,
    remote: &str,
    local: &Path,
    options: &GetOptions,
) -> Result<()> {
    std::fs::create_dir_all(local)?;

    let mut entries = sftp.readdir(Path::new(remote))?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    for (path, stat) in entries {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if name == "." || name == ".." {
            continue;
        }
        let child_remote = join_remote(remote, &name);
        let child_local = local.join(&name);
        if stat.is_dir() {
            download_dir(sftp, cancel, &child_remote, &child_local, options)?;
        } else {
            download_file(sftp, cancel, &child_remote, &child_local, &stat, options)?;
        }
    }
    Ok(())
}

fn upload_file(
    sftp: &ssh2::Sftp,
    cancel: &CancellationToken,
    local: &Path,
    remote: &str,
    mode: u32,
    size: u64,
    options: &PutOptions,
) -> Result<()> {
    let mut source = std::fs::File::open(local)?;
    let mut target = sftp.create(Path::new(remote))?;
    let mut progress = Progress::new(
        options.trace.clone(),
        remote_base_name(remote),
        &local.to_string_lossy(),
        remote,
        size,
    );
    copy_blocking(cancel, &mut source, &mut target, options.cache_size, &mut progress)?;
    drop(target);

    sftp.setstat(
        Path::new(remote),
        ssh2::FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(mode),
            atime: None,
            mtime: None,
        },
    )?;
    Ok(())
}

#[async_trait]
impl Client for SshClient {
    fn kind(&self) -> &'static str {
        "ssh"
    }

    async fn stat(&self, _cancel: &CancellationToken, path: &str) -> Result<FileStat> {
        let path = path.to_string();
        self.blocking(move |session| {
            let sftp = session.sftp()?;
            let stat = sftp.stat(Path::new(&path))?;
            Ok(file_stat(&path, &stat))
        })
        .await
    }

    #[instrument(skip(self, cancel, local, options), fields(host = %self.address))]
    async fn get(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        local: &Path,
        options: GetOptions,
    ) -> Result<()> {
        let cancel = cancel.clone();
        let remote = remote.to_string();
        let local = local.to_path_buf();
        self.blocking(move |session| {
            let sftp = session.sftp()?;
            let stat = sftp.stat(Path::new(&remote))?;
            if stat.is_dir() {
                if !options.dir {
                    return Err(Error::Request(format!("{} is a directory", remote)));
                }
                download_dir(&sftp, &cancel, &remote, &local, &options)
            } else {
                download_file(&sftp, &cancel, &remote, &local, &stat, &options)
            }
        })
        .await
    }

    #[instrument(skip(self, cancel, local, options), fields(host = %self.address))]
    async fn put(
        &self,
        cancel: &CancellationToken,
        local: &Path,
        remote: &str,
        options: PutOptions,
    ) -> Result<()> {
        let cancel = cancel.clone();
        let remote = remote.to_string();
        let local = local.to_path_buf();
        self.blocking(move |session| {
            let entries = walk_local(&local)?;
            if entries.first().is_some_and(|e| e.is_dir) && !options.dir {
                return Err(Error::Request(format!("{} is a directory", local.display())));
            }

            let sftp = session.sftp()?;
            if options.mkdir
                && let Some(parent) = remote_parent(&remote)
            {
                mkdir_all(&sftp, parent)?;
            }

            for entry in entries {
                let target = join_remote(&remote, &entry.relative);
                if entry.is_dir {
                    mkdir_all(&sftp, &target)?;
                } else {
                    upload_file(&sftp, &cancel, &entry.path, &target, entry.mode, entry.size, &options)?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        shell: &str,
        options: ExecOptions,
    ) -> Result<Box<dyn Command>> {
        let line = command_line(shell, &options);
        debug!(host = %self.address, command = %line, "preparing SSH command");
        let process = SshProcess {
            session: self.session.clone(),
            line: line.clone(),
        };
        Ok(Box::new(PipedCommand::new(line, Box::new(process), cancel)))
    }

    async fn close(&self) -> Result<()> {
        let address = self.address.clone();
        self.blocking(move |session| {
            if let Err(e) = session.disconnect(None, "closing", None) {
                warn!(host = %address, error = %e, "SSH disconnect failed");
            }
            Ok(())
        })
        .await
    }
}

/// POSIX command line for a shell, its arguments, environment and root.
pub fn command_line(shell: &str, options: &ExecOptions) -> String {
    let mut line = String::new();
    if let Some(root) = &options.root {
        line.push_str(&format!("cd {} && ", quote_posix(root)));
    }
    for (key, value) in &options.env {
        line.push_str(&format!("{}={} ", key, quote_posix(value)));
    }
    let mut words = Vec::with_capacity(options.args.len() + 1);
    words.push(shell);
    words.extend(options.args.iter().map(String::as_str));
    line.push_str(&join_posix(&words));
    line
}

// ============================================================================
// Remote process
// ============================================================================

enum Chunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

struct SshProcess {
    session: Arc<Mutex<Session>>,
    line: String,
}

fn is_eagain(error: &ssh2::Error) -> bool {
    matches!(error.code(), ssh2::ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

fn read_nonblocking(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    match reader.read(buf) {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Drive one channel on a blocking thread until the remote side exits.
fn pump(
    session: &Session,
    line: &str,
    mut stdin: mpsc::Receiver<Vec<u8>>,
    output: mpsc::Sender<Chunk>,
    cancel: &CancellationToken,
) -> Result<i32> {
    let mut channel = session.channel_session()?;
    channel.exec(line)?;
    session.set_blocking(false);

    let mut buf = vec![0u8; 32 * 1024];
    let mut pending: Vec<u8> = Vec::new();
    let mut stdin_open = true;
    let mut eof_sent = false;

    let outcome = loop {
        if cancel.is_cancelled() {
            let _ = channel.close();
            break Err(Error::Timeout);
        }
        let mut idle = true;

        let n = match read_nonblocking(&mut channel, &mut buf) {
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if n > 0 {
            idle = false;
            let _ = output.blocking_send(Chunk::Stdout(buf[..n].to_vec()));
        }
        let n = match read_nonblocking(&mut channel.stderr(), &mut buf) {
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if n > 0 {
            idle = false;
            let _ = output.blocking_send(Chunk::Stderr(buf[..n].to_vec()));
        }

        if pending.is_empty() && stdin_open {
            match stdin.try_recv() {
                Ok(data) => pending = data,
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => stdin_open = false,
            }
        }
        if !pending.is_empty() {
            match channel.write(&pending) {
                Ok(written) => {
                    pending.drain(..written);
                    idle = false;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => break Err(e.into()),
            }
        }
        if !stdin_open && pending.is_empty() && !eof_sent {
            match channel.send_eof() {
                Ok(()) => eof_sent = true,
                Err(e) if is_eagain(&e) => {}
                Err(e) => break Err(e.into()),
            }
        }

        if channel.eof() && idle {
            break Ok(());
        }
        if idle {
            std::thread::sleep(Duration::from_millis(10));
        }
    };

    session.set_blocking(true);
    outcome?;
    channel.wait_close()?;
    Ok(channel.exit_status()?)
}

#[async_trait]
impl RemoteProcess for SshProcess {
    async fn run(self: Box<Self>, mut io: RemoteIo, cancel: CancellationToken) -> Result<i32> {
        let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(16);
        let (output_tx, mut output_rx) = mpsc::channel::<Chunk>(64);

        let stdin = io.stdin.take();
        let stdin_task = tokio::spawn(async move {
            let Some(mut stdin) = stdin else {
                return;
            };
            let mut buf = vec![0u8; 32 * 1024];
            while let Ok(n) = stdin.read(&mut buf).await {
                if n == 0 || stdin_tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        });

        let session = self.session.clone();
        let line = self.line.clone();
        let pump_cancel = cancel.clone();
        let pump_task = tokio::task::spawn_blocking(move || {
            let session = session
                .lock()
                .map_err(|_| Error::Request("SSH session lock poisoned".to_string()))?;
            pump(&session, &line, stdin_rx, output_tx, &pump_cancel)
        });

        while let Some(chunk) = output_rx.recv().await {
            match chunk {
                Chunk::Stdout(data) => io.stdout.write_all(&data).await?,
                Chunk::Stderr(data) => io.stderr.write_all(&data).await?,
            }
        }
        io.stdout.flush().await?;
        io.stderr.flush().await?;

        stdin_task.abort();
        pump_task
            .await
            .map_err(|e| Error::Request(e.to_string()))?
    }
}
