// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gRPC transport, talking to a `bee-agent` on the host.

use std::path::Path;

use async_trait::async_trait;
use bee_protocol::rpc::bee_client::BeeClient;
use bee_protocol::rpc::{
    Chunk, ExecuteKind, ExecuteRequest, FileStat as WireStat, GetRequest, PingRequest, PutRequest,
    StatRequest,
};
use bee_protocol::{DialConfig, dial};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, info, instrument};

use super::command::{PipedCommand, RemoteIo, RemoteProcess};
use super::transfer::{self, LocalEntry, Progress, join_remote, remote_parent, walk_local};
use super::{Client, Command, ExecOptions, FileStat, GetOptions, PutOptions};
use crate::error::{Error, Result};

// ============================================================================
// Wire conversions
// ============================================================================

/// Decode a wire stat.
pub fn from_wire(stat: &WireStat) -> FileStat {
    FileStat {
        name: stat.name.clone(),
        is_dir: stat.is_dir,
        mode: stat.perm,
        size: stat.size.max(0) as u64,
        mod_time: DateTime::<Utc>::from_timestamp(stat.mod_time, 0).unwrap_or_default(),
    }
}

/// Encode local metadata for the wire.
pub fn to_wire(name: &str, metadata: &std::fs::Metadata) -> WireStat {
    let mod_time = metadata
        .modified()
        .ok()
        .map(|t| DateTime::<Utc>::from(t).timestamp())
        .unwrap_or(0);
    WireStat {
        name: name.to_string(),
        is_dir: metadata.is_dir(),
        perm: transfer::local_mode(metadata),
        size: if metadata.is_dir() { 0 } else { metadata.len() as i64 },
        mod_time,
    }
}

fn chunk(data: &[u8]) -> Chunk {
    Chunk {
        data: data.to_vec(),
        length: data.len() as i64,
    }
}

// ============================================================================
// Client
// ============================================================================

/// Client of a `bee-agent`.
pub struct GrpcClient {
    addr: String,
    client: BeeClient<Channel>,
}

impl GrpcClient {
    /// Dial an agent with the default keepalive settings.
    #[instrument]
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = dial(&DialConfig::new(addr)).await?;
        info!(addr, "connected to bee-agent");
        Ok(Self {
            addr: addr.to_string(),
            client,
        })
    }

    /// Version reported by the agent.
    pub async fn ping(&self) -> Result<String> {
        let response = self.client.clone().ping(PingRequest {}).await?;
        Ok(response.into_inner().version)
    }

    async fn put_entry(
        &self,
        cancel: &CancellationToken,
        entry: &LocalEntry,
        target: &str,
        options: &PutOptions,
    ) -> Result<()> {
        let metadata = std::fs::metadata(&entry.path)?;
        let (tx, mut rx) = mpsc::channel::<PutRequest>(8);
        let requests = async_stream::stream! {
            while let Some(request) = rx.recv().await {
                yield request;
            }
        };

        let header = PutRequest {
            name: target.to_string(),
            stat: Some(to_wire(target, &metadata)),
            chunk: None,
        };

        let feed = async move {
            tx.send(header)
                .await
                .map_err(|_| Error::Request("put stream closed".to_string()))?;
            if entry.is_dir {
                return Ok(());
            }

            let mut file = tokio::fs::File::open(&entry.path).await?;
            let mut buf = vec![0u8; options.cache_size.max(1)];
            let mut progress = Progress::new(
                options.trace.clone(),
                transfer::remote_base_name(target),
                &entry.path.to_string_lossy(),
                target,
                entry.size,
            );
            loop {
                if cancel.is_cancelled() {
                    return Err(Error::Timeout);
                }
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                tx.send(PutRequest {
                    chunk: Some(chunk(&buf[..n])),
                    ..Default::default()
                })
                .await
                .map_err(|_| Error::Request("put stream closed".to_string()))?;
                progress.advance(n as u64);
            }
        };

        let mut client = self.client.clone();
        let (fed, response) = tokio::join!(feed, client.put(requests));
        response?;
        fed
    }
}

#[async_trait]
impl Client for GrpcClient {
    fn kind(&self) -> &'static str {
        "grpc"
    }

    async fn stat(&self, cancel: &CancellationToken, path: &str) -> Result<FileStat> {
        let mut client = self.client.clone();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Timeout),
            response = client.stat(StatRequest { name: path.to_string() }) => response?,
        };
        response
            .into_inner()
            .stat
            .as_ref()
            .map(from_wire)
            .ok_or_else(|| Error::NotExists(path.to_string()))
    }

    #[instrument(skip(self, cancel, local, options), fields(addr = %self.addr))]
    async fn get(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        local: &Path,
        options: GetOptions,
    ) -> Result<()> {
        let mut client = self.client.clone();
        let mut stream = client
            .get(GetRequest {
                name: remote.to_string(),
                cache_size: options.cache_size as i64,
            })
            .await?
            .into_inner();

        let mut current: Option<(tokio::fs::File, Progress)> = None;
        let mut first = true;
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Timeout),
                message = stream.message() => message?,
            };
            let Some(message) = message else { break };

            if let Some(stat) = message.stat {
                if let Some((mut file, _)) = current.take() {
                    file.flush().await?;
                }
                if first && stat.is_dir && !options.dir {
                    return Err(Error::Request(format!("{} is a directory", remote)));
                }
                first = false;

                let path = if stat.name.is_empty() {
                    local.to_path_buf()
                } else {
                    local.join(&stat.name)
                };
                if stat.is_dir {
                    tokio::fs::create_dir_all(&path).await?;
                } else {
                    if let Some(parent) = path.parent()
                        && !parent.as_os_str().is_empty()
                    {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    let file = tokio::fs::File::create(&path).await?;
                    transfer::set_local_mode(&path, stat.perm)?;
                    let progress = Progress::new(
                        options.trace.clone(),
                        &stat.name,
                        &join_remote(remote, &stat.name),
                        &path.to_string_lossy(),
                        stat.size.max(0) as u64,
                    );
                    current = Some((file, progress));
                }
            }

            if let Some(chunk) = message.chunk {
                let (file, progress) = current
                    .as_mut()
                    .ok_or_else(|| Error::Request("chunk without an open file".to_string()))?;
                file.write_all(&chunk.data).await?;
                progress.advance(chunk.data.len() as u64);
            }
        }

        if let Some((mut file, _)) = current.take() {
            file.flush().await?;
        }
        Ok(())
    }

    #[instrument(skip(self, cancel, local, options), fields(addr = %self.addr))]
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
        if !options.mkdir
            && let Some(parent) = remote_parent(remote)
        {
            self.stat(cancel, parent).await?;
        }

        for entry in &entries {
            let target = join_remote(remote, &entry.relative);
            debug!(target = %target, is_dir = entry.is_dir, "uploading entry");
            self.put_entry(cancel, entry, &target, &options).await?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        shell: &str,
        options: ExecOptions,
    ) -> Result<Box<dyn Command>> {
        let header = ExecuteRequest {
            name: shell.to_string(),
            args: options.args,
            env: options.env.into_iter().collect(),
            root: options.root.unwrap_or_default(),
            data: Vec::new(),
        };
        let process = GrpcProcess {
            client: self.client.clone(),
            header,
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

struct GrpcProcess {
    client: BeeClient<Channel>,
    header: ExecuteRequest,
}

#[async_trait]
impl RemoteProcess for GrpcProcess {
    async fn run(self: Box<Self>, mut io: RemoteIo, cancel: CancellationToken) -> Result<i32> {
        let GrpcProcess { mut client, header } = *self;
        let (tx, mut rx) = mpsc::channel::<ExecuteRequest>(16);
        let requests = async_stream::stream! {
            while let Some(request) = rx.recv().await {
                yield request;
            }
        };

        // Dropping the sender ends the request stream, which the agent reads
        // as EOF on stdin.
        let stdin = io.stdin.take();
        let feeder = tokio::spawn(async move {
            if tx.send(header).await.is_err() {
                return;
            }
            let Some(mut stdin) = stdin else { return };
            let mut buf = vec![0u8; 32 * 1024];
            while let Ok(n) = stdin.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                let request = ExecuteRequest {
                    data: buf[..n].to_vec(),
                    ..Default::default()
                };
                if tx.send(request).await.is_err() {
                    break;
                }
            }
        });

        let mut responses = client.execute(requests).await?.into_inner();
        let outcome = loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break Err(Error::Timeout),
                message = responses.message() => message,
            };
            let response = match message {
                Ok(Some(response)) => response,
                Ok(None) => {
                    break Err(Error::Request(
                        "execute stream closed without exit status".to_string(),
                    ));
                }
                Err(status) => break Err(status.into()),
            };
            match response.kind() {
                ExecuteKind::Ping => debug!("agent heartbeat"),
                ExecuteKind::Data => {
                    io.stdout.write_all(&response.stdout).await?;
                    io.stderr.write_all(&response.stderr).await?;
                }
                ExecuteKind::Exit => break Ok(response.exit_code),
            }
        };

        feeder.abort();
        io.stdout.flush().await?;
        io.stderr.flush().await?;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_stat_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, "hello").unwrap();

        let wire = to_wire("/remote/f", &std::fs::metadata(&path).unwrap());
        assert_eq!(wire.size, 5);
        assert!(!wire.is_dir);

        let stat = from_wire(&wire);
        assert_eq!(stat.name, "/remote/f");
        assert_eq!(stat.size, 5);
        assert_eq!(stat.mod_time.timestamp(), wire.mod_time);
    }

    #[test]
    fn test_negative_size_is_clamped() {
        let stat = from_wire(&WireStat {
            size: -1,
            ..Default::default()
        });
        assert_eq!(stat.size, 0);
    }
}
