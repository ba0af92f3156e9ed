// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The `bee-agent` gRPC service.
//!
//! Serves the host's filesystem and processes to a controller:
//!
//! ```text
//!  controller (GrpcClient)              bee-agent (AgentService)
//!  Stat ────────────────────────────▶  tokio::fs::metadata
//!  Get  ◀── stat, chunk, chunk, ... ──  walk + read
//!  Put  ── stat, chunk, chunk, ... ──▶  create + write + chmod
//!  Execute ◀═══ ping/data/exit ═══▶    tokio::process::Command
//! ```
//!
//! Relative paths resolve against the agent root.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use bee_protocol::rpc::bee_server::{Bee, BeeServer};
use bee_protocol::rpc::{
    Chunk, ExecuteKind, ExecuteRequest, ExecuteResponse, GetRequest, GetResponse, PingRequest,
    PingResponse, PutRequest, PutResponse, StatRequest, StatResponse,
};
use bee_protocol::{DEFAULT_CHUNK_SIZE, DEFAULT_PORT, EXECUTE_HEARTBEAT};
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, instrument, warn};

use crate::client::grpc::to_wire;
use crate::client::transfer::{self, walk_local};
use crate::error::Error;

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

// ============================================================================
// Configuration
// ============================================================================

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Listen address
    pub addr: SocketAddr,
    /// Root for relative paths and default working directory
    pub root: PathBuf,
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `BEE_AGENT_ADDR`: listen address (default: `0.0.0.0:15450`)
    /// - `BEE_AGENT_ROOT`: working root (default: current directory)
    pub fn from_env() -> Result<Self, crate::config::ConfigError> {
        let addr = match std::env::var("BEE_AGENT_ADDR") {
            Ok(value) => value.parse().map_err(|_| {
                crate::config::ConfigError::Invalid("BEE_AGENT_ADDR", "must be a socket address")
            })?,
            Err(_) => SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
        };

        let root = std::env::var("BEE_AGENT_ROOT")
            .map(PathBuf::from)
            .or_else(|_| std::env::current_dir())
            .unwrap_or_else(|_| PathBuf::from("."));

        Ok(Self { addr, root })
    }
}

// ============================================================================
// Service
// ============================================================================

/// Filesystem and process service of one host.
#[derive(Debug, Clone)]
pub struct AgentService {
    root: PathBuf,
}

impl AgentService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), tonic::transport::Error> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, root = %self.root.display(), "bee-agent listening");
        }
        let incoming = async_stream::stream! {
            loop {
                yield listener.accept().await.map(|(stream, _)| stream);
            }
        };
        tonic::transport::Server::builder()
            .add_service(BeeServer::new(self))
            .serve_with_incoming_shutdown(incoming, shutdown)
            .await
    }

    fn resolve(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

fn status(error: std::io::Error, path: &Path) -> Status {
    match error.kind() {
        std::io::ErrorKind::NotFound => Status::not_found(path.display().to_string()),
        _ => Error::from(error).to_status(),
    }
}

fn chunk(data: &[u8]) -> Chunk {
    Chunk {
        data: data.to_vec(),
        length: data.len() as i64,
    }
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[tonic::async_trait]
impl Bee for AgentService {
    type GetStream = ResponseStream<GetResponse>;
    type ExecuteStream = ResponseStream<ExecuteResponse>;

    async fn ping(&self, _request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        Ok(Response::new(PingResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }

    async fn stat(&self, request: Request<StatRequest>) -> Result<Response<StatResponse>, Status> {
        let path = self.resolve(&request.into_inner().name);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| status(e, &path))?;
        Ok(Response::new(StatResponse {
            stat: Some(to_wire(&base_name(&path), &metadata)),
        }))
    }

    #[instrument(skip(self, request))]
    async fn get(&self, request: Request<GetRequest>) -> Result<Response<Self::GetStream>, Status> {
        let request = request.into_inner();
        let root = self.resolve(&request.name);
        let chunk_size = match request.cache_size {
            n if n > 0 => n as usize,
            _ => DEFAULT_CHUNK_SIZE,
        };

        let entries = {
            let root = root.clone();
            tokio::task::spawn_blocking(move || walk_local(&root))
                .await
                .map_err(|e| Status::internal(e.to_string()))?
        };
        let entries = match entries {
            Ok(entries) => entries,
            Err(Error::Io(e)) => return Err(status(e, &root)),
            Err(e) => return Err(e.to_status()),
        };
        debug!(path = %root.display(), entries = entries.len(), "streaming download");

        let stream = async_stream::try_stream! {
            for entry in entries {
                let metadata = tokio::fs::metadata(&entry.path).await?;
                yield GetResponse {
                    stat: Some(to_wire(&entry.relative, &metadata)),
                    chunk: None,
                };
                if entry.is_dir {
                    continue;
                }

                let mut file = tokio::fs::File::open(&entry.path).await?;
                let mut buf = vec![0u8; chunk_size];
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    yield GetResponse {
                        stat: None,
                        chunk: Some(chunk(&buf[..n])),
                    };
                }
            }
        };
        let stream = futures::StreamExt::map(stream, |item: Result<GetResponse, std::io::Error>| {
            item.map_err(|e| Error::from(e).to_status())
        });
        Ok(Response::new(Box::pin(stream)))
    }

    #[instrument(skip(self, request))]
    async fn put(
        &self,
        request: Request<Streaming<PutRequest>>,
    ) -> Result<Response<PutResponse>, Status> {
        let mut inbound = request.into_inner();
        let header = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("missing put header"))?;
        let stat = header
            .stat
            .ok_or_else(|| Status::invalid_argument("put header without stat"))?;
        let path = self.resolve(&header.name);

        if stat.is_dir {
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| status(e, &path))?;
            transfer::set_local_mode(&path, stat.perm).map_err(|e| e.to_status())?;
            return Ok(Response::new(PutResponse {}));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| status(e, parent))?;
        }
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| status(e, &path))?;

        let mut written = 0u64;
        while let Some(message) = inbound.message().await? {
            if let Some(chunk) = message.chunk {
                file.write_all(&chunk.data)
                    .await
                    .map_err(|e| status(e, &path))?;
                written += chunk.data.len() as u64;
            }
        }
        file.flush().await.map_err(|e| status(e, &path))?;
        transfer::set_local_mode(&path, stat.perm).map_err(|e| e.to_status())?;

        debug!(path = %path.display(), written, "upload stored");
        Ok(Response::new(PutResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn execute(
        &self,
        request: Request<Streaming<ExecuteRequest>>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        let mut inbound = request.into_inner();
        let header = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("missing execute header"))?;

        let dir = if header.root.is_empty() {
            self.root.clone()
        } else {
            self.resolve(&header.root)
        };

        let mut child = tokio::process::Command::new(&header.name)
            .args(&header.args)
            .envs(&header.env)
            .current_dir(&dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| status(e, Path::new(&header.name)))?;
        info!(command = %header.name, pid = ?child.id(), "process started");

        let (tx, rx) = mpsc::channel::<Result<ExecuteResponse, Status>>(32);
        let stdin = child.stdin.take();
        tokio::spawn(supervise(child, stdin, inbound, tx));

        let stream = async_stream::stream! {
            let mut rx = rx;
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        Ok(Response::new(Box::pin(stream)))
    }
}

fn data_frame(data: &[u8], stderr: bool) -> ExecuteResponse {
    let mut frame = ExecuteResponse {
        kind: ExecuteKind::Data as i32,
        ..Default::default()
    };
    if stderr {
        frame.stderr = data.to_vec();
    } else {
        frame.stdout = data.to_vec();
    }
    frame
}

async fn forward<R>(mut reader: R, tx: mpsc::Sender<Result<ExecuteResponse, Status>>, stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(Ok(data_frame(&buf[..n], stderr))).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Pump one process until it exits or the controller goes away.
async fn supervise(
    mut child: Child,
    stdin: Option<ChildStdin>,
    mut inbound: Streaming<ExecuteRequest>,
    tx: mpsc::Sender<Result<ExecuteResponse, Status>>,
) {
    let stdin_task = tokio::spawn(async move {
        let Some(mut stdin) = stdin else { return };
        while let Ok(Some(request)) = inbound.message().await {
            if request.data.is_empty() {
                continue;
            }
            if stdin.write_all(&request.data).await.is_err() {
                break;
            }
        }
    });

    let stdout = child.stdout.take().map(|out| tokio::spawn(forward(out, tx.clone(), false)));
    let stderr = child.stderr.take().map(|err| tokio::spawn(forward(err, tx.clone(), true)));

    let heartbeat = {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EXECUTE_HEARTBEAT);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let ping = ExecuteResponse {
                    kind: ExecuteKind::Ping as i32,
                    ..Default::default()
                };
                if tx.send(Ok(ping)).await.is_err() {
                    break;
                }
            }
        })
    };

    let exit = tokio::select! {
        _ = tx.closed() => {
            warn!("controller went away, killing process");
            let _ = child.kill().await;
            None
        }
        exit = child.wait() => Some(exit),
    };

    if let Some(exit) = exit {
        for task in [stdout, stderr].into_iter().flatten() {
            let _ = task.await;
        }
        let frame = match exit {
            Ok(exit) => {
                debug!(code = ?exit.code(), "process exited");
                Ok(ExecuteResponse {
                    kind: ExecuteKind::Exit as i32,
                    exit_code: exit.code().unwrap_or(-1),
                    ..Default::default()
                })
            }
            Err(e) => Err(Error::from(e).to_status()),
        };
        let _ = tx.send(frame).await;
    }

    heartbeat.abort();
    stdin_task.abort();
}
