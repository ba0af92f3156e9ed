// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pipe plumbing shared by every transport.
//!
//! A transport only has to implement [`RemoteProcess`]: run the remote
//! command, feed it from `stdin` and write what it prints to `stdout` and
//! `stderr`. [`PipedCommand`] turns that into a [`Command`]:
//!
//! ```text
//!  caller                PipedCommand                 RemoteProcess
//!  stdin_pipe()  ──▶ duplex ────────────────────▶ io.stdin
//!  stdout_pipe() ◀── duplex ◀──────────────────── io.stdout
//!  (unclaimed)       Capture buffer ◀──────────── io.stdout / io.stderr
//! ```
//!
//! Outputs nobody claimed land in one mutex-protected capture that backs
//! [`Command::combined_output`] and [`Command::output`].

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Command, OutputPipe, StdinPipe};
use crate::error::{Error, Result};

/// Buffer size of each pipe.
const PIPE_BUFFER: usize = 64 * 1024;

/// Remote end of a command's standard streams.
pub struct RemoteIo {
    /// `None` when the caller never claimed stdin; the remote side sees EOF.
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

/// A transport's way of running one command.
#[async_trait]
pub trait RemoteProcess: Send + 'static {
    /// Run to completion and return the exit code.
    ///
    /// Must stop and release the remote side when `cancel` trips.
    async fn run(self: Box<Self>, io: RemoteIo, cancel: CancellationToken) -> Result<i32>;
}

/// Captured standard streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Default)]
struct Capture {
    combined: Vec<u8>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

struct CaptureWriter {
    capture: Arc<Mutex<Capture>>,
    stream: Stream,
}

impl AsyncWrite for CaptureWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut capture = match self.capture.lock() {
            Ok(capture) => capture,
            Err(_) => return Poll::Ready(Err(io::Error::other("capture lock poisoned"))),
        };
        capture.combined.extend_from_slice(buf);
        match self.stream {
            Stream::Stdout => capture.stdout.extend_from_slice(buf),
            Stream::Stderr => capture.stderr.extend_from_slice(buf),
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// [`Command`] over any [`RemoteProcess`].
pub struct PipedCommand {
    name: String,
    process: Option<Box<dyn RemoteProcess>>,
    stdin: Option<DuplexStream>,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    capture: Arc<Mutex<Capture>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<Result<i32>>>,
    started: bool,
}

impl PipedCommand {
    /// Wrap a process; it is cancelled with `cancel` or on [`Command::close`].
    pub fn new(
        name: impl Into<String>,
        process: Box<dyn RemoteProcess>,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            process: Some(process),
            stdin: None,
            stdout: None,
            stderr: None,
            capture: Arc::new(Mutex::new(Capture::default())),
            cancel: cancel.child_token(),
            handle: None,
            started: false,
        }
    }

    fn ensure_not_started(&self) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        Ok(())
    }

    fn captured<T>(&self, f: impl FnOnce(&Capture) -> T) -> Result<T> {
        let capture = self
            .capture
            .lock()
            .map_err(|_| Error::Request("capture lock poisoned".to_string()))?;
        Ok(f(&capture))
    }

    fn writer(&mut self, stream: Stream) -> Box<dyn AsyncWrite + Send + Unpin> {
        let claimed = match stream {
            Stream::Stdout => self.stdout.take(),
            Stream::Stderr => self.stderr.take(),
        };
        match claimed {
            Some(pipe) => Box::new(pipe),
            None => Box::new(CaptureWriter {
                capture: self.capture.clone(),
                stream,
            }),
        }
    }
}

#[async_trait]
impl Command for PipedCommand {
    fn stdin_pipe(&mut self) -> Result<StdinPipe> {
        self.ensure_not_started()?;
        if self.stdin.is_some() {
            return Err(Error::AlreadyExists("stdin".to_string()));
        }
        let (caller, remote) = tokio::io::duplex(PIPE_BUFFER);
        self.stdin = Some(remote);
        Ok(Box::new(caller))
    }

    fn stdout_pipe(&mut self) -> Result<OutputPipe> {
        self.ensure_not_started()?;
        if self.stdout.is_some() {
            return Err(Error::AlreadyExists("stdout".to_string()));
        }
        let (caller, remote) = tokio::io::duplex(PIPE_BUFFER);
        self.stdout = Some(remote);
        Ok(Box::new(caller))
    }

    fn stderr_pipe(&mut self) -> Result<OutputPipe> {
        self.ensure_not_started()?;
        if self.stderr.is_some() {
            return Err(Error::AlreadyExists("stderr".to_string()));
        }
        let (caller, remote) = tokio::io::duplex(PIPE_BUFFER);
        self.stderr = Some(remote);
        Ok(Box::new(caller))
    }

    async fn start(&mut self) -> Result<()> {
        self.ensure_not_started()?;
        let process = self.process.take().ok_or(Error::AlreadyStarted)?;

        let io = RemoteIo {
            stdin: self
                .stdin
                .take()
                .map(|pipe| Box::new(pipe) as Box<dyn AsyncRead + Send + Unpin>),
            stdout: self.writer(Stream::Stdout),
            stderr: self.writer(Stream::Stderr),
        };

        debug!(command = %self.name, "command started");
        self.started = true;
        self.handle = Some(tokio::spawn(process.run(io, self.cancel.clone())));
        Ok(())
    }

    async fn wait(&mut self) -> Result<()> {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None if self.started => return Ok(()),
            None => return Err(Error::Request(format!("{}: command not started", self.name))),
        };

        let code = match handle.await {
            Ok(result) => result?,
            Err(e) => return Err(Error::Request(format!("{}: {}", self.name, e))),
        };
        debug!(command = %self.name, code, "command exited");

        if code != 0 {
            let stderr = self.captured(|c| String::from_utf8_lossy(&c.stderr).trim().to_string())?;
            return Err(Error::Exit { code, stderr });
        }
        Ok(())
    }

    async fn combined_output(&mut self) -> Result<Vec<u8>> {
        self.ensure_not_started()?;
        self.run().await?;
        self.captured(|c| c.combined.clone())
    }

    async fn output(&mut self) -> Result<Output> {
        self.ensure_not_started()?;
        self.run().await?;
        self.captured(|c| Output {
            stdout: c.stdout.clone(),
            stderr: c.stderr.clone(),
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

impl Drop for PipedCommand {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
