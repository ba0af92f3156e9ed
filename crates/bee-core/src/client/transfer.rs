// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chunked copy loops with cancellation and progress tracing.
//!
//! Every transfer loop checks cancellation once per chunk and fails with
//! [`Error::Timeout`] when it trips.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::{IoTrace, TraceFn};
use crate::error::{Error, Result};

/// Progress of one file transfer.
pub struct Progress {
    trace: Option<TraceFn>,
    record: IoTrace,
    started: Instant,
}

impl Progress {
    pub fn new(trace: Option<TraceFn>, name: &str, src: &str, dst: &str, total: u64) -> Self {
        Self {
            trace,
            record: IoTrace {
                name: name.to_string(),
                src: src.to_string(),
                dst: dst.to_string(),
                total,
                transferred: 0,
                bytes_per_second: 0.0,
            },
            started: Instant::now(),
        }
    }

    pub fn advance(&mut self, bytes: u64) {
        self.record.transferred += bytes;
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.record.bytes_per_second = self.record.transferred as f64 / elapsed;
        }
        if let Some(trace) = &self.trace {
            trace(&self.record);
        }
    }

    pub fn transferred(&self) -> u64 {
        self.record.transferred
    }
}

/// Copy `reader` into `writer` in `chunk`-sized pieces.
pub async fn copy<R, W>(
    cancel: &CancellationToken,
    reader: &mut R,
    writer: &mut W,
    chunk: usize,
    progress: &mut Progress,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; chunk.max(1)];
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Timeout);
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        progress.advance(n as u64);
    }
    writer.flush().await?;
    Ok(progress.transferred())
}

/// Blocking twin of [`copy`], for transports running on a blocking thread.
pub fn copy_blocking<R, W>(
    cancel: &CancellationToken,
    reader: &mut R,
    writer: &mut W,
    chunk: usize,
    progress: &mut Progress,
) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; chunk.max(1)];
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Timeout);
        }
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        progress.advance(n as u64);
    }
    writer.flush()?;
    Ok(progress.transferred())
}

/// One entry of a local tree walk.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    /// Path relative to the walk root, `/`-separated; empty for the root
    pub relative: String,
    pub path: PathBuf,
    pub is_dir: bool,
    pub mode: u32,
    pub size: u64,
}

/// Walk a local tree in lexicographic order, each directory before its
/// contents. A file root yields a single entry.
pub fn walk_local(root: &Path) -> Result<Vec<LocalEntry>> {
    let mut entries = Vec::new();
    walk_into(root, String::new(), &mut entries)?;
    Ok(entries)
}

fn walk_into(path: &Path, relative: String, entries: &mut Vec<LocalEntry>) -> Result<()> {
    let metadata = std::fs::metadata(path)?;
    let is_dir = metadata.is_dir();
    entries.push(LocalEntry {
        relative: relative.clone(),
        path: path.to_path_buf(),
        is_dir,
        mode: local_mode(&metadata),
        size: if is_dir { 0 } else { metadata.len() },
    });

    if is_dir {
        let mut children: Vec<_> = std::fs::read_dir(path)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        children.sort();
        for child in children {
            let child_relative = if relative.is_empty() {
                child.clone()
            } else {
                format!("{}/{}", relative, child)
            };
            walk_into(&path.join(&child), child_relative, entries)?;
        }
    }
    Ok(())
}

/// Permission bits of local metadata.
#[cfg(unix)]
pub fn local_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub fn local_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Apply permission bits to a local path.
#[cfg(unix)]
pub fn set_local_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode != 0 {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn set_local_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Join a remote path, keeping the separator style of `base`.
pub fn join_remote(base: &str, relative: &str) -> String {
    if relative.is_empty() {
        return base.to_string();
    }
    let separator = if base.contains('\\') && !base.contains('/') {
        '\\'
    } else {
        '/'
    };
    let relative = relative.replace('/', &separator.to_string());
    if base.ends_with(separator) {
        format!("{}{}", base, relative)
    } else {
        format!("{}{}{}", base, separator, relative)
    }
}

/// Last component of a remote path.
pub fn remote_base_name(path: &str) -> &str {
    path.trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
}

/// Parent of a remote path, if it has one.
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches(['/', '\\']);
    let index = trimmed.rfind(['/', '\\'])?;
    if index == 0 {
        return Some(&trimmed[..1]);
    }
    Some(&trimmed[..index])
}
