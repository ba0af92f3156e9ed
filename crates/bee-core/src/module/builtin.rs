// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in modules.
//!
//! The manifests and scripts of `bee.builtin.*` are embedded in the binary
//! and written to `<dir>/modules/builtin` at start-up, so they load and sync
//! like any other module. `copy` and `fetch` have no script; their run hooks
//! use the client's file transfer directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{Hooks, Invocation, Phase, RunContext};
use crate::client::{GetOptions, PutOptions};
use crate::error::{Error, Result};

/// Name prefix of the built-in modules.
pub const NAMESPACE: &str = "bee.builtin";

const ASSETS: &[(&str, &str)] = &[
    ("ping/bee.yml", include_str!("../../builtin/ping/bee.yml")),
    ("ping/ping.tengo", include_str!("../../builtin/ping/ping.tengo")),
    ("copy/bee.yml", include_str!("../../builtin/copy/bee.yml")),
    ("fetch/bee.yml", include_str!("../../builtin/fetch/bee.yml")),
];

/// Write the built-in modules under `<dir>/modules/builtin` and return that
/// directory.
pub fn materialize(dir: &Path) -> Result<PathBuf> {
    let root = dir.join("modules").join("builtin");
    for (relative, content) in ASSETS {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
    }
    Ok(root)
}

/// Run hooks of the built-in modules, keyed by qualified name.
pub fn hooks() -> HashMap<String, Hooks> {
    let run = |phase: Arc<dyn Phase>| Hooks {
        run: Some(phase),
        ..Default::default()
    };
    HashMap::from([
        (format!("{}.copy", NAMESPACE), run(Arc::new(CopyPhase))),
        (format!("{}.fetch", NAMESPACE), run(Arc::new(FetchPhase))),
    ])
}

fn required(invocation: &Invocation, name: &str) -> Result<String> {
    invocation
        .flag_str(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Parse(format!("{}: --{} is required", invocation.module.name, name)))
}

/// Upload a local path to the host.
struct CopyPhase;

#[async_trait]
impl Phase for CopyPhase {
    async fn call(&self, ctx: &RunContext, invocation: &Invocation) -> Result<Vec<u8>> {
        let src = required(invocation, "src")?;
        let dest = required(invocation, "dest")?;

        let local = PathBuf::from(&src);
        let metadata = tokio::fs::metadata(&local)
            .await
            .map_err(|_| Error::NotExists(src.clone()))?;
        let options = PutOptions {
            dir: metadata.is_dir(),
            mkdir: true,
            ..Default::default()
        };
        ctx.client.put(&ctx.cancel, &local, &dest, options).await?;

        info!(parent: &ctx.span, %src, %dest, "copied");
        Ok(format!("{} -> {}:{}\n", src, ctx.host, dest).into_bytes())
    }
}

/// Download a remote path from the host.
struct FetchPhase;

#[async_trait]
impl Phase for FetchPhase {
    async fn call(&self, ctx: &RunContext, invocation: &Invocation) -> Result<Vec<u8>> {
        let src = required(invocation, "src")?;
        let dest = required(invocation, "dest")?;

        let stat = ctx.client.stat(&ctx.cancel, &src).await?;
        let local = PathBuf::from(&dest);
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = GetOptions {
            dir: stat.is_dir,
            ..Default::default()
        };
        ctx.client.get(&ctx.cancel, &src, &local, options).await?;

        info!(parent: &ctx.span, %src, %dest, "fetched");
        Ok(format!("{}:{} -> {}\n", ctx.host, src, dest).into_bytes())
    }
}
