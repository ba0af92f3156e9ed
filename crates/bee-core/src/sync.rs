// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host bootstrap.
//!
//! Before the first command runs on a host, the script interpreter and the
//! module tree are brought onto it:
//!
//! ```text
//! repl -version ──ok──────────────────────────────┐
//!      │ fails                                    │
//!      ▼                                          ▼
//! put <dir>/repl/tengo.<platform>.<arch>   for each module:
//!     to <bee_home>/bin/tengo               stat <bee_home>/modules/<relpath>
//!                                           missing → put the directory
//! ```
//!
//! Each host is synced once per [`Syncer`]; a failed sync is retried on the
//! next call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::client::{ExecOptions, PutOptions};
use crate::error::{Error, Result};
use crate::module::{Registry, RunContext};

/// Local file name of the interpreter for a platform.
pub fn repl_file_name(platform: &str, architecture: &str) -> String {
    let mut name = format!("tengo.{}.{}", platform, architecture);
    if platform == "windows" {
        name.push_str(".exe");
    }
    name
}

/// Per-host bootstrap state.
pub struct Syncer {
    runtime_dir: PathBuf,
    hosts: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl Syncer {
    /// `runtime_dir` holds the bundled interpreters under `repl/`.
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, host: &str) -> Arc<OnceCell<()>> {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        hosts.entry(host.to_string()).or_default().clone()
    }

    /// Bring the interpreter and modules onto the context's host.
    pub async fn sync(&self, ctx: &RunContext, registry: &Registry) -> Result<()> {
        let slot = self.slot(&ctx.host);
        slot.get_or_try_init(|| async {
            self.sync_repl(ctx).await?;
            self.sync_modules(ctx, registry).await
        })
        .await?;
        Ok(())
    }

    /// Upload the interpreter unless `repl -version` already succeeds.
    #[instrument(skip_all, fields(host = %ctx.host))]
    pub async fn sync_repl(&self, ctx: &RunContext) -> Result<()> {
        let repl = ctx.repl_path();
        let mut probe = ctx
            .client
            .execute(&ctx.cancel, &repl, ExecOptions::args(["-version"]))
            .await?;
        match probe.output().await {
            Ok(output) => {
                debug!(
                    version = %String::from_utf8_lossy(&output.stdout).trim(),
                    "interpreter present"
                );
                return Ok(());
            }
            Err(Error::Timeout) => return Err(Error::Timeout),
            Err(e) => debug!(error = %e, "interpreter probe failed"),
        }

        let local = self
            .runtime_dir
            .join("repl")
            .join(repl_file_name(ctx.platform(), ctx.architecture()));
        if !local.is_file() {
            return Err(Error::NotExists(local.display().to_string()));
        }

        let options = PutOptions {
            mkdir: true,
            ..Default::default()
        };
        ctx.client.put(&ctx.cancel, &local, &repl, options).await?;
        info!(local = %local.display(), remote = %repl, "interpreter uploaded");
        Ok(())
    }

    /// Upload every module directory the host does not have yet.
    #[instrument(skip_all, fields(host = %ctx.host))]
    pub async fn sync_modules(&self, ctx: &RunContext, registry: &Registry) -> Result<()> {
        for module in registry.modules() {
            let remote = ctx.remote_path(&["modules", &module.relpath]);
            match ctx.client.stat(&ctx.cancel, &remote).await {
                Ok(_) => {
                    debug!(module = %module.name, %remote, "module present");
                    continue;
                }
                Err(e) if e.is_not_exists() => {}
                Err(e) => return Err(e),
            }

            let options = PutOptions {
                dir: true,
                mkdir: true,
                ..Default::default()
            };
            ctx.client.put(&ctx.cancel, &module.dir, &remote, options).await?;
            info!(module = %module.name, %remote, "module uploaded");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Syncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Syncer")
            .field("runtime_dir", &self.runtime_dir)
            .finish()
    }
}
