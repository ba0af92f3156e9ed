// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Default `run` phase: interpret the command's script on the host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{Invocation, Phase, RunContext};
use crate::client::{ExecOptions, PutOptions};
use crate::error::{Error, Result};

type UploadKey = (String, PathBuf);

/// Uploads a command's script to `<bee_home>/tmp/` once per host and runs it
/// with the remote interpreter, returning its stdout.
#[derive(Default)]
pub struct ScriptRun {
    uploads: Mutex<HashMap<UploadKey, Arc<OnceCell<String>>>>,
}

impl ScriptRun {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, host: &str, script: &Path) -> Arc<OnceCell<String>> {
        let mut uploads = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
        uploads
            .entry((host.to_string(), script.to_path_buf()))
            .or_default()
            .clone()
    }

    /// Remote path of `script` on the context's host, uploading it on first
    /// use.
    async fn upload(&self, ctx: &RunContext, script: &Path) -> Result<String> {
        let slot = self.slot(&ctx.host, script);
        let remote = slot
            .get_or_try_init(|| async {
                let ext = script
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "tengo".to_string());
                let remote = ctx.remote_path(&["tmp", &format!("{}.{}", Uuid::new_v4(), ext)]);
                let options = PutOptions {
                    mkdir: true,
                    ..Default::default()
                };
                ctx.client.put(&ctx.cancel, script, &remote, options).await?;
                debug!(parent: &ctx.span, script = %script.display(), %remote, "script uploaded");
                Ok::<_, Error>(remote)
            })
            .await?;
        Ok(remote.clone())
    }
}

#[async_trait]
impl Phase for ScriptRun {
    #[instrument(skip_all, fields(host = %ctx.host, module = %invocation.module.name))]
    async fn call(&self, ctx: &RunContext, invocation: &Invocation) -> Result<Vec<u8>> {
        let script = invocation
            .command()
            .script
            .as_deref()
            .ok_or_else(|| Error::NotRunnable(invocation.module.name.clone()))?;
        let remote = self.upload(ctx, script).await?;

        let mut args = vec![remote];
        args.extend(invocation.cli_args());
        let mut command = ctx
            .client
            .execute(&ctx.cancel, &ctx.repl_path(), ExecOptions::args(args))
            .await?;
        let output = command.output().await?;
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, MockClient, MockReply};
    use crate::module::{builtin, parser, registry::Registry};
    use std::collections::BTreeMap;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_script_uploaded_once_per_host() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = Registry::new(HashMap::new(), Some(Arc::new(ScriptRun::new())));
        registry
            .load_dir(builtin::materialize(dir.path()).unwrap(), builtin::NAMESPACE)
            .unwrap();

        let mock = Arc::new(MockClient::with_handler(|_, options| {
            Ok(MockReply::ok(options.args[1..].join(" ")))
        }));
        let client: Arc<dyn Client> = mock.clone();
        let ctx = RunContext::new(CancellationToken::new(), client, "web1", BTreeMap::new());

        let module = registry.find("ping").unwrap();
        let invocation = parser::parse(module, &[], &["data=hi".to_string()]).unwrap();
        let run = invocation.command().hooks.run.clone().unwrap();

        assert_eq!(run.call(&ctx, &invocation).await.unwrap(), b"--data=hi");
        assert_eq!(run.call(&ctx, &invocation).await.unwrap(), b"--data=hi");

        let puts = mock.puts();
        assert_eq!(puts.len(), 1);
        assert!(puts[0].starts_with(".bee/tmp/") && puts[0].ends_with(".tengo"));
        assert!(mock.executes()[0].starts_with(".bee/bin/tengo .bee/tmp/"));
    }
}
