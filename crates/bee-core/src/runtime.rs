// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime orchestrator.
//!
//! [`Runtime`] ties the execution plane together: it owns the connection
//! manager, the module registry, the credential store and the worker pool,
//! and runs one module command on one host per [`Runtime::execute`] call.
//!
//! # Example
//!
//! ```rust,ignore
//! use bee_core::inventory::variables::load_inventory;
//! use bee_core::runtime::{Runtime, RuntimeOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! let inventory = load_inventory("hosts")?;
//! let runtime = Runtime::builder(inventory)
//!     .options(RuntimeOptions::default().dir("/var/lib/bee"))
//!     .build()
//!     .await?;
//!
//! let out = runtime
//!     .execute("web1", "ping data=hello", CancellationToken::new())
//!     .await?;
//! runtime.stop().await?;
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, instrument, warn};

use crate::config::{Config, DEFAULT_DIR, default_parallel};
use crate::connection::{ConnectionManager, Connector, TransportConnector};
use crate::error::{Error, Result};
use crate::inventory::Inventory;
use crate::inventory::variables::VariableManager;
use crate::module::script::ScriptRun;
use crate::module::{Hooks, Invocation, Phase, Registry, RunContext, builtin, ensure_runnable, parser};
use crate::secret::{KeyProvider, RsaKeyProvider, SecretStore, SqliteSecretStore};
use crate::shell;
use crate::sync::Syncer;

/// Called with the host, the shell line and the output of every successful
/// execute.
pub type Callback = Arc<dyn Fn(&str, &str, &[u8]) + Send + Sync>;

/// Options of a [`Runtime`].
#[derive(Clone)]
pub struct RuntimeOptions {
    /// Local runtime directory
    pub dir: PathBuf,
    /// Worker pool size
    pub parallel: usize,
    /// User module roots, loaded after the built-ins
    pub module_paths: Vec<PathBuf>,
    pub callback: Option<Callback>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_DIR),
            parallel: default_parallel(),
            module_paths: Vec::new(),
            callback: None,
        }
    }
}

impl RuntimeOptions {
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    pub fn module_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.module_paths.push(path.into());
        self
    }

    pub fn callback(mut self, callback: Callback) -> Self {
        self.callback = Some(callback);
        self
    }
}

impl From<&Config> for RuntimeOptions {
    fn from(config: &Config) -> Self {
        Self {
            dir: config.dir.clone(),
            parallel: config.parallel,
            module_paths: config.module_paths.clone(),
            callback: None,
        }
    }
}

impl std::fmt::Debug for RuntimeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeOptions")
            .field("dir", &self.dir)
            .field("parallel", &self.parallel)
            .field("module_paths", &self.module_paths)
            .field("callback", &self.callback.as_ref().map(|_| "..."))
            .finish()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for a [`Runtime`].
pub struct RuntimeBuilder {
    inventory: Inventory,
    variables: Option<VariableManager>,
    connector: Option<Arc<dyn Connector>>,
    keys: Option<Arc<dyn KeyProvider>>,
    hooks: HashMap<String, Hooks>,
    options: RuntimeOptions,
}

impl std::fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("hosts", &self.inventory.hosts.len())
            .field("variables", &self.variables.as_ref().map(|v| v.root().to_path_buf()))
            .field("connector", &self.connector.as_ref().map(|_| "..."))
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .field("options", &self.options)
            .finish()
    }
}

impl RuntimeBuilder {
    /// Variable overlays (`group_vars/`, `host_vars/`) applied to the
    /// inventory at build time.
    pub fn variables(mut self, variables: VariableManager) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Client factory. Default: [`TransportConnector`].
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Credential store keys. Default: [`RsaKeyProvider::embedded`].
    pub fn key_provider(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Install hooks on the command with the given qualified name.
    pub fn hook(mut self, name: impl Into<String>, hooks: Hooks) -> Self {
        self.hooks.entry(name.into()).or_default().merge(&hooks);
        self
    }

    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    /// Open the credential store, load the modules and size the pool.
    pub async fn build(self) -> Result<Runtime> {
        let RuntimeBuilder {
            mut inventory,
            variables,
            connector,
            keys,
            hooks: user_hooks,
            options,
        } = self;

        if let Some(variables) = &variables {
            variables.apply(&mut inventory)?;
        }

        std::fs::create_dir_all(&options.dir)?;
        let keys = match keys {
            Some(keys) => keys,
            None => Arc::new(RsaKeyProvider::embedded()?),
        };
        let store = Arc::new(SqliteSecretStore::from_path(options.dir.join("db"), keys).await?);

        let mut hooks = builtin::hooks();
        for (name, overlay) in &user_hooks {
            hooks.entry(name.clone()).or_default().merge(overlay);
        }
        let default_run: Arc<dyn Phase> = Arc::new(ScriptRun::new());
        let mut registry = Registry::new(hooks, Some(default_run));
        registry.load_dir(builtin::materialize(&options.dir)?, builtin::NAMESPACE)?;
        for path in &options.module_paths {
            registry.load_dir(path, "")?;
        }

        let connector = connector.unwrap_or_else(|| Arc::new(TransportConnector));
        let secrets: Arc<dyn SecretStore> = store.clone();
        let connections = ConnectionManager::new(Arc::new(inventory), secrets, connector);

        let parallel = options.parallel.max(1);
        info!(
            dir = %options.dir.display(),
            parallel,
            modules = registry.len(),
            "runtime started"
        );

        Ok(Runtime {
            pool: Semaphore::new(parallel),
            connections,
            registry,
            syncer: Syncer::new(&options.dir),
            store,
            callback: options.callback.clone(),
            options,
        })
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// The remote execution plane.
pub struct Runtime {
    pool: Semaphore,
    connections: ConnectionManager,
    registry: Registry,
    syncer: Syncer,
    store: Arc<SqliteSecretStore>,
    callback: Option<Callback>,
    options: RuntimeOptions,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish()
    }
}

impl Runtime {
    pub fn builder(inventory: Inventory) -> RuntimeBuilder {
        RuntimeBuilder {
            inventory,
            variables: None,
            connector: None,
            keys: None,
            hooks: HashMap::new(),
            options: RuntimeOptions::default(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn secrets(&self) -> &dyn SecretStore {
        self.store.as_ref()
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Bind `shell` to a module command without touching the host.
    pub fn parse(&self, shell: &str) -> Result<Invocation> {
        let words = shell::split(shell)?;
        let (token, args) = words
            .split_first()
            .ok_or_else(|| Error::ModuleNotFound(String::new()))?;
        let (module, path) = self
            .registry
            .resolve(token)
            .ok_or_else(|| Error::ModuleNotFound(token.clone()))?;
        parser::parse(module, &path, args)
    }

    /// Run the module command `shell` on `host` and return its output.
    ///
    /// Waits for a worker slot first. `pre_run` and `post_run` failures are
    /// logged; a `run` failure is returned.
    #[instrument(skip(self, host, cancel), fields(host = %host))]
    pub async fn execute(&self, host: &str, shell: &str, cancel: CancellationToken) -> Result<Vec<u8>> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Timeout),
            permit = self.pool.acquire() => permit.map_err(|_| Error::Request("runtime stopped".to_string()))?,
        };

        let invocation = self.parse(shell)?;
        let command = invocation.command();
        ensure_runnable(command, shell)?;

        let client = self.connections.get_client(host).await?;
        let variables = self
            .connections
            .inventory()
            .host(host)
            .map(|h| h.vars.clone())
            .unwrap_or_default();
        let ctx = RunContext::new(cancel, client, host, variables);

        self.syncer
            .sync(&ctx, &self.registry)
            .instrument(ctx.span.clone())
            .await?;

        let hooks = &command.hooks;
        if let Some(pre_run) = &hooks.pre_run
            && let Err(e) = pre_run.call(&ctx, &invocation).await
        {
            warn!(parent: &ctx.span, error = %e, "pre_run failed");
        }

        let run = hooks
            .run
            .as_ref()
            .ok_or_else(|| Error::NotRunnable(shell.to_string()))?;
        let output = match run.call(&ctx, &invocation).instrument(ctx.span.clone()).await {
            Ok(output) => output,
            Err(e) => {
                error!(parent: &ctx.span, module = %invocation.module.name, error = %e, "run failed");
                return Err(e);
            }
        };

        if let Some(post_run) = &hooks.post_run
            && let Err(e) = post_run.call(&ctx, &invocation).await
        {
            warn!(parent: &ctx.span, error = %e, "post_run failed");
        }

        if let Some(callback) = &self.callback {
            callback(host, shell, &output);
        }
        Ok(output)
    }

    /// Close the pool, every client and the credential store.
    pub async fn stop(&self) -> Result<()> {
        self.pool.close();
        let result = self.connections.cleanup().await;
        self.store.close().await;
        info!("runtime stopped");
        result
    }
}
