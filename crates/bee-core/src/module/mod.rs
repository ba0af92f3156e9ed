// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Modules: typed command trees backed by scripts.
//!
//! A module is a directory holding a `bee.yml` manifest, the scripts it
//! names and, in subdirectories, the manifests of its subcommands:
//!
//! ```text
//! copy/
//! ├── bee.yml            name, script, params
//! ├── copy.tengo
//! └── windows/
//!     ├── bee.yml        subcommand `copy.windows`
//!     └── copy.tengo
//! ```
//!
//! Running a command goes through three [`Phase`]s: `pre_run` and `post_run`
//! are advisory, `run` produces the output.

pub mod builtin;
pub mod parser;
pub mod registry;
pub mod script;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::error::{Error, Result};

pub use parser::Invocation;
pub use registry::Registry;

/// Variable defaults of a host that does not set them.
pub const DEFAULT_HOME: &str = ".bee";
pub const DEFAULT_PLATFORM: &str = "linux";
pub const DEFAULT_ARCHITECTURE: &str = "amd64";

// ============================================================================
// Parameters
// ============================================================================

/// Accepted literal form of a parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    #[default]
    String,
    Int,
    Uint,
    Float,
    Duration,
}

/// A parameter schema of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ParamKind,
    #[serde(default)]
    pub desc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    String(String),
    Int(i64),
    Uint(u64),
    Float(f64),
    Duration(Duration),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::String(s) => f.write_str(s),
            ParamValue::Int(n) => write!(f, "{}", n),
            ParamValue::Uint(n) => write!(f, "{}", n),
            ParamValue::Float(n) => write!(f, "{}", n),
            ParamValue::Duration(d) => f.write_str(&format_duration(*d)),
        }
    }
}

/// Parse a duration such as `1h30m`, `250ms` or `10s`.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let input = input.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration '{}'", input))?;
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid duration '{}'", input))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => return Err(format!("unknown unit '{}' in duration '{}'", unit, input)),
        };
        total += Duration::from_secs_f64(value * seconds);
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Render a duration the way [`parse_duration`] reads it.
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else if duration.subsec_nanos() % 1_000_000 == 0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{}ns", duration.as_nanos())
    }
}

// ============================================================================
// Commands
// ============================================================================

/// One stage of running a command.
#[async_trait]
pub trait Phase: Send + Sync {
    async fn call(&self, ctx: &RunContext, invocation: &Invocation) -> Result<Vec<u8>>;
}

/// Optional phases of a command.
#[derive(Clone, Default)]
pub struct Hooks {
    pub pre_run: Option<Arc<dyn Phase>>,
    pub run: Option<Arc<dyn Phase>>,
    pub post_run: Option<Arc<dyn Phase>>,
}

impl Hooks {
    /// Overlay the phases `other` sets.
    pub fn merge(&mut self, other: &Hooks) {
        if other.pre_run.is_some() {
            self.pre_run = other.pre_run.clone();
        }
        if other.run.is_some() {
            self.run = other.run.clone();
        }
        if other.post_run.is_some() {
            self.post_run = other.post_run.clone();
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("pre_run", &self.pre_run.is_some())
            .field("run", &self.run.is_some())
            .field("post_run", &self.post_run.is_some())
            .finish()
    }
}

/// A node of a module's command tree.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub short: String,
    pub desc: String,
    /// Absolute path of the script, validated at load time
    pub script: Option<PathBuf>,
    pub params: Vec<Param>,
    pub children: Vec<Command>,
    pub hooks: Hooks,
}

impl Command {
    /// Whether the command has a script or a run hook.
    pub fn is_runnable(&self) -> bool {
        self.hooks.run.is_some()
            || self
                .script
                .as_ref()
                .is_some_and(|s| !s.as_os_str().is_empty())
    }

    pub fn child(&self, name: &str) -> Option<&Command> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Descend along `path`.
    pub fn descend(&self, path: &[String]) -> Option<&Command> {
        path.iter()
            .try_fold(self, |command, name| command.child(name))
    }
}

/// A loaded module.
#[derive(Debug, Clone)]
pub struct Module {
    /// Fully qualified dotted name, e.g. `bee.builtin.ping`
    pub name: String,
    pub command: Command,
    /// Local directory holding the manifest and scripts
    pub dir: PathBuf,
    /// `/`-separated path under the remote `modules` directory
    pub relpath: String,
}

// ============================================================================
// Run context
// ============================================================================

/// Everything a phase needs to act on one host.
#[derive(Clone)]
pub struct RunContext {
    pub cancel: CancellationToken,
    /// Span the phases log under
    pub span: tracing::Span,
    pub client: Arc<dyn Client>,
    pub host: String,
    /// Host variables with `bee_home`, `bee_platform` and `bee_architecture`
    /// resolved
    pub variables: BTreeMap<String, String>,
}

impl RunContext {
    pub fn new(
        cancel: CancellationToken,
        client: Arc<dyn Client>,
        host: impl Into<String>,
        mut variables: BTreeMap<String, String>,
    ) -> Self {
        for (key, default) in [
            ("bee_home", DEFAULT_HOME),
            ("bee_platform", DEFAULT_PLATFORM),
            ("bee_architecture", DEFAULT_ARCHITECTURE),
        ] {
            let value = variables.entry(key.to_string()).or_default();
            if value.is_empty() {
                *value = default.to_string();
            }
        }

        let host = host.into();
        Self {
            cancel,
            span: tracing::info_span!("run", host = %host),
            client,
            host,
            variables,
        }
    }

    fn variable(&self, key: &str, default: &'static str) -> &str {
        self.variables.get(key).map(String::as_str).unwrap_or(default)
    }

    pub fn bee_home(&self) -> &str {
        self.variable("bee_home", DEFAULT_HOME)
    }

    pub fn platform(&self) -> &str {
        self.variable("bee_platform", DEFAULT_PLATFORM)
    }

    pub fn architecture(&self) -> &str {
        self.variable("bee_architecture", DEFAULT_ARCHITECTURE)
    }

    pub fn is_windows(&self) -> bool {
        self.platform() == "windows"
    }

    /// Remote path under `bee_home`, with the platform's separator.
    pub fn remote_path(&self, parts: &[&str]) -> String {
        let separator = if self.is_windows() { "\\" } else { "/" };
        let mut path = self.bee_home().trim_end_matches(['/', '\\']).to_string();
        for part in parts {
            for segment in part.split('/').filter(|s| !s.is_empty()) {
                path.push_str(separator);
                path.push_str(segment);
            }
        }
        if self.is_windows() {
            path = path.replace('/', "\\");
        }
        path
    }

    /// Remote path of the script interpreter.
    pub fn repl_path(&self) -> String {
        let name = if self.is_windows() { "tengo.exe" } else { "tengo" };
        self.remote_path(&["bin", name])
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("host", &self.host)
            .field("client", &self.client.kind())
            .field("variables", &self.variables)
            .finish()
    }
}

/// Fail unless the command can run.
pub fn ensure_runnable(command: &Command, shell: &str) -> Result<()> {
    if command.is_runnable() {
        Ok(())
    } else {
        Err(Error::NotRunnable(shell.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClient;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10d").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn test_run_context_paths() {
        let client: Arc<dyn Client> = Arc::new(MockClient::new());
        let ctx = RunContext::new(CancellationToken::new(), client.clone(), "web1", BTreeMap::new());
        assert_eq!(ctx.repl_path(), ".bee/bin/tengo");
        assert_eq!(ctx.remote_path(&["modules", "bee/builtin/ping"]), ".bee/modules/bee/builtin/ping");

        let vars = BTreeMap::from([
            ("bee_platform".to_string(), "windows".to_string()),
            ("bee_home".to_string(), r"C:\bee".to_string()),
        ]);
        let ctx = RunContext::new(CancellationToken::new(), client, "win1", vars);
        assert_eq!(ctx.repl_path(), r"C:\bee\bin\tengo.exe");
        assert_eq!(ctx.remote_path(&["modules", "web/iis"]), r"C:\bee\modules\web\iis");
        assert_eq!(ctx.architecture(), "amd64");
    }
}
