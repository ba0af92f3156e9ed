// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Module registry.
//!
//! Walks module roots on disk and indexes every directory holding a
//! `bee.yml` (or `bee.yaml`) manifest by its dotted name. Subdirectories of a
//! module that carry their own manifest become subcommands.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use super::{Command, Hooks, Module, Param, Phase};
use crate::error::{Error, Result};

/// Manifest file names, in lookup order.
pub const MANIFESTS: [&str; 2] = ["bee.yml", "bee.yaml"];

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    short: String,
    #[serde(default)]
    desc: String,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    params: Vec<Param>,
}

fn manifest_path(dir: &Path) -> Option<PathBuf> {
    MANIFESTS
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Non-hidden subdirectories of `dir`, sorted by name.
fn subdirs(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        dirs.push((name, entry.path()));
    }
    dirs.sort();
    Ok(dirs)
}

/// Index of loaded modules.
pub struct Registry {
    modules: BTreeMap<String, Arc<Module>>,
    hooks: HashMap<String, Hooks>,
    default_run: Option<Arc<dyn Phase>>,
}

impl Registry {
    /// Empty registry.
    ///
    /// `hooks` are keyed by fully qualified command name
    /// (`bee.builtin.copy`, `web.iis.site`); `default_run` is installed on
    /// every command that has a script.
    pub fn new(hooks: HashMap<String, Hooks>, default_run: Option<Arc<dyn Phase>>) -> Self {
        Self {
            modules: BTreeMap::new(),
            hooks,
            default_run,
        }
    }

    /// Load every module under `root`.
    ///
    /// Module names are the dotted directory path below `root`, prefixed by
    /// `namespace` when it is not empty. Returns the number of modules loaded.
    pub fn load_dir(&mut self, root: impl AsRef<Path>, namespace: &str) -> Result<usize> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(Error::NotExists(root.display().to_string()));
        }
        let mut segments = Vec::new();
        let loaded = self.walk(root, namespace, &mut segments)?;
        info!(root = %root.display(), namespace, loaded, "modules loaded");
        Ok(loaded)
    }

    fn walk(&mut self, dir: &Path, namespace: &str, segments: &mut Vec<String>) -> Result<usize> {
        if manifest_path(dir).is_some() {
            self.load_module(dir, namespace, segments)?;
            return Ok(1);
        }

        let mut loaded = 0;
        for (name, path) in subdirs(dir)? {
            segments.push(name);
            loaded += self.walk(&path, namespace, segments)?;
            segments.pop();
        }
        Ok(loaded)
    }

    fn load_module(&mut self, dir: &Path, namespace: &str, segments: &[String]) -> Result<()> {
        let mut command = load_command(dir)?;

        let mut parts: Vec<String> = namespace
            .split('.')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        parts.extend(segments.iter().cloned());
        if parts.is_empty() {
            let own = if command.name.is_empty() {
                dir.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            } else {
                command.name.clone()
            };
            parts.push(own);
        }
        let name = parts.join(".");
        let relpath = parts.join("/");
        if command.name.is_empty()
            && let Some(last) = parts.last()
        {
            command.name = last.clone();
        }

        self.install_hooks(&mut command, &name);

        debug!(module = %name, dir = %dir.display(), "module loaded");
        let module = Module {
            name: name.clone(),
            command,
            dir: dir.to_path_buf(),
            relpath,
        };
        self.modules.insert(name, Arc::new(module));
        Ok(())
    }

    fn install_hooks(&self, command: &mut Command, qualified: &str) {
        if command.script.is_some()
            && let Some(run) = &self.default_run
        {
            command.hooks.run = Some(run.clone());
        }
        if let Some(hooks) = self.hooks.get(qualified) {
            command.hooks.merge(hooks);
        }
        for child in &mut command.children {
            let name = format!("{}.{}", qualified, child.name);
            self.install_hooks(child, &name);
        }
    }

    /// Look a module up by name.
    ///
    /// A name without a dot also matches the built-in of that name.
    pub fn find(&self, name: &str) -> Option<Arc<Module>> {
        if let Some(module) = self.modules.get(name) {
            return Some(module.clone());
        }
        if !name.contains('.') {
            return self
                .modules
                .get(&format!("{}.{}", super::builtin::NAMESPACE, name))
                .cloned();
        }
        None
    }

    /// Split a dotted token into the longest module name it starts with and
    /// the remaining subcommand path.
    pub fn resolve(&self, token: &str) -> Option<(Arc<Module>, Vec<String>)> {
        let segments: Vec<&str> = token.split('.').filter(|s| !s.is_empty()).collect();
        (1..=segments.len()).rev().find_map(|len| {
            self.find(&segments[..len].join(".")).map(|module| {
                let path = segments[len..].iter().map(|s| s.to_string()).collect();
                (module, path)
            })
        })
    }

    pub fn modules(&self) -> impl Iterator<Item = &Arc<Module>> {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Load the command tree rooted at `dir`.
pub fn load_command(dir: &Path) -> Result<Command> {
    let path = manifest_path(dir)
        .ok_or_else(|| Error::NotExists(dir.join(MANIFESTS[0]).display().to_string()))?;
    let manifest: Manifest = serde_yaml::from_str(&fs::read_to_string(&path)?)?;

    let script = match manifest.script.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(script) => {
            let script = Path::new(script);
            let resolved = if script.is_absolute() {
                script.to_path_buf()
            } else {
                dir.join(script)
            };
            if !resolved.is_file() {
                return Err(Error::NotExists(resolved.display().to_string()));
            }
            Some(resolved)
        }
    };

    let mut children = Vec::new();
    for (name, sub) in subdirs(dir)? {
        if manifest_path(&sub).is_none() {
            continue;
        }
        let mut child = load_command(&sub)?;
        if child.name.is_empty() {
            child.name = name;
        }
        children.push(child);
    }

    Ok(Command {
        name: manifest.name,
        short: manifest.short,
        desc: manifest.desc,
        script,
        params: manifest.params,
        children,
        hooks: Hooks::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Invocation, ParamKind, RunContext};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Phase for Echo {
        async fn call(&self, _ctx: &RunContext, _invocation: &Invocation) -> Result<Vec<u8>> {
            Ok(b"echo".to_vec())
        }
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join("web/iis/bee.yml"),
            "name: iis\nscript: iis.tengo\nparams:\n  - name: site\n    required: true\n",
        );
        write(&root.join("web/iis/iis.tengo"), "fmt := import(\"fmt\")");
        write(
            &root.join("web/iis/pool/bee.yaml"),
            "name: pool\nscript: ../iis.tengo\nparams:\n  - name: size\n    type: uint\n    default: \"4\"\n",
        );
        write(&root.join("web/iis/notes/readme.txt"), "not a command");
        write(&root.join(".hidden/bee.yml"), "name: hidden\n");
        write(&root.join("db/bee.yml"), "name: db\n");
        dir
    }

    #[test]
    fn test_load_dir_names_modules_by_path() {
        let dir = fixture();
        let mut registry = Registry::new(HashMap::new(), Some(Arc::new(Echo)));
        assert_eq!(registry.load_dir(dir.path(), "").unwrap(), 2);

        let names: Vec<_> = registry.modules().map(|m| m.name.clone()).collect();
        assert_eq!(names, vec!["db", "web.iis"]);

        let iis = registry.find("web.iis").unwrap();
        assert_eq!(iis.relpath, "web/iis");
        assert_eq!(iis.command.children.len(), 1);
        let pool = iis.command.child("pool").unwrap();
        assert_eq!(pool.params[0].kind, ParamKind::Uint);
        assert!(pool.hooks.run.is_some());

        let db = registry.find("db").unwrap();
        assert!(!db.command.is_runnable());
    }

    #[test]
    fn test_namespace_and_builtin_fallback() {
        let dir = fixture();
        let mut registry = Registry::new(HashMap::new(), None);
        registry.load_dir(dir.path(), "bee.builtin").unwrap();

        let db = registry.find("db").unwrap();
        assert_eq!(db.name, "bee.builtin.db");
        assert_eq!(db.relpath, "bee/builtin/db");
        assert!(registry.find("web.iis").is_none());
    }

    #[test]
    fn test_resolve_longest_prefix() {
        let dir = fixture();
        let mut registry = Registry::new(HashMap::new(), None);
        registry.load_dir(dir.path(), "").unwrap();

        let (module, path) = registry.resolve("web.iis.pool").unwrap();
        assert_eq!(module.name, "web.iis");
        assert_eq!(path, vec!["pool"]);
        assert!(registry.resolve("web").is_none());
    }

    #[test]
    fn test_hooks_merge_by_qualified_name() {
        let dir = fixture();
        let hooks = HashMap::from([(
            "db".to_string(),
            Hooks {
                run: Some(Arc::new(Echo) as Arc<dyn Phase>),
                ..Default::default()
            },
        )]);
        let mut registry = Registry::new(hooks, None);
        registry.load_dir(dir.path(), "").unwrap();
        assert!(registry.find("db").unwrap().command.is_runnable());
        assert!(registry.find("web.iis").unwrap().command.hooks.run.is_none());
    }

    #[test]
    fn test_missing_script_fails() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("bad/bee.yml"), "name: bad\nscript: nope.tengo\n");
        let mut registry = Registry::new(HashMap::new(), None);
        let err = registry.load_dir(dir.path(), "").unwrap_err();
        assert!(err.is_not_exists());
    }
}
