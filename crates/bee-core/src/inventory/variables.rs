// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `group_vars/` and `host_vars/` overlays.
//!
//! ```text
//! <root>/
//!   group_vars/web.yml     -> groups["web"].file_vars
//!   host_vars/web1.yaml    -> hosts["web1"].file_vars
//! ```
//!
//! Each file is a flat YAML map. Scalars become strings; nested values are
//! kept as their JSON rendering.

use std::path::{Path, PathBuf};

use serde_yaml::Value;
use tracing::debug;

use super::{Inventory, Vars};
use crate::error::{Error, Result};

/// Loads variable overlay files next to an inventory.
#[derive(Debug, Clone)]
pub struct VariableManager {
    root: PathBuf,
}

impl VariableManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Manager rooted at the directory of an inventory file.
    pub fn for_inventory(path: impl AsRef<Path>) -> Self {
        let root = path
            .as_ref()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fill `file_vars` of every known host and group, then reconcile.
    pub fn apply(&self, inventory: &mut Inventory) -> Result<()> {
        let groups: Vec<String> = inventory.groups.keys().cloned().collect();
        for name in groups {
            if let Some(vars) = self.read("group_vars", &name)? {
                inventory.add_group(&name).file_vars = vars;
            }
        }

        let hosts: Vec<String> = inventory.hosts.keys().cloned().collect();
        for name in hosts {
            if let Some(vars) = self.read("host_vars", &name)? {
                inventory.add_host(&name).file_vars = vars;
            }
        }

        inventory.reconcile();
        Ok(())
    }

    fn read(&self, kind: &str, name: &str) -> Result<Option<Vars>> {
        for ext in ["yml", "yaml"] {
            let path = self.root.join(kind).join(format!("{}.{}", name, ext));
            if !path.is_file() {
                continue;
            }
            let source = std::fs::read_to_string(&path)?;
            debug!(path = %path.display(), "loading variables");
            return parse(&source).map(Some);
        }
        Ok(None)
    }
}

/// Parse a flat YAML variable map.
pub fn parse(source: &str) -> Result<Vars> {
    let value: Value = serde_yaml::from_str(source)?;
    let map = match value {
        Value::Null => return Ok(Vars::new()),
        Value::Mapping(map) => map,
        _ => return Err(Error::Parse("variable file must be a map".to_string())),
    };

    let mut vars = Vars::new();
    for (key, value) in map {
        let key = scalar(&key)
            .ok_or_else(|| Error::Parse("variable names must be scalars".to_string()))?;
        let value = match scalar(&value) {
            Some(s) => s,
            None => serde_json::to_string(&value)?,
        };
        vars.insert(key, value);
    }
    Ok(vars)
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

/// Load an inventory file together with the overlays next to it.
pub fn load_inventory(path: impl AsRef<Path>) -> Result<Inventory> {
    let path = path.as_ref();
    let mut inventory = super::loader::load(path)?;
    VariableManager::for_inventory(path).apply(&mut inventory)?;
    Ok(inventory)
}
