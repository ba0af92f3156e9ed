// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inventory model: hosts, groups and variable precedence.
//!
//! Hosts belong to groups, groups have parent groups. After
//! [`Inventory::reconcile`] every host carries its fully resolved variables
//! in [`Host::vars`], computed from lowest to highest priority:
//!
//! ```text
//! ancestor inventory vars
//!   < ancestor file vars
//!     < direct-group inventory vars
//!       < direct-group file vars
//!         < host inventory vars
//!           < host file vars
//! ```
//!
//! Two groups always exist: `all`, the ancestor of every other group, and
//! `ungrouped`, holding the hosts that belong to no other group.

pub mod loader;
pub mod variables;

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the root group.
pub const ALL: &str = "all";
/// Name of the group collecting hosts without a group.
pub const UNGROUPED: &str = "ungrouped";

/// Stable string map used for every variable set.
pub type Vars = BTreeMap<String, String>;

// ============================================================================
// Host / Group
// ============================================================================

/// An inventory host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Effective variables, computed by reconciliation
    #[serde(default)]
    pub vars: Vars,
    /// Variables declared on the host line
    #[serde(default)]
    pub inventory_vars: Vars,
    /// Variables from `host_vars/<name>.yml`
    #[serde(default)]
    pub file_vars: Vars,
    /// Groups the host is declared in
    #[serde(default)]
    pub direct_groups: BTreeSet<String>,
    /// Direct groups plus all their ancestors, computed by reconciliation
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Effective variable, if set.
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// An inventory group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    /// Direct parents
    #[serde(default)]
    pub parents: BTreeSet<String>,
    /// Transitive parents, computed
    #[serde(default)]
    pub all_parents: BTreeSet<String>,
    /// Direct children
    #[serde(default)]
    pub children: BTreeSet<String>,
    /// Transitive children, computed
    #[serde(default)]
    pub all_children: BTreeSet<String>,
    /// Hosts of this group and of every descendant, computed
    #[serde(default)]
    pub hosts: BTreeSet<String>,
    /// Variables from `[name:vars]`
    #[serde(default)]
    pub inventory_vars: Vars,
    /// Variables from `group_vars/<name>.yml`
    #[serde(default)]
    pub file_vars: Vars,
    /// Inventory vars merged over all ancestors, computed
    #[serde(default)]
    pub all_inventory_vars: Vars,
    /// File vars merged over all ancestors, computed
    #[serde(default)]
    pub all_file_vars: Vars,
    /// Effective variables, computed
    #[serde(default)]
    pub vars: Vars,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn clear_computed(&mut self) {
        self.all_parents.clear();
        self.all_children.clear();
        self.hosts.clear();
        self.all_inventory_vars.clear();
        self.all_file_vars.clear();
        self.vars.clear();
    }
}

// ============================================================================
// Inventory
// ============================================================================

/// Hosts and groups, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    pub hosts: BTreeMap<String, Host>,
    pub groups: BTreeMap<String, Group>,
}

impl Inventory {
    /// An empty, reconciled inventory.
    pub fn new() -> Self {
        let mut inventory = Self::default();
        inventory.reconcile();
        inventory
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    /// Get or create a host.
    pub fn add_host(&mut self, name: &str) -> &mut Host {
        self.hosts
            .entry(name.to_string())
            .or_insert_with(|| Host::new(name))
    }

    /// Get or create a group.
    pub fn add_group(&mut self, name: &str) -> &mut Group {
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| Group::new(name))
    }

    /// Declare `host` as a direct member of `group`.
    pub fn add_host_to_group(&mut self, host: &str, group: &str) {
        self.add_group(group);
        self.add_host(host).direct_groups.insert(group.to_string());
    }

    /// Declare `child` as a direct child of `parent`.
    pub fn add_child(&mut self, parent: &str, child: &str) {
        self.add_group(parent).children.insert(child.to_string());
        self.add_group(child).parents.insert(parent.to_string());
    }

    /// Recompute every derived field: ancestors, memberships and effective
    /// variables.
    pub fn reconcile(&mut self) {
        // 1. Clear computed state.
        for host in self.hosts.values_mut() {
            host.groups.clear();
            host.vars.clear();
        }
        for group in self.groups.values_mut() {
            group.clear_computed();
        }

        // 2. Synthetic groups.
        self.add_group(ALL);
        self.add_child(ALL, UNGROUPED);

        // 3. Register direct groups (and referenced parents) of every host.
        let mut referenced = BTreeSet::new();
        for host in self.hosts.values_mut() {
            let grouped = host
                .direct_groups
                .iter()
                .any(|g| g != ALL && g != UNGROUPED);
            if grouped {
                host.direct_groups.remove(UNGROUPED);
            } else {
                host.direct_groups.insert(UNGROUPED.to_string());
            }
            referenced.extend(host.direct_groups.iter().cloned());
        }
        for group in self.groups.values() {
            referenced.extend(group.parents.iter().cloned());
            referenced.extend(group.children.iter().cloned());
        }
        for name in referenced {
            self.add_group(&name);
        }

        // 4. Link ancestors and descendants.
        let names: Vec<String> = self.groups.keys().cloned().collect();
        for name in names.iter().filter(|n| *n != ALL) {
            self.add_child(ALL, name);
        }
        for name in &names {
            let ancestors = self.ancestors(name);
            for ancestor in &ancestors {
                if let Some(group) = self.groups.get_mut(ancestor) {
                    group.all_children.insert(name.clone());
                }
            }
            if let Some(group) = self.groups.get_mut(name) {
                group.all_parents = ancestors;
            }
        }

        // 5. Propagate hosts into every ancestor group.
        for host in self.hosts.values_mut() {
            let mut groups = host.direct_groups.clone();
            for direct in &host.direct_groups {
                if let Some(group) = self.groups.get(direct) {
                    groups.extend(group.all_parents.iter().cloned());
                }
            }
            for name in &groups {
                if let Some(group) = self.groups.get_mut(name) {
                    group.hosts.insert(host.name.clone());
                }
            }
            host.groups = groups;
        }

        // 6. Group variables, memoized over parents.
        let mut done = HashSet::new();
        for name in &names {
            self.compute_group_vars(name, &mut done, &mut HashSet::new());
        }

        // 7. Host variables.
        let resolved: Vec<(String, Vars)> = self
            .hosts
            .iter()
            .map(|(name, host)| (name.clone(), self.resolve_host_vars(host)))
            .collect();
        for (name, vars) in resolved {
            if let Some(host) = self.hosts.get_mut(&name) {
                host.vars = vars;
            }
        }
    }

    /// Effective variables of one host.
    ///
    /// Ancestors are merged farthest first (`all` lowest); the inventory vars
    /// of every ancestor go in before any ancestor file vars, and likewise for
    /// the direct groups.
    fn resolve_host_vars(&self, host: &Host) -> Vars {
        let direct: Vec<&Group> = host
            .direct_groups
            .iter()
            .filter(|g| *g != ALL)
            .filter_map(|g| self.groups.get(g))
            .collect();
        let ancestors: Vec<&Group> = self
            .ordered_groups(host)
            .iter()
            .rev()
            .filter(|g| !direct.iter().any(|d| &d.name == *g))
            .filter_map(|g| self.groups.get(g))
            .collect();

        let mut vars = Vars::new();
        for layer in [&ancestors, &direct] {
            for group in layer {
                merge(&mut vars, &group.inventory_vars);
            }
            for group in layer {
                merge(&mut vars, &group.file_vars);
            }
        }
        merge(&mut vars, &host.inventory_vars);
        merge(&mut vars, &host.file_vars);
        vars
    }

    /// Transitive parents of a group, tolerating cycles.
    fn ancestors(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: Vec<String> = self
            .groups
            .get(name)
            .map(|g| g.parents.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(current) = queue.pop() {
            if current == name || !seen.insert(current.clone()) {
                continue;
            }
            if let Some(group) = self.groups.get(&current) {
                queue.extend(group.parents.iter().cloned());
            }
        }
        seen
    }

    fn compute_group_vars(
        &mut self,
        name: &str,
        done: &mut HashSet<String>,
        visiting: &mut HashSet<String>,
    ) {
        if done.contains(name) || !visiting.insert(name.to_string()) {
            return;
        }

        let parents = match self.groups.get(name) {
            Some(group) => ordered_parents(&group.parents),
            None => return,
        };
        for parent in &parents {
            self.compute_group_vars(parent, done, visiting);
        }

        let mut all_inventory = Vars::new();
        let mut all_file = Vars::new();
        let mut vars = Vars::new();
        for parent in &parents {
            if let Some(p) = self.groups.get(parent) {
                merge(&mut all_inventory, &p.all_inventory_vars);
                merge(&mut all_file, &p.all_file_vars);
                merge(&mut vars, &p.vars);
            }
        }

        if let Some(group) = self.groups.get_mut(name) {
            merge(&mut all_inventory, &group.inventory_vars);
            merge(&mut all_file, &group.file_vars);
            merge(&mut vars, &group.inventory_vars);
            merge(&mut vars, &group.file_vars);
            group.all_inventory_vars = all_inventory;
            group.all_file_vars = all_file;
            group.vars = vars;
        }

        visiting.remove(name);
        done.insert(name.to_string());
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Hosts whose name matches a shell glob.
    pub fn match_hosts(&self, pattern: &str) -> Result<BTreeMap<&str, &Host>> {
        let pattern = compile(pattern)?;
        Ok(self
            .hosts
            .iter()
            .filter(|(name, _)| pattern.matches(name))
            .map(|(name, host)| (name.as_str(), host))
            .collect())
    }

    /// Groups whose name matches a shell glob.
    pub fn match_groups(&self, pattern: &str) -> Result<BTreeMap<&str, &Group>> {
        let pattern = compile(pattern)?;
        Ok(self
            .groups
            .iter()
            .filter(|(name, _)| pattern.matches(name))
            .map(|(name, group)| (name.as_str(), group))
            .collect())
    }

    /// Groups of a host, nearest first.
    ///
    /// Breadth-first from the direct groups, lexicographic within a level,
    /// with `all` appended last.
    pub fn list_groups_ordered(&self, host: &str) -> Result<Vec<String>> {
        let host = self
            .hosts
            .get(host)
            .ok_or_else(|| Error::HostNotExists(host.to_string()))?;
        Ok(self.ordered_groups(host))
    }

    fn ordered_groups(&self, host: &Host) -> Vec<String> {
        let mut ordered = Vec::new();
        let mut seen = HashSet::new();
        let mut level: BTreeSet<String> = host
            .direct_groups
            .iter()
            .filter(|g| *g != ALL)
            .cloned()
            .collect();

        while !level.is_empty() {
            let mut next = BTreeSet::new();
            for name in level {
                if !seen.insert(name.clone()) {
                    continue;
                }
                if let Some(group) = self.groups.get(&name) {
                    next.extend(group.parents.iter().filter(|p| *p != ALL).cloned());
                }
                ordered.push(name);
            }
            level = next;
        }

        ordered.push(ALL.to_string());
        ordered
    }

    /// Groups of a host matching a glob, nearest first.
    pub fn match_groups_ordered(&self, host: &str, pattern: &str) -> Result<Vec<String>> {
        let pattern = compile(pattern)?;
        Ok(self
            .list_groups_ordered(host)?
            .into_iter()
            .filter(|g| pattern.matches(g))
            .collect())
    }

    // ------------------------------------------------------------------------
    // Case folding
    // ------------------------------------------------------------------------

    /// Lowercase every host name, including references from groups.
    pub fn hosts_to_lower(&mut self) {
        let hosts = std::mem::take(&mut self.hosts);
        for (name, mut host) in hosts {
            let lower = name.to_lowercase();
            host.name = lower.clone();
            match self.hosts.get_mut(&lower) {
                Some(existing) => merge_host(existing, host),
                None => {
                    self.hosts.insert(lower, host);
                }
            }
        }
        for group in self.groups.values_mut() {
            group.hosts = lower_set(&group.hosts);
        }
    }

    /// Lowercase every group name, including references from hosts and
    /// other groups.
    pub fn groups_to_lower(&mut self) {
        let groups = std::mem::take(&mut self.groups);
        for (name, mut group) in groups {
            let lower = name.to_lowercase();
            group.name = lower.clone();
            group.parents = lower_set(&group.parents);
            group.all_parents = lower_set(&group.all_parents);
            group.children = lower_set(&group.children);
            group.all_children = lower_set(&group.all_children);
            match self.groups.get_mut(&lower) {
                Some(existing) => merge_group(existing, group),
                None => {
                    self.groups.insert(lower, group);
                }
            }
        }
        for host in self.hosts.values_mut() {
            host.direct_groups = lower_set(&host.direct_groups);
            host.groups = lower_set(&host.groups);
        }
    }
}

fn compile(pattern: &str) -> Result<glob::Pattern> {
    glob::Pattern::new(pattern).map_err(|e| Error::Parse(format!("pattern {}: {}", pattern, e)))
}

/// Parents in merge order: `all` first (lowest priority), then by name.
fn ordered_parents(parents: &BTreeSet<String>) -> Vec<String> {
    let mut ordered: Vec<String> = parents.iter().filter(|p| *p != ALL).cloned().collect();
    if parents.contains(ALL) {
        ordered.insert(0, ALL.to_string());
    }
    ordered
}

fn merge(into: &mut Vars, from: &Vars) {
    for (k, v) in from {
        into.insert(k.clone(), v.clone());
    }
}

fn lower_set(set: &BTreeSet<String>) -> BTreeSet<String> {
    set.iter().map(|s| s.to_lowercase()).collect()
}

fn merge_host(into: &mut Host, from: Host) {
    into.port = into.port.or(from.port);
    merge(&mut into.inventory_vars, &from.inventory_vars);
    merge(&mut into.file_vars, &from.file_vars);
    merge(&mut into.vars, &from.vars);
    into.direct_groups.extend(from.direct_groups);
    into.groups.extend(from.groups);
}

fn merge_group(into: &mut Group, from: Group) {
    into.parents.extend(from.parents);
    into.all_parents.extend(from.all_parents);
    into.children.extend(from.children);
    into.all_children.extend(from.all_children);
    into.hosts.extend(from.hosts);
    merge(&mut into.inventory_vars, &from.inventory_vars);
    merge(&mut into.file_vars, &from.file_vars);
    merge(&mut into.all_inventory_vars, &from.all_inventory_vars);
    merge(&mut into.all_file_vars, &from.all_file_vars);
    merge(&mut into.vars, &from.vars);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sample() -> Inventory {
        let mut inv = Inventory::default();
        inv.add_host_to_group("web1", "web");
        inv.add_host_to_group("db1", "db");
        inv.add_host("lonely");
        inv.add_child("prod", "web");
        inv.add_child("prod", "db");
        inv.add_child("eu", "web");
        inv.reconcile();
        inv
    }

    #[test]
    fn test_synthetic_groups_exist() {
        let inv = Inventory::new();
        assert!(inv.group(ALL).is_some());
        assert!(inv.group(UNGROUPED).unwrap().parents.contains(ALL));
    }

    #[test]
    fn test_every_group_has_all_as_parent() {
        let inv = sample();
        for (name, group) in &inv.groups {
            if name != ALL {
                assert!(group.parents.contains(ALL), "{} lacks all", name);
            }
        }
    }

    #[test]
    fn test_host_groups_contain_ancestors() {
        let inv = sample();
        let web1 = inv.host("web1").unwrap();
        for g in ["web", "prod", "eu", ALL] {
            assert!(web1.groups.contains(g), "missing {}", g);
        }
        assert!(!web1.groups.contains(UNGROUPED));

        let lonely = inv.host("lonely").unwrap();
        assert!(lonely.direct_groups.contains(UNGROUPED));
        assert!(lonely.groups.contains(ALL));
        assert!(inv.group("prod").unwrap().hosts.contains("web1"));
        assert!(inv.group(ALL).unwrap().hosts.contains("lonely"));
    }

    #[test]
    fn test_variable_precedence() {
        let mut inv = sample();
        inv.add_group(ALL).inventory_vars = vars(&[("a", "all-inv"), ("b", "all-inv")]);
        inv.add_group(ALL).file_vars = vars(&[("b", "all-file"), ("c", "all-file")]);
        inv.add_group("web").inventory_vars = vars(&[("c", "web-inv"), ("d", "web-inv")]);
        inv.add_group("web").file_vars = vars(&[("d", "web-file"), ("e", "web-file")]);
        inv.add_host("web1").inventory_vars = vars(&[("e", "host-inv"), ("f", "host-inv")]);
        inv.add_host("web1").file_vars = vars(&[("f", "host-file")]);
        inv.reconcile();

        let host = inv.host("web1").unwrap();
        assert_eq!(host.var("a"), Some("all-inv"));
        assert_eq!(host.var("b"), Some("all-file"));
        assert_eq!(host.var("c"), Some("web-inv"));
        assert_eq!(host.var("d"), Some("web-file"));
        assert_eq!(host.var("e"), Some("host-inv"));
        assert_eq!(host.var("f"), Some("host-file"));
    }

    #[test]
    fn test_direct_group_vars_outrank_ancestors_of_other_direct_groups() {
        let mut inv = Inventory::default();
        inv.add_host_to_group("h1", "a");
        inv.add_host_to_group("h1", "b");
        inv.add_group("a").inventory_vars = vars(&[("x", "a")]);
        inv.add_group(ALL).inventory_vars = vars(&[("x", "f"), ("y", "f")]);
        inv.reconcile();

        let host = inv.host("h1").unwrap();
        assert_eq!(host.var("x"), Some("a"));
        assert_eq!(host.var("y"), Some("f"));
    }

    #[test]
    fn test_ancestor_file_vars_stay_below_direct_inventory_vars() {
        let mut inv = Inventory::default();
        inv.add_host_to_group("h1", "web");
        inv.add_host_to_group("h1", "zone");
        inv.add_child("prod", "zone");
        inv.add_group("prod").file_vars = vars(&[("role", "prod-file"), ("tier", "prod-file")]);
        inv.add_group("web").inventory_vars = vars(&[("role", "web-inv")]);
        inv.add_group("zone").file_vars = vars(&[("tier", "zone-file")]);
        inv.reconcile();

        let host = inv.host("h1").unwrap();
        assert_eq!(host.var("role"), Some("web-inv"));
        assert_eq!(host.var("tier"), Some("zone-file"));
    }

    #[test]
    fn test_direct_group_vars_reach_host() {
        let mut inv = sample();
        inv.add_group("db").inventory_vars = vars(&[("port", "5432")]);
        inv.reconcile();
        assert_eq!(inv.host("db1").unwrap().var("port"), Some("5432"));
        assert_eq!(inv.host("web1").unwrap().var("port"), None);
    }

    #[test]
    fn test_cycles_are_tolerated() {
        let mut inv = Inventory::default();
        inv.add_child("a", "b");
        inv.add_child("b", "a");
        inv.add_host_to_group("h", "a");
        inv.add_group("b").inventory_vars = vars(&[("x", "1")]);
        inv.reconcile();

        let host = inv.host("h").unwrap();
        assert!(host.groups.contains("b"));
        assert_eq!(host.var("x"), Some("1"));
        assert_eq!(
            inv.list_groups_ordered("h").unwrap(),
            vec!["a", "b", ALL]
        );
    }

    #[test]
    fn test_list_groups_ordered_is_breadth_first() {
        let inv = sample();
        assert_eq!(
            inv.list_groups_ordered("web1").unwrap(),
            vec!["web", "eu", "prod", ALL]
        );
        assert!(matches!(
            inv.list_groups_ordered("nope"),
            Err(Error::HostNotExists(_))
        ));
    }

    #[test]
    fn test_match_hosts_and_groups() {
        let inv = sample();
        let hosts = inv.match_hosts("*1").unwrap();
        assert_eq!(hosts.keys().copied().collect::<Vec<_>>(), vec!["db1", "web1"]);

        let groups = inv.match_groups("[dw]*").unwrap();
        assert_eq!(groups.keys().copied().collect::<Vec<_>>(), vec!["db", "web"]);

        assert_eq!(
            inv.match_groups_ordered("web1", "p*").unwrap(),
            vec!["prod"]
        );
    }

    #[test]
    fn test_case_folding_is_idempotent() {
        let mut inv = Inventory::default();
        inv.add_host_to_group("Web1", "WEB");
        inv.reconcile();

        inv.hosts_to_lower();
        inv.groups_to_lower();
        let once = inv.clone();
        inv.hosts_to_lower();
        inv.groups_to_lower();

        assert_eq!(inv, once);
        assert!(inv.host("web1").unwrap().direct_groups.contains("web"));
        assert!(inv.group("web").unwrap().hosts.contains("web1"));
    }
}
