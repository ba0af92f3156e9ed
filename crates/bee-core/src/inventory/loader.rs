// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! INI inventory loader.
//!
//! ```ini
//! # hosts before any section are ungrouped
//! jump bee_host=10.0.0.1:2222
//!
//! [web]
//! web-[01:03] bee_user=deploy
//! win1:5986 bee_connect=winrm
//!
//! [web:vars]
//! bee_home=/opt/bee
//!
//! [prod:children]
//! web
//!
//! [all:vars]
//! bee_platform=linux
//! ```
//!
//! Host patterns expand numeric (`[1:10]`, `[001:015:3]`, zero padding kept)
//! and alphabetic (`[a:f]`) ranges, several per pattern.

use std::path::Path;

use tracing::debug;

use super::{Inventory, UNGROUPED};
use crate::error::{Error, Result};
use crate::shell;

enum Section {
    Hosts(String),
    Vars(String),
    Children(String),
}

impl Section {
    fn group(&self) -> &str {
        match self {
            Section::Hosts(g) | Section::Vars(g) | Section::Children(g) => g,
        }
    }
}

/// Load and reconcile an inventory file.
pub fn load(path: impl AsRef<Path>) -> Result<Inventory> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path)?;
    let inventory = parse(&source)?;
    debug!(path = %path.display(), hosts = inventory.hosts.len(), "inventory loaded");
    Ok(inventory)
}

/// Parse and reconcile inventory source.
pub fn parse(source: &str) -> Result<Inventory> {
    let mut inventory = Inventory::default();
    let mut section = Section::Hosts(UNGROUPED.to_string());

    for (index, raw) in source.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let lineno = index + 1;

        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = parse_header(header.trim(), lineno)?;
            inventory.add_group(section.group());
            continue;
        }

        match &section {
            Section::Hosts(group) => parse_host_line(&mut inventory, group, line, lineno)?,
            Section::Vars(group) => {
                let (key, value) = parse_var(line, lineno)?;
                inventory.add_group(group).inventory_vars.insert(key, value);
            }
            Section::Children(parent) => {
                let words = shell::split(line)?;
                let child = words.first().ok_or_else(|| {
                    Error::Parse(format!("line {}: expected a group name", lineno))
                })?;
                inventory.add_child(parent, child);
            }
        }
    }

    inventory.reconcile();
    Ok(inventory)
}

fn parse_header(header: &str, lineno: usize) -> Result<Section> {
    let (name, kind) = match header.split_once(':') {
        Some((name, kind)) => (name.trim(), Some(kind.trim())),
        None => (header, None),
    };
    if name.is_empty() {
        return Err(Error::Parse(format!("line {}: empty section name", lineno)));
    }
    match kind {
        None => Ok(Section::Hosts(name.to_string())),
        Some("vars") => Ok(Section::Vars(name.to_string())),
        Some("children") => Ok(Section::Children(name.to_string())),
        Some(other) => Err(Error::Parse(format!(
            "line {}: unknown section kind '{}'",
            lineno, other
        ))),
    }
}

fn parse_var(line: &str, lineno: usize) -> Result<(String, String)> {
    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| Error::Parse(format!("line {}: expected key=value", lineno)))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(Error::Parse(format!("line {}: empty variable name", lineno)));
    }
    let value = shell::split(value.trim())?.join(" ");
    Ok((key.to_string(), value))
}

fn parse_host_line(inventory: &mut Inventory, group: &str, line: &str, lineno: usize) -> Result<()> {
    let words = shell::split(line)?;
    let Some((pattern, pairs)) = words.split_first() else {
        return Ok(());
    };

    let (pattern, port) = split_port(pattern, lineno)?;

    let mut vars = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            Error::Parse(format!("line {}: expected key=value, got '{}'", lineno, pair))
        })?;
        vars.push((key.to_string(), value.to_string()));
    }

    let port = match vars.iter().find(|(k, _)| k == "bee_host") {
        Some((_, address)) => port.or(address_port(address)),
        None => port,
    };

    for name in expand(pattern)? {
        inventory.add_host_to_group(&name, group);
        let host = inventory.add_host(&name);
        if port.is_some() {
            host.port = port;
        }
        for (key, value) in &vars {
            host.inventory_vars.insert(key.clone(), value.clone());
        }
    }
    Ok(())
}

/// Split a trailing `:port` off a host pattern, ignoring colons inside
/// range brackets.
fn split_port(pattern: &str, lineno: usize) -> Result<(&str, Option<u16>)> {
    let mut depth = 0usize;
    let mut colon = None;
    for (i, c) in pattern.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => colon = Some(i),
            _ => {}
        }
    }
    match colon {
        Some(i) => {
            let port = pattern[i + 1..].parse::<u16>().map_err(|_| {
                Error::Parse(format!("line {}: invalid port in '{}'", lineno, pattern))
            })?;
            Ok((&pattern[..i], Some(port)))
        }
        None => Ok((pattern, None)),
    }
}

/// Port carried by an address such as `10.0.0.1:22`.
pub fn address_port(address: &str) -> Option<u16> {
    let (_, port) = address.rsplit_once(':')?;
    port.parse().ok()
}

/// Expand range brackets in a host pattern.
pub fn expand(pattern: &str) -> Result<Vec<String>> {
    let Some(open) = pattern.find('[') else {
        return Ok(vec![pattern.to_string()]);
    };
    let close = pattern[open..]
        .find(']')
        .map(|i| open + i)
        .ok_or_else(|| Error::Parse(format!("unterminated range in '{}'", pattern)))?;

    let prefix = &pattern[..open];
    let range = &pattern[open + 1..close];
    let rest = expand(&pattern[close + 1..])?;

    let mut names = Vec::new();
    for item in expand_range(range, pattern)? {
        for suffix in &rest {
            names.push(format!("{}{}{}", prefix, item, suffix));
        }
    }
    Ok(names)
}

fn expand_range(range: &str, pattern: &str) -> Result<Vec<String>> {
    let invalid = || Error::Parse(format!("invalid range '[{}]' in '{}'", range, pattern));

    let parts: Vec<&str> = range.split(':').collect();
    let (start, end, step) = match parts.as_slice() {
        [start, end] => (*start, *end, 1usize),
        [start, end, step] => (*start, *end, step.parse().map_err(|_| invalid())?),
        _ => return Err(invalid()),
    };
    if step == 0 {
        return Err(invalid());
    }

    if let (Ok(from), Ok(to)) = (start.parse::<u64>(), end.parse::<u64>()) {
        if from > to {
            return Err(invalid());
        }
        let width = if start.len() > 1 && start.starts_with('0') {
            start.len()
        } else {
            0
        };
        return Ok((from..=to)
            .step_by(step)
            .map(|n| format!("{:0width$}", n, width = width))
            .collect());
    }

    let mut from = start.chars();
    let mut to = end.chars();
    match (from.next(), from.next(), to.next(), to.next()) {
        (Some(a), None, Some(b), None) if a.is_ascii_alphabetic() && b.is_ascii_alphabetic() && a <= b => {
            Ok((a..=b).step_by(step).map(String::from).collect())
        }
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::ALL;

    #[test]
    fn test_host_line_with_address_port() {
        let inv = parse("host1 bee_host=10.0.0.1:22 bee_user=root\n").unwrap();
        let host = inv.host("host1").unwrap();
        assert_eq!(host.var("bee_host"), Some("10.0.0.1:22"));
        assert_eq!(host.var("bee_user"), Some("root"));
        assert_eq!(host.port, Some(22));
        assert!(host.direct_groups.contains(UNGROUPED));
    }

    #[test]
    fn test_group_precedence() {
        let inv = parse(
            "h1 x=a\n\
             [web]\n\
             h1\n\
             [web:vars]\n\
             x=c\n\
             [all:vars]\n\
             x=f\n",
        )
        .unwrap();
        let host = inv.host("h1").unwrap();
        assert_eq!(host.var("x"), Some("a"));
        assert!(host.direct_groups.contains("web"));
        assert!(!host.direct_groups.contains(UNGROUPED));
    }

    #[test]
    fn test_host_in_two_groups_keeps_group_var_over_all_vars() {
        let inv = parse("[a]\nh1\n[b]\nh1\n[a:vars]\nx=a\n[all:vars]\nx=f\n").unwrap();
        let host = inv.host("h1").unwrap();
        assert!(host.direct_groups.contains("a"));
        assert!(host.direct_groups.contains("b"));
        assert_eq!(host.var("x"), Some("a"));
    }

    #[test]
    fn test_children_and_group_vars() {
        let inv = parse(
            "; comment\n\
             [web]\n\
             web1:2222\n\
             [prod:children]\n\
             web\n\
             [prod:vars]\n\
             env = \"production eu\"\n",
        )
        .unwrap();
        let host = inv.host("web1").unwrap();
        assert_eq!(host.port, Some(2222));
        assert_eq!(host.var("env"), Some("production eu"));
        assert!(host.groups.contains("prod"));
        assert!(inv.group("prod").unwrap().parents.contains(ALL));
    }

    #[test]
    fn test_numeric_range_keeps_padding() {
        assert_eq!(
            expand("[001:015:3]").unwrap(),
            vec!["001", "004", "007", "010", "013"]
        );
        assert_eq!(expand("db[8:10]").unwrap(), vec!["db8", "db9", "db10"]);
    }

    #[test]
    fn test_alphabetic_range() {
        assert_eq!(
            expand("host-[a:c]-x").unwrap(),
            vec!["host-a-x", "host-b-x", "host-c-x"]
        );
    }

    #[test]
    fn test_multiple_ranges() {
        assert_eq!(
            expand("r[1:2]n[a:b]").unwrap(),
            vec!["r1na", "r1nb", "r2na", "r2nb"]
        );
    }

    #[test]
    fn test_invalid_ranges() {
        assert!(expand("h[3:1]").is_err());
        assert!(expand("h[1:3:0]").is_err());
        assert!(expand("h[1:3").is_err());
        assert!(expand("h[aa:b]").is_err());
    }

    #[test]
    fn test_range_with_port() {
        let inv = parse("[web]\nweb-[1:2]:8022\n").unwrap();
        assert_eq!(inv.host("web-1").unwrap().port, Some(8022));
        assert_eq!(inv.host("web-2").unwrap().port, Some(8022));
    }

    #[test]
    fn test_repeated_host_merges_vars() {
        let inv = parse("[a]\nh1 x=1\n[b]\nh1 y=2\n").unwrap();
        let host = inv.host("h1").unwrap();
        assert_eq!(host.var("x"), Some("1"));
        assert_eq!(host.var("y"), Some("2"));
        assert_eq!(host.direct_groups.len(), 2);
    }

    #[test]
    fn test_unknown_section_kind() {
        assert!(matches!(parse("[web:hosts]\n"), Err(Error::Parse(_))));
    }
}
