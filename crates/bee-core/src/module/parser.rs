// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Argument binding for module commands.
//!
//! A module's command tree is turned into a `clap` command on the fly. Before
//! parsing, the argument vector is normalised:
//!
//! - a dotted first word (`copy.windows`) becomes a subcommand path;
//! - `key=value` words become `--key=value`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, value_parser};

use super::{Command, Module, ParamKind, ParamValue, parse_duration};
use crate::error::{Error, Result};

/// A command bound to its arguments.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub module: Arc<Module>,
    /// Subcommand names below the module's root command
    pub path: Vec<String>,
    pub flags: BTreeMap<String, ParamValue>,
}

impl Invocation {
    /// The bound command node.
    pub fn command(&self) -> &Command {
        self.module
            .command
            .descend(&self.path)
            .unwrap_or(&self.module.command)
    }

    pub fn flag(&self, name: &str) -> Option<&ParamValue> {
        self.flags.get(name)
    }

    /// String form of a flag.
    pub fn flag_str(&self, name: &str) -> Option<String> {
        self.flags.get(name).map(ToString::to_string)
    }

    /// Flags rendered as `--key=value`, in name order.
    pub fn cli_args(&self) -> Vec<String> {
        self.flags
            .iter()
            .map(|(key, value)| format!("--{}={}", key, value))
            .collect()
    }
}

/// Rewrite an argument vector into clap's form.
///
/// The first word, if dotted and not a flag, is split into a subcommand path;
/// bare `key=value` words become `--key=value`.
pub fn normalize(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut words = args.iter();

    if let Some(first) = args.first()
        && first.contains('.')
        && !first.contains(['-', '=', '/', '\\'])
    {
        out.extend(first.split('.').filter(|s| !s.is_empty()).map(str::to_string));
        words.next();
    }

    for word in words {
        if !word.starts_with('-') && word.contains('=') {
            out.push(format!("--{}", word));
        } else {
            out.push(word.clone());
        }
    }
    out
}

fn build(command: &Command) -> clap::Command {
    let mut cli = clap::Command::new(command.name.clone())
        .disable_help_subcommand(true)
        .disable_version_flag(true)
        .subcommand_negates_reqs(true);
    if !command.short.is_empty() {
        cli = cli.about(command.short.clone());
    }
    if !command.desc.is_empty() {
        cli = cli.long_about(command.desc.clone());
    }

    for param in &command.params {
        let mut arg = Arg::new(param.name.clone())
            .long(param.name.clone())
            .action(ArgAction::Set)
            .required(param.required && param.default.is_none());
        if !param.desc.is_empty() {
            arg = arg.help(param.desc.clone());
        }
        if let Some(default) = &param.default {
            arg = arg.default_value(default.clone());
        }
        arg = match param.kind {
            ParamKind::String => arg.value_parser(value_parser!(String)),
            ParamKind::Int => arg.value_parser(value_parser!(i64)),
            ParamKind::Uint => arg.value_parser(value_parser!(u64)),
            ParamKind::Float => arg.value_parser(value_parser!(f64)),
            ParamKind::Duration => arg.value_parser(parse_duration),
        };
        cli = cli.arg(arg);
    }

    for child in &command.children {
        cli = cli.subcommand(build(child));
    }
    cli
}

fn bind(command: &Command, matches: &ArgMatches) -> BTreeMap<String, ParamValue> {
    let mut flags = BTreeMap::new();
    for param in &command.params {
        let name = param.name.as_str();
        let value = match param.kind {
            ParamKind::String => matches.get_one::<String>(name).cloned().map(ParamValue::String),
            ParamKind::Int => matches.get_one::<i64>(name).copied().map(ParamValue::Int),
            ParamKind::Uint => matches.get_one::<u64>(name).copied().map(ParamValue::Uint),
            ParamKind::Float => matches.get_one::<f64>(name).copied().map(ParamValue::Float),
            ParamKind::Duration => matches
                .get_one::<Duration>(name)
                .copied()
                .map(ParamValue::Duration),
        };
        if let Some(value) = value {
            flags.insert(param.name.clone(), value);
        }
    }
    flags
}

/// Bind `args` against `module`.
///
/// `path` is the subcommand path already resolved from the module name; a
/// dotted first word in `args` extends it.
pub fn parse(module: Arc<Module>, path: &[String], args: &[String]) -> Result<Invocation> {
    let mut argv = vec![module.command.name.clone()];
    argv.extend(path.iter().cloned());
    argv.extend(normalize(args));

    let matches = build(&module.command)
        .try_get_matches_from(&argv)
        .map_err(|e| Error::Parse(format!("{}: {}", module.name, e.render().to_string().trim())))?;

    let mut command = &module.command;
    let mut matches = &matches;
    let mut bound_path = Vec::new();
    while let Some((name, sub)) = matches.subcommand() {
        command = command
            .child(name)
            .ok_or_else(|| Error::Parse(format!("{}: unknown subcommand '{}'", module.name, name)))?;
        bound_path.push(name.to_string());
        matches = sub;
    }

    let flags = bind(command, matches);
    Ok(Invocation {
        module,
        path: bound_path,
        flags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Hooks, Param};
    use std::path::PathBuf;

    fn param(name: &str, kind: ParamKind, default: Option<&str>) -> Param {
        Param {
            name: name.to_string(),
            kind,
            desc: String::new(),
            default: default.map(str::to_string),
            required: false,
        }
    }

    fn command(name: &str, params: Vec<Param>, children: Vec<Command>) -> Command {
        Command {
            name: name.to_string(),
            short: String::new(),
            desc: String::new(),
            script: Some(PathBuf::from(format!("/modules/{}.tengo", name))),
            params,
            children,
            hooks: Hooks::default(),
        }
    }

    fn module() -> Arc<Module> {
        let windows = command("windows", vec![param("src", ParamKind::String, None)], vec![]);
        let root = command(
            "copy",
            vec![
                param("src", ParamKind::String, None),
                param("mode", ParamKind::Uint, Some("420")),
                param("timeout", ParamKind::Duration, Some("30s")),
            ],
            vec![windows],
        );
        Arc::new(Module {
            name: "bee.builtin.copy".to_string(),
            command: root,
            dir: PathBuf::from("/modules/copy"),
            relpath: "bee/builtin/copy".to_string(),
        })
    }

    fn strings(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize(&strings(&["copy.windows", "src=/tmp/a", "--mode=644", "-v"])),
            strings(&["copy", "windows", "--src=/tmp/a", "--mode=644", "-v"])
        );
        assert_eq!(
            normalize(&strings(&["src=a.b"])),
            strings(&["--src=a.b"])
        );
    }

    #[test]
    fn test_key_value_sets_flag() {
        let invocation = parse(module(), &[], &strings(&["src=/tmp/a"])).unwrap();
        assert!(invocation.path.is_empty());
        assert_eq!(
            invocation.flag("src"),
            Some(&ParamValue::String("/tmp/a".into()))
        );
    }

    #[test]
    fn test_defaults_apply() {
        let invocation = parse(module(), &[], &[]).unwrap();
        assert_eq!(invocation.flag("mode"), Some(&ParamValue::Uint(420)));
        assert_eq!(
            invocation.flag("timeout"),
            Some(&ParamValue::Duration(Duration::from_secs(30)))
        );
        assert_eq!(invocation.flag("src"), None);
        assert_eq!(invocation.cli_args(), vec!["--mode=420", "--timeout=30s"]);
    }

    #[test]
    fn test_subcommand_path() {
        let from_name = parse(module(), &strings(&["windows"]), &strings(&["src=x"])).unwrap();
        assert_eq!(from_name.path, vec!["windows"]);
        assert_eq!(from_name.command().name, "windows");

        let from_args = parse(module(), &[], &strings(&["windows", "src=x"])).unwrap();
        assert_eq!(from_args.path, vec!["windows"]);
    }

    #[test]
    fn test_typed_values_are_checked() {
        let err = parse(module(), &[], &strings(&["mode=rw"])).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));

        let err = parse(module(), &[], &strings(&["unknown=1"])).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}
