// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process model types.
//!
//! A [`Process`] is an ordered list of [`Node`]s bound to a set of hosts, plus
//! a list of named handlers that nodes can reference through `catch`,
//! `finish` and `notify`.

use std::collections::{BTreeMap, HashSet};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{ProcessError, Result};

// ============================================================================
// Root Types
// ============================================================================

/// Complete process definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Process {
    /// Process identifier (defaults to the name)
    #[serde(default)]
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Detailed description of what the process does
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,

    /// Hosts every task runs on unless the task names its own
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,

    /// Main flow, executed in order
    #[serde(default)]
    pub tasks: Vec<Node>,

    /// Named handlers referenced by `catch`, `finish` and `notify`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<Node>,
}

impl Process {
    /// Parse a process from YAML.
    pub fn from_yaml(source: &str) -> Result<Self> {
        let mut process: Process = serde_yaml::from_str(source)?;
        process.normalize();
        Ok(process)
    }

    /// Parse a process from JSON.
    pub fn from_json(source: &str) -> Result<Self> {
        let mut process: Process = serde_json::from_str(source)?;
        process.normalize();
        Ok(process)
    }

    /// Fill in missing identifiers.
    ///
    /// Nodes without an id get a positional one (`<parent>-<index>`), so the
    /// same document always yields the same ids.
    pub fn normalize(&mut self) {
        if self.id.is_empty() {
            self.id = self.name.clone();
        }
        for (index, node) in self.tasks.iter_mut().enumerate() {
            node.normalize(&format!("task-{}", index));
        }
        for (index, node) in self.handlers.iter_mut().enumerate() {
            node.normalize(&format!("handler-{}", index));
        }
    }

    /// Find a handler by name.
    pub fn handler(&self, name: &str) -> Option<&Node> {
        self.handlers.iter().find(|h| h.name() == name)
    }

    /// Check that every handler reference resolves and that handler names and
    /// node ids are unique.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProcessError::Invalid("process name is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for handler in &self.handlers {
            if !seen.insert(handler.name()) {
                return Err(ProcessError::Invalid(format!(
                    "duplicate handler '{}'",
                    handler.name()
                )));
            }
        }

        fn check(process: &Process, nodes: &[Node]) -> Result<()> {
            for node in nodes {
                for reference in node.references() {
                    if process.handler(reference).is_none() {
                        return Err(ProcessError::UnknownHandler(reference.to_string()));
                    }
                }
                if let Node::Process(child) = node {
                    check(process, &child.tasks)?;
                }
            }
            Ok(())
        }

        check(self, &self.tasks)?;
        check(self, &self.handlers)?;
        self.check_ids()
    }

    /// Node ids share one namespace with the start/end events of the
    /// process and of every child process.
    fn check_ids(&self) -> Result<()> {
        let mut reserved = HashSet::new();
        reserve(&mut reserved, &self.id);

        fn collect<'a>(nodes: &'a [Node], ids: &mut Vec<&'a str>, reserved: &mut HashSet<String>) {
            for node in nodes {
                ids.push(node.id());
                if let Node::Process(child) = node {
                    reserve(reserved, &child.id);
                    collect(&child.tasks, ids, reserved);
                }
            }
        }

        let mut ids = Vec::new();
        collect(&self.tasks, &mut ids, &mut reserved);
        collect(&self.handlers, &mut ids, &mut reserved);

        let mut seen = HashSet::new();
        for id in ids {
            if id.is_empty() {
                return Err(ProcessError::Invalid("node without an id".to_string()));
            }
            if reserved.contains(id) {
                return Err(ProcessError::Invalid(format!(
                    "node id '{}' collides with a start or end event",
                    id
                )));
            }
            if !seen.insert(id) {
                return Err(ProcessError::Invalid(format!("duplicate node id '{}'", id)));
            }
        }
        Ok(())
    }
}

fn reserve(reserved: &mut HashSet<String>, id: &str) {
    reserved.insert(format!("{}-start", id));
    reserved.insert(format!("{}-end", id));
}

// ============================================================================
// Nodes
// ============================================================================

/// A single action bound to hosts.
///
/// Also the shape of a [`Node::Service`]; services differ only in being
/// long-running on the remote side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,

    /// Host selector; empty means "the process hosts"
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,

    /// Dotted `module.sub` action
    #[serde(default)]
    pub action: String,

    /// Arguments rendered as `key=value` for the module
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, Value>,

    /// Handler run when this task fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch: Option<String>,

    /// Handler run after this task, whatever the outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<String>,

    /// Handlers scheduled after the main flow when this task succeeds
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<String>,
}

impl Task {
    /// Render the module invocation: action followed by `k=v` pairs.
    ///
    /// Values containing whitespace or quotes are single-quoted so the
    /// receiving tokenizer yields them back as one word.
    pub fn shell(&self) -> String {
        let mut parts = vec![self.action.clone()];
        for (key, value) in &self.args {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            parts.push(format!("{}={}", key, quote_word(&value)));
        }
        parts.join(" ")
    }
}

fn quote_word(word: &str) -> String {
    let needs_quotes = word.is_empty()
        || word
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '\\'));
    if !needs_quotes {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// A nested sequence of nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChildProcess {
    #[serde(default)]
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub tasks: Vec<Node>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<String>,
}

/// Tagged sum of process nodes.
///
/// Decoded by looking up the `kind` key; a map without `kind` is a task.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Task(Task),
    Process(ChildProcess),
    Service(Task),
}

impl Node {
    /// Value of the `kind` key for this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Task(_) => "task",
            Node::Process(_) => "process",
            Node::Service(_) => "service",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Node::Task(t) | Node::Service(t) => &t.id,
            Node::Process(p) => &p.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Node::Task(t) | Node::Service(t) => &t.name,
            Node::Process(p) => &p.name,
        }
    }

    pub fn catch(&self) -> Option<&str> {
        match self {
            Node::Task(t) | Node::Service(t) => t.catch.as_deref(),
            Node::Process(p) => p.catch.as_deref(),
        }
    }

    pub fn finish(&self) -> Option<&str> {
        match self {
            Node::Task(t) | Node::Service(t) => t.finish.as_deref(),
            Node::Process(p) => p.finish.as_deref(),
        }
    }

    pub fn notify(&self) -> &[String] {
        match self {
            Node::Task(t) | Node::Service(t) => &t.notify,
            Node::Process(p) => &p.notify,
        }
    }

    /// Every handler name this node refers to.
    fn references(&self) -> impl Iterator<Item = &str> {
        self.catch()
            .into_iter()
            .chain(self.finish())
            .chain(self.notify().iter().map(String::as_str))
    }

    fn normalize(&mut self, fallback_id: &str) {
        match self {
            Node::Task(t) | Node::Service(t) => {
                if t.id.is_empty() {
                    t.id = fallback_id.to_string();
                }
            }
            Node::Process(p) => {
                if p.id.is_empty() {
                    p.id = fallback_id.to_string();
                }
                let parent = p.id.clone();
                for (index, child) in p.tasks.iter_mut().enumerate() {
                    child.normalize(&format!("{}-{}", parent, index));
                }
            }
        }
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("task")
            .to_string();

        match kind.as_str() {
            "task" => serde_json::from_value(value)
                .map(Node::Task)
                .map_err(D::Error::custom),
            "process" => serde_json::from_value(value)
                .map(Node::Process)
                .map_err(D::Error::custom),
            "service" => serde_json::from_value(value)
                .map(Node::Service)
                .map_err(D::Error::custom),
            other => Err(D::Error::custom(format!("unknown node kind '{}'", other))),
        }
    }
}

impl Serialize for Node {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::Error as _;

        let mut value = match self {
            Node::Task(t) | Node::Service(t) => serde_json::to_value(t),
            Node::Process(p) => serde_json::to_value(p),
        }
        .map_err(S::Error::custom)?;

        if let Value::Object(map) = &mut value {
            map.insert("kind".to_string(), Value::String(self.kind().to_string()));
        }
        value.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOY: &str = r#"
name: deploy
hosts: [web-1, web-2]
tasks:
  - name: ping
    action: ping
    args:
      data: pong
  - kind: process
    name: nginx
    hosts: [web-1]
    tasks:
      - name: install
        action: package.install
        args: { name: nginx }
        notify: [restart]
  - kind: service
    name: tail
    action: log.follow
handlers:
  - name: restart
    action: service.restart
"#;

    #[test]
    fn test_kind_defaults_to_task() {
        let process = Process::from_yaml(DEPLOY).unwrap();
        assert!(matches!(process.tasks[0], Node::Task(_)));
        assert!(matches!(process.tasks[1], Node::Process(_)));
        assert!(matches!(process.tasks[2], Node::Service(_)));
    }

    #[test]
    fn test_normalize_assigns_positional_ids() {
        let process = Process::from_yaml(DEPLOY).unwrap();
        assert_eq!(process.id, "deploy");
        assert_eq!(process.tasks[0].id(), "task-0");
        let Node::Process(child) = &process.tasks[1] else {
            panic!("expected child process");
        };
        assert_eq!(child.tasks[0].id(), "task-1-0");
        assert_eq!(process.handlers[0].id(), "handler-0");
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let err = Process::from_yaml("name: x\ntasks:\n  - kind: gateway\n    name: g\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_handler() {
        let mut process = Process::from_yaml(DEPLOY).unwrap();
        process.handlers.clear();
        assert!(matches!(
            process.validate(),
            Err(ProcessError::UnknownHandler(name)) if name == "restart"
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let process = Process::from_yaml(
            "name: dup\ntasks:\n  - id: x\n    name: a\n    action: ping\n  - id: x\n    name: b\n    action: ping\n",
        )
        .unwrap();
        assert!(matches!(process.validate(), Err(ProcessError::Invalid(msg)) if msg.contains("'x'")));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids_in_child_process() {
        let process = Process::from_yaml(
            r#"
name: nested
tasks:
  - id: setup
    name: setup
    action: ping
  - kind: process
    name: child
    tasks:
      - id: setup
        name: again
        action: ping
"#,
        )
        .unwrap();
        assert!(matches!(process.validate(), Err(ProcessError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_start_and_end_ids() {
        for id in ["site-start", "site-end"] {
            let source = format!("name: site\ntasks:\n  - id: {}\n    name: a\n    action: ping\n", id);
            let process = Process::from_yaml(&source).unwrap();
            assert!(matches!(process.validate(), Err(ProcessError::Invalid(_))), "{}", id);
        }

        let process = Process::from_yaml(
            r#"
name: site
tasks:
  - kind: process
    id: inner
    name: inner
    tasks:
      - id: inner-end
        name: a
        action: ping
"#,
        )
        .unwrap();
        assert!(matches!(process.validate(), Err(ProcessError::Invalid(_))));
    }

    #[test]
    fn test_positional_ids_validate() {
        let process = Process::from_yaml(DEPLOY).unwrap();
        process.validate().unwrap();
    }

    #[test]
    fn test_node_serializes_kind() {
        let process = Process::from_yaml(DEPLOY).unwrap();
        let json = serde_json::to_value(&process.tasks[2]).unwrap();
        assert_eq!(json["kind"], "service");

        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back, process.tasks[2]);
    }

    #[test]
    fn test_task_shell_rendering() {
        let mut task = Task {
            action: "copy".to_string(),
            ..Default::default()
        };
        task.args.insert("src".to_string(), Value::String("/tmp/a b".into()));
        task.args.insert("mode".to_string(), Value::from(644));
        assert_eq!(task.shell(), "copy mode=644 src='/tmp/a b'");
    }

    #[test]
    fn test_quote_word_escapes_single_quotes() {
        assert_eq!(quote_word("it's"), r"'it'\''s'");
        assert_eq!(quote_word(""), "''");
        assert_eq!(quote_word("plain"), "plain");
    }
}
