// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Definitions graph.
//!
//! A [`Process`] is compiled into a BPMN-like graph before it runs:
//!
//! ```text
//! (start) ──▶ [ScriptTask] ──▶ [SubProcess] ──▶ [ServiceTask] ──▶ (end)
//!                                  │
//!                          (start) ──▶ [ScriptTask] ──▶ (end)
//! ```
//!
//! Every activity element carries the JSON of the task it came from in its
//! `body` property; the trace consumer decodes it back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{ChildProcess, Node, Process, Task};

/// Property holding the JSON-encoded task.
pub const PROPERTY_BODY: &str = "body";
/// Property naming the handler run on failure.
pub const PROPERTY_CATCH: &str = "catch";
/// Property naming the handler run after the element.
pub const PROPERTY_FINISH: &str = "finish";
/// Property listing notified handlers, comma separated.
pub const PROPERTY_NOTIFY: &str = "notify";

/// Element kinds of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ElementKind {
    StartEvent,
    EndEvent,
    ScriptTask,
    ServiceTask,
    SubProcess { definitions: Box<Definitions> },
}

/// A node of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    pub name: String,
    pub kind: ElementKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl Element {
    fn new(id: impl Into<String>, name: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            properties: BTreeMap::new(),
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Whether the element is dispatched to the trace consumer.
    pub fn is_activity(&self) -> bool {
        matches!(self.kind, ElementKind::ScriptTask | ElementKind::ServiceTask)
    }

    /// Handlers listed in the `notify` property.
    pub fn notified(&self) -> Vec<&str> {
        self.property(PROPERTY_NOTIFY)
            .map(|s| s.split(',').filter(|n| !n.is_empty()).collect())
            .unwrap_or_default()
    }

    /// Decode the `body` property back into a task.
    pub fn task(&self) -> Result<Option<Task>> {
        match self.property(PROPERTY_BODY) {
            Some(body) => Ok(Some(serde_json::from_str(body)?)),
            None => Ok(None),
        }
    }
}

/// A directed edge between two elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
}

/// Compiled process graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definitions {
    pub id: String,
    pub name: String,
    /// ID of the start event
    pub start: String,
    pub elements: BTreeMap<String, Element>,
    pub flows: Vec<SequenceFlow>,
    /// Handler elements in declaration order, kept out of the main flow.
    /// Only populated at the top level.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<Element>,
}

impl Definitions {
    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    /// The single flow leaving `source`, if any.
    pub fn outgoing(&self, source: &str) -> Option<&SequenceFlow> {
        self.flows.iter().find(|f| f.source == source)
    }

    /// Resolve a handler element by handler name.
    pub fn handler(&self, name: &str) -> Option<&Element> {
        self.handlers.iter().find(|e| e.name == name)
    }

    /// Compile a process into its graph.
    ///
    /// Tasks inside a child process inherit the child's hosts when they do not
    /// name their own.
    pub fn compile(process: &Process) -> Result<Self> {
        process.validate()?;

        let mut definitions = sequence(&process.id, &process.name, &process.tasks, &[])?;

        for handler in &process.handlers {
            definitions.handlers.push(element_for(handler, &[])?);
        }

        Ok(definitions)
    }
}

fn sequence(id: &str, name: &str, nodes: &[Node], hosts: &[String]) -> Result<Definitions> {
    let start = Element::new(format!("{}-start", id), "start", ElementKind::StartEvent);
    let end = Element::new(format!("{}-end", id), "end", ElementKind::EndEvent);

    let mut definitions = Definitions {
        id: id.to_string(),
        name: name.to_string(),
        start: start.id.clone(),
        elements: BTreeMap::new(),
        flows: Vec::new(),
        handlers: Vec::new(),
    };

    let mut previous = start.id.clone();
    definitions.elements.insert(start.id.clone(), start);

    for node in nodes {
        let element = element_for(node, hosts)?;
        link(&mut definitions, &previous, &element.id);
        previous = element.id.clone();
        definitions.elements.insert(element.id.clone(), element);
    }

    link(&mut definitions, &previous, &end.id);
    definitions.elements.insert(end.id.clone(), end);

    Ok(definitions)
}

fn link(definitions: &mut Definitions, source: &str, target: &str) {
    let id = format!("flow-{}-{}", source, target);
    definitions.flows.push(SequenceFlow {
        id,
        source: source.to_string(),
        target: target.to_string(),
    });
}

fn element_for(node: &Node, inherited_hosts: &[String]) -> Result<Element> {
    let mut element = match node {
        Node::Task(task) => task_element(task, inherited_hosts, ElementKind::ScriptTask)?,
        Node::Service(task) => task_element(task, inherited_hosts, ElementKind::ServiceTask)?,
        Node::Process(child) => child_element(child, inherited_hosts)?,
    };

    if let Some(catch) = node.catch() {
        element
            .properties
            .insert(PROPERTY_CATCH.to_string(), catch.to_string());
    }
    if let Some(finish) = node.finish() {
        element
            .properties
            .insert(PROPERTY_FINISH.to_string(), finish.to_string());
    }
    if !node.notify().is_empty() {
        element
            .properties
            .insert(PROPERTY_NOTIFY.to_string(), node.notify().join(","));
    }

    Ok(element)
}

fn task_element(task: &Task, inherited_hosts: &[String], kind: ElementKind) -> Result<Element> {
    let mut task = task.clone();
    if task.hosts.is_empty() {
        task.hosts = inherited_hosts.to_vec();
    }
    let mut element = Element::new(task.id.clone(), task.name.clone(), kind);
    element
        .properties
        .insert(PROPERTY_BODY.to_string(), serde_json::to_string(&task)?);
    Ok(element)
}

fn child_element(child: &ChildProcess, inherited_hosts: &[String]) -> Result<Element> {
    let hosts = if child.hosts.is_empty() {
        inherited_hosts
    } else {
        child.hosts.as_slice()
    };
    let inner = sequence(&child.id, &child.name, &child.tasks, hosts)?;
    Ok(Element::new(
        child.id.clone(),
        child.name.clone(),
        ElementKind::SubProcess {
            definitions: Box::new(inner),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process() -> Process {
        Process::from_yaml(
            r#"
name: site
hosts: [h1]
tasks:
  - name: ping
    action: ping
    catch: rescue
  - kind: process
    name: child
    hosts: [h2]
    tasks:
      - name: inner
        action: shell
  - kind: service
    name: agent
    action: agent.run
    notify: [rescue]
handlers:
  - name: rescue
    action: log
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_compile_links_a_linear_flow() {
        let defs = Definitions::compile(&process()).unwrap();

        let mut order = vec![];
        let mut current = defs.start.clone();
        while let Some(flow) = defs.outgoing(&current) {
            order.push(flow.target.clone());
            current = flow.target.clone();
        }
        assert_eq!(order, vec!["task-0", "task-1", "task-2", "site-end"]);
    }

    #[test]
    fn test_compile_element_kinds_and_properties() {
        let defs = Definitions::compile(&process()).unwrap();

        let ping = defs.element("task-0").unwrap();
        assert_eq!(ping.kind, ElementKind::ScriptTask);
        assert_eq!(ping.property(PROPERTY_CATCH), Some("rescue"));
        assert_eq!(ping.task().unwrap().unwrap().action, "ping");

        let agent = defs.element("task-2").unwrap();
        assert_eq!(agent.kind, ElementKind::ServiceTask);
        assert_eq!(agent.notified(), vec!["rescue"]);
    }

    #[test]
    fn test_child_tasks_inherit_child_hosts() {
        let defs = Definitions::compile(&process()).unwrap();
        let ElementKind::SubProcess { definitions } = &defs.element("task-1").unwrap().kind else {
            panic!("expected sub process");
        };
        let inner = definitions.element("task-1-0").unwrap().task().unwrap().unwrap();
        assert_eq!(inner.hosts, vec!["h2".to_string()]);
    }

    #[test]
    fn test_handlers_are_registered_off_flow() {
        let defs = Definitions::compile(&process()).unwrap();
        let handler = defs.handler("rescue").unwrap();
        assert_eq!(handler.id, "handler-0");
        assert!(defs.outgoing(&handler.id).is_none());
    }
}
