// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process engine.
//!
//! An [`Instance`] walks a [`Definitions`] graph on a background task and
//! reports every step as a [`Trace`] on a bounded channel. Activities are
//! handed to the consumer, which answers through [`ActivityTrace::complete`]
//! or [`ActivityTrace::fail`]; the engine waits for that answer before it
//! moves on.
//!
//! # Trace order
//!
//! ```text
//! Visit(start) → Flow → Activity(task-0) → Flow → ... → Visit(end)
//!   → Activity(notified handlers...) → CeaseFlow
//! ```
//!
//! An uncaught activity failure produces a single `Error` trace and ends the
//! stream.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::definitions::{Definitions, Element, ElementKind, PROPERTY_CATCH, PROPERTY_FINISH};
use crate::error::{ProcessError, Result};

/// Capacity of the trace channel.
const TRACE_BUFFER: usize = 16;

// ============================================================================
// Traces
// ============================================================================

/// A sequence flow was taken.
#[derive(Debug, Clone)]
pub struct FlowTrace {
    pub flow_id: String,
    pub source: String,
    pub target: String,
}

/// A non-activity element (event or sub process) was entered.
#[derive(Debug, Clone)]
pub struct VisitTrace {
    pub element_id: String,
    pub name: String,
}

/// Why an activity is being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityRole {
    /// Part of the main flow
    Task,
    /// Reached through `catch`, `finish` or `notify`
    Handler,
}

/// Outcome reported by the consumer.
pub type ActivityOutcome = std::result::Result<(), String>;

/// An activity waiting to be executed by the consumer.
#[derive(Debug)]
pub struct ActivityTrace {
    pub element: Element,
    pub role: ActivityRole,
    responder: Option<oneshot::Sender<ActivityOutcome>>,
}

impl ActivityTrace {
    /// Report success.
    pub fn complete(mut self) {
        self.respond(Ok(()));
    }

    /// Report failure.
    pub fn fail(mut self, error: impl Into<String>) {
        self.respond(Err(error.into()));
    }

    fn respond(&mut self, outcome: ActivityOutcome) {
        if let Some(responder) = self.responder.take() {
            let _ = responder.send(outcome);
        }
    }
}

/// An activity failed and nothing caught it.
#[derive(Debug, Clone)]
pub struct ErrorTrace {
    pub element_id: String,
    pub error: String,
}

/// The instance reached its end.
#[derive(Debug, Clone)]
pub struct CeaseFlowTrace {
    pub definitions_id: String,
}

/// Everything an [`Instance`] reports.
#[derive(Debug)]
pub enum Trace {
    Flow(FlowTrace),
    Visit(VisitTrace),
    Activity(ActivityTrace),
    Error(ErrorTrace),
    CeaseFlow(CeaseFlowTrace),
}

/// Receiving side of an instance's traces.
pub type TraceStream = mpsc::Receiver<Trace>;

type WalkFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

// ============================================================================
// Instance
// ============================================================================

/// A running (or runnable) process instance.
pub struct Instance {
    definitions: Arc<Definitions>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Instance {
    pub fn new(definitions: Definitions) -> Self {
        Self {
            definitions: Arc::new(definitions),
            handle: None,
        }
    }

    pub fn definitions(&self) -> &Definitions {
        &self.definitions
    }

    /// Start walking the graph; traces arrive on the returned stream.
    pub fn start(&mut self, cancel: CancellationToken) -> Result<TraceStream> {
        if self.handle.is_some() {
            return Err(ProcessError::AlreadyStarted);
        }

        let (tx, rx) = mpsc::channel(TRACE_BUFFER);
        let walker = Walker {
            root: self.definitions.clone(),
            tx,
            cancel,
            notified: Vec::new(),
        };
        self.handle = Some(tokio::spawn(walker.run()));

        info!(process = %self.definitions.id, "process instance started");
        Ok(rx)
    }

    /// Wait for the background walk to finish.
    pub async fn wait(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(ProcessError::Cancelled),
                Err(e) => Err(ProcessError::Invalid(format!("engine task panicked: {}", e))),
            },
            None => Ok(()),
        }
    }
}

struct Walker {
    root: Arc<Definitions>,
    tx: mpsc::Sender<Trace>,
    cancel: CancellationToken,
    notified: Vec<String>,
}

impl Walker {
    async fn run(mut self) -> Result<()> {
        let root = self.root.clone();

        let mut result = self.walk(&root).await;
        if result.is_ok() {
            result = self.run_notified().await;
        }

        match result {
            Ok(()) => {
                self.emit(Trace::CeaseFlow(CeaseFlowTrace {
                    definitions_id: root.id.clone(),
                }))
                .await?;
                info!(process = %root.id, "process instance finished");
                Ok(())
            }
            Err(ProcessError::Activity {
                element_id,
                message,
            }) => {
                warn!(process = %root.id, element = %element_id, error = %message, "process failed");
                // Best effort: the consumer may already be gone.
                let _ = self
                    .emit(Trace::Error(ErrorTrace {
                        element_id: element_id.clone(),
                        error: message.clone(),
                    }))
                    .await;
                Err(ProcessError::Activity {
                    element_id,
                    message,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Walk one graph from its start event to its end event.
    ///
    /// Boxed because sub processes recurse through [`Walker::run_element`].
    fn walk<'a>(&'a mut self, definitions: &'a Definitions) -> WalkFuture<'a> {
        Box::pin(self.walk_graph(definitions))
    }

    async fn walk_graph(&mut self, definitions: &Definitions) -> Result<()> {
        let mut current = definitions.start.clone();

        loop {
            let element = definitions.element(&current).ok_or_else(|| {
                ProcessError::Invalid(format!("element '{}' is not defined", current))
            })?;

            match &element.kind {
                ElementKind::StartEvent => self.visit(element).await?,
                ElementKind::EndEvent => {
                    self.visit(element).await?;
                    return Ok(());
                }
                ElementKind::ScriptTask
                | ElementKind::ServiceTask
                | ElementKind::SubProcess { .. } => self.run_element(element).await?,
            }

            let flow = definitions.outgoing(&current).ok_or_else(|| {
                ProcessError::Invalid(format!("element '{}' has no outgoing flow", current))
            })?;
            self.emit(Trace::Flow(FlowTrace {
                flow_id: flow.id.clone(),
                source: flow.source.clone(),
                target: flow.target.clone(),
            }))
            .await?;
            current = flow.target.clone();
        }
    }

    /// Run one activity or sub process, applying its catch/finish/notify.
    async fn run_element(&mut self, element: &Element) -> Result<()> {
        let outcome = match &element.kind {
            ElementKind::SubProcess { definitions } => {
                self.visit(element).await?;
                self.walk(definitions).await
            }
            _ => self.activity(element, ActivityRole::Task).await,
        };

        let succeeded = outcome.is_ok();
        let outcome = match outcome {
            Err(e) if e.is_catchable() => match element.property(PROPERTY_CATCH) {
                Some(handler) => {
                    debug!(element = %element.id, handler, "failure caught");
                    self.handler(handler).await
                }
                None => Err(e),
            },
            other => other,
        };

        if matches!(&outcome, Err(e) if !e.is_catchable()) {
            return outcome;
        }

        if let Some(handler) = element.property(PROPERTY_FINISH) {
            self.handler(handler).await?;
        }

        // A caught failure does not notify.
        if succeeded {
            for name in element.notified() {
                if !self.notified.iter().any(|n| n == name) {
                    self.notified.push(name.to_string());
                }
            }
        }

        outcome
    }

    async fn run_notified(&mut self) -> Result<()> {
        let root = self.root.clone();
        // Declaration order, not notification order.
        let pending: Vec<&Element> = root
            .handlers
            .iter()
            .filter(|e| self.notified.contains(&e.name))
            .collect();
        for element in pending {
            self.activity(element, ActivityRole::Handler).await?;
        }
        Ok(())
    }

    async fn handler(&mut self, name: &str) -> Result<()> {
        let root = self.root.clone();
        let element = root
            .handler(name)
            .ok_or_else(|| ProcessError::UnknownHandler(name.to_string()))?;
        self.activity(element, ActivityRole::Handler).await
    }

    async fn activity(&mut self, element: &Element, role: ActivityRole) -> Result<()> {
        let (responder, response) = oneshot::channel();
        self.emit(Trace::Activity(ActivityTrace {
            element: element.clone(),
            role,
            responder: Some(responder),
        }))
        .await?;

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ProcessError::Cancelled),
            outcome = response => outcome,
        };

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(ProcessError::Activity {
                element_id: element.id.clone(),
                message,
            }),
            Err(_) => Err(ProcessError::Activity {
                element_id: element.id.clone(),
                message: "activity dropped without a result".to_string(),
            }),
        }
    }

    async fn visit(&mut self, element: &Element) -> Result<()> {
        self.emit(Trace::Visit(VisitTrace {
            element_id: element.id.clone(),
            name: element.name.clone(),
        }))
        .await
    }

    async fn emit(&self, trace: Trace) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ProcessError::Cancelled),
            sent = self.tx.send(trace) => sent.map_err(|_| ProcessError::Detached),
        }
    }
}
