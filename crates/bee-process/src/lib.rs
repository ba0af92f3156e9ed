// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bee Process - workflow model and trace-emitting engine
//!
//! A process is a declarative list of tasks bound to hosts. This crate takes
//! it from a YAML/JSON document to a stream of traces:
//!
//! ```text
//! YAML / JSON ──▶ Process ──▶ Definitions ──▶ Instance ──▶ TraceStream
//!   (model)        (model)    (definitions)    (engine)
//! ```
//!
//! The consumer of the trace stream (the interpreter in `bee-core`) executes
//! each activity and answers it; the engine decides what runs next.
//!
//! # Example
//!
//! ```ignore
//! use bee_process::{Definitions, Instance, Process, Trace};
//! use tokio_util::sync::CancellationToken;
//!
//! let process = Process::from_yaml(source)?;
//! let mut instance = Instance::new(Definitions::compile(&process)?);
//! let mut traces = instance.start(CancellationToken::new())?;
//! while let Some(trace) = traces.recv().await {
//!     match trace {
//!         Trace::Activity(activity) => activity.complete(),
//!         Trace::CeaseFlow(_) => break,
//!         _ => {}
//!     }
//! }
//! instance.wait().await?;
//! ```

pub mod definitions;
pub mod engine;
pub mod error;
pub mod model;

pub use definitions::{Definitions, Element, ElementKind, SequenceFlow};
pub use engine::{
    ActivityRole, ActivityTrace, CeaseFlowTrace, ErrorTrace, FlowTrace, Instance, Trace,
    TraceStream, VisitTrace,
};
pub use error::{ProcessError, Result};
pub use model::{ChildProcess, Node, Process, Task};
