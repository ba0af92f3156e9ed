// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bee Core - Remote Execution Plane
//!
//! Runs typed module commands on fleets of hosts over SSH, WinRM or the
//! bee gRPC agent, and drives whole processes through them.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  interpreter::play(process)                                       │
//! │     trace stream from bee-process ──▶ Activity ──▶ Executor       │
//! └───────────────────────────────────────────────────────────────────┘
//!                                  │ execute(host, "copy src=a dest=b")
//!                                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  runtime::Runtime                                                 │
//! │   worker pool ─▶ module::Registry ─▶ parser ─▶ sync ─▶ phases     │
//! └───────────────────────────────────────────────────────────────────┘
//!           │                         │
//!           ▼                         ▼
//! ┌───────────────────────┐  ┌────────────────────────────────────────┐
//! │ connection::Manager   │  │ secret::SqliteSecretStore (<dir>/db)   │
//! │  inventory ─▶ client  │  └────────────────────────────────────────┘
//! └───────────────────────┘
//!           │
//!           ▼
//!   client::{SshClient, WinrmClient, GrpcClient}
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`inventory`] | Hosts, groups and variable precedence; INI loader |
//! | [`secret`] | Encrypted per-host credentials |
//! | [`client`] | Transport clients and remote commands |
//! | [`connection`] | Per-host client cache and transport selection |
//! | [`module`] | Module registry, argument parsing, run phases |
//! | [`sync`] | Interpreter and module bootstrap on a host |
//! | [`runtime`] | Orchestrator |
//! | [`interpreter`] | Process execution |
//! | [`agent`] | Server side of the gRPC transport |

pub mod agent;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod interpreter;
pub mod inventory;
pub mod module;
pub mod runtime;
pub mod secret;
pub mod shell;
pub mod sync;

pub use client::{Client, Command, ExecOptions, FileStat, GetOptions, PutOptions};
pub use config::Config;
pub use connection::{ConnectionManager, Connector, TransportConnector};
pub use error::{Error, Result};
pub use interpreter::{Executor, play};
pub use inventory::{Host, Inventory};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeOptions};
pub use secret::{SecretStore, SqliteSecretStore};
