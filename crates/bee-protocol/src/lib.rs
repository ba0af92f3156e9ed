// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bee Protocol - gRPC + Protobuf communication layer
//!
//! This crate provides the wire protocol spoken between a bee controller and
//! the `bee-agent` process running on a managed host.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      bee-protocol                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: unary + server/client/bidirectional streaming   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: HTTP/2 (tonic)                                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Service
//!
//! | RPC | Shape | Purpose |
//! |-----|-------|---------|
//! | `Ping` | unary | Liveness probe |
//! | `Stat` | unary | Metadata of a remote path |
//! | `Get` | server streaming | Download a file or directory tree |
//! | `Put` | client streaming | Upload a file or directory |
//! | `Execute` | bidirectional | Run a process with stdin/stdout/stderr |
//!
//! # Usage
//!
//! ```ignore
//! use bee_protocol::{DialConfig, dial, rpc::StatRequest};
//!
//! let mut client = dial(&DialConfig::new("10.0.0.5:15450")).await?;
//! let stat = client.stat(StatRequest { name: "/etc/hosts".into() }).await?;
//! ```

pub mod client;

/// Generated protobuf types and tonic stubs for the `bee.rpc` package.
pub mod rpc {
    tonic::include_proto!("bee.rpc");
}

pub use client::{DialConfig, DialError, dial};

/// Default port a `bee-agent` listens on.
pub const DEFAULT_PORT: u16 = 15450;

/// Default chunk size for file transfers (32 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Interval at which the agent pings an open `Execute` stream.
pub const EXECUTE_HEARTBEAT: std::time::Duration = std::time::Duration::from_secs(5);
