// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for bee-process.

use thiserror::Error;

/// Process errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// The process document is malformed.
    #[error("Invalid process: {0}")]
    Invalid(String),

    /// A `catch`, `finish` or `notify` reference names no handler.
    #[error("Unknown handler: {0}")]
    UnknownHandler(String),

    /// An activity reported failure and nothing caught it.
    #[error("Activity '{element_id}' failed: {message}")]
    Activity {
        /// Element that failed.
        element_id: String,
        /// Failure reported by the trace consumer.
        message: String,
    },

    /// The instance was cancelled.
    #[error("Process cancelled")]
    Cancelled,

    /// The trace consumer went away before the instance finished.
    #[error("Trace stream closed")]
    Detached,

    /// The instance was already started.
    #[error("Instance already started")]
    AlreadyStarted,

    /// YAML decoding failed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON encoding/decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProcessError {
    /// Whether a `catch` handler may absorb this error.
    pub fn is_catchable(&self) -> bool {
        matches!(self, ProcessError::Activity { .. })
    }
}

/// Result type using ProcessError.
pub type Result<T> = std::result::Result<T, ProcessError>;
