// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for bee-core.
//!
//! One error type covers the whole execution plane. Variants fall into five
//! groups:
//!
//! | Group | Variants |
//! |-------|----------|
//! | Transport | `Connect`, `Timeout`, `Request` |
//! | Resource | `NotExists`, `AlreadyExists`, `InvalidWrite` |
//! | Configuration | `MissingVariable`, `InvalidClient`, `HostNotExists` |
//! | Execution | `ModuleNotFound`, `NotRunnable`, `Exit`, `AlreadyStarted` |
//! | Wrapped | `Io`, `Database`, `Yaml`, `Json`, `Parse`, `Crypto`, `Process` |
//!
//! Errors crossing the gRPC boundary go through [`Error::to_status`] and
//! `From<tonic::Status>`.

use thiserror::Error;
use tonic::{Code, Status};

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors of the remote execution plane.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Connection to a host could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The operation was cancelled or ran out of time.
    #[error("operation timed out")]
    Timeout,

    /// A request to the remote side failed.
    #[error("request failed: {0}")]
    Request(String),

    /// The path or key does not exist.
    #[error("{0}: not exists")]
    NotExists(String),

    /// The path or key already exists.
    #[error("{0}: already exists")]
    AlreadyExists(String),

    /// A write was short or rejected.
    #[error("invalid write")]
    InvalidWrite,

    /// A variable required to build a client is not set.
    #[error("missing variable '{0}'")]
    MissingVariable(String),

    /// `bee_connect` names an unknown transport.
    #[error("invalid client kind '{0}'")]
    InvalidClient(String),

    /// The host is not part of the inventory.
    #[error("host '{0}' not exists")]
    HostNotExists(String),

    /// No module is registered under the name.
    #[error("module '{0}' not found")]
    ModuleNotFound(String),

    /// The resolved command has no script.
    #[error("command can't be executed: {0}")]
    NotRunnable(String),

    /// The remote process exited with a non-zero code.
    #[error("exit status {code}: {stderr}")]
    Exit {
        /// Exit code reported by the remote side.
        code: i32,
        /// Captured standard error.
        stderr: String,
    },

    /// A pipe was requested after the command started.
    #[error("command already started")]
    AlreadyStarted,

    /// Input could not be parsed (inventory, arguments, remote output).
    #[error("parse error: {0}")]
    Parse(String),

    /// Secret encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Local I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The credential store failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// YAML decoding failed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON encoding/decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The process engine failed.
    #[error(transparent)]
    Process(#[from] bee_process::ProcessError),
}

impl Error {
    /// Whether this error reports a missing path or key.
    pub fn is_not_exists(&self) -> bool {
        match self {
            Error::NotExists(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Convert this error to a gRPC status.
    ///
    /// NotExists maps to `NOT_FOUND`, Timeout to `CANCELLED`, everything else
    /// to `UNKNOWN`.
    pub fn to_status(&self) -> Status {
        match self {
            e if e.is_not_exists() => Status::not_found(e.to_string()),
            Error::Timeout => Status::cancelled(self.to_string()),
            other => Status::unknown(other.to_string()),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::NotFound => Error::NotExists(status.message().to_string()),
            Code::Cancelled => Error::Timeout,
            _ => Error::Request(status.message().to_string()),
        }
    }
}

impl From<Error> for Status {
    fn from(error: Error) -> Self {
        error.to_status()
    }
}

impl From<ssh2::Error> for Error {
    fn from(error: ssh2::Error) -> Self {
        // LIBSSH2_FX_NO_SUCH_FILE
        if matches!(error.code(), ssh2::ErrorCode::SFTP(2)) {
            return Error::NotExists(error.message().to_string());
        }
        Error::Request(error.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_connect() {
            Error::Connect(error.to_string())
        } else if error.is_timeout() {
            Error::Timeout
        } else {
            Error::Request(error.to_string())
        }
    }
}

impl From<bee_protocol::DialError> for Error {
    fn from(error: bee_protocol::DialError) -> Self {
        match error {
            bee_protocol::DialError::Timeout(_) => Error::Timeout,
            other => Error::Connect(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_is_bijective() {
        let cases = [
            (Error::NotExists("/tmp/x".into()), Code::NotFound),
            (Error::Timeout, Code::Cancelled),
            (Error::Request("boom".into()), Code::Unknown),
        ];

        for (error, code) in cases {
            let status = error.to_status();
            assert_eq!(status.code(), code);

            let back = Error::from(status);
            assert_eq!(
                std::mem::discriminant(&back),
                std::mem::discriminant(&error)
            );
        }
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let error = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(error.is_not_exists());
        assert_eq!(error.to_status().code(), Code::NotFound);
    }

    #[test]
    fn test_exit_error_display() {
        let error = Error::Exit {
            code: 3,
            stderr: "no such module".into(),
        };
        assert_eq!(error.to_string(), "exit status 3: no such module");
    }
}
