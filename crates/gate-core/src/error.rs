// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the gateway
//!
//! Policy violations, resource exhaustion and database-reported failures are
//! kept apart so callers can tell "fix your query" from "try again later".

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a request was refused before reaching the database
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationKind {
    #[error("only SELECT, SHOW, EXPLAIN, DESCRIBE and WITH statements are allowed")]
    NotReadOnlyPrefix,

    #[error("operation '{keyword}' is not allowed in read-only mode")]
    ForbiddenKeyword { keyword: String },

    #[error("multiple statements are not allowed")]
    MultipleStatements,

    #[error("query text could not be tokenized: {message}")]
    MalformedText { message: String },

    #[error("access to schema '{schema}' is not allowed")]
    BlockedSchema { schema: String },

    #[error("access to table '{table}' is not allowed")]
    TableNotAllowed { table: String },
}

impl ViolationKind {
    pub fn forbidden(keyword: impl Into<String>) -> Self {
        Self::ForbiddenKeyword {
            keyword: keyword.into(),
        }
    }

    pub fn blocked_schema(schema: impl Into<String>) -> Self {
        Self::BlockedSchema {
            schema: schema.into(),
        }
    }

    pub fn table_not_allowed(table: impl Into<String>) -> Self {
        Self::TableNotAllowed {
            table: table.into(),
        }
    }

    /// True for violations raised by the scope enforcer
    pub fn is_scope(&self) -> bool {
        matches!(self, Self::BlockedSchema { .. } | Self::TableNotAllowed { .. })
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotReadOnlyPrefix => "not_read_only_prefix",
            Self::ForbiddenKeyword { .. } => "forbidden_keyword",
            Self::MultipleStatements => "multiple_statements",
            Self::MalformedText { .. } => "malformed_text",
            Self::BlockedSchema { .. } => "blocked_schema",
            Self::TableNotAllowed { .. } => "table_not_allowed",
        }
    }
}

/// Category of a database-reported failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseErrorKind {
    Syntax,
    Constraint,
    ConnectionLost,
    Other,
}

/// Unified error type for every gateway operation
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum GateError {
    #[error("Query validation failed: {violation}")]
    Validation { violation: ViolationKind },

    #[error("Access denied: {violation}")]
    Scope { violation: ViolationKind },

    #[error("Connection pool exhausted: no connection became free within {timeout_ms}ms")]
    PoolExhausted { timeout_ms: u64 },

    #[error("Could not open a database connection within {timeout_ms}ms: {message}")]
    ConnectTimeout { timeout_ms: u64, message: String },

    #[error("Query exceeded timeout limit of {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Database error: {message}")]
    Database {
        kind: DatabaseErrorKind,
        code: Option<String>,
        message: String,
    },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GateError {
    /// Wraps a violation in the validation or scope variant it belongs to
    pub fn rejected(violation: ViolationKind) -> Self {
        if violation.is_scope() {
            Self::Scope { violation }
        } else {
            Self::Validation { violation }
        }
    }

    pub fn database(kind: DatabaseErrorKind, code: Option<String>, msg: impl Into<String>) -> Self {
        Self::Database {
            kind,
            code,
            message: msg.into(),
        }
    }

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::database(DatabaseErrorKind::ConnectionLost, None, msg)
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
        }
    }

    /// The violation behind a rejection, if this is one
    pub fn violation(&self) -> Option<&ViolationKind> {
        match self {
            Self::Validation { violation } | Self::Scope { violation } => Some(violation),
            _ => None,
        }
    }

    /// Caller-fault errors that must never be retried as-is
    pub fn is_rejection(&self) -> bool {
        self.violation().is_some()
    }

    /// Transient resource failures a caller may choose to retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::ConnectTimeout { .. } | Self::Timeout { .. }
        )
    }

    /// Whether the connection that produced this error must not be reused
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Database {
                    kind: DatabaseErrorKind::ConnectionLost,
                    ..
                }
        )
    }

    /// Coarse error family reported to callers
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Scope { .. } => "scope",
            Self::PoolExhausted { .. } | Self::ConnectTimeout { .. } | Self::Timeout { .. } => {
                "resource"
            }
            Self::Database { .. } => "database",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::Config { .. } => "config",
            Self::Internal { .. } => "internal",
        }
    }

    /// Stable machine-readable code, safe to write to the audit log
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { violation } | Self::Scope { violation } => violation.code(),
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::Timeout { .. } => "timeout",
            Self::Database { kind, .. } => match kind {
                DatabaseErrorKind::Syntax => "database_syntax",
                DatabaseErrorKind::Constraint => "database_constraint",
                DatabaseErrorKind::ConnectionLost => "database_connection_lost",
                DatabaseErrorKind::Other => "database_error",
            },
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::Config { .. } => "config",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for gateway operations
pub type GateResult<T> = Result<T, GateError>;
