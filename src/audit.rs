// SPDX-License-Identifier: Apache-2.0

//! Audit Recorder
//!
//! One append-only JSON line per request. Parameter values and database error
//! texts are never written; they can echo literal data.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gate_core::{GateError, ViolationKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;

/// Longest query text kept in a record, in characters
pub const QUERY_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    ExecuteQuery,
    DescribeTable,
    ListTables,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecuteQuery => "execute_query",
            Self::DescribeTable => "describe_table",
            Self::ListTables => "list_tables",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Rejected,
    Error,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Rejected => "rejected",
            Self::Error => "error",
        }
    }
}

/// A single audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub operation: AuditOperation,
    pub query_preview: String,
    pub param_count: usize,
    pub outcome: AuditOutcome,
    pub row_count: usize,
    pub truncated: bool,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<ViolationKind>,
    /// Stable error code only, never the database message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub principal: String,
}

impl AuditRecord {
    /// Starts a record for a request; the outcome defaults to success
    pub fn new(
        operation: AuditOperation,
        query: &str,
        param_count: usize,
        principal: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            operation,
            query_preview: preview(query),
            param_count,
            outcome: AuditOutcome::Success,
            row_count: 0,
            truncated: false,
            elapsed_ms: 0.0,
            violation: None,
            error_kind: None,
            principal: principal.into(),
        }
    }

    pub fn succeeded(mut self, row_count: usize, truncated: bool, elapsed: Duration) -> Self {
        self.outcome = AuditOutcome::Success;
        self.row_count = row_count;
        self.truncated = truncated;
        self.elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self
    }

    pub fn failed(mut self, err: &GateError, elapsed: Duration) -> Self {
        self.outcome = if err.is_rejection() {
            AuditOutcome::Rejected
        } else {
            AuditOutcome::Error
        };
        self.violation = err.violation().cloned();
        self.error_kind = Some(err.code().to_string());
        self.elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self
    }
}

fn preview(query: &str) -> String {
    query.chars().take(QUERY_PREVIEW_CHARS).collect()
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit record could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Destination for audit records
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Appends records to a JSON-lines file, flushing each one
pub struct JsonlAuditLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlAuditLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditLog {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let json = serde_json::to_string(record)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()?;
        Ok(())
    }
}

/// Sink installed when auditing is disabled
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _record: &AuditRecord) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Writes records to the sink and mirrors them as `audit` tracing events
///
/// A failed write never fails the request.
#[derive(Clone)]
pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
    principal: String,
    enabled: bool,
}

impl AuditRecorder {
    pub fn new(sink: Arc<dyn AuditSink>, principal: impl Into<String>) -> Self {
        Self {
            sink,
            principal: principal.into(),
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            sink: Arc::new(NullAuditSink),
            principal: String::new(),
            enabled: false,
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn begin(&self, operation: AuditOperation, query: &str, param_count: usize) -> AuditRecord {
        AuditRecord::new(operation, query, param_count, self.principal.clone())
    }

    pub fn record(&self, record: &AuditRecord) {
        if !self.enabled {
            return;
        }

        match record.outcome {
            AuditOutcome::Success => info!(
                target: "audit",
                id = %record.id,
                operation = record.operation.as_str(),
                outcome = record.outcome.as_str(),
                row_count = record.row_count,
                truncated = record.truncated,
                elapsed_ms = record.elapsed_ms,
                principal = %record.principal,
                "query audited"
            ),
            AuditOutcome::Rejected | AuditOutcome::Error => warn!(
                target: "audit",
                id = %record.id,
                operation = record.operation.as_str(),
                outcome = record.outcome.as_str(),
                error_kind = record.error_kind.as_deref().unwrap_or_default(),
                elapsed_ms = record.elapsed_ms,
                principal = %record.principal,
                "query audited"
            ),
        }

        if let Err(e) = self.sink.record(record) {
            metrics::record_audit_failure();
            error!(id = %record.id, "Failed to write audit log entry: {}", e);
        }
    }
}
