// SPDX-License-Identifier: Apache-2.0

//! Transport boundary
//!
//! One JSON request object per input line, one JSON response object per
//! output line:
//!
//! ```text
//! -> {"id": 1, "tool": "query_database", "arguments": {"query": "SELECT 1"}}
//! <- {"id": 1, "ok": true, "result": {...}}
//! ```

pub mod query;
pub mod server;

use gate_core::{DatabaseDriver, GateError, GateResult, ViolationKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::executor::GuardedExecutor;

pub use server::{serve, serve_until};

/// The operations exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    QueryDatabase,
    GetTableSchema,
    ListTables,
    GetSecurityConfig,
}

impl Tool {
    pub const ALL: [Tool; 4] = [
        Tool::QueryDatabase,
        Tool::GetTableSchema,
        Tool::ListTables,
        Tool::GetSecurityConfig,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::QueryDatabase => "query_database",
            Self::GetTableSchema => "get_table_schema",
            Self::ListTables => "list_tables",
            Self::GetSecurityConfig => "get_security_config",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }
}

#[derive(Debug, Deserialize)]
pub struct RequestFrame {
    #[serde(default)]
    pub id: JsonValue,
    pub tool: String,
    #[serde(default)]
    pub arguments: JsonValue,
}

/// Error as reported to callers
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub category: &'static str,
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<ViolationKind>,
}

impl From<&GateError> for ErrorBody {
    fn from(err: &GateError) -> Self {
        Self {
            category: err.category(),
            code: err.code(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            violation: err.violation().cloned(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResponseFrame {
    pub id: JsonValue,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseFrame {
    fn from_result(id: JsonValue, result: GateResult<JsonValue>) -> Self {
        match result {
            Ok(value) => Self {
                id,
                ok: true,
                result: Some(value),
                error: None,
            },
            Err(err) => Self {
                id,
                ok: false,
                result: None,
                error: Some(ErrorBody::from(&err)),
            },
        }
    }
}

/// Decodes one input line and runs it
pub async fn handle_line<D: DatabaseDriver>(executor: &GuardedExecutor<D>, line: &str) -> ResponseFrame {
    let frame: RequestFrame = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(e) => {
            return ResponseFrame::from_result(
                JsonValue::Null,
                Err(GateError::invalid_argument(format!("malformed request: {}", e))),
            )
        }
    };

    debug!(tool = %frame.tool, "Dispatching request");
    let result = dispatch(executor, &frame.tool, frame.arguments).await;
    ResponseFrame::from_result(frame.id, result)
}

/// Answer to an input line that is not UTF-8; the request id is unreadable
pub fn undecodable_line(err: std::str::Utf8Error) -> ResponseFrame {
    ResponseFrame::from_result(
        JsonValue::Null,
        Err(GateError::invalid_argument(format!(
            "malformed request: line is not valid UTF-8 ({})",
            err
        ))),
    )
}

/// Routes a decoded request to its operation
pub async fn dispatch<D: DatabaseDriver>(
    executor: &GuardedExecutor<D>,
    tool: &str,
    arguments: JsonValue,
) -> GateResult<JsonValue> {
    let tool = Tool::from_name(tool)
        .ok_or_else(|| GateError::invalid_argument(format!("unknown tool '{}'", tool)))?;

    match tool {
        Tool::QueryDatabase => to_json(query::query_database(executor, parse_args(arguments)?).await?),
        Tool::GetTableSchema => {
            to_json(query::get_table_schema(executor, parse_args(arguments)?).await?)
        }
        Tool::ListTables => to_json(query::list_tables(executor, parse_args(arguments)?).await?),
        Tool::GetSecurityConfig => to_json(executor.security_policy()),
    }
}

fn parse_args<T: DeserializeOwned>(arguments: JsonValue) -> GateResult<T> {
    // a missing arguments object reads as "no arguments"
    let arguments = match arguments {
        JsonValue::Null => JsonValue::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(arguments)
        .map_err(|e| GateError::invalid_argument(format!("invalid arguments: {}", e)))
}

fn to_json<T: Serialize>(value: T) -> GateResult<JsonValue> {
    serde_json::to_value(value).map_err(|e| GateError::internal(e.to_string()))
}
