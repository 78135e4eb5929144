// SPDX-License-Identifier: Apache-2.0

//! Query operations
//!
//! Argument decoding and response shaping for the four caller-facing tools.

use gate_core::{ColumnInfo, DatabaseDriver, GateResult, RawRequest, Row, TableColumn, Value};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::executor::{ExecutionOutcome, GuardedExecutor};

#[derive(Debug, Deserialize)]
pub struct QueryDatabaseArgs {
    pub query: String,
    /// Positional parameters for `$1`, `$2`, ...
    #[serde(default)]
    pub params: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
pub struct TableSchemaArgs {
    pub table_name: String,
    #[serde(default)]
    pub schema_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListTablesArgs {
    #[serde(default)]
    pub schema_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRestrictions {
    pub max_rows_limit: usize,
    pub timeout_seconds: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub row_count: usize,
    pub execution_time_ms: f64,
    pub truncated: bool,
    pub columns: Vec<ColumnInfo>,
    /// One object per row, keyed by column name
    pub data: Vec<Map<String, JsonValue>>,
    pub restrictions: QueryRestrictions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableEntry {
    pub schema_name: String,
    pub table_name: String,
}

pub async fn query_database<D: DatabaseDriver>(
    executor: &GuardedExecutor<D>,
    args: QueryDatabaseArgs,
) -> GateResult<QueryResponse> {
    let parameters = args
        .params
        .into_iter()
        .map(Value::from_param)
        .collect::<GateResult<Vec<_>>>()?;

    let outcome = executor.execute(RawRequest::new(args.query, parameters)).await?;
    let policy = executor.policy();

    Ok(QueryResponse {
        row_count: outcome.row_count_returned,
        execution_time_ms: round_ms(outcome.elapsed_ms()),
        truncated: outcome.row_count_truncated,
        data: rows_as_objects(&outcome),
        columns: outcome.columns,
        restrictions: QueryRestrictions {
            max_rows_limit: policy.max_rows,
            timeout_seconds: policy.timeout.as_secs_f64(),
        },
    })
}

pub async fn get_table_schema<D: DatabaseDriver>(
    executor: &GuardedExecutor<D>,
    args: TableSchemaArgs,
) -> GateResult<Vec<TableColumn>> {
    executor
        .describe_table(&args.table_name, args.schema_name.as_deref())
        .await
}

pub async fn list_tables<D: DatabaseDriver>(
    executor: &GuardedExecutor<D>,
    args: ListTablesArgs,
) -> GateResult<Vec<TableEntry>> {
    let tables = executor.list_tables(args.schema_name.as_deref()).await?;
    Ok(tables
        .into_iter()
        .map(|name| TableEntry {
            schema_name: name.schema.unwrap_or_default(),
            table_name: name.table,
        })
        .collect())
}

fn rows_as_objects(outcome: &ExecutionOutcome) -> Vec<Map<String, JsonValue>> {
    outcome
        .rows
        .iter()
        .map(|row| row_object(&outcome.columns, row))
        .collect()
}

fn row_object(columns: &[ColumnInfo], row: &Row) -> Map<String, JsonValue> {
    columns
        .iter()
        .zip(&row.values)
        .map(|(column, value)| (column.name.clone(), value_to_json(value)))
        .collect()
}

fn value_to_json(value: &Value) -> JsonValue {
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}

fn round_ms(ms: f64) -> f64 {
    (ms * 100.0).round() / 100.0
}
