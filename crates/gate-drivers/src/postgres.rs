// SPDX-License-Identifier: Apache-2.0

//! PostgreSQL Driver
//!
//! Implements the DatabaseDriver trait for PostgreSQL using SQLx.
//!
//! ## Statement Handling
//!
//! Each pooled session wraps one dedicated `PgConnection`. Statements run in
//! a `READ ONLY` transaction that is rolled back afterwards, so nothing a
//! caller runs can persist. Every connection is opened with a server-side
//! `statement_timeout` that backs up the gateway's own deadline.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow, PgSslMode, Postgres};
use sqlx::{Column, Connection, Row, TypeInfo};
use tracing::debug;

use gate_core::{
    CancelToken, ColumnInfo, DatabaseDriver, DatabaseErrorKind, FetchedRows, GateError,
    GateResult, QualifiedName, Row as GRow, TableColumn, Value,
};

/// SQLSTATE raised when a statement is cancelled or hits `statement_timeout`
const QUERY_CANCELED: &str = "57014";

pub const DEFAULT_APPLICATION_NAME: &str = "querygate";

/// Connection target for the PostgreSQL driver
#[derive(Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub ssl_mode: PgSslMode,
    /// Server-side `statement_timeout` set on every connection
    pub statement_timeout: Duration,
    pub application_name: String,
}

impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"***")
            .field("ssl_mode", &self.ssl_mode)
            .field("statement_timeout", &self.statement_timeout)
            .field("application_name", &self.application_name)
            .finish()
    }
}

/// Parses a libpq-style `sslmode` value
pub fn parse_ssl_mode(raw: &str) -> GateResult<PgSslMode> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "disable" => Ok(PgSslMode::Disable),
        "allow" => Ok(PgSslMode::Allow),
        "prefer" => Ok(PgSslMode::Prefer),
        "require" => Ok(PgSslMode::Require),
        "verify-ca" => Ok(PgSslMode::VerifyCa),
        "verify-full" => Ok(PgSslMode::VerifyFull),
        other => Err(GateError::config(format!(
            "invalid ssl mode '{}': expected disable, allow, prefer, require, verify-ca or verify-full",
            other
        ))),
    }
}

/// Maps a SQLSTATE to the error category reported to callers
pub fn classify_sqlstate(code: &str) -> DatabaseErrorKind {
    match code.get(..2) {
        Some("42") => DatabaseErrorKind::Syntax,
        Some("23") => DatabaseErrorKind::Constraint,
        // connection exception, operator intervention
        Some("08") | Some("57") => DatabaseErrorKind::ConnectionLost,
        _ => DatabaseErrorKind::Other,
    }
}

/// Schema of a table the caller has already resolved
fn resolved_schema(table: &QualifiedName) -> GateResult<&str> {
    table
        .schema
        .as_deref()
        .ok_or_else(|| GateError::internal(format!("table '{}' has no resolved schema", table)))
}

/// One live connection plus the backend serving it
pub struct PgSession {
    conn: PgConnection,
    backend_pid: i32,
}

impl PgSession {
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }
}

/// PostgreSQL driver implementation
pub struct PostgresDriver {
    config: PostgresConfig,
}

impl PostgresDriver {
    pub fn new(config: PostgresConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PostgresConfig {
        &self.config
    }

    /// Builds the connect options shared by sessions and cancel requests
    pub fn connect_options(&self) -> PgConnectOptions {
        let config = &self.config;
        PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.username)
            .password(&config.password)
            .ssl_mode(config.ssl_mode)
            .application_name(&config.application_name)
            .options([(
                "statement_timeout",
                format!("{}ms", config.statement_timeout.as_millis()),
            )])
    }

    /// Helper to bind a Value to a Postgres query
    fn bind_param<'q>(
        query: sqlx::query::Query<'q, Postgres, PgArguments>,
        value: &'q Value,
    ) -> sqlx::query::Query<'q, Postgres, PgArguments> {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(b),
            Value::Int(i) => query.bind(i),
            Value::Float(f) => query.bind(f),
            Value::Text(s) => query.bind(s),
            Value::Bytes(b) => query.bind(b),
            Value::Json(j) => query.bind(j),
        }
    }

    /// Converts a SQLx row to our universal Row type
    fn convert_row(pg_row: &PgRow) -> GRow {
        let values: Vec<Value> = pg_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(pg_row, col.ordinal()))
            .collect();

        GRow { values }
    }

    /// Extracts a value from a PgRow at the given index
    fn extract_value(row: &PgRow, idx: usize) -> Value {
        // try_get with Option<T> so NULLs decode for any type
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<rust_decimal::Decimal>, _>(idx) {
            // text keeps the exact digits
            return v.map(|d| Value::Text(d.to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(idx) {
            return v.map(|u| Value::Text(u.to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return v.map(|dt| Value::Text(dt.to_rfc3339())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v
                .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
            return v
                .map(|t| Value::Text(t.format("%H:%M:%S%.f").to_string()))
                .unwrap_or(Value::Null);
        }

        // unsupported types surface as NULL
        Value::Null
    }

    /// Gets column info from a PgRow
    fn get_column_info(row: &PgRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                data_type: col.type_info().name().to_string(),
            })
            .collect()
    }

    /// Streams rows until `fetch_limit` is reached or the result set ends
    async fn fetch_rows(
        conn: &mut PgConnection,
        sql: &str,
        params: &[Value],
        fetch_limit: usize,
    ) -> Result<FetchedRows, sqlx::Error> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = Self::bind_param(query, param);
        }

        let mut fetched = FetchedRows::default();
        let mut stream = query.fetch(conn);

        while fetched.rows.len() < fetch_limit {
            match stream.next().await {
                Some(Ok(pg_row)) => {
                    if fetched.columns.is_empty() {
                        fetched.columns = Self::get_column_info(&pg_row);
                    }
                    fetched.rows.push(Self::convert_row(&pg_row));
                }
                Some(Err(e)) => return Err(e),
                None => {
                    fetched.exhausted = true;
                    break;
                }
            }
        }

        Ok(fetched)
    }

    fn map_error(&self, err: sqlx::Error) -> GateError {
        match &err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.into_owned());
                let message = db_err.message().to_string();
                match code.as_deref() {
                    Some(QUERY_CANCELED) => GateError::Timeout {
                        timeout_ms: self.config.statement_timeout.as_millis() as u64,
                    },
                    Some(state) => GateError::database(classify_sqlstate(state), code.clone(), message),
                    None => GateError::database(DatabaseErrorKind::Other, None, message),
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed => GateError::connection_lost(err.to_string()),
            _ => GateError::database(DatabaseErrorKind::Other, None, err.to_string()),
        }
    }
}

#[async_trait]
impl DatabaseDriver for PostgresDriver {
    type Connection = PgSession;

    fn driver_id(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self) -> GateResult<PgSession> {
        let mut conn = PgConnection::connect_with(&self.connect_options())
            .await
            .map_err(|e| self.map_error(e))?;

        let backend_pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut conn)
            .await
            .map_err(|e| self.map_error(e))?;

        debug!(backend_pid, host = %self.config.host, "Opened PostgreSQL connection");
        Ok(PgSession { conn, backend_pid })
    }

    async fn ping(&self, session: &mut PgSession) -> GateResult<()> {
        session.conn.ping().await.map_err(|e| self.map_error(e))
    }

    fn cancel_token(&self, session: &PgSession) -> CancelToken {
        CancelToken {
            backend_id: session.backend_pid as i64,
        }
    }

    async fn cancel(&self, token: CancelToken) -> GateResult<()> {
        let mut conn = PgConnection::connect_with(&self.connect_options())
            .await
            .map_err(|e| self.map_error(e))?;

        let cancelled: bool = sqlx::query_scalar("SELECT pg_cancel_backend($1)")
            .bind(token.backend_id as i32)
            .fetch_one(&mut conn)
            .await
            .map_err(|e| self.map_error(e))?;

        debug!(backend_pid = token.backend_id, cancelled, "Sent cancel request");
        let _ = conn.close().await;
        Ok(())
    }

    async fn fetch_bounded(
        &self,
        session: &mut PgSession,
        sql: &str,
        params: &[Value],
        fetch_limit: usize,
    ) -> GateResult<FetchedRows> {
        let mut tx = session.conn.begin().await.map_err(|e| self.map_error(e))?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| self.map_error(e))?;

        let fetched = match Self::fetch_rows(&mut *tx, sql, params, fetch_limit).await {
            Ok(fetched) => fetched,
            Err(e) => {
                let err = self.map_error(e);
                if !err.poisons_connection() {
                    let _ = tx.rollback().await;
                }
                return Err(err);
            }
        };

        // An abandoned stream leaves the rollback queued on drop; the caller
        // discards such sessions.
        if fetched.exhausted {
            tx.rollback().await.map_err(|e| self.map_error(e))?;
        }

        Ok(fetched)
    }

    async fn describe_table(
        &self,
        session: &mut PgSession,
        table: &QualifiedName,
    ) -> GateResult<Vec<TableColumn>> {
        let schema = resolved_schema(table)?;

        let rows: Vec<(String, String, Option<i32>, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT
                column_name::text,
                data_type::text,
                character_maximum_length::int4,
                is_nullable::text,
                column_default::text
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(schema)
        .bind(&table.table)
        .fetch_all(&mut session.conn)
        .await
        .map_err(|e| self.map_error(e))?;

        Ok(rows
            .into_iter()
            .map(
                |(column_name, data_type, max_length, is_nullable, default)| TableColumn {
                    column_name,
                    data_type,
                    max_length,
                    nullable: is_nullable == "YES",
                    default,
                },
            )
            .collect())
    }

    async fn list_tables(
        &self,
        session: &mut PgSession,
        schema: Option<&str>,
    ) -> GateResult<Vec<QualifiedName>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT schemaname::text, tablename::text
            FROM pg_tables
            WHERE $1::text IS NULL OR schemaname = $1
            ORDER BY schemaname, tablename
            "#,
        )
        .bind(schema)
        .fetch_all(&mut session.conn)
        .await
        .map_err(|e| self.map_error(e))?;

        Ok(rows
            .into_iter()
            .map(|(schema, table)| QualifiedName::qualified(schema, table))
            .collect())
    }
}
