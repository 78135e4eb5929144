// SPDX-License-Identifier: Apache-2.0

//! Guarded Executor
//!
//! Classify, scope, acquire, run under a deadline with a row cap, then audit.
//! Every path through `execute`, `describe_table` and `list_tables` writes
//! exactly one audit record before returning.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gate_core::{
    parse_identifier, CancelToken, ColumnInfo, DatabaseDriver, GateError, GateResult, PolicySnapshot,
    QualifiedName, RawRequest, Row, TableColumn,
};
use gate_sql::{
    analyze, check_scope, check_table, is_visible, ALLOWED_PREFIXES, FORBIDDEN_FUNCTIONS,
    FORBIDDEN_KEYWORDS,
};
use serde::Serialize;
use tracing::{debug, field, info, instrument, warn, Span};

use crate::audit::{AuditOperation, AuditRecorder};
use crate::metrics::{self, RequestOutcome};
use crate::pool::{ConnectionPool, PooledSession};

/// Result of a successful guarded query
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
    pub row_count_returned: usize,
    /// More than `max_rows` rows were available
    pub row_count_truncated: bool,
    /// The statement carried its own top-level `LIMIT` or `FETCH`
    pub explicit_limit: bool,
    pub elapsed: Duration,
}

impl ExecutionOutcome {
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

/// Allow-list as reported to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AllowedTablesView {
    Unrestricted(&'static str),
    Tables(Vec<String>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestrictionsView {
    pub max_rows_limit: usize,
    pub query_timeout_seconds: f64,
    pub allowed_tables: AllowedTablesView,
    pub blocked_schemas: Vec<String>,
    pub audit_logging: bool,
    pub default_schema: String,
}

/// The active policy, without any connection details
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicyView {
    pub restrictions: RestrictionsView,
    pub allowed_operations: Vec<&'static str>,
    pub blocked_operations: Vec<&'static str>,
}

pub struct GuardedExecutor<D: DatabaseDriver> {
    policy: Arc<PolicySnapshot>,
    pool: Arc<ConnectionPool<D>>,
    audit: AuditRecorder,
}

impl<D: DatabaseDriver> GuardedExecutor<D> {
    pub fn new(policy: Arc<PolicySnapshot>, pool: Arc<ConnectionPool<D>>, audit: AuditRecorder) -> Self {
        Self {
            policy,
            pool,
            audit,
        }
    }

    pub fn policy(&self) -> &PolicySnapshot {
        &self.policy
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<D>> {
        &self.pool
    }

    /// Runs a caller's read query under the active policy
    #[instrument(
        skip(self, request),
        fields(
            query_len = request.text.len(),
            params = request.parameters.len(),
            form = field::Empty,
            rows = field::Empty,
            truncated = field::Empty
        )
    )]
    pub async fn execute(&self, request: RawRequest) -> GateResult<ExecutionOutcome> {
        let started = Instant::now();
        let record =
            self.audit
                .begin(AuditOperation::ExecuteQuery, &request.text, request.parameters.len());

        let result = self.execute_inner(&request, started).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(outcome) => {
                Span::current().record("rows", outcome.row_count_returned);
                Span::current().record("truncated", outcome.row_count_truncated);
                info!(
                    rows = outcome.row_count_returned,
                    truncated = outcome.row_count_truncated,
                    explicit_limit = outcome.explicit_limit,
                    elapsed_ms = outcome.elapsed_ms(),
                    "Query executed"
                );
                self.audit.record(&record.succeeded(
                    outcome.row_count_returned,
                    outcome.row_count_truncated,
                    elapsed,
                ));
            }
            Err(e) => {
                log_failure(e);
                self.audit.record(&record.failed(e, elapsed));
            }
        }
        let truncated = result.as_ref().is_ok_and(|o| o.row_count_truncated);
        metrics::record_request(
            elapsed.as_secs_f64() * 1000.0,
            request_outcome(&result, truncated),
        );

        result
    }

    async fn execute_inner(&self, request: &RawRequest, started: Instant) -> GateResult<ExecutionOutcome> {
        let classification = analyze(&request.text).map_err(GateError::rejected)?;
        Span::current().record("form", field::debug(&classification.form));
        check_scope(&request.text, &self.policy)
            .into_result()
            .map_err(GateError::rejected)?;

        let mut session = self.acquire().await?;
        let driver = self.pool.driver();
        let token = driver.cancel_token(session.connection());
        let max_rows = self.policy.max_rows;

        let fetched = self
            .with_deadline(
                token,
                driver.fetch_bounded(
                    session.connection(),
                    &request.text,
                    &request.parameters,
                    max_rows + 1,
                ),
            )
            .await;

        let mut fetched = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                settle(session, Some(&e), true);
                return Err(e);
            }
        };
        settle(session, None, fetched.exhausted);

        let row_count_truncated = fetched.rows.len() > max_rows;
        fetched.rows.truncate(max_rows);

        Ok(ExecutionOutcome {
            columns: fetched.columns,
            row_count_returned: fetched.rows.len(),
            rows: fetched.rows,
            row_count_truncated,
            explicit_limit: classification.has_limit,
            elapsed: started.elapsed(),
        })
    }

    /// Columns of one table, in ordinal order
    ///
    /// `table_name` may be `schema.table` when `schema_name` is absent;
    /// otherwise the schema defaults to the policy's default schema.
    #[instrument(skip(self))]
    pub async fn describe_table(
        &self,
        table_name: &str,
        schema_name: Option<&str>,
    ) -> GateResult<Vec<TableColumn>> {
        let started = Instant::now();
        let record = self.audit.begin(
            AuditOperation::DescribeTable,
            &describe_preview(table_name, schema_name),
            0,
        );

        let result = self.describe_inner(table_name, schema_name).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(columns) => self
                .audit
                .record(&record.succeeded(columns.len(), false, elapsed)),
            Err(e) => {
                log_failure(e);
                self.audit.record(&record.failed(e, elapsed));
            }
        }
        metrics::record_request(elapsed.as_secs_f64() * 1000.0, request_outcome(&result, false));

        result
    }

    async fn describe_inner(
        &self,
        table_name: &str,
        schema_name: Option<&str>,
    ) -> GateResult<Vec<TableColumn>> {
        let name = match schema_name {
            Some(schema) => QualifiedName::qualified(parse_identifier(schema)?, parse_identifier(table_name)?),
            None => QualifiedName::parse(table_name)?,
        }
        .resolve(&self.policy.default_schema);

        check_table(&name, &self.policy)
            .into_result()
            .map_err(GateError::rejected)?;

        let mut session = self.acquire().await?;
        let driver = self.pool.driver();
        let token = driver.cancel_token(session.connection());
        let result = self
            .with_deadline(
                token,
                driver.describe_table(session.connection(), &name),
            )
            .await;
        settle(session, result.as_ref().err(), true);

        let columns = result?;
        if columns.is_empty() {
            return Err(GateError::invalid_argument(format!("table '{}' not found", name)));
        }
        Ok(columns)
    }

    /// Tables the policy lets callers see, optionally within one schema
    #[instrument(skip(self))]
    pub async fn list_tables(&self, schema_name: Option<&str>) -> GateResult<Vec<QualifiedName>> {
        let started = Instant::now();
        let record = self
            .audit
            .begin(AuditOperation::ListTables, schema_name.unwrap_or_default(), 0);

        let result = self.list_inner(schema_name).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(tables) => self
                .audit
                .record(&record.succeeded(tables.len(), false, elapsed)),
            Err(e) => {
                log_failure(e);
                self.audit.record(&record.failed(e, elapsed));
            }
        }
        metrics::record_request(elapsed.as_secs_f64() * 1000.0, request_outcome(&result, false));

        result
    }

    async fn list_inner(&self, schema_name: Option<&str>) -> GateResult<Vec<QualifiedName>> {
        let schema = schema_name.map(parse_identifier).transpose()?;
        if let Some(schema) = schema.as_deref() {
            if self.policy.is_schema_blocked(schema) {
                return Err(GateError::rejected(gate_core::ViolationKind::blocked_schema(
                    schema,
                )));
            }
        }

        let mut session = self.acquire().await?;
        let driver = self.pool.driver();
        let token = driver.cancel_token(session.connection());
        let result = self
            .with_deadline(
                token,
                driver.list_tables(session.connection(), schema.as_deref()),
            )
            .await;
        settle(session, result.as_ref().err(), true);

        Ok(result?
            .into_iter()
            .filter(|name| is_visible(name, &self.policy))
            .collect())
    }

    /// The active policy as shown to callers
    pub fn security_policy(&self) -> SecurityPolicyView {
        let policy = &self.policy;
        let allowed_tables = if policy.is_restricted() {
            AllowedTablesView::Tables(policy.allowed_tables.iter().map(|t| t.to_string()).collect())
        } else {
            AllowedTablesView::Unrestricted("ALL (no restrictions)")
        };

        SecurityPolicyView {
            restrictions: RestrictionsView {
                max_rows_limit: policy.max_rows,
                query_timeout_seconds: policy.timeout.as_secs_f64(),
                allowed_tables,
                blocked_schemas: policy.blocked_schemas.iter().cloned().collect(),
                audit_logging: policy.audit_enabled,
                default_schema: policy.default_schema.clone(),
            },
            allowed_operations: ALLOWED_PREFIXES.to_vec(),
            blocked_operations: FORBIDDEN_KEYWORDS
                .iter()
                .chain(FORBIDDEN_FUNCTIONS)
                .copied()
                .collect(),
        }
    }

    async fn acquire(&self) -> GateResult<PooledSession<D>> {
        self.pool.acquire(self.policy.timeout).await
    }

    /// Awaits a driver call for at most the policy timeout
    ///
    /// On expiry the in-flight call is dropped and cancellation of the
    /// statement is requested on a fresh connection in the background.
    async fn with_deadline<T, F>(&self, token: CancelToken, fut: F) -> GateResult<T>
    where
        F: Future<Output = GateResult<T>>,
    {
        match tokio::time::timeout(self.policy.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                let driver = Arc::clone(self.pool.driver());
                tokio::spawn(async move {
                    match driver.cancel(token).await {
                        Ok(()) => debug!(backend = token.backend_id, "Cancelled timed out statement"),
                        Err(e) => warn!(
                            backend = token.backend_id,
                            "Failed to cancel timed out statement: {}", e
                        ),
                    }
                });
                Err(GateError::Timeout {
                    timeout_ms: self.policy.timeout_ms(),
                })
            }
        }
    }
}

/// Returns the session to the pool or closes it
fn settle<D: DatabaseDriver>(session: PooledSession<D>, error: Option<&GateError>, exhausted: bool) {
    if error.is_some_and(GateError::poisons_connection) || !exhausted {
        debug!("Discarding pooled connection");
        session.discard();
    }
}

fn describe_preview(table_name: &str, schema_name: Option<&str>) -> String {
    match schema_name {
        Some(schema) => format!("{}.{}", schema, table_name),
        None => table_name.to_string(),
    }
}

fn log_failure(err: &GateError) {
    if err.is_rejection() {
        info!(code = err.code(), "Request rejected: {}", err);
    } else {
        warn!(code = err.code(), "Request failed: {}", err);
    }
}

fn request_outcome<T>(result: &GateResult<T>, truncated: bool) -> RequestOutcome {
    match result {
        Ok(_) => RequestOutcome::Success { truncated },
        Err(e) if e.is_rejection() => RequestOutcome::Rejected,
        Err(GateError::Timeout { .. }) => RequestOutcome::Timeout,
        Err(GateError::PoolExhausted { .. } | GateError::ConnectTimeout { .. }) => {
            RequestOutcome::PoolUnavailable
        }
        Err(_) => RequestOutcome::Failed,
    }
}
