//! Shared fixtures: an in-memory driver and a wired-up executor.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gate_core::{
    CancelToken, ColumnInfo, DatabaseDriver, FetchedRows, GateError, GateResult, PolicySnapshot,
    QualifiedName, Row, TableColumn, Value,
};
use querygate_lib::audit::{AuditRecord, AuditRecorder, JsonlAuditLog};
use querygate_lib::config::PoolSettings;
use querygate_lib::executor::GuardedExecutor;
use querygate_lib::pool::ConnectionPool;
use tempfile::TempDir;

pub struct MockConnection {
    pub id: i64,
}

/// Serves `rows` synthetic rows for every query.
///
/// Statements mentioning `pg_sleep` hang for `slow_delay`; `fail_with`
/// makes every fetch fail with that error.
pub struct MockDriver {
    pub rows: usize,
    pub slow_delay: Duration,
    pub fail_with: Option<GateError>,
    pub tables: Vec<QualifiedName>,
    pub connects: AtomicUsize,
    pub fetches: AtomicUsize,
    pub cancelled: Mutex<Vec<CancelToken>>,
    pub last_params: Mutex<Vec<Value>>,
    next_id: AtomicI64,
}

impl MockDriver {
    pub fn with_rows(rows: usize) -> Self {
        Self {
            rows,
            slow_delay: Duration::from_secs(5),
            fail_with: None,
            tables: vec![
                QualifiedName::qualified("public", "users"),
                QualifiedName::qualified("public", "orders"),
                QualifiedName::qualified("sales", "invoices"),
                QualifiedName::qualified("pg_catalog", "pg_class"),
            ],
            connects: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            cancelled: Mutex::new(Vec::new()),
            last_params: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn failing(err: GateError) -> Self {
        Self {
            fail_with: Some(err),
            ..Self::with_rows(1)
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatabaseDriver for MockDriver {
    type Connection = MockConnection;

    fn driver_id(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self) -> GateResult<MockConnection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn ping(&self, _conn: &mut MockConnection) -> GateResult<()> {
        Ok(())
    }

    fn cancel_token(&self, conn: &MockConnection) -> CancelToken {
        CancelToken { backend_id: conn.id }
    }

    async fn cancel(&self, token: CancelToken) -> GateResult<()> {
        self.cancelled.lock().unwrap().push(token);
        Ok(())
    }

    async fn fetch_bounded(
        &self,
        conn: &mut MockConnection,
        sql: &str,
        params: &[Value],
        fetch_limit: usize,
    ) -> GateResult<FetchedRows> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        *self.last_params.lock().unwrap() = params.to_vec();

        if sql.contains("pg_sleep") {
            tokio::time::sleep(self.slow_delay).await;
        }
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }

        let rows = (0..self.rows.min(fetch_limit))
            .map(|i| Row {
                values: vec![Value::Int(i as i64), Value::Int(conn.id)],
            })
            .collect();

        Ok(FetchedRows {
            columns: vec![
                ColumnInfo {
                    name: "n".to_string(),
                    data_type: "int8".to_string(),
                },
                ColumnInfo {
                    name: "backend".to_string(),
                    data_type: "int8".to_string(),
                },
            ],
            rows,
            exhausted: self.rows < fetch_limit,
        })
    }

    async fn describe_table(
        &self,
        _conn: &mut MockConnection,
        table: &QualifiedName,
    ) -> GateResult<Vec<TableColumn>> {
        if !self.tables.contains(table) {
            return Ok(Vec::new());
        }
        Ok(vec![
            TableColumn {
                column_name: "id".to_string(),
                data_type: "integer".to_string(),
                max_length: None,
                nullable: false,
                default: Some("nextval('id_seq'::regclass)".to_string()),
            },
            TableColumn {
                column_name: "name".to_string(),
                data_type: "character varying".to_string(),
                max_length: Some(64),
                nullable: true,
                default: None,
            },
        ])
    }

    async fn list_tables(
        &self,
        _conn: &mut MockConnection,
        schema: Option<&str>,
    ) -> GateResult<Vec<QualifiedName>> {
        Ok(self
            .tables
            .iter()
            .filter(|t| schema.is_none() || t.schema.as_deref() == schema)
            .cloned()
            .collect())
    }
}

pub struct Harness {
    pub executor: Arc<GuardedExecutor<MockDriver>>,
    pub driver: Arc<MockDriver>,
    pub audit_path: PathBuf,
    _dir: TempDir,
}

impl Harness {
    pub fn new(driver: MockDriver, policy: PolicySnapshot) -> Self {
        Self::with_pool(driver, policy, 2)
    }

    pub fn with_pool(driver: MockDriver, policy: PolicySnapshot, max_size: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let audit_path = dir.path().join("audit.jsonl");
        let log = JsonlAuditLog::open(&audit_path).unwrap();
        let recorder = AuditRecorder::new(Arc::new(log), "tester");

        let driver = Arc::new(driver);
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&driver),
            PoolSettings {
                min_idle: 0,
                max_size,
            },
            policy.timeout,
        ));
        let executor = Arc::new(GuardedExecutor::new(Arc::new(policy), pool, recorder));

        Self {
            executor,
            driver,
            audit_path,
            _dir: dir,
        }
    }

    pub fn audit_records(&self) -> Vec<AuditRecord> {
        fs::read_to_string(&self.audit_path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

pub fn policy(max_rows: usize, timeout: Duration) -> PolicySnapshot {
    PolicySnapshot {
        max_rows,
        timeout,
        ..PolicySnapshot::default()
    }
}

pub fn restricted_policy(tables: &[&str]) -> PolicySnapshot {
    PolicySnapshot {
        allowed_tables: tables
            .iter()
            .map(|t| QualifiedName::parse(t).unwrap().resolve("public"))
            .collect(),
        ..PolicySnapshot::default()
    }
}
