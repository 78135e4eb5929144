//! DatabaseDriver trait definition
//!
//! The boundary between the gateway and a concrete SQL engine. A driver owns
//! the wire protocol; pooling, deadlines and policy stay with the caller.

use async_trait::async_trait;

use crate::error::GateResult;
use crate::types::{CancelToken, FetchedRows, QualifiedName, TableColumn, Value};

/// Core trait that every database driver must implement
///
/// Connections are handed out exclusively: a `&mut Self::Connection` is only
/// ever held by one in-flight request.
#[async_trait]
pub trait DatabaseDriver: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Returns the unique identifier for this driver (e.g., "postgres")
    fn driver_id(&self) -> &'static str;

    /// Opens a new connection to the configured target
    async fn connect(&self) -> GateResult<Self::Connection>;

    /// Cheap round-trip used as a health check on checkout
    async fn ping(&self, conn: &mut Self::Connection) -> GateResult<()>;

    /// Token identifying the backend serving this connection
    fn cancel_token(&self, conn: &Self::Connection) -> CancelToken;

    /// Asks the server to abort whatever the identified backend is running
    ///
    /// Must not use the connection being cancelled.
    async fn cancel(&self, token: CancelToken) -> GateResult<()>;

    /// Runs a parameterized statement and reads at most `fetch_limit` rows
    ///
    /// Parameters are bound positionally (`$1`, `$2`, ...) through the
    /// driver's native binding channel.
    async fn fetch_bounded(
        &self,
        conn: &mut Self::Connection,
        sql: &str,
        params: &[Value],
        fetch_limit: usize,
    ) -> GateResult<FetchedRows>;

    /// Lists the columns of a table in ordinal order
    async fn describe_table(
        &self,
        conn: &mut Self::Connection,
        table: &QualifiedName,
    ) -> GateResult<Vec<TableColumn>>;

    /// Lists base tables, optionally restricted to one schema
    async fn list_tables(
        &self,
        conn: &mut Self::Connection,
        schema: Option<&str>,
    ) -> GateResult<Vec<QualifiedName>>;
}
