use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::options::QueryOptions;
use crate::types::{
    ColumnFilter, ForeignKeyFilter, IsolationLevel, KeyFilter, RowSet, SqlValue, TableFilter,
};

/// Trait for database driver implementations.
/// Drivers are responsible for:
/// - Opening connections, possibly several in one round trip
/// - Converting SqlValue parameters to native types
/// - Executing queries and converting results to RowSet
#[async_trait]
pub trait Driver: Send + Sync {
    /// Open `count` connections in a single call. Either all of them open or
    /// the call fails.
    async fn connect(
        &self,
        config: &ConnectionConfig,
        count: usize,
    ) -> Result<Vec<Arc<dyn DriverConnection>>>;
}

/// What a query or statement execution produced.
pub enum QueryOutput {
    /// Every row, already materialized.
    Rows(RowSet),
    /// A result handle to page through with [`DriverCursor::fetch`].
    Cursor(Arc<dyn DriverCursor>),
}

impl fmt::Debug for QueryOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryOutput::Rows(rows) => f.debug_tuple("Rows").field(rows).finish(),
            QueryOutput::Cursor(_) => f.write_str("Cursor"),
        }
    }
}

/// One live driver connection.
#[async_trait]
pub trait DriverConnection: Send + Sync {
    /// Execute a SQL query with the given parameters. The driver should
    /// return a cursor when `options.wants_cursor()` and rows otherwise.
    async fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
        options: &QueryOptions,
    ) -> Result<QueryOutput>;

    async fn call_procedure(
        &self,
        catalog: Option<&str>,
        schema: Option<&str>,
        name: &str,
        params: &[SqlValue],
    ) -> Result<RowSet>;

    async fn create_statement(&self) -> Result<Arc<dyn DriverStatement>>;

    async fn tables(&self, filter: &TableFilter) -> Result<RowSet>;
    async fn columns(&self, filter: &ColumnFilter) -> Result<RowSet>;
    async fn primary_keys(&self, filter: &KeyFilter) -> Result<RowSet>;
    async fn foreign_keys(&self, filter: &ForeignKeyFilter) -> Result<RowSet>;

    async fn begin_transaction(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
    async fn set_isolation_level(&self, level: IsolationLevel) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
    fn autocommit(&self) -> bool;
}

/// A driver-side statement handle.
#[async_trait]
pub trait DriverStatement: Send + Sync {
    /// Prepare `sql`, returning the number of parameter markers it takes.
    async fn prepare(&self, sql: &str) -> Result<usize>;
    async fn bind(&self, params: &[SqlValue]) -> Result<()>;
    async fn execute(&self, options: &QueryOptions) -> Result<QueryOutput>;
    async fn close(&self) -> Result<()>;
}

/// A driver-side result handle that has not been fully read.
#[async_trait]
pub trait DriverCursor: Send + Sync {
    /// Read up to `count` further rows.
    async fn fetch(&self, count: usize) -> Result<RowSet>;
    async fn close(&self) -> Result<()>;
}
