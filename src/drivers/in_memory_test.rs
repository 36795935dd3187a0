use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::ConnectionConfig;
use crate::error::{DriverError, Result};
use crate::options::QueryOptions;
use crate::traits::{Driver, DriverConnection, DriverCursor, DriverStatement, QueryOutput};
use crate::types::{
    ColumnFilter, ForeignKeyFilter, IsolationLevel, KeyFilter, RowSet, SqlValue, TableFilter,
};

/// A recorded driver call for verification.
///
/// Queries and statement executions record their SQL. Other calls record a
/// descriptive name such as `BEGIN`, `CALL name` or `tables`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

#[derive(Clone)]
enum Reply {
    Rows(RowSet),
    Error(DriverError),
}

struct Shared {
    responses: Mutex<VecDeque<RowSet>>,
    fixed: Mutex<HashMap<String, Reply>>,
    default_response: Mutex<RowSet>,
    recorded_queries: Mutex<Vec<RecordedQuery>>,
    connect_calls: Mutex<Vec<usize>>,
    failing_connects: AtomicBool,
    failing_closes: AtomicBool,
    opened: AtomicUsize,
    closed: AtomicUsize,
    open_cursors: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

impl Shared {
    fn record(&self, sql: impl Into<String>, params: &[SqlValue]) {
        self.recorded_queries.lock().push(RecordedQuery {
            sql: sql.into(),
            params: params.to_vec(),
        });
    }

    async fn pause(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn reply(&self, sql: &str) -> Result<RowSet> {
        if let Some(reply) = self.fixed.lock().get(sql).cloned() {
            return match reply {
                Reply::Rows(rows) => Ok(rows),
                Reply::Error(e) => Err(e.into()),
            };
        }
        let queued = self.responses.lock().pop_front();
        Ok(queued.unwrap_or_else(|| self.default_response.lock().clone()))
    }

    fn output(self: &Arc<Self>, rows: RowSet, options: &QueryOptions) -> QueryOutput {
        if options.wants_cursor() {
            self.open_cursors.fetch_add(1, Ordering::AcqRel);
            QueryOutput::Cursor(Arc::new(InMemoryCursor {
                shared: Arc::clone(self),
                columns: rows.columns,
                rows: Mutex::new(rows.rows.into()),
                closed: AtomicBool::new(false),
            }))
        } else {
            QueryOutput::Rows(rows)
        }
    }
}

/// An in-memory database driver for testing.
///
/// Allows configuring expected responses and verifying executed queries.
/// Connections opened from one driver share its responses and its record
/// of executed queries.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use dbaccess::drivers::{InMemoryTestDriver, InMemoryTestResponseBuilder};
/// use dbaccess::traits::Driver;
///
/// let driver = Arc::new(
///     InMemoryTestDriver::new().with_response(
///         InMemoryTestResponseBuilder::new()
///             .columns(&["id", "name"])
///             .row(&["1", "Alice"])
///             .build(),
///     ),
/// );
/// let driver: Arc<dyn Driver> = driver;
/// ```
pub struct InMemoryTestDriver {
    shared: Arc<Shared>,
}

impl InMemoryTestDriver {
    /// Create a new in-memory test driver with no pre-configured responses.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                responses: Mutex::new(VecDeque::new()),
                fixed: Mutex::new(HashMap::new()),
                default_response: Mutex::new(RowSet::empty()),
                recorded_queries: Mutex::new(Vec::new()),
                connect_calls: Mutex::new(Vec::new()),
                failing_connects: AtomicBool::new(false),
                failing_closes: AtomicBool::new(false),
                opened: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                open_cursors: AtomicUsize::new(0),
                latency: Mutex::new(None),
            }),
        }
    }

    /// Add a response to be returned by the next query.
    /// Responses are returned in FIFO order.
    pub fn with_response(self, response: RowSet) -> Self {
        self.shared.responses.lock().push_back(response);
        self
    }

    /// Add multiple responses to be returned by subsequent queries.
    pub fn with_responses(self, responses: impl IntoIterator<Item = RowSet>) -> Self {
        self.shared.responses.lock().extend(responses);
        self
    }

    /// Always answer `sql` with `response`, ahead of the FIFO queue.
    pub fn with_response_for(self, sql: &str, response: RowSet) -> Self {
        self.shared
            .fixed
            .lock()
            .insert(sql.to_string(), Reply::Rows(response));
        self
    }

    /// Always fail `sql` with `error`.
    pub fn with_error_for(self, sql: &str, error: DriverError) -> Self {
        self.shared
            .fixed
            .lock()
            .insert(sql.to_string(), Reply::Error(error));
        self
    }

    /// Set a default response to use when no queued responses remain.
    pub fn with_default_response(self, response: RowSet) -> Self {
        *self.shared.default_response.lock() = response;
        self
    }

    /// Delay every connect, query, execute and fetch by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.shared.latency.lock() = Some(latency);
        self
    }

    /// Make every subsequent `connect` fail until switched back.
    pub fn set_failing_connects(&self, failing: bool) {
        self.shared.failing_connects.store(failing, Ordering::Release);
    }

    /// Make every subsequent connection `close` fail until switched back.
    pub fn set_failing_closes(&self, failing: bool) {
        self.shared.failing_closes.store(failing, Ordering::Release);
    }

    /// The `count` argument of every `connect` call, in call order.
    pub fn connect_calls(&self) -> Vec<usize> {
        self.shared.connect_calls.lock().clone()
    }

    /// Connections opened so far.
    pub fn opened_connections(&self) -> usize {
        self.shared.opened.load(Ordering::Acquire)
    }

    /// Connections closed so far.
    pub fn closed_connections(&self) -> usize {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Connections opened and not yet closed.
    pub fn live_connections(&self) -> usize {
        self.opened_connections() - self.closed_connections()
    }

    /// Driver cursors opened and not yet closed.
    pub fn open_cursors(&self) -> usize {
        self.shared.open_cursors.load(Ordering::Acquire)
    }

    /// Get all recorded queries that have been executed.
    pub fn recorded_queries(&self) -> Vec<RecordedQuery> {
        self.shared.recorded_queries.lock().clone()
    }

    /// Get the last recorded query, if any.
    pub fn last_query(&self) -> Option<RecordedQuery> {
        self.shared.recorded_queries.lock().last().cloned()
    }

    /// Clear all recorded queries.
    pub fn clear_recorded_queries(&self) {
        self.shared.recorded_queries.lock().clear();
    }

    /// Assert that the last query matches the expected SQL and parameters.
    pub fn assert_last_query(&self, expected_sql: &str, expected_params: &[SqlValue]) {
        let last = self.last_query().expect("No queries were recorded");
        assert_eq!(
            last.sql, expected_sql,
            "SQL mismatch.\nExpected: {}\nActual: {}",
            expected_sql, last.sql
        );
        assert_eq!(
            last.params, expected_params,
            "Parameters mismatch.\nExpected: {:?}\nActual: {:?}",
            expected_params, last.params
        );
    }

    /// Assert that exactly n queries were executed.
    pub fn assert_query_count(&self, expected: usize) {
        let actual = self.shared.recorded_queries.lock().len();
        assert_eq!(
            actual, expected,
            "Query count mismatch. Expected: {}, Actual: {}",
            expected, actual
        );
    }
}

impl Default for InMemoryTestDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for InMemoryTestDriver {
    async fn connect(
        &self,
        _config: &ConnectionConfig,
        count: usize,
    ) -> Result<Vec<Arc<dyn DriverConnection>>> {
        self.shared.connect_calls.lock().push(count);
        self.shared.pause().await;
        if self.shared.failing_connects.load(Ordering::Acquire) {
            return Err(DriverError::new("connection refused")
                .with_state("08001")
                .into());
        }

        self.shared.opened.fetch_add(count, Ordering::AcqRel);
        Ok((0..count)
            .map(|_| {
                Arc::new(InMemoryConnection {
                    shared: Arc::clone(&self.shared),
                    connected: AtomicBool::new(true),
                    autocommit: AtomicBool::new(true),
                }) as Arc<dyn DriverConnection>
            })
            .collect())
    }
}

struct InMemoryConnection {
    shared: Arc<Shared>,
    connected: AtomicBool,
    autocommit: AtomicBool,
}

impl InMemoryConnection {
    fn check_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DriverError::new("connection is not open").with_state("08003").into())
        }
    }

    fn catalog(&self, call: &str, names: &[&Option<String>]) -> Result<RowSet> {
        self.check_connected()?;
        let params: Vec<SqlValue> = names.iter().map(|n| SqlValue::from((*n).clone())).collect();
        self.shared.record(call, &params);
        self.shared.reply(call)
    }
}

#[async_trait]
impl DriverConnection for InMemoryConnection {
    async fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
        options: &QueryOptions,
    ) -> Result<QueryOutput> {
        self.check_connected()?;
        self.shared.record(sql, params);
        self.shared.pause().await;
        let rows = self.shared.reply(sql)?;
        Ok(self.shared.output(rows, options))
    }

    async fn call_procedure(
        &self,
        _catalog: Option<&str>,
        schema: Option<&str>,
        name: &str,
        params: &[SqlValue],
    ) -> Result<RowSet> {
        self.check_connected()?;
        let call = match schema {
            Some(schema) => format!("CALL {schema}.{name}"),
            None => format!("CALL {name}"),
        };
        self.shared.record(call.as_str(), params);
        self.shared.reply(&call)
    }

    async fn create_statement(&self) -> Result<Arc<dyn DriverStatement>> {
        self.check_connected()?;
        Ok(Arc::new(InMemoryStatement {
            shared: Arc::clone(&self.shared),
            sql: Mutex::new(None),
            params: Mutex::new(Vec::new()),
        }))
    }

    async fn tables(&self, filter: &TableFilter) -> Result<RowSet> {
        self.catalog(
            "tables",
            &[&filter.catalog, &filter.schema, &filter.table, &filter.table_type],
        )
    }

    async fn columns(&self, filter: &ColumnFilter) -> Result<RowSet> {
        self.catalog(
            "columns",
            &[&filter.catalog, &filter.schema, &filter.table, &filter.column],
        )
    }

    async fn primary_keys(&self, filter: &KeyFilter) -> Result<RowSet> {
        self.catalog("primaryKeys", &[&filter.catalog, &filter.schema, &filter.table])
    }

    async fn foreign_keys(&self, filter: &ForeignKeyFilter) -> Result<RowSet> {
        let (pk, fk) = (&filter.primary, &filter.foreign);
        self.catalog(
            "foreignKeys",
            &[&pk.catalog, &pk.schema, &pk.table, &fk.catalog, &fk.schema, &fk.table],
        )
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.check_connected()?;
        self.shared.record("BEGIN", &[]);
        self.autocommit.store(false, Ordering::Release);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.check_connected()?;
        self.shared.record("COMMIT", &[]);
        self.autocommit.store(true, Ordering::Release);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.check_connected()?;
        self.shared.record("ROLLBACK", &[]);
        self.autocommit.store(true, Ordering::Release);
        Ok(())
    }

    async fn set_isolation_level(&self, level: IsolationLevel) -> Result<()> {
        self.check_connected()?;
        self.shared.record(
            format!("SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}", level.as_sql()),
            &[],
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.check_connected()?;
        if self.shared.failing_closes.load(Ordering::Acquire) {
            return Err(DriverError::new("close failed").into());
        }
        self.connected.store(false, Ordering::Release);
        self.shared.closed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn autocommit(&self) -> bool {
        self.autocommit.load(Ordering::Acquire)
    }
}

struct InMemoryStatement {
    shared: Arc<Shared>,
    sql: Mutex<Option<String>>,
    params: Mutex<Vec<SqlValue>>,
}

#[async_trait]
impl DriverStatement for InMemoryStatement {
    async fn prepare(&self, sql: &str) -> Result<usize> {
        if let Some(Reply::Error(e)) = self.shared.fixed.lock().get(sql) {
            return Err(e.clone().into());
        }
        *self.sql.lock() = Some(sql.to_string());
        self.params.lock().clear();
        Ok(count_markers(sql))
    }

    async fn bind(&self, params: &[SqlValue]) -> Result<()> {
        *self.params.lock() = params.to_vec();
        Ok(())
    }

    async fn execute(&self, options: &QueryOptions) -> Result<QueryOutput> {
        let sql = self
            .sql
            .lock()
            .clone()
            .ok_or_else(|| DriverError::new("statement has not been prepared"))?;
        let params = self.params.lock().clone();
        self.shared.record(sql.as_str(), &params);
        self.shared.pause().await;
        let rows = self.shared.reply(&sql)?;
        Ok(self.shared.output(rows, options))
    }

    async fn close(&self) -> Result<()> {
        *self.sql.lock() = None;
        Ok(())
    }
}

/// `?` markers outside single-quoted literals.
fn count_markers(sql: &str) -> usize {
    let mut quoted = false;
    sql.chars()
        .filter(|c| {
            if *c == '\'' {
                quoted = !quoted;
            }
            *c == '?' && !quoted
        })
        .count()
}

struct InMemoryCursor {
    shared: Arc<Shared>,
    columns: Vec<String>,
    rows: Mutex<VecDeque<Vec<SqlValue>>>,
    closed: AtomicBool,
}

#[async_trait]
impl DriverCursor for InMemoryCursor {
    async fn fetch(&self, count: usize) -> Result<RowSet> {
        self.shared.pause().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::new("cursor is closed").with_state("24000").into());
        }
        let page: Vec<_> = {
            let mut rows = self.rows.lock();
            let take = count.min(rows.len());
            rows.drain(..take).collect()
        };
        Ok(RowSet::new(self.columns.clone(), page))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shared.open_cursors.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

/// Builder for creating test responses easily.
pub struct InMemoryTestResponseBuilder {
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
    count: Option<u64>,
}

impl InMemoryTestResponseBuilder {
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            count: None,
        }
    }

    /// Set the column names for the response.
    pub fn columns(mut self, cols: &[&str]) -> Self {
        self.columns = cols.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Add a row of text values.
    pub fn row(mut self, values: &[&str]) -> Self {
        self.rows
            .push(values.iter().map(|s| SqlValue::from(*s)).collect());
        self
    }

    /// Add a row of typed values.
    pub fn values(mut self, values: Vec<SqlValue>) -> Self {
        self.rows.push(values);
        self
    }

    /// Set the affected-row count.
    pub fn count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Build the RowSet.
    pub fn build(self) -> RowSet {
        let rows = RowSet::new(self.columns, self.rows);
        match self.count {
            Some(count) => rows.with_count(count),
            None => rows,
        }
    }
}

impl Default for InMemoryTestResponseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_markers_skips_literals() {
        assert_eq!(count_markers("SELECT * FROM t WHERE a = ? AND b = ?"), 2);
        assert_eq!(count_markers("SELECT '?' FROM t WHERE a = ?"), 1);
        assert_eq!(count_markers("SELECT 1"), 0);
    }

    #[tokio::test]
    async fn test_connect_opens_requested_count() {
        let driver = InMemoryTestDriver::new();
        let conns = driver
            .connect(&ConnectionConfig::new("mem"), 3)
            .await
            .unwrap();
        assert_eq!(conns.len(), 3);
        assert_eq!(driver.connect_calls(), vec![3]);
        assert_eq!(driver.live_connections(), 3);

        conns[0].close().await.unwrap();
        assert!(!conns[0].is_connected());
        assert_eq!(driver.live_connections(), 2);
    }

    #[tokio::test]
    async fn test_fixed_response_takes_precedence() {
        let driver = InMemoryTestDriver::new()
            .with_response(InMemoryTestResponseBuilder::new().columns(&["queued"]).build())
            .with_response_for(
                "SELECT 1",
                InMemoryTestResponseBuilder::new().columns(&["fixed"]).build(),
            );
        let conn = driver
            .connect(&ConnectionConfig::new("mem"), 1)
            .await
            .unwrap()
            .remove(0);

        let output = conn
            .query("SELECT 1", &[], &QueryOptions::new())
            .await
            .unwrap();
        match output {
            QueryOutput::Rows(rows) => assert_eq!(rows.columns, vec!["fixed"]),
            QueryOutput::Cursor(_) => panic!("expected rows"),
        }
        driver.assert_last_query("SELECT 1", &[]);
    }
}
