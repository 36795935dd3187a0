use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls, RowStream, ToStatement};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::error::{DbError, DriverError, Result};
use crate::options::QueryOptions;
use crate::traits::{Driver, DriverConnection, DriverCursor, DriverStatement, QueryOutput};
use crate::types::{
    ColumnFilter, ForeignKeyFilter, IsolationLevel, KeyFilter, RowSet, SqlValue, TableFilter,
};

const TABLES_SQL: &str = r#"
SELECT table_catalog::text AS "TABLE_CAT", table_schema::text AS "TABLE_SCHEM",
       table_name::text AS "TABLE_NAME", table_type::text AS "TABLE_TYPE",
       NULL::text AS "REMARKS"
FROM information_schema.tables
WHERE ($1::text IS NULL OR table_catalog = $1)
  AND ($2::text IS NULL OR table_schema LIKE $2)
  AND ($3::text IS NULL OR table_name LIKE $3)
  AND ($4::text IS NULL OR table_type = $4)
ORDER BY 4, 1, 2, 3"#;

const COLUMNS_SQL: &str = r#"
SELECT table_catalog::text AS "TABLE_CAT", table_schema::text AS "TABLE_SCHEM",
       table_name::text AS "TABLE_NAME", column_name::text AS "COLUMN_NAME",
       data_type::text AS "TYPE_NAME", is_nullable::text AS "IS_NULLABLE",
       ordinal_position::int4 AS "ORDINAL_POSITION"
FROM information_schema.columns
WHERE ($1::text IS NULL OR table_catalog = $1)
  AND ($2::text IS NULL OR table_schema LIKE $2)
  AND ($3::text IS NULL OR table_name LIKE $3)
  AND ($4::text IS NULL OR column_name LIKE $4)
ORDER BY 1, 2, 3, 7"#;

const PRIMARY_KEYS_SQL: &str = r#"
SELECT k.table_catalog::text AS "TABLE_CAT", k.table_schema::text AS "TABLE_SCHEM",
       k.table_name::text AS "TABLE_NAME", k.column_name::text AS "COLUMN_NAME",
       k.ordinal_position::int4 AS "KEY_SEQ", k.constraint_name::text AS "PK_NAME"
FROM information_schema.table_constraints c
JOIN information_schema.key_column_usage k
  ON k.constraint_schema = c.constraint_schema AND k.constraint_name = c.constraint_name
WHERE c.constraint_type = 'PRIMARY KEY'
  AND ($1::text IS NULL OR k.table_catalog = $1)
  AND ($2::text IS NULL OR k.table_schema = $2)
  AND ($3::text IS NULL OR k.table_name = $3)
ORDER BY 1, 2, 3, 5"#;

const FOREIGN_KEYS_SQL: &str = r#"
SELECT pk.table_catalog::text AS "PKTABLE_CAT", pk.table_schema::text AS "PKTABLE_SCHEM",
       pk.table_name::text AS "PKTABLE_NAME", pk.column_name::text AS "PKCOLUMN_NAME",
       fk.table_catalog::text AS "FKTABLE_CAT", fk.table_schema::text AS "FKTABLE_SCHEM",
       fk.table_name::text AS "FKTABLE_NAME", fk.column_name::text AS "FKCOLUMN_NAME",
       fk.ordinal_position::int4 AS "KEY_SEQ", r.constraint_name::text AS "FK_NAME",
       r.unique_constraint_name::text AS "PK_NAME"
FROM information_schema.referential_constraints r
JOIN information_schema.key_column_usage fk
  ON fk.constraint_schema = r.constraint_schema AND fk.constraint_name = r.constraint_name
JOIN information_schema.key_column_usage pk
  ON pk.constraint_schema = r.unique_constraint_schema
 AND pk.constraint_name = r.unique_constraint_name
 AND pk.ordinal_position = fk.position_in_unique_constraint
WHERE ($1::text IS NULL OR pk.table_catalog = $1)
  AND ($2::text IS NULL OR pk.table_schema = $2)
  AND ($3::text IS NULL OR pk.table_name = $3)
  AND ($4::text IS NULL OR fk.table_catalog = $4)
  AND ($5::text IS NULL OR fk.table_schema = $5)
  AND ($6::text IS NULL OR fk.table_name = $6)
ORDER BY 5, 6, 7, 9"#;

/// PostgreSQL driver implementation using tokio-postgres.
#[derive(Debug, Default)]
pub struct TokioPostgresDriver;

impl TokioPostgresDriver {
    pub fn new() -> Self {
        Self
    }

    async fn connect_one(config: &ConnectionConfig) -> Result<Arc<dyn DriverConnection>> {
        let mut pg_config: tokio_postgres::Config = config
            .connection_string
            .parse()
            .map_err(|e: tokio_postgres::Error| DbError::Configuration(e.to_string()))?;
        if let Some(timeout) = config.connection_timeout {
            pg_config.connect_timeout(timeout);
        }

        let connecting = pg_config.connect(NoTls);
        let (client, connection) = match config.login_timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| timed_out("login"))?,
            None => connecting.await,
        }
        .map_err(pg_error)?;

        // Spawn the connection handler
        let task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "PostgreSQL connection error");
            }
        });

        Ok(Arc::new(PgConnection {
            client: Arc::new(client),
            task: parking_lot::Mutex::new(Some(task)),
            autocommit: AtomicBool::new(true),
        }))
    }
}

#[async_trait]
impl Driver for TokioPostgresDriver {
    async fn connect(
        &self,
        config: &ConnectionConfig,
        count: usize,
    ) -> Result<Vec<Arc<dyn DriverConnection>>> {
        try_join_all((0..count).map(|_| Self::connect_one(config))).await
    }
}

struct PgConnection {
    client: Arc<Client>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    autocommit: AtomicBool,
}

impl PgConnection {
    async fn batch(&self, sql: &str) -> Result<()> {
        self.client.batch_execute(sql).await.map_err(pg_error)
    }

    async fn catalog(&self, sql: &str, names: &[&Option<String>]) -> Result<RowSet> {
        let params: Vec<SqlValue> = names.iter().map(|n| SqlValue::from((*n).clone())).collect();
        collect(open_stream(&self.client, sql, &params, None).await?).await
    }
}

#[async_trait]
impl DriverConnection for PgConnection {
    async fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
        options: &QueryOptions,
    ) -> Result<QueryOutput> {
        if options.wants_cursor() {
            return declare(&self.client, sql, params, options).await;
        }
        rows(&self.client, sql, params, options.timeout).await
    }

    async fn call_procedure(
        &self,
        _catalog: Option<&str>,
        schema: Option<&str>,
        name: &str,
        params: &[SqlValue],
    ) -> Result<RowSet> {
        let target = match schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(name)),
            None => quote_ident(name),
        };
        let markers: Vec<String> = (1..=params.len()).map(|i| format!("${i}")).collect();
        let sql = format!("CALL {target}({})", markers.join(", "));
        collect(open_stream(&self.client, sql.as_str(), params, None).await?).await
    }

    async fn create_statement(&self) -> Result<Arc<dyn DriverStatement>> {
        Ok(Arc::new(PgStatement {
            client: Arc::clone(&self.client),
            prepared: parking_lot::Mutex::new(None),
            params: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    async fn tables(&self, filter: &TableFilter) -> Result<RowSet> {
        self.catalog(
            TABLES_SQL,
            &[&filter.catalog, &filter.schema, &filter.table, &filter.table_type],
        )
        .await
    }

    async fn columns(&self, filter: &ColumnFilter) -> Result<RowSet> {
        self.catalog(
            COLUMNS_SQL,
            &[&filter.catalog, &filter.schema, &filter.table, &filter.column],
        )
        .await
    }

    async fn primary_keys(&self, filter: &KeyFilter) -> Result<RowSet> {
        self.catalog(
            PRIMARY_KEYS_SQL,
            &[&filter.catalog, &filter.schema, &filter.table],
        )
        .await
    }

    async fn foreign_keys(&self, filter: &ForeignKeyFilter) -> Result<RowSet> {
        let (pk, fk) = (&filter.primary, &filter.foreign);
        self.catalog(
            FOREIGN_KEYS_SQL,
            &[&pk.catalog, &pk.schema, &pk.table, &fk.catalog, &fk.schema, &fk.table],
        )
        .await
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.batch("BEGIN").await?;
        self.autocommit.store(false, Ordering::Release);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.batch("COMMIT").await?;
        self.autocommit.store(true, Ordering::Release);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.batch("ROLLBACK").await?;
        self.autocommit.store(true, Ordering::Release);
        Ok(())
    }

    async fn set_isolation_level(&self, level: IsolationLevel) -> Result<()> {
        let sql = format!(
            "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}",
            level.as_sql()
        );
        self.batch(&sql).await
    }

    async fn close(&self) -> Result<()> {
        // Dropping the connection future closes the socket.
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.client.is_closed() && self.task.lock().is_some()
    }

    fn autocommit(&self) -> bool {
        self.autocommit.load(Ordering::Acquire)
    }
}

/// A prepared statement together with the text it was prepared from, which
/// a cursor needs for its `DECLARE`.
struct Prepared {
    statement: tokio_postgres::Statement,
    sql: String,
}

struct PgStatement {
    client: Arc<Client>,
    prepared: parking_lot::Mutex<Option<Prepared>>,
    params: parking_lot::Mutex<Vec<SqlValue>>,
}

#[async_trait]
impl DriverStatement for PgStatement {
    async fn prepare(&self, sql: &str) -> Result<usize> {
        let statement = self.client.prepare(sql).await.map_err(pg_error)?;
        let count = statement.params().len();
        *self.prepared.lock() = Some(Prepared {
            statement,
            sql: sql.to_string(),
        });
        self.params.lock().clear();
        Ok(count)
    }

    async fn bind(&self, params: &[SqlValue]) -> Result<()> {
        *self.params.lock() = params.to_vec();
        Ok(())
    }

    async fn execute(&self, options: &QueryOptions) -> Result<QueryOutput> {
        let (statement, sql) = self
            .prepared
            .lock()
            .as_ref()
            .map(|p| (p.statement.clone(), p.sql.clone()))
            .ok_or_else(|| DriverError::new("statement has not been prepared"))?;
        let params = self.params.lock().clone();
        if options.wants_cursor() {
            return declare(&self.client, &sql, &params, options).await;
        }
        rows(&self.client, &statement, &params, options.timeout).await
    }

    async fn close(&self) -> Result<()> {
        *self.prepared.lock() = None;
        Ok(())
    }
}

/// A server-side cursor declared `WITH HOLD`.
///
/// Every fetch is its own `FETCH` request read to completion, so an open
/// cursor never holds up other requests on the shared client.
struct PgCursor {
    client: Arc<Client>,
    name: String,
    timeout: Option<u64>,
    closed: AtomicBool,
}

#[async_trait]
impl DriverCursor for PgCursor {
    async fn fetch(&self, count: usize) -> Result<RowSet> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::new("cursor is closed").with_state("24000").into());
        }
        let sql = fetch_sql(&self.name, count);
        collect(open_stream(&self.client, sql.as_str(), &[], self.timeout).await?).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) || self.client.is_closed() {
            return Ok(());
        }
        self.client
            .batch_execute(&close_sql(&self.name))
            .await
            .map_err(pg_error)
    }
}

impl Drop for PgCursor {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) || self.client.is_closed() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = Arc::clone(&self.client);
        let sql = close_sql(&self.name);
        runtime.spawn(async move {
            if let Err(e) = client.batch_execute(&sql).await {
                tracing::debug!(error = %e, "failed to close dropped cursor");
            }
        });
    }
}

/// Read `statement` to the end.
async fn rows<T>(
    client: &Client,
    statement: &T,
    params: &[SqlValue],
    timeout: Option<u64>,
) -> Result<QueryOutput>
where
    T: ?Sized + ToStatement + Sync,
{
    let stream = open_stream(client, statement, params, timeout).await?;
    Ok(QueryOutput::Rows(collect(stream).await?))
}

/// Declare a cursor over `sql` and hand it back unread.
async fn declare(
    client: &Arc<Client>,
    sql: &str,
    params: &[SqlValue],
    options: &QueryOptions,
) -> Result<QueryOutput> {
    let name = cursor_name();
    let declaring = declare_sql(&name, sql);
    collect(open_stream(client, declaring.as_str(), params, options.timeout).await?).await?;
    Ok(QueryOutput::Cursor(Arc::new(PgCursor {
        client: Arc::clone(client),
        name,
        timeout: options.timeout,
        closed: AtomicBool::new(false),
    })))
}

fn cursor_name() -> String {
    format!("dbaccess_cursor_{}", Uuid::new_v4().simple())
}

fn declare_sql(name: &str, sql: &str) -> String {
    let body = sql.trim().trim_end_matches(';').trim_end();
    format!("DECLARE {} NO SCROLL CURSOR WITH HOLD FOR {body}", quote_ident(name))
}

fn fetch_sql(name: &str, count: usize) -> String {
    let count = i64::try_from(count).unwrap_or(i64::MAX);
    format!("FETCH FORWARD {count} FROM {}", quote_ident(name))
}

fn close_sql(name: &str) -> String {
    format!("CLOSE {}", quote_ident(name))
}

/// Start `statement`. A timeout of zero seconds means no limit.
async fn open_stream<T>(
    client: &Client,
    statement: &T,
    params: &[SqlValue],
    timeout: Option<u64>,
) -> Result<Pin<Box<RowStream>>>
where
    T: ?Sized + ToStatement + Sync,
{
    // Convert SqlValue params to tokio-postgres compatible types
    let converted: Vec<Box<dyn ToSql + Sync + Send>> =
        params.iter().map(sql_value_to_tosql).collect();
    let refs = converted.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync));

    let opening = client.query_raw(statement, refs);
    let stream = match timeout.filter(|s| *s > 0) {
        Some(seconds) => tokio::time::timeout(Duration::from_secs(seconds), opening)
            .await
            .map_err(|_| timed_out("query"))?,
        None => opening.await,
    }
    .map_err(pg_error)?;
    Ok(Box::pin(stream))
}

async fn collect(mut stream: Pin<Box<RowStream>>) -> Result<RowSet> {
    let mut columns = Vec::new();
    let mut rows = Vec::new();
    while let Some(row) = stream.next().await {
        let row = row.map_err(pg_error)?;
        if columns.is_empty() {
            columns = column_names(&row);
        }
        rows.push(row_values(&row));
    }
    let result = RowSet::new(columns, rows);
    Ok(match stream.rows_affected() {
        Some(count) => result.with_count(count),
        None => result,
    })
}

fn pg_error(e: tokio_postgres::Error) -> DbError {
    let error = DriverError::new(e.to_string());
    match e.code() {
        Some(code) => error.with_state(code.code()).into(),
        None => error.into(),
    }
}

fn timed_out(phase: &str) -> DbError {
    DriverError::new(format!("{phase} timed out"))
        .with_state("HYT00")
        .into()
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn column_names(row: &tokio_postgres::Row) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

fn row_values(row: &tokio_postgres::Row) -> Vec<SqlValue> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| row_value(row, i, col.type_()))
        .collect()
}

/// Convert a SqlValue to a boxed ToSql trait object.
fn sql_value_to_tosql(value: &SqlValue) -> Box<dyn ToSql + Sync + Send> {
    match value {
        SqlValue::Null => Box::new(None::<String>),
        SqlValue::Text(s) => Box::new(s.clone()),
        SqlValue::Int32(i) => Box::new(*i),
        SqlValue::Int64(i) => Box::new(*i),
        SqlValue::Float64(f) => Box::new(*f),
        SqlValue::Bool(b) => Box::new(*b),
    }
}

/// Convert a row value at a given index to a SqlValue.
fn row_value(row: &tokio_postgres::Row, index: usize, type_: &Type) -> SqlValue {
    let value = match *type_ {
        Type::BOOL => row.try_get::<_, Option<bool>>(index).map(SqlValue::from),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(index)
            .map(|v| SqlValue::from(v.map(i32::from))),
        Type::INT4 => row.try_get::<_, Option<i32>>(index).map(SqlValue::from),
        Type::INT8 => row.try_get::<_, Option<i64>>(index).map(SqlValue::from),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(index)
            .map(|v| SqlValue::from(v.map(f64::from))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(index).map(SqlValue::from),
        _ => row.try_get::<_, Option<String>>(index).map(SqlValue::from),
    };
    // Types without a text decoding surface as NULL.
    value.unwrap_or(SqlValue::Null)
}
