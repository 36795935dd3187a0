//! A single driver connection and its dual-mode operations.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::completion::Completion;
use crate::cursor::{BufferedCursor, Cursor};
use crate::error::{DbError, Resource, Result};
use crate::options::QueryOptions;
use crate::signature::{self, Arg, ProcedureCall, QueryCall};
use crate::statement::Statement;
use crate::traits::{DriverConnection, QueryOutput};
use crate::types::{
    ColumnFilter, ForeignKeyFilter, IsolationLevel, KeyFilter, ResultSet, RowSet, SqlValue,
    TableFilter,
};

/// Rows requested per fetch when a driver hands back a result handle for a
/// query that asked for materialized rows.
const DRAIN_BATCH: usize = 1024;

pub(crate) struct ConnectionShared {
    id: u64,
    connection_string: String,
    handle: Arc<dyn DriverConnection>,
    closed: AtomicBool,
}

impl ConnectionShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A live database connection.
///
/// Clones share the same underlying driver connection. Once closed, every
/// operation fails with [`DbError::Closed`] without reaching the driver.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

/// Outcome of a query: materialized rows, or a cursor when the options
/// asked for one.
#[derive(Debug)]
pub enum QueryResponse {
    Rows(ResultSet),
    Cursor(Cursor),
}

impl QueryResponse {
    pub fn is_cursor(&self) -> bool {
        matches!(self, QueryResponse::Cursor(_))
    }

    pub fn into_rows(self) -> Option<ResultSet> {
        match self {
            QueryResponse::Rows(rows) => Some(rows),
            QueryResponse::Cursor(_) => None,
        }
    }

    pub fn into_cursor(self) -> Option<Cursor> {
        match self {
            QueryResponse::Cursor(cursor) => Some(cursor),
            QueryResponse::Rows(_) => None,
        }
    }
}

impl Connection {
    pub(crate) fn from_handle(
        id: u64,
        connection_string: impl Into<String>,
        handle: Arc<dyn DriverConnection>,
    ) -> Self {
        tracing::debug!(connection_id = id, "connection opened");
        Self {
            shared: Arc::new(ConnectionShared {
                id,
                connection_string: connection_string.into(),
                handle,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn connection_string(&self) -> &str {
        &self.shared.connection_string
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// True while this connection is open and the driver reports it connected.
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.shared.handle.is_connected()
    }

    pub fn autocommit(&self) -> bool {
        self.shared.handle.autocommit()
    }

    fn handle(&self) -> Result<&Arc<dyn DriverConnection>> {
        if self.is_closed() {
            return Err(DbError::Closed(Resource::Connection));
        }
        Ok(&self.shared.handle)
    }

    /// Run `sql`. Returns a cursor when `options` carries `cursor` or
    /// `fetch_size`, otherwise every row.
    pub async fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
        options: &QueryOptions,
    ) -> Result<QueryResponse> {
        let handle = self.handle()?;
        options.validate()?;
        let output = handle.query(sql, params, options).await?;
        respond(output, options, &self.shared, sql, params).await
    }

    /// Dual-mode `query(sql, params?, options?, callback?)`.
    pub fn query_args(&self, args: Vec<Arg<QueryResponse>>) -> Result<Completion<QueryResponse>> {
        let QueryCall {
            sql,
            params,
            options,
            callback,
        } = signature::resolve_query("query", args)?;
        let options = match parse_options(options) {
            Ok(options) => options,
            Err(e) => return Ok(Completion::failed(e, callback)),
        };
        let conn = self.clone();
        Ok(Completion::new(
            async move { conn.query(&sql, &params, &options).await },
            callback,
        ))
    }

    pub async fn call_procedure(
        &self,
        catalog: Option<&str>,
        schema: Option<&str>,
        name: &str,
        params: &[SqlValue],
    ) -> Result<ResultSet> {
        let handle = self.handle()?;
        let rows = handle.call_procedure(catalog, schema, name, params).await?;
        Ok(ResultSet::from_raw(rows).with_statement(name, params.to_vec()))
    }

    /// Dual-mode `callProcedure(catalog, schema, name, params?, callback?)`.
    pub fn call_procedure_args(&self, args: Vec<Arg<ResultSet>>) -> Result<Completion<ResultSet>> {
        let ProcedureCall {
            catalog,
            schema,
            name,
            params,
            callback,
        } = signature::resolve_procedure(args)?;
        let conn = self.clone();
        Ok(Completion::new(
            async move {
                conn.call_procedure(catalog.as_deref(), schema.as_deref(), &name, &params)
                    .await
            },
            callback,
        ))
    }

    pub async fn create_statement(&self) -> Result<Statement> {
        let handle = self.handle()?;
        let statement = handle.create_statement().await?;
        Ok(Statement::new(statement, Arc::clone(&self.shared)))
    }

    pub fn create_statement_args(
        &self,
        args: Vec<Arg<Statement>>,
    ) -> Result<Completion<Statement>> {
        let callback = signature::resolve_none("createStatement", args)?;
        let conn = self.clone();
        Ok(Completion::new(
            async move { conn.create_statement().await },
            callback,
        ))
    }

    pub async fn begin_transaction(&self) -> Result<()> {
        self.handle()?.begin_transaction().await
    }

    pub fn begin_transaction_args(&self, args: Vec<Arg<()>>) -> Result<Completion<()>> {
        let callback = signature::resolve_none("beginTransaction", args)?;
        let conn = self.clone();
        Ok(Completion::new(
            async move { conn.begin_transaction().await },
            callback,
        ))
    }

    pub async fn commit(&self) -> Result<()> {
        self.handle()?.commit().await
    }

    pub fn commit_args(&self, args: Vec<Arg<()>>) -> Result<Completion<()>> {
        let callback = signature::resolve_none("commit", args)?;
        let conn = self.clone();
        Ok(Completion::new(async move { conn.commit().await }, callback))
    }

    pub async fn rollback(&self) -> Result<()> {
        self.handle()?.rollback().await
    }

    pub fn rollback_args(&self, args: Vec<Arg<()>>) -> Result<Completion<()>> {
        let callback = signature::resolve_none("rollback", args)?;
        let conn = self.clone();
        Ok(Completion::new(async move { conn.rollback().await }, callback))
    }

    pub async fn set_isolation_level(&self, level: IsolationLevel) -> Result<()> {
        self.handle()?.set_isolation_level(level).await
    }

    /// Dual-mode `setIsolationLevel(level, callback?)` taking an ODBC
    /// `SQL_TXN_*` code.
    pub fn set_isolation_level_args(&self, args: Vec<Arg<()>>) -> Result<Completion<()>> {
        let (code, callback) = signature::resolve_number(
            "setIsolationLevel",
            signature::ISOLATION_SHAPES,
            args,
        )?;
        let level = (code.fract() == 0.0 && code >= 0.0)
            .then(|| IsolationLevel::from_code(code as u32))
            .flatten();
        let Some(level) = level else {
            return Err(DbError::Signature {
                method: "setIsolationLevel",
                accepted: signature::ISOLATION_SHAPES,
            });
        };
        let conn = self.clone();
        Ok(Completion::new(
            async move { conn.set_isolation_level(level).await },
            callback,
        ))
    }

    pub async fn tables(&self, filter: &TableFilter) -> Result<ResultSet> {
        let rows = self.handle()?.tables(filter).await?;
        Ok(ResultSet::from_raw(rows))
    }

    pub fn tables_args(&self, args: Vec<Arg<ResultSet>>) -> Result<Completion<ResultSet>> {
        let call = signature::resolve_names("tables", signature::TABLES_SHAPES, 4, args)?;
        let [catalog, schema, table, table_type] = four(call.names);
        let filter = TableFilter {
            catalog,
            schema,
            table,
            table_type,
        };
        let conn = self.clone();
        Ok(Completion::new(
            async move { conn.tables(&filter).await },
            call.callback,
        ))
    }

    pub async fn columns(&self, filter: &ColumnFilter) -> Result<ResultSet> {
        let rows = self.handle()?.columns(filter).await?;
        Ok(ResultSet::from_raw(rows))
    }

    pub fn columns_args(&self, args: Vec<Arg<ResultSet>>) -> Result<Completion<ResultSet>> {
        let call = signature::resolve_names("columns", signature::COLUMNS_SHAPES, 4, args)?;
        let [catalog, schema, table, column] = four(call.names);
        let filter = ColumnFilter {
            catalog,
            schema,
            table,
            column,
        };
        let conn = self.clone();
        Ok(Completion::new(
            async move { conn.columns(&filter).await },
            call.callback,
        ))
    }

    pub async fn primary_keys(&self, filter: &KeyFilter) -> Result<ResultSet> {
        let rows = self.handle()?.primary_keys(filter).await?;
        Ok(ResultSet::from_raw(rows))
    }

    pub fn primary_keys_args(&self, args: Vec<Arg<ResultSet>>) -> Result<Completion<ResultSet>> {
        let call =
            signature::resolve_names("primaryKeys", signature::PRIMARY_KEYS_SHAPES, 3, args)?;
        let mut names = call.names.into_iter();
        let filter = KeyFilter {
            catalog: names.next().flatten(),
            schema: names.next().flatten(),
            table: names.next().flatten(),
        };
        let conn = self.clone();
        Ok(Completion::new(
            async move { conn.primary_keys(&filter).await },
            call.callback,
        ))
    }

    pub async fn foreign_keys(&self, filter: &ForeignKeyFilter) -> Result<ResultSet> {
        let rows = self.handle()?.foreign_keys(filter).await?;
        Ok(ResultSet::from_raw(rows))
    }

    pub fn foreign_keys_args(&self, args: Vec<Arg<ResultSet>>) -> Result<Completion<ResultSet>> {
        let call =
            signature::resolve_names("foreignKeys", signature::FOREIGN_KEYS_SHAPES, 6, args)?;
        let mut names = call.names.into_iter();
        let mut key = || KeyFilter {
            catalog: names.next().flatten(),
            schema: names.next().flatten(),
            table: names.next().flatten(),
        };
        let filter = ForeignKeyFilter {
            primary: key(),
            foreign: key(),
        };
        let conn = self.clone();
        Ok(Completion::new(
            async move { conn.foreign_keys(&filter).await },
            call.callback,
        ))
    }

    /// Close the driver connection. Succeeds exactly once.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Err(DbError::Closed(Resource::Connection));
        }
        tracing::debug!(connection_id = self.shared.id, "closing connection");
        self.shared.handle.close().await
    }

    pub fn close_args(&self, args: Vec<Arg<()>>) -> Result<Completion<()>> {
        let callback = signature::resolve_none("close", args)?;
        let conn = self.clone();
        Ok(Completion::new(async move { conn.close().await }, callback))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

pub(crate) fn parse_options(
    object: Option<serde_json::Map<String, serde_json::Value>>,
) -> Result<QueryOptions> {
    Ok(object
        .as_ref()
        .map(QueryOptions::from_object)
        .transpose()?
        .unwrap_or_default())
}

fn four(names: Vec<Option<String>>) -> [Option<String>; 4] {
    let mut names = names.into_iter();
    [
        names.next().flatten(),
        names.next().flatten(),
        names.next().flatten(),
        names.next().flatten(),
    ]
}

/// Shapes a driver's output into what `options` asked for.
pub(crate) async fn respond(
    output: QueryOutput,
    options: &QueryOptions,
    owner: &Arc<ConnectionShared>,
    sql: &str,
    params: &[SqlValue],
) -> Result<QueryResponse> {
    if options.wants_cursor() {
        let handle = match output {
            QueryOutput::Cursor(handle) => handle,
            QueryOutput::Rows(rows) => Arc::new(BufferedCursor::new(rows)),
        };
        let cursor = Cursor::new(handle, options.effective_fetch_size(), Arc::clone(owner));
        return Ok(QueryResponse::Cursor(cursor));
    }

    let rows = match output {
        QueryOutput::Rows(rows) => rows,
        QueryOutput::Cursor(handle) => {
            let mut all = RowSet::empty();
            loop {
                let page = match handle.fetch(DRAIN_BATCH).await {
                    Ok(page) => page,
                    Err(e) => {
                        let _ = handle.close().await;
                        return Err(e);
                    }
                };
                let done = page.len() < DRAIN_BATCH;
                if all.columns.is_empty() {
                    all.columns = page.columns;
                }
                all.rows.extend(page.rows);
                if done {
                    break;
                }
            }
            handle.close().await?;
            all
        }
    };
    Ok(QueryResponse::Rows(
        ResultSet::from_raw(rows).with_statement(sql, params.to_vec()),
    ))
}
