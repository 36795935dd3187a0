//! Prepared statements.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::completion::Completion;
use crate::connection::{parse_options, respond, ConnectionShared, QueryResponse};
use crate::error::{DbError, Resource, Result};
use crate::options::QueryOptions;
use crate::signature::{self, Arg};
use crate::traits::DriverStatement;
use crate::types::SqlValue;

/// Where a [`Statement`] is in its prepare/bind/execute cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementState {
    Unprepared,
    Prepared,
    Bound,
    Executed,
    Closed,
}

impl fmt::Display for StatementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatementState::Unprepared => "unprepared",
            StatementState::Prepared => "prepared",
            StatementState::Bound => "bound",
            StatementState::Executed => "executed",
            StatementState::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct Tracked {
    state: StatementState,
    sql: Option<String>,
    parameter_count: usize,
    params: Vec<SqlValue>,
}

/// A statement handle created by
/// [`Connection::create_statement`](crate::Connection::create_statement).
///
/// Calls on one statement run one at a time, in the order they were made.
/// Closing the owning connection does not close the statement.
#[derive(Clone)]
pub struct Statement {
    handle: Arc<dyn DriverStatement>,
    owner: Arc<ConnectionShared>,
    tracked: Arc<Mutex<Tracked>>,
}

impl Statement {
    pub(crate) fn new(handle: Arc<dyn DriverStatement>, owner: Arc<ConnectionShared>) -> Self {
        Self {
            handle,
            owner,
            tracked: Arc::new(Mutex::new(Tracked {
                state: StatementState::Unprepared,
                sql: None,
                parameter_count: 0,
                params: Vec::new(),
            })),
        }
    }

    pub async fn state(&self) -> StatementState {
        self.tracked.lock().await.state
    }

    /// Prepare `sql`. Legal from any state but `Closed`; a statement may be
    /// re-prepared after it was bound or executed.
    pub async fn prepare(&self, sql: &str) -> Result<()> {
        let mut tracked = self.tracked.lock().await;
        if tracked.state == StatementState::Closed {
            return Err(DbError::Closed(Resource::Statement));
        }
        match self.handle.prepare(sql).await {
            Ok(count) => {
                tracked.state = StatementState::Prepared;
                tracked.sql = Some(sql.to_owned());
                tracked.parameter_count = count;
                tracked.params.clear();
                Ok(())
            }
            Err(e) => {
                tracked.state = StatementState::Unprepared;
                tracked.sql = None;
                Err(e)
            }
        }
    }

    pub fn prepare_args(&self, args: Vec<Arg<()>>) -> Result<Completion<()>> {
        let (sql, callback) = signature::resolve_text("prepare", signature::PREPARE_SHAPES, args)?;
        let statement = self.clone();
        Ok(Completion::new(
            async move { statement.prepare(&sql).await },
            callback,
        ))
    }

    pub async fn bind(&self, params: &[SqlValue]) -> Result<()> {
        let mut tracked = self.tracked.lock().await;
        match tracked.state {
            StatementState::Closed => return Err(DbError::Closed(Resource::Statement)),
            StatementState::Unprepared => {
                return Err(DbError::InvalidState {
                    operation: "bind",
                    state: tracked.state,
                })
            }
            _ => {}
        }
        self.handle.bind(params).await?;
        tracked.state = StatementState::Bound;
        tracked.params = params.to_vec();
        Ok(())
    }

    pub fn bind_args(&self, args: Vec<Arg<()>>) -> Result<Completion<()>> {
        let (params, callback) = signature::resolve_params("bind", args)?;
        let statement = self.clone();
        Ok(Completion::new(
            async move { statement.bind(&params).await },
            callback,
        ))
    }

    /// Execute the prepared SQL with the bound parameters.
    pub async fn execute(&self, options: &QueryOptions) -> Result<QueryResponse> {
        let mut tracked = self.tracked.lock().await;
        let ready = match tracked.state {
            StatementState::Closed => return Err(DbError::Closed(Resource::Statement)),
            StatementState::Bound | StatementState::Executed => true,
            StatementState::Prepared => tracked.parameter_count == 0,
            StatementState::Unprepared => false,
        };
        if !ready {
            return Err(DbError::InvalidState {
                operation: "execute",
                state: tracked.state,
            });
        }
        options.validate()?;

        let output = self.handle.execute(options).await?;
        tracked.state = StatementState::Executed;
        let sql = tracked.sql.clone().unwrap_or_default();
        respond(output, options, &self.owner, &sql, &tracked.params).await
    }

    pub fn execute_args(
        &self,
        args: Vec<Arg<QueryResponse>>,
    ) -> Result<Completion<QueryResponse>> {
        let (options, callback) = signature::resolve_options("execute", args)?;
        let options = match parse_options(options) {
            Ok(options) => options,
            Err(e) => return Ok(Completion::failed(e, callback)),
        };
        let statement = self.clone();
        Ok(Completion::new(
            async move { statement.execute(&options).await },
            callback,
        ))
    }

    pub async fn close(&self) -> Result<()> {
        let mut tracked = self.tracked.lock().await;
        if tracked.state == StatementState::Closed {
            return Err(DbError::Closed(Resource::Statement));
        }
        tracked.state = StatementState::Closed;
        self.handle.close().await
    }

    pub fn close_args(&self, args: Vec<Arg<()>>) -> Result<Completion<()>> {
        let callback = signature::resolve_none("close", args)?;
        let statement = self.clone();
        Ok(Completion::new(
            async move { statement.close().await },
            callback,
        ))
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement").finish_non_exhaustive()
    }
}
