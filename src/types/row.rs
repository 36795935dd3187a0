use std::sync::Arc;

use crate::error::{DbError, Result};
use crate::types::SqlValue;

/// Driver-agnostic raw rows as produced by a driver call or one cursor fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    /// Column names in order
    pub columns: Vec<String>,
    /// Rows, where each row holds its values in column order
    pub rows: Vec<Vec<SqlValue>>,
    /// Rows affected, when the driver reports it
    pub count: Option<u64>,
}

impl RowSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self {
            columns,
            rows,
            count: None,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A single row of a result.
/// Values are kept in column order and can be looked up by name or index.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Gets a value by column name.
    pub fn get(&self, column: &str) -> Result<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
            .ok_or_else(|| DbError::ColumnNotFound(column.to_string()))
    }

    /// Gets a value by position.
    pub fn get_index(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Returns all column names in this row.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }

    /// Returns the number of columns in this row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if this row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A materialized result: zero or more rows plus statement metadata.
///
/// Also used for each page returned by [`Cursor::fetch`](crate::Cursor::fetch).
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    columns: Arc<[String]>,
    rows: Vec<Row>,
    count: Option<u64>,
    statement: Option<String>,
    parameters: Vec<SqlValue>,
}

impl ResultSet {
    /// Creates a ResultSet from a driver RowSet.
    pub fn from_raw(raw: RowSet) -> Self {
        let columns: Arc<[String]> = raw.columns.into();
        let rows = raw
            .rows
            .into_iter()
            .map(|values| Row::new(Arc::clone(&columns), values))
            .collect();
        Self {
            columns,
            rows,
            count: raw.count,
            statement: None,
            parameters: Vec::new(),
        }
    }

    pub(crate) fn with_statement(mut self, sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        self.statement = Some(sql.into());
        self.parameters = params;
        self
    }

    /// Extracts a single row from the result.
    /// Returns an error if the result contains zero or more than one row.
    pub fn single_row(self) -> Result<Row> {
        let actual = self.rows.len();
        match <[Row; 1]>::try_from(self.rows) {
            Ok([row]) => Ok(row),
            Err(_) => Err(DbError::UnexpectedRowCount {
                expected: 1,
                actual,
            }),
        }
    }

    /// Returns all rows from the result.
    pub fn rows(self) -> Vec<Row> {
        self.rows
    }

    /// Returns a reference to the rows without consuming the result.
    pub fn rows_ref(&self) -> &[Row] {
        &self.rows
    }

    /// Returns the column names from this result.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows affected, when the driver reported it.
    pub fn count(&self) -> Option<u64> {
        self.count
    }

    /// The SQL text that produced this result, if known.
    pub fn statement(&self) -> Option<&str> {
        self.statement.as_deref()
    }

    pub fn parameters(&self) -> &[SqlValue] {
        &self.parameters
    }

    /// Returns the number of rows in this result.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if this result contains no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
