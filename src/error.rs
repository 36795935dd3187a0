use std::fmt;

use thiserror::Error;

use crate::statement::StatementState;

/// Error type for dbaccess operations
#[derive(Debug, Error)]
pub enum DbError {
    /// A `*_args` entry point was called with an argument list that matches
    /// none of its accepted shapes.
    #[error("{method}() called with an unsupported argument list; accepted: {}", .accepted.join(" | "))]
    Signature {
        method: &'static str,
        accepted: &'static [&'static str],
    },

    #[error("{0} is already closed")]
    Closed(Resource),

    #[error(transparent)]
    InvalidOption(#[from] OptionError),

    #[error("cannot {operation} a statement that is {state}")]
    InvalidState {
        operation: &'static str,
        state: StatementState,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Expected {expected} row(s), got {actual}")]
    UnexpectedRowCount { expected: usize, actual: usize },
}

impl DbError {
    /// Returns true for the closed-resource class of errors.
    pub fn is_closed(&self) -> bool {
        matches!(self, DbError::Closed(_))
    }

    /// Returns true for malformed call shapes and mistyped query options.
    pub fn is_type_error(&self) -> bool {
        matches!(
            self,
            DbError::Signature { .. } | DbError::InvalidOption(OptionError::Type { .. })
        )
    }

    /// Returns true for query options holding an out-of-range value.
    pub fn is_range_error(&self) -> bool {
        matches!(self, DbError::InvalidOption(OptionError::Range { .. }))
    }
}

/// The kind of resource a closed-resource error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Connection,
    Statement,
    Cursor,
    Pool,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Connection => "connection",
            Resource::Statement => "statement",
            Resource::Cursor => "cursor",
            Resource::Pool => "pool",
        };
        f.write_str(name)
    }
}

/// A malformed query option, detected before the driver is called.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    #[error("query option `{key}` must be {expected}")]
    Type {
        key: &'static str,
        expected: &'static str,
    },

    #[error("query option `{key}` must be {requirement}")]
    Range {
        key: &'static str,
        requirement: &'static str,
    },
}

/// An error reported by the driver. Passed through this layer unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
    /// Five character SQLSTATE, when the driver reports one.
    pub state: Option<String>,
    /// Native driver error code.
    pub code: Option<i32>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            state: None,
            code: None,
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }
}

/// Result type alias for dbaccess operations
pub type Result<T> = std::result::Result<T, DbError>;
