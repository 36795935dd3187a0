//! Query options and their validation.
//!
//! Options arrive either typed (built with the [`QueryOptions`] setters) or
//! as a loosely typed JSON object from a `*_args` call. Both end up as a
//! validated [`QueryOptions`] before any driver call is issued.

use serde_json::{Map, Value};

use crate::error::OptionError;

/// Rows per fetch when a cursor is requested without a `fetchSize`.
pub const DEFAULT_FETCH_SIZE: usize = 1;

/// The `cursor` option: a flag or a cursor name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorOption {
    Flag(bool),
    Named(String),
}

/// Validated per-call query options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub cursor: Option<CursorOption>,
    pub fetch_size: Option<usize>,
    /// Query timeout in seconds, passed through to the driver.
    pub timeout: Option<u64>,
    pub initial_buffer_size: Option<usize>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a cursor instead of a materialized result.
    pub fn cursor(mut self, enabled: bool) -> Self {
        self.cursor = Some(CursorOption::Flag(enabled));
        self
    }

    /// Request a cursor with the given name.
    pub fn named_cursor(mut self, name: impl Into<String>) -> Self {
        self.cursor = Some(CursorOption::Named(name.into()));
        self
    }

    pub fn fetch_size(mut self, rows: usize) -> Self {
        self.fetch_size = Some(rows);
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn initial_buffer_size(mut self, bytes: usize) -> Self {
        self.initial_buffer_size = Some(bytes);
        self
    }

    /// A cursor is produced whenever `cursor` or `fetchSize` is present,
    /// whatever its value.
    pub fn wants_cursor(&self) -> bool {
        self.cursor.is_some() || self.fetch_size.is_some()
    }

    /// Rows per fetch for a cursor opened with these options.
    pub fn effective_fetch_size(&self) -> usize {
        self.fetch_size.unwrap_or(DEFAULT_FETCH_SIZE)
    }

    /// Checks typed options. Setters accept any `usize`, so a zero
    /// `fetch_size` or `initial_buffer_size` is only caught here.
    pub fn validate(&self) -> Result<(), OptionError> {
        if self.fetch_size == Some(0) {
            return Err(positive_integer("fetchSize"));
        }
        if self.initial_buffer_size == Some(0) {
            return Err(positive_integer("initialBufferSize"));
        }
        Ok(())
    }

    /// Parses and validates a JSON options object. Unknown keys are ignored.
    pub fn from_object(object: &Map<String, Value>) -> Result<Self, OptionError> {
        let mut options = QueryOptions::new();

        if let Some(value) = object.get("cursor") {
            options.cursor = Some(match value {
                Value::Bool(b) => CursorOption::Flag(*b),
                Value::String(s) => CursorOption::Named(s.clone()),
                _ => {
                    return Err(OptionError::Type {
                        key: "cursor",
                        expected: "a boolean or a string",
                    })
                }
            });
        }

        if let Some(value) = object.get("fetchSize") {
            let n = positive(value, "fetchSize")?;
            options.fetch_size = Some(n);
        }

        if let Some(value) = object.get("timeout") {
            let n = number(value, "timeout")?;
            let seconds = as_integer(n).filter(|v| *v >= 0).ok_or(OptionError::Range {
                key: "timeout",
                requirement: "a non-negative integer",
            })?;
            options.timeout = Some(seconds as u64);
        }

        if let Some(value) = object.get("initialBufferSize") {
            options.initial_buffer_size = Some(positive(value, "initialBufferSize")?);
        }

        Ok(options)
    }
}

fn number(value: &Value, key: &'static str) -> Result<f64, OptionError> {
    value.as_f64().ok_or(OptionError::Type {
        key,
        expected: "a number",
    })
}

fn positive(value: &Value, key: &'static str) -> Result<usize, OptionError> {
    let n = number(value, key)?;
    as_integer(n)
        .filter(|v| *v > 0)
        .map(|v| v as usize)
        .ok_or_else(|| positive_integer(key))
}

fn positive_integer(key: &'static str) -> OptionError {
    OptionError::Range {
        key,
        requirement: "a positive integer",
    }
}

fn as_integer(n: f64) -> Option<i64> {
    (n.is_finite() && n.fract() == 0.0).then_some(n as i64)
}
