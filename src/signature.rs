//! Loosely typed argument lists and their resolution into typed calls.
//!
//! The `*_args` entry points accept a `Vec<Arg<T>>` whose shape may vary:
//! optional params, optional options object, optional callback. The
//! callback is usually last but is recognized in any position.
//! The resolvers here look only at each argument's type tag, so the rules
//! are the same for every method and can be tested without a driver.

use std::fmt;

use serde_json::{Map, Value};

use crate::completion::Callback;
use crate::error::{DbError, Result};
use crate::types::SqlValue;

/// One dynamically typed argument. `T` is the outcome type a callback
/// argument receives.
pub enum Arg<T> {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Array(Vec<SqlValue>),
    Object(Map<String, Value>),
    Function(Callback<T>),
}

/// Type tag of an [`Arg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgTag {
    Null,
    Bool,
    Number,
    Text,
    Array,
    Object,
    Function,
}

impl<T> Arg<T> {
    /// Wraps a closure as a callback argument.
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        Arg::Function(Box::new(f))
    }

    pub fn tag(&self) -> ArgTag {
        match self {
            Arg::Null => ArgTag::Null,
            Arg::Bool(_) => ArgTag::Bool,
            Arg::Number(_) => ArgTag::Number,
            Arg::Text(_) => ArgTag::Text,
            Arg::Array(_) => ArgTag::Array,
            Arg::Object(_) => ArgTag::Object,
            Arg::Function(_) => ArgTag::Function,
        }
    }
}

impl<T> fmt::Debug for Arg<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Null => f.write_str("Null"),
            Arg::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Arg::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Arg::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Arg::Array(a) => f.debug_tuple("Array").field(a).finish(),
            Arg::Object(o) => f.debug_tuple("Object").field(o).finish(),
            Arg::Function(_) => f.write_str("Function"),
        }
    }
}

impl<T> From<&str> for Arg<T> {
    fn from(value: &str) -> Self {
        Arg::Text(value.to_string())
    }
}

impl<T> From<String> for Arg<T> {
    fn from(value: String) -> Self {
        Arg::Text(value)
    }
}

impl<T> From<bool> for Arg<T> {
    fn from(value: bool) -> Self {
        Arg::Bool(value)
    }
}

impl<T> From<f64> for Arg<T> {
    fn from(value: f64) -> Self {
        Arg::Number(value)
    }
}

impl<T> From<i64> for Arg<T> {
    fn from(value: i64) -> Self {
        Arg::Number(value as f64)
    }
}

impl<T> From<Vec<SqlValue>> for Arg<T> {
    fn from(value: Vec<SqlValue>) -> Self {
        Arg::Array(value)
    }
}

impl<T> From<Map<String, Value>> for Arg<T> {
    fn from(value: Map<String, Value>) -> Self {
        Arg::Object(value)
    }
}

impl<T> From<Value> for Arg<T> {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Arg::Null,
            Value::Bool(b) => Arg::Bool(b),
            Value::Number(n) => Arg::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Arg::Text(s),
            Value::Array(items) => Arg::Array(items.into_iter().map(SqlValue::from_json).collect()),
            Value::Object(map) => Arg::Object(map),
        }
    }
}

pub const QUERY_SHAPES: &[&str] = &[
    "query(sql[, callback])",
    "query(sql, params[, callback])",
    "query(sql, options[, callback])",
    "query(sql, params, options[, callback])",
];

pub const PROCEDURE_SHAPES: &[&str] = &[
    "callProcedure(catalog, schema, name[, callback])",
    "callProcedure(catalog, schema, name, params[, callback])",
];

pub const PREPARE_SHAPES: &[&str] = &["prepare(sql[, callback])"];
pub const BIND_SHAPES: &[&str] = &["bind(params[, callback])"];
pub const EXECUTE_SHAPES: &[&str] = &["execute([callback])", "execute(options[, callback])"];
pub const ISOLATION_SHAPES: &[&str] = &["setIsolationLevel(level[, callback])"];
pub const TABLES_SHAPES: &[&str] = &["tables(catalog, schema, table, type[, callback])"];
pub const COLUMNS_SHAPES: &[&str] = &["columns(catalog, schema, table, column[, callback])"];
pub const PRIMARY_KEYS_SHAPES: &[&str] = &["primaryKeys(catalog, schema, table[, callback])"];
pub const FOREIGN_KEYS_SHAPES: &[&str] = &[
    "foreignKeys(pkCatalog, pkSchema, pkTable, fkCatalog, fkSchema, fkTable[, callback])",
];
pub const CONNECT_SHAPES: &[&str] = &[
    "connect(connectionString[, callback])",
    "connect(config[, callback])",
];
pub const POOL_SHAPES: &[&str] = &[
    "pool(connectionString[, callback])",
    "pool(config[, callback])",
];

/// Shape list for a method taking nothing but an optional callback.
pub fn no_argument_shapes(method: &'static str) -> &'static [&'static str] {
    match method {
        "close" => &["close([callback])"],
        "commit" => &["commit([callback])"],
        "rollback" => &["rollback([callback])"],
        "beginTransaction" => &["beginTransaction([callback])"],
        "createStatement" => &["createStatement([callback])"],
        "fetch" => &["fetch([callback])"],
        "init" => &["init([callback])"],
        "connect" => &["connect([callback])"],
        _ => &["([callback])"],
    }
}

/// A resolved `query(sql, params?, options?, callback?)` call.
pub struct QueryCall<T> {
    pub sql: String,
    pub params: Vec<SqlValue>,
    pub options: Option<Map<String, Value>>,
    pub callback: Option<Callback<T>>,
}

/// A resolved `callProcedure(catalog, schema, name, params?, callback?)` call.
pub struct ProcedureCall<T> {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub name: String,
    pub params: Vec<SqlValue>,
    pub callback: Option<Callback<T>>,
}

/// A resolved call taking a fixed number of nullable strings, as the
/// catalog lookups do.
pub struct NamesCall<T> {
    pub names: Vec<Option<String>>,
    pub callback: Option<Callback<T>>,
}

/// Takes out the callback: the first function argument, wherever it sits.
/// The remaining arguments keep their order and are matched by type, so a
/// second function fails the shape check like any other stray value.
fn split_callback<T>(mut args: Vec<Arg<T>>) -> (Vec<Arg<T>>, Option<Callback<T>>) {
    let Some(at) = args.iter().position(|a| a.tag() == ArgTag::Function) else {
        return (args, None);
    };
    let callback = match args.remove(at) {
        Arg::Function(cb) => Some(cb),
        _ => None,
    };
    (args, callback)
}

fn mismatch(method: &'static str, accepted: &'static [&'static str]) -> DbError {
    DbError::Signature { method, accepted }
}

/// Resolves `(sql)`, `(sql, params)`, `(sql, options)` and
/// `(sql, params, options)`, each with an optional trailing callback.
/// `params` is an array or null, `options` an object or null.
pub fn resolve_query<T>(method: &'static str, args: Vec<Arg<T>>) -> Result<QueryCall<T>> {
    let (args, callback) = split_callback(args);
    let mut args = args.into_iter();
    let sql = match args.next() {
        Some(Arg::Text(sql)) => sql,
        _ => return Err(mismatch(method, QUERY_SHAPES)),
    };

    let (params, options) = match (args.next(), args.next(), args.next()) {
        (None, None, None) => (Vec::new(), None),
        (Some(Arg::Array(p)), None, None) => (p, None),
        (Some(Arg::Null), None, None) => (Vec::new(), None),
        (Some(Arg::Object(o)), None, None) => (Vec::new(), Some(o)),
        (Some(p @ (Arg::Array(_) | Arg::Null)), Some(o @ (Arg::Object(_) | Arg::Null)), None) => {
            let params = match p {
                Arg::Array(p) => p,
                _ => Vec::new(),
            };
            let options = match o {
                Arg::Object(o) => Some(o),
                _ => None,
            };
            (params, options)
        }
        _ => return Err(mismatch(method, QUERY_SHAPES)),
    };

    Ok(QueryCall {
        sql,
        params,
        options,
        callback,
    })
}

/// Resolves `(catalog, schema, name, params?)`. Catalog and schema may be
/// null; the procedure name must be a string.
pub fn resolve_procedure<T>(args: Vec<Arg<T>>) -> Result<ProcedureCall<T>> {
    const METHOD: &str = "callProcedure";
    let (args, callback) = split_callback(args);
    if !(3..=4).contains(&args.len()) {
        return Err(mismatch(METHOD, PROCEDURE_SHAPES));
    }
    let mut args = args.into_iter();
    let catalog = nullable_text(args.next()).ok_or_else(|| mismatch(METHOD, PROCEDURE_SHAPES))?;
    let schema = nullable_text(args.next()).ok_or_else(|| mismatch(METHOD, PROCEDURE_SHAPES))?;
    let name = match args.next() {
        Some(Arg::Text(name)) => name,
        _ => return Err(mismatch(METHOD, PROCEDURE_SHAPES)),
    };
    let params = match args.next() {
        None | Some(Arg::Null) => Vec::new(),
        Some(Arg::Array(p)) => p,
        Some(_) => return Err(mismatch(METHOD, PROCEDURE_SHAPES)),
    };
    Ok(ProcedureCall {
        catalog,
        schema,
        name,
        params,
        callback,
    })
}

/// Resolves a single required string argument.
pub fn resolve_text<T>(
    method: &'static str,
    accepted: &'static [&'static str],
    args: Vec<Arg<T>>,
) -> Result<(String, Option<Callback<T>>)> {
    let (args, callback) = split_callback(args);
    match <[Arg<T>; 1]>::try_from(args) {
        Ok([Arg::Text(text)]) => Ok((text, callback)),
        _ => Err(mismatch(method, accepted)),
    }
}

/// Resolves a single required params array.
pub fn resolve_params<T>(
    method: &'static str,
    args: Vec<Arg<T>>,
) -> Result<(Vec<SqlValue>, Option<Callback<T>>)> {
    let (args, callback) = split_callback(args);
    match <[Arg<T>; 1]>::try_from(args) {
        Ok([Arg::Array(params)]) => Ok((params, callback)),
        _ => Err(mismatch(method, BIND_SHAPES)),
    }
}

/// Resolves an optional options object (object or null).
pub fn resolve_options<T>(
    method: &'static str,
    args: Vec<Arg<T>>,
) -> Result<(Option<Map<String, Value>>, Option<Callback<T>>)> {
    let (args, callback) = split_callback(args);
    let mut args = args.into_iter();
    match (args.next(), args.next()) {
        (None, None) | (Some(Arg::Null), None) => Ok((None, callback)),
        (Some(Arg::Object(o)), None) => Ok((Some(o), callback)),
        _ => Err(mismatch(method, EXECUTE_SHAPES)),
    }
}

/// Resolves a single required number.
pub fn resolve_number<T>(
    method: &'static str,
    accepted: &'static [&'static str],
    args: Vec<Arg<T>>,
) -> Result<(f64, Option<Callback<T>>)> {
    let (args, callback) = split_callback(args);
    match <[Arg<T>; 1]>::try_from(args) {
        Ok([Arg::Number(n)]) => Ok((n, callback)),
        _ => Err(mismatch(method, accepted)),
    }
}

/// Resolves a method that takes nothing but an optional callback.
pub fn resolve_none<T>(method: &'static str, args: Vec<Arg<T>>) -> Result<Option<Callback<T>>> {
    let accepted = no_argument_shapes(method);
    let (args, callback) = split_callback(args);
    if !args.is_empty() {
        return Err(mismatch(method, accepted));
    }
    Ok(callback)
}

/// Resolves exactly `arity` arguments, each a string or null.
pub fn resolve_names<T>(
    method: &'static str,
    accepted: &'static [&'static str],
    arity: usize,
    args: Vec<Arg<T>>,
) -> Result<NamesCall<T>> {
    let (args, callback) = split_callback(args);
    if args.len() != arity {
        return Err(mismatch(method, accepted));
    }
    let names = args
        .into_iter()
        .map(|a| nullable_text(Some(a)))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| mismatch(method, accepted))?;
    Ok(NamesCall { names, callback })
}

/// A connection target: either a bare connection string or a config object.
#[derive(Debug)]
pub enum Target {
    ConnectionString(String),
    Config(Map<String, Value>),
}

/// Resolves `(connectionString)` or `(config)`.
pub fn resolve_target<T>(
    method: &'static str,
    accepted: &'static [&'static str],
    args: Vec<Arg<T>>,
) -> Result<(Target, Option<Callback<T>>)> {
    let (args, callback) = split_callback(args);
    match <[Arg<T>; 1]>::try_from(args) {
        Ok([Arg::Text(s)]) => Ok((Target::ConnectionString(s), callback)),
        Ok([Arg::Object(o)]) => Ok((Target::Config(o), callback)),
        _ => Err(mismatch(method, accepted)),
    }
}

/// `Some(None)` for null, `Some(Some(s))` for a string, `None` otherwise.
fn nullable_text<T>(arg: Option<Arg<T>>) -> Option<Option<String>> {
    match arg {
        Some(Arg::Null) => Some(None),
        Some(Arg::Text(s)) => Some(Some(s)),
        _ => None,
    }
}
