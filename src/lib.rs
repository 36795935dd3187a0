//! dbaccess - A driver-agnostic database access layer with connection pooling
//!
//! Every asynchronous operation is available twice: as a typed `async fn`,
//! and as an `*_args` entry point that takes a loosely typed argument list
//! ending in an optional callback.
//!
//! # Example
//! ```ignore
//! use dbaccess::{DbClient, PoolConfig, QueryOptions};
//!
//! let client = DbClient::postgres();
//! let pool = client
//!     .pool(PoolConfig::new("postgres://localhost/mydb").initial_size(4))
//!     .await?;
//!
//! // Lease a connection and page through a result
//! let conn = pool.connect().await?;
//! let cursor = conn
//!     .query("SELECT id, name FROM users", &[], &QueryOptions::new().fetch_size(100))
//!     .await?
//!     .into_cursor()
//!     .expect("cursor requested");
//!
//! while !cursor.no_data() {
//!     for row in cursor.fetch().await?.rows() {
//!         let id = row.get("id")?;
//!     }
//! }
//! cursor.close().await?;
//!
//! // Returns the lease to the pool
//! conn.close().await?;
//! pool.close().await?;
//! ```

pub mod completion;
pub mod config;
pub mod drivers;
pub mod error;
pub mod options;
pub mod signature;
pub mod traits;
pub mod types;

mod client;
mod connection;
mod cursor;
mod pool;
mod statement;

// Re-export main types for convenient access
pub use client::DbClient;
pub use completion::{callback, Callback, Completion};
pub use config::{ConnectionConfig, PoolConfig};
pub use connection::{Connection, QueryResponse};
pub use cursor::Cursor;
pub use error::{DbError, DriverError, OptionError, Resource, Result};
pub use options::{CursorOption, QueryOptions, DEFAULT_FETCH_SIZE};
pub use pool::{Pool, PoolStatus, PooledConnection, LOW_WATER};
pub use signature::Arg;
pub use statement::{Statement, StatementState};
pub use traits::{Driver, DriverConnection, DriverCursor, DriverStatement, QueryOutput};
pub use types::{
    ColumnFilter, ForeignKeyFilter, IsolationLevel, KeyFilter, ResultSet, Row, RowSet, SqlValue,
    TableFilter,
};
