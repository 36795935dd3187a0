mod catalog;
mod row;
mod sql_value;

pub use catalog::{ColumnFilter, ForeignKeyFilter, IsolationLevel, KeyFilter, TableFilter};
pub use row::{ResultSet, Row, RowSet};
pub use sql_value::SqlValue;
