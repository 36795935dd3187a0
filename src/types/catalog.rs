/// Filter for a `tables` catalog lookup. `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFilter {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub table_type: Option<String>,
}

/// Filter for a `columns` catalog lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnFilter {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
}

/// Identifies the table of a primary or foreign key lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFilter {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
}

/// Filter for a `foreign_keys` lookup: the referenced (primary key) side
/// and the referencing (foreign key) side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForeignKeyFilter {
    pub primary: KeyFilter,
    pub foreign: KeyFilter,
}

/// Transaction isolation level, numbered with the ODBC `SQL_TXN_*` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted = 1,
    ReadCommitted = 2,
    RepeatableRead = 4,
    Serializable = 8,
}

impl IsolationLevel {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::ReadUncommitted),
            2 => Some(Self::ReadCommitted),
            4 => Some(Self::RepeatableRead),
            8 => Some(Self::Serializable),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// SQL spelling, as used in `SET TRANSACTION ISOLATION LEVEL`.
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}
