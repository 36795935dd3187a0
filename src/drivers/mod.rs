mod in_memory_test;
#[cfg(feature = "postgres")]
mod tokio_postgres;

pub use self::in_memory_test::{InMemoryTestDriver, InMemoryTestResponseBuilder, RecordedQuery};
#[cfg(feature = "postgres")]
pub use self::tokio_postgres::TokioPostgresDriver;
