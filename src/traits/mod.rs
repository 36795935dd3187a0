mod driver;

pub use driver::{Driver, DriverConnection, DriverCursor, DriverStatement, QueryOutput};
