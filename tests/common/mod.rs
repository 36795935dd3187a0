#![allow(dead_code)]

use std::sync::Arc;

use dbaccess::drivers::{InMemoryTestDriver, InMemoryTestResponseBuilder};
use dbaccess::traits::Driver;
use dbaccess::{DbClient, RowSet, SqlValue};

/// Route log output through the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn client(driver: &Arc<InMemoryTestDriver>) -> DbClient {
    let driver: Arc<dyn Driver> = Arc::clone(driver) as Arc<dyn Driver>;
    DbClient::with_driver(driver)
}

/// A single `n` column holding 1..=count.
pub fn numbers(count: i32) -> RowSet {
    (1..=count)
        .fold(InMemoryTestResponseBuilder::new().columns(&["n"]), |b, i| {
            b.values(vec![SqlValue::Int32(i)])
        })
        .build()
}

pub fn users() -> RowSet {
    InMemoryTestResponseBuilder::new()
        .columns(&["id", "name"])
        .values(vec![SqlValue::Int32(1), SqlValue::from("Alice")])
        .values(vec![SqlValue::Int32(2), SqlValue::from("Bob")])
        .build()
}
