mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dbaccess::drivers::InMemoryTestDriver;
use dbaccess::{Arg, Connection, DbError, DriverError, QueryResponse, Result, SqlValue};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use common::{client, init_tracing, users};

async fn open(driver: &Arc<InMemoryTestDriver>) -> Connection {
    client(driver).connect("DSN=memory").await.unwrap()
}

/// Runs one `query_args` call in callback mode and returns what the
/// callback received.
async fn via_callback(conn: &Connection, mut args: Vec<Arg<QueryResponse>>) -> Result<QueryResponse> {
    let (tx, rx) = oneshot::channel();
    args.push(Arg::callback(move |outcome| {
        let _ = tx.send(outcome);
    }));
    let completion = conn.query_args(args).unwrap();
    assert!(completion.is_scheduled());
    assert!(completion.await.is_none());
    rx.await.unwrap()
}

async fn via_future(conn: &Connection, args: Vec<Arg<QueryResponse>>) -> Result<QueryResponse> {
    let completion = conn.query_args(args).unwrap();
    assert!(!completion.is_scheduled());
    completion.await.unwrap()
}

#[tokio::test]
async fn test_both_modes_return_the_same_rows() {
    init_tracing();
    let driver = Arc::new(InMemoryTestDriver::new().with_default_response(users()));
    let conn = open(&driver).await;

    let args = || vec![Arg::from("SELECT id, name FROM users"), Arg::from(json!([1]))];
    let deferred = via_future(&conn, args()).await.unwrap().into_rows().unwrap();
    let called = via_callback(&conn, args()).await.unwrap().into_rows().unwrap();

    assert_eq!(deferred, called);
    driver.assert_query_count(2);
}

#[tokio::test]
async fn test_both_modes_report_driver_errors() {
    init_tracing();
    let driver = Arc::new(
        InMemoryTestDriver::new().with_error_for("SELECT broken", DriverError::new("boom").with_state("42000")),
    );
    let conn = open(&driver).await;

    for outcome in [
        via_future(&conn, vec![Arg::from("SELECT broken")]).await,
        via_callback(&conn, vec![Arg::from("SELECT broken")]).await,
    ] {
        match outcome {
            Err(DbError::Driver(e)) => assert_eq!(e, DriverError::new("boom").with_state("42000")),
            other => panic!("expected driver error, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_invalid_options_fail_before_driver_call() {
    init_tracing();
    let driver = Arc::new(InMemoryTestDriver::new());
    let conn = open(&driver).await;

    let cases: Vec<(Value, &str, bool)> = vec![
        (json!({"fetchSize": 0}), "query option `fetchSize` must be a positive integer", false),
        (json!({"fetchSize": -1}), "query option `fetchSize` must be a positive integer", false),
        (json!({"fetchSize": 1.5}), "query option `fetchSize` must be a positive integer", false),
        (json!({"fetchSize": "3"}), "query option `fetchSize` must be a number", true),
        (json!({"cursor": 1}), "query option `cursor` must be a boolean or a string", true),
        (json!({"timeout": -1}), "query option `timeout` must be a non-negative integer", false),
        (json!({"timeout": "5"}), "query option `timeout` must be a number", true),
        (json!({"initialBufferSize": 0}), "query option `initialBufferSize` must be a positive integer", false),
        (json!({"initialBufferSize": null}), "query option `initialBufferSize` must be a number", true),
    ];

    for (options, message, is_type) in cases {
        for callback_mode in [false, true] {
            let args = vec![Arg::from("SELECT 1"), Arg::from(options.clone())];
            let outcome = if callback_mode {
                via_callback(&conn, args).await
            } else {
                via_future(&conn, args).await
            };
            let err = outcome.unwrap_err();
            assert_eq!(err.to_string(), message, "options {options}");
            assert_eq!(err.is_type_error(), is_type, "options {options}");
            assert_eq!(err.is_range_error(), !is_type, "options {options}");
        }
    }
    driver.assert_query_count(0);
}

#[tokio::test]
async fn test_signature_errors_are_returned_synchronously() {
    init_tracing();
    let driver = Arc::new(InMemoryTestDriver::new());
    let conn = open(&driver).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let bad_shapes: Vec<Vec<Arg<QueryResponse>>> = vec![
        vec![],
        vec![Arg::from(1.0)],
        vec![Arg::from("SELECT 1"), Arg::from("not params")],
        vec![Arg::from("SELECT 1"), Arg::from(json!({})), Arg::from(json!([]))],
        vec![Arg::from("SELECT 1"), Arg::Null, Arg::Null, Arg::Null],
    ];
    for args in bad_shapes {
        let err = conn.query_args(args).unwrap_err();
        assert!(matches!(err, DbError::Signature { method: "query", .. }));
    }

    // Only the first function is the callback; a second one is a stray value
    let first = Arc::clone(&calls);
    let second = Arc::clone(&calls);
    let err = conn
        .query_args(vec![
            Arg::from("SELECT 1"),
            Arg::callback(move |_| {
                first.fetch_add(1, Ordering::SeqCst);
            }),
            Arg::callback(move |_| {
                second.fetch_add(1, Ordering::SeqCst);
            }),
        ])
        .unwrap_err();
    assert!(err.is_type_error());
    assert!(err.to_string().starts_with("query() called with an unsupported argument list"));

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    driver.assert_query_count(0);
}

#[tokio::test]
async fn test_callback_before_params_still_receives_outcome() {
    init_tracing();
    let driver = Arc::new(InMemoryTestDriver::new().with_default_response(users()));
    let conn = open(&driver).await;

    let (tx, rx) = oneshot::channel();
    let completion = conn
        .query_args(vec![
            Arg::from("SELECT id, name FROM users WHERE id = ?"),
            Arg::callback(move |outcome| {
                let _ = tx.send(outcome);
            }),
            Arg::from(json!([1])),
        ])
        .unwrap();
    assert!(completion.is_scheduled());
    assert!(completion.await.is_none());

    let rows = rx.await.unwrap().unwrap().into_rows().unwrap();
    assert_eq!(rows.len(), 2);
    driver.assert_last_query("SELECT id, name FROM users WHERE id = ?", &[SqlValue::Int64(1)]);
}

#[tokio::test(flavor = "current_thread")]
async fn test_callback_runs_once_and_never_synchronously() {
    init_tracing();
    let driver = Arc::new(InMemoryTestDriver::new());
    let conn = open(&driver).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let completion = conn
        .close_args(vec![Arg::callback(move |outcome: Result<()>| {
            assert!(outcome.is_ok());
            counter.fetch_add(1, Ordering::SeqCst);
        })])
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert!(completion.await.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_closed_resources_fail_in_callback_mode() {
    init_tracing();
    let driver = Arc::new(InMemoryTestDriver::new());
    let conn = open(&driver).await;
    conn.close().await.unwrap();

    let outcome = via_callback(&conn, vec![Arg::from("SELECT 1")]).await;
    assert!(outcome.unwrap_err().is_closed());

    let (tx, rx) = oneshot::channel();
    conn.close_args(vec![Arg::callback(move |outcome| {
        let _ = tx.send(outcome);
    })])
    .unwrap()
    .await;
    assert!(rx.await.unwrap().unwrap_err().is_closed());
    driver.assert_query_count(0);
}

#[tokio::test]
async fn test_client_connect_args() {
    init_tracing();
    let driver = Arc::new(InMemoryTestDriver::new());
    let client = client(&driver);

    let conn = client
        .connect_args(vec![Arg::from("DSN=memory")])
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn.connection_string(), "DSN=memory");

    let (tx, rx) = oneshot::channel();
    client
        .connect_args(vec![
            Arg::from(json!({"connectionString": "DSN=other", "loginTimeout": 5})),
            Arg::callback(move |conn| {
                let _ = tx.send(conn);
            }),
        ])
        .unwrap()
        .await;
    let other = rx.await.unwrap().unwrap();
    assert_eq!(other.connection_string(), "DSN=other");
    assert_ne!(conn.id(), other.id());

    // A config object without a connection string fails through the
    // completion, not synchronously
    let outcome = client
        .connect_args(vec![Arg::from(json!({"loginTimeout": 5}))])
        .unwrap()
        .await
        .unwrap();
    assert!(matches!(outcome, Err(DbError::Configuration(_))));

    assert!(client
        .connect_args(vec![Arg::from(true)])
        .unwrap_err()
        .is_type_error());
    assert_eq!(driver.connect_calls(), vec![1, 1]);
}
