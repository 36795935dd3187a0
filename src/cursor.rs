//! Incremental result reading.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::completion::Completion;
use crate::connection::ConnectionShared;
use crate::error::{DbError, Resource, Result};
use crate::signature::{self, Arg};
use crate::traits::DriverCursor;
use crate::types::{ResultSet, RowSet, SqlValue};

/// Pages through a result that has not been fully read.
///
/// [`no_data`](Cursor::no_data) stays false until a fetch returns fewer rows
/// than the fetch size. Fetching past the end yields empty pages.
#[derive(Clone)]
pub struct Cursor {
    inner: Arc<Inner>,
}

struct Inner {
    handle: Arc<dyn DriverCursor>,
    owner: Arc<ConnectionShared>,
    fetch_size: usize,
    gate: Mutex<()>,
    no_data: AtomicBool,
    closed: AtomicBool,
}

impl Cursor {
    pub(crate) fn new(
        handle: Arc<dyn DriverCursor>,
        fetch_size: usize,
        owner: Arc<ConnectionShared>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                handle,
                owner,
                fetch_size,
                gate: Mutex::new(()),
                no_data: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn no_data(&self) -> bool {
        self.inner.no_data.load(Ordering::Acquire)
    }

    pub fn fetch_size(&self) -> usize {
        self.inner.fetch_size
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Read the next page of at most `fetch_size` rows.
    pub async fn fetch(&self) -> Result<ResultSet> {
        let _turn = self.inner.gate.lock().await;
        if self.is_closed() {
            return Err(DbError::Closed(Resource::Cursor));
        }
        if self.inner.owner.is_closed() {
            return Err(DbError::Closed(Resource::Connection));
        }
        if self.no_data() {
            return Ok(ResultSet::from_raw(RowSet::empty()));
        }

        let page = self.inner.handle.fetch(self.inner.fetch_size).await?;
        if page.len() < self.inner.fetch_size {
            self.inner.no_data.store(true, Ordering::Release);
        }
        Ok(ResultSet::from_raw(page))
    }

    pub fn fetch_args(&self, args: Vec<Arg<ResultSet>>) -> Result<Completion<ResultSet>> {
        let callback = signature::resolve_none("fetch", args)?;
        let cursor = self.clone();
        Ok(Completion::new(async move { cursor.fetch().await }, callback))
    }

    /// Release the driver result handle. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let _turn = self.inner.gate.lock().await;
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.handle.close().await
    }

    pub fn close_args(&self, args: Vec<Arg<()>>) -> Result<Completion<()>> {
        let callback = signature::resolve_none("close", args)?;
        let cursor = self.clone();
        Ok(Completion::new(async move { cursor.close().await }, callback))
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("fetch_size", &self.inner.fetch_size)
            .field("no_data", &self.no_data())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Serves already-materialized rows through the cursor interface, for
/// drivers that answer a cursor request with every row at once.
pub(crate) struct BufferedCursor {
    columns: Vec<String>,
    rows: parking_lot::Mutex<VecDeque<Vec<SqlValue>>>,
}

impl BufferedCursor {
    pub(crate) fn new(rows: RowSet) -> Self {
        Self {
            columns: rows.columns,
            rows: parking_lot::Mutex::new(rows.rows.into()),
        }
    }
}

#[async_trait]
impl DriverCursor for BufferedCursor {
    async fn fetch(&self, count: usize) -> Result<RowSet> {
        let mut rows = self.rows.lock();
        let take = count.min(rows.len());
        let page = rows.drain(..take).collect();
        Ok(RowSet::new(self.columns.clone(), page))
    }

    async fn close(&self) -> Result<()> {
        self.rows.lock().clear();
        Ok(())
    }
}
