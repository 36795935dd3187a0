//! Connection pool.
//!
//! The pool keeps a collection of free connections, opened in batches with a
//! single [`Driver::connect`] call. A leased connection is handed out as a
//! [`PooledConnection`]; closing it returns the lease: the underlying
//! connection is really closed in the background and, depending on the
//! `shrink` policy, replaced by a fresh one.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::completion::Completion;
use crate::config::PoolConfig;
use crate::connection::{parse_options, Connection, QueryResponse};
use crate::error::{DbError, DriverError, OptionError, Resource, Result};
use crate::options::QueryOptions;
use crate::signature::{self, Arg, QueryCall};
use crate::traits::Driver;
use crate::types::{ResultSet, SqlValue};

/// Below this many free connections, `connect()` grows the pool first.
pub const LOW_WATER: usize = 2;

/// Source of connection ids, shared by everything one client opens.
#[derive(Debug, Default)]
pub(crate) struct IdSequence(AtomicU64);

impl IdSequence {
    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// A point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections waiting to be leased.
    pub free: usize,
    /// Connections currently handed out, overflow included.
    pub leased: usize,
    /// Connections counted against `max`: free, leased and opening.
    pub total: usize,
    pub max: usize,
}

struct IdleConnection {
    conn: Connection,
    since: Instant,
}

struct Lease {
    conn: Connection,
    /// Opened past `max_size`; closed for good on release.
    overflow: bool,
}

#[derive(Default)]
struct PoolState {
    free: VecDeque<IdleConnection>,
    leased: HashMap<u64, Lease>,
    opening: usize,
    initialized: bool,
    closed: bool,
    reaper: Option<JoinHandle<()>>,
}

impl PoolState {
    fn total(&self) -> usize {
        let managed_leases = self.leased.values().filter(|l| !l.overflow).count();
        self.free.len() + managed_leases + self.opening
    }

    fn push_free(&mut self, conn: Connection) {
        self.free.push_back(IdleConnection {
            conn,
            since: Instant::now(),
        });
    }
}

/// Connections counted in `opening` while they are being opened. Dropping
/// the reservation unsettled gives the count back, so a cancelled open
/// never leaves the managed total inflated.
struct Reservation {
    pool: Arc<PoolInner>,
    count: usize,
}

impl Reservation {
    /// Takes `count` slots. The caller holds the state lock.
    fn take(pool: &Arc<PoolInner>, state: &mut PoolState, count: usize) -> Self {
        state.opening += count;
        Self {
            pool: Arc::clone(pool),
            count,
        }
    }

    /// Hands the slots back under a lock the caller already holds.
    fn settle(mut self, state: &mut PoolState) {
        state.opening -= self.count;
        self.count = 0;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.count > 0 {
            self.pool.state.lock().opening -= self.count;
        }
    }
}

struct PoolInner {
    id: Uuid,
    config: PoolConfig,
    driver: Arc<dyn Driver>,
    ids: Arc<IdSequence>,
    state: Mutex<PoolState>,
    init_gate: tokio::sync::Mutex<()>,
    in_flight: AtomicUsize,
    settled: Notify,
}

/// A pool of connections opened from one connection string.
///
/// Cloning a `Pool` yields another handle to the same pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create an empty pool. Nothing is opened until [`init`](Pool::init) or
    /// the first [`connect`](Pool::connect).
    pub fn new(driver: Arc<dyn Driver>, config: PoolConfig) -> Result<Self> {
        Self::with_ids(driver, config, Arc::new(IdSequence::default()))
    }

    pub(crate) fn with_ids(
        driver: Arc<dyn Driver>,
        config: PoolConfig,
        ids: Arc<IdSequence>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                id: Uuid::new_v4(),
                config,
                driver,
                ids,
                state: Mutex::new(PoolState::default()),
                init_gate: tokio::sync::Mutex::new(()),
                in_flight: AtomicUsize::new(0),
                settled: Notify::new(),
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            free: state.free.len(),
            leased: state.leased.len(),
            total: state.total(),
            max: self.inner.config.max_size,
        }
    }

    pub fn free_count(&self) -> usize {
        self.inner.state.lock().free.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Open `initial_size` connections in one batch.
    ///
    /// Returns `Ok(true)` when this call populated the pool and `Ok(false)`
    /// when it was already initialized. A failed batch leaves the pool
    /// uninitialized.
    pub async fn init(&self) -> Result<bool> {
        let _gate = self.inner.init_gate.lock().await;
        {
            let state = self.inner.state.lock();
            if state.closed {
                return Err(DbError::Closed(Resource::Pool));
            }
            if state.initialized {
                tracing::warn!(pool_id = %self.inner.id, "pool already initialized");
                return Ok(false);
            }
        }

        let opened = self.inner.open(self.inner.config.initial_size).await?;

        let rejected = {
            let mut state = self.inner.state.lock();
            if state.closed {
                Some(opened)
            } else {
                for conn in opened {
                    state.push_free(conn);
                }
                state.initialized = true;
                state.reaper = spawn_reaper(&self.inner);
                None
            }
        };
        if let Some(rejected) = rejected {
            close_all(rejected).await;
            return Err(DbError::Closed(Resource::Pool));
        }

        tracing::info!(
            pool_id = %self.inner.id,
            free = self.inner.config.initial_size,
            "pool initialized"
        );
        Ok(true)
    }

    pub fn init_args(&self, args: Vec<Arg<bool>>) -> Result<Completion<bool>> {
        let callback = signature::resolve_none("init", args)?;
        let pool = self.clone();
        Ok(Completion::new(async move { pool.init().await }, callback))
    }

    /// Lease a connection.
    ///
    /// Grows the pool by `increment_size` first when fewer than
    /// [`LOW_WATER`] connections are free. At `max_size` with nothing free
    /// an extra connection is opened outside the managed total.
    pub async fn connect(&self) -> Result<PooledConnection> {
        let initialized = {
            let state = self.inner.state.lock();
            if state.closed {
                return Err(DbError::Closed(Resource::Pool));
            }
            state.initialized
        };
        if !initialized {
            self.init().await?;
        }

        let grow = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(DbError::Closed(Resource::Pool));
            }
            if state.free.len() < LOW_WATER {
                let room = self.inner.config.max_size.saturating_sub(state.total());
                let n = self.inner.config.effective_increment_size().min(room);
                if n > 0 {
                    Some(Reservation::take(&self.inner, &mut state, n))
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let Some(reservation) = grow {
            self.grow(reservation).await?;
        }

        let taken = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(DbError::Closed(Resource::Pool));
            }
            match state.free.pop_front() {
                Some(idle) => {
                    let lease = Lease {
                        conn: idle.conn.clone(),
                        overflow: false,
                    };
                    state.leased.insert(idle.conn.id(), lease);
                    Some(idle.conn)
                }
                None => None,
            }
        };

        let conn = match taken {
            Some(conn) => conn,
            None => self.open_outside_free().await?,
        };

        tracing::debug!(
            pool_id = %self.inner.id,
            connection_id = conn.id(),
            free = self.free_count(),
            "connection leased"
        );
        Ok(PooledConnection {
            conn,
            pool: Arc::clone(&self.inner),
            released: AtomicBool::new(false),
        })
    }

    pub fn connect_args(
        &self,
        args: Vec<Arg<PooledConnection>>,
    ) -> Result<Completion<PooledConnection>> {
        let callback = signature::resolve_none("connect", args)?;
        let pool = self.clone();
        Ok(Completion::new(async move { pool.connect().await }, callback))
    }

    /// Open the reserved connections and add them to the free collection.
    /// A failure is only returned when nothing is free.
    async fn grow(&self, reservation: Reservation) -> Result<()> {
        let n = reservation.count;
        let result = self.inner.open(n).await;

        let rejected = {
            let mut state = self.inner.state.lock();
            reservation.settle(&mut state);
            match result {
                Ok(opened) if state.closed => opened,
                Ok(opened) => {
                    for conn in opened {
                        state.push_free(conn);
                    }
                    tracing::debug!(
                        pool_id = %self.inner.id,
                        added = n,
                        free = state.free.len(),
                        "pool grown"
                    );
                    Vec::new()
                }
                Err(e) if state.free.is_empty() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        pool_id = %self.inner.id,
                        error = %e,
                        "failed to grow pool, leasing an existing connection"
                    );
                    Vec::new()
                }
            }
        };

        if !rejected.is_empty() {
            close_all(rejected).await;
            return Err(DbError::Closed(Resource::Pool));
        }
        Ok(())
    }

    /// Open a single connection straight into the leased set. It counts as
    /// overflow when the managed total has already reached `max_size`.
    async fn open_outside_free(&self) -> Result<Connection> {
        let conn = self
            .inner
            .open(1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::new("driver opened no connection"))?;

        let accepted = {
            let mut state = self.inner.state.lock();
            if state.closed {
                false
            } else {
                let overflow = state.total() >= self.inner.config.max_size;
                if overflow {
                    tracing::debug!(
                        pool_id = %self.inner.id,
                        connection_id = conn.id(),
                        "pool exhausted, opened overflow connection"
                    );
                }
                state.leased.insert(
                    conn.id(),
                    Lease {
                        conn: conn.clone(),
                        overflow,
                    },
                );
                true
            }
        };

        if !accepted {
            close_all(vec![conn]).await;
            return Err(DbError::Closed(Resource::Pool));
        }
        Ok(conn)
    }

    /// Run `sql` on a leased connection and return every row. The lease is
    /// returned whether or not the query succeeds.
    pub async fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
        options: &QueryOptions,
    ) -> Result<ResultSet> {
        if options.wants_cursor() {
            let key = if options.cursor.is_some() {
                "cursor"
            } else {
                "fetchSize"
            };
            return Err(OptionError::Range {
                key,
                requirement: "absent for pool queries",
            }
            .into());
        }

        let conn = self.connect().await?;
        let outcome = conn.query(sql, params, options).await;
        conn.release();

        match outcome? {
            QueryResponse::Rows(rows) => Ok(rows),
            QueryResponse::Cursor(cursor) => {
                cursor.close().await?;
                Err(DriverError::new("driver returned a cursor for a materialized query").into())
            }
        }
    }

    /// Dual-mode `query(sql, params?, options?, callback?)`.
    pub fn query_args(&self, args: Vec<Arg<ResultSet>>) -> Result<Completion<ResultSet>> {
        let QueryCall {
            sql,
            params,
            options,
            callback,
        } = signature::resolve_query("query", args)?;
        let options = match parse_options(options) {
            Ok(options) => options,
            Err(e) => return Ok(Completion::failed(e, callback)),
        };
        let pool = self.clone();
        Ok(Completion::new(
            async move { pool.query(&sql, &params, &options).await },
            callback,
        ))
    }

    /// Wait until every background close and replenishment has finished.
    pub async fn settled(&self) {
        self.inner.settled().await;
    }

    /// Close the pool and every connection it references, free and leased.
    ///
    /// All closes are attempted; the first failure is returned. Waiting for
    /// background work is best-effort: a lease returned after that wait but
    /// before the drain is closed by its own task, which `close` does not
    /// await.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(DbError::Closed(Resource::Pool));
            }
            state.closed = true;
            if let Some(reaper) = state.reaper.take() {
                reaper.abort();
            }
        }
        tracing::info!(pool_id = %self.inner.id, "closing pool");

        self.inner.settled().await;

        let connections: Vec<Connection> = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state
                .free
                .drain(..)
                .map(|idle| idle.conn)
                .chain(state.leased.drain().map(|(_, lease)| lease.conn))
                .collect()
        };
        let count = connections.len();

        let mut first_error = None;
        for result in join_all(connections.iter().map(|conn| conn.close())).await {
            match result {
                Ok(()) => {}
                // Closed by its user through the inner connection.
                Err(e) if e.is_closed() => {}
                Err(e) => {
                    tracing::error!(pool_id = %self.inner.id, error = %e, "failed to close pooled connection");
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::info!(pool_id = %self.inner.id, closed = count, "pool closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn close_args(&self, args: Vec<Arg<()>>) -> Result<Completion<()>> {
        let callback = signature::resolve_none("close", args)?;
        let pool = self.clone();
        Ok(Completion::new(async move { pool.close().await }, callback))
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl PoolInner {
    async fn open(&self, count: usize) -> Result<Vec<Connection>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let handles = self
            .driver
            .connect(&self.config.connection(), count)
            .await?;
        Ok(handles
            .into_iter()
            .map(|handle| {
                Connection::from_handle(self.ids.next(), &self.config.connection_string, handle)
            })
            .collect())
    }

    /// Return a lease. Bookkeeping happens here, synchronously; the real
    /// close and any replenishment run in the background.
    ///
    /// Outside a Tokio runtime the lease is still removed, but the connection
    /// is dropped unclosed and nothing is replenished.
    fn release(self: &Arc<Self>, conn: &Connection) {
        let runtime = tokio::runtime::Handle::try_current().ok();
        let replenish = {
            let mut state = self.state.lock();
            let Some(lease) = state.leased.remove(&conn.id()) else {
                // Already taken over by pool close.
                return;
            };
            let replenish = runtime.is_some()
                && !state.closed
                && !lease.overflow
                && (state.free.len() < self.config.initial_size || !self.config.shrink);
            if replenish {
                Some(Reservation::take(self, &mut state, 1))
            } else {
                None
            }
        };

        tracing::debug!(
            pool_id = %self.id,
            connection_id = conn.id(),
            replenish = replenish.is_some(),
            "connection returned"
        );

        let Some(runtime) = runtime else {
            tracing::warn!(
                pool_id = %self.id,
                connection_id = conn.id(),
                "no runtime available, returned connection left unclosed"
            );
            return;
        };

        let inner = Arc::clone(self);
        let conn = conn.clone();
        self.spawn_tracked(&runtime, async move {
            if let Err(e) = conn.close().await {
                if !e.is_closed() {
                    tracing::error!(
                        pool_id = %inner.id,
                        connection_id = conn.id(),
                        error = %e,
                        "failed to close returned connection"
                    );
                }
            }
            if let Some(reservation) = replenish {
                inner.replenish(reservation).await;
            }
        });
    }

    async fn replenish(&self, reservation: Reservation) {
        let result = self.open(1).await;
        let rejected = {
            let mut state = self.state.lock();
            reservation.settle(&mut state);
            match result {
                Ok(opened) if state.closed => opened,
                Ok(opened) => {
                    for conn in opened {
                        state.push_free(conn);
                    }
                    Vec::new()
                }
                Err(e) => {
                    tracing::error!(pool_id = %self.id, error = %e, "failed to replenish pool");
                    Vec::new()
                }
            }
        };
        close_all(rejected).await;
    }

    /// Run `task` in the background, counted until it finishes.
    fn spawn_tracked<F>(self: &Arc<Self>, runtime: &tokio::runtime::Handle, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let inner = Arc::clone(self);
        runtime.spawn(async move {
            task.await;
            if inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                inner.settled.notify_waiters();
            }
        });
    }

    async fn settled(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Remove free connections idle for at least `idle`, keeping
    /// `initial_size` of them.
    fn take_expired(&self, idle: Duration) -> Vec<Connection> {
        let mut state = self.state.lock();
        let mut expired = Vec::new();
        if state.closed {
            return expired;
        }
        while state.free.len() > self.config.initial_size
            && state.free.front().is_some_and(|c| c.since.elapsed() >= idle)
        {
            if let Some(idle) = state.free.pop_front() {
                expired.push(idle.conn);
            }
        }
        expired
    }
}

fn spawn_reaper(inner: &Arc<PoolInner>) -> Option<JoinHandle<()>> {
    let idle = inner.config.idle_timeout.filter(|_| inner.config.shrink)?;
    let weak: Weak<PoolInner> = Arc::downgrade(inner);
    let period = (idle / 2).max(Duration::from_millis(10));

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let expired = inner.take_expired(idle);
            if !expired.is_empty() {
                tracing::debug!(pool_id = %inner.id, count = expired.len(), "closing idle connections");
            }
            drop(inner);
            close_all(expired).await;
        }
    }))
}

async fn close_all(connections: Vec<Connection>) {
    for result in join_all(connections.iter().map(|conn| conn.close())).await {
        if let Err(e) = result {
            tracing::error!(error = %e, "failed to close connection");
        }
    }
}

/// A connection leased from a [`Pool`].
///
/// Dereferences to [`Connection`]. Closing it (or dropping it) returns the
/// lease to the pool instead of closing the connection directly.
///
/// Only the methods on `PooledConnection` itself are intercepted. Going
/// through the [`Connection`] it dereferences to bypasses the pool:
/// `pooled.clone()` yields a plain `Connection` handle, and
/// `Connection::close(&pooled)` really closes the connection while the lease
/// stays outstanding until the `PooledConnection` is closed or dropped. Use
/// [`connection`](PooledConnection::connection) to take that handle
/// explicitly.
pub struct PooledConnection {
    conn: Connection,
    pool: Arc<PoolInner>,
    released: AtomicBool,
}

impl PooledConnection {
    pub fn pool_id(&self) -> Uuid {
        self.pool.id
    }

    /// The underlying connection. Closing it does not return the lease.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.pool.release(&self.conn);
        true
    }

    /// Return the lease. Completes once the pool's bookkeeping is done; the
    /// connection itself closes in the background.
    pub async fn close(&self) -> Result<()> {
        if self.release() {
            Ok(())
        } else {
            Err(DbError::Closed(Resource::Connection))
        }
    }

    pub fn close_args(&self, args: Vec<Arg<()>>) -> Result<Completion<()>> {
        let callback = signature::resolve_none("close", args)?;
        let outcome = if self.release() {
            Ok(())
        } else {
            Err(DbError::Closed(Resource::Connection))
        };
        Ok(Completion::new(async move { outcome }, callback))
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.release() {
            tracing::trace!(connection_id = self.conn.id(), "pooled connection dropped without close");
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool_id", &self.pool.id)
            .field("connection", &self.conn)
            .finish()
    }
}
