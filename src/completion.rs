//! Dual-mode completion: deliver an operation's outcome either as a future
//! or to a caller-supplied callback.
//!
//! Every `*_args` entry point builds its operation as a future and hands it
//! to [`Completion::new`] together with the optional callback it resolved
//! from its arguments. Nothing else in the crate branches on calling style.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::error::{DbError, Result};

/// Continuation invoked exactly once with an operation's outcome.
pub type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Boxes a closure as a [`Callback`].
pub fn callback<T, F>(f: F) -> Callback<T>
where
    F: FnOnce(Result<T>) + Send + 'static,
{
    Box::new(f)
}

/// The pending outcome of a dual-mode call.
///
/// Awaiting it yields `Some(outcome)` when no callback was supplied. When a
/// callback was supplied it yields `None` once the callback has run.
#[must_use = "a completion without a callback does nothing unless awaited"]
pub struct Completion<T> {
    state: State<T>,
}

enum State<T> {
    Deferred(BoxFuture<'static, Result<T>>),
    Scheduled(JoinHandle<()>),
    Done,
}

impl<T: Send + 'static> Completion<T> {
    /// Wraps `operation`. With a callback the operation is spawned on the
    /// current Tokio runtime and the callback runs on a later task turn,
    /// never on the caller's stack.
    pub fn new<F>(operation: F, callback: Option<Callback<T>>) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let state = match callback {
            None => State::Deferred(Box::pin(operation)),
            Some(callback) => State::Scheduled(tokio::spawn(async move {
                tokio::task::yield_now().await;
                let outcome = operation.await;
                callback(outcome);
            })),
        };
        Self { state }
    }

    /// A completion that fails with `error` through the same channel a
    /// driver failure would use.
    pub fn failed(error: DbError, callback: Option<Callback<T>>) -> Self {
        Self::new(async move { Err(error) }, callback)
    }

    /// True when the outcome goes to a callback.
    pub fn is_scheduled(&self) -> bool {
        matches!(self.state, State::Scheduled(_))
    }
}

impl<T> Future for Completion<T> {
    type Output = Option<Result<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let ready = match &mut this.state {
            State::Deferred(operation) => match operation.as_mut().poll(cx) {
                Poll::Ready(outcome) => Some(outcome),
                Poll::Pending => return Poll::Pending,
            },
            State::Scheduled(handle) => match Pin::new(handle).poll(cx) {
                Poll::Ready(Ok(())) => None,
                Poll::Ready(Err(join_error)) => {
                    if join_error.is_panic() {
                        std::panic::resume_unwind(join_error.into_panic());
                    }
                    None
                }
                Poll::Pending => return Poll::Pending,
            },
            State::Done => return Poll::Ready(None),
        };
        this.state = State::Done;
        Poll::Ready(ready)
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.state {
            State::Deferred(_) => "deferred",
            State::Scheduled(_) => "scheduled",
            State::Done => "done",
        };
        f.debug_struct("Completion").field("mode", &mode).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_deferred_yields_outcome() {
        let completion = Completion::new(async { Ok(7) }, None);
        assert!(!completion.is_scheduled());
        assert_eq!(completion.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_callback_receives_outcome() {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(
            async { Ok("done") },
            Some(callback(move |r: Result<&str>| {
                let _ = tx.send(r.unwrap());
            })),
        );
        assert!(completion.is_scheduled());
        assert!(completion.await.is_none());
        assert_eq!(rx.await.unwrap(), "done");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_callback_never_runs_synchronously() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let completion = Completion::failed(
            DbError::Configuration("boom".into()),
            Some(callback(move |r: Result<()>| {
                assert!(r.is_err());
                flag.store(true, Ordering::SeqCst);
            })),
        );
        assert!(!called.load(Ordering::SeqCst));
        let _ = completion.await;
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_deferred() {
        let outcome = Completion::<()>::failed(DbError::Configuration("x".into()), None).await;
        assert!(matches!(outcome, Some(Err(DbError::Configuration(_)))));
    }
}
