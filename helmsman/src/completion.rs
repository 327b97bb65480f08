//! Single-assignment asynchronous result cells.
//!
//! A [`Completion`] is the consuming half of a one-shot result: it can be waited on from
//! synchronous code, awaited as a `Future`, or extended with continuations which run on an
//! attached [`Executor`]. The producing half is a [`Resolver`]. Each cell is fulfilled at most
//! once; a value set before a continuation is attached is still delivered.
//!
//! Continuation-returning callbacks are flattened through [`Step`], so a
//! `Completion<Completion<T>>` is never constructed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;
use std::time::Duration;

use crate::error::RaftError;
use crate::error::RaftResult;
use crate::executor::Executor;

type Continuation<T> = Box<dyn FnOnce(RaftResult<T>) + Send + 'static>;

enum CellState<T> {
    Pending {
        continuation: Option<(Continuation<T>, Executor)>,
        waker: Option<Waker>,
    },
    /// The inner option is `None` once the result has been consumed.
    Settled(Option<RaftResult<T>>),
    Cancelled,
}

struct Shared<T> {
    state: Mutex<CellState<T>>,
    cond: Condvar,
}

impl<T> Shared<T> {
    fn new_pending() -> Arc<Self> {
        Arc::new(Shared {
            state: Mutex::new(CellState::Pending {
                continuation: None,
                waker: None,
            }),
            cond: Condvar::new(),
        })
    }
}

/// The producing half of a completion cell.
///
/// Dropping an unresolved resolver fails the cell with `Cancelled` so that consumers never
/// hang on a result which can no longer arrive.
pub struct Resolver<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    resolved: std::sync::atomic::AtomicBool,
}

impl<T: Send + 'static> Resolver<T> {
    /// Fulfil the cell with a value.
    ///
    /// Fails with `AlreadyFulfilled` if the cell has already settled. Fulfilling a cancelled
    /// cell silently discards the value.
    pub fn fulfil(&self, value: T) -> RaftResult<()> {
        self.resolve(Ok(value))
    }

    /// Fail the cell with the given error.
    pub fn fail(&self, err: RaftError) -> RaftResult<()> {
        self.resolve(Err(err))
    }

    /// Settle the cell with the given result.
    pub fn resolve(&self, res: RaftResult<T>) -> RaftResult<()> {
        self.resolved.store(true, std::sync::atomic::Ordering::Relaxed);
        let mut state = self.shared.state.lock().unwrap();
        match &mut *state {
            CellState::Pending { continuation, waker } => {
                let continuation = continuation.take();
                let waker = waker.take();
                match continuation {
                    Some((f, executor)) => {
                        *state = CellState::Settled(None);
                        drop(state);
                        self.shared.cond.notify_all();
                        executor.add(move || f(res))
                    }
                    None => {
                        *state = CellState::Settled(Some(res));
                        drop(state);
                        self.shared.cond.notify_all();
                        if let Some(w) = waker {
                            w.wake();
                        }
                        Ok(())
                    }
                }
            }
            CellState::Settled(_) => Err(RaftError::AlreadyFulfilled),
            CellState::Cancelled => Ok(()),
        }
    }
}

impl<T: Send + 'static> Drop for Resolver<T> {
    fn drop(&mut self) {
        if self.resolved.load(std::sync::atomic::Ordering::Relaxed) {
            return;
        }
        let mut state = self.shared.state.lock().unwrap();
        if let CellState::Pending { continuation, waker } = &mut *state {
            let continuation = continuation.take();
            let waker = waker.take();
            match continuation {
                Some((f, executor)) => {
                    *state = CellState::Settled(None);
                    drop(state);
                    self.shared.cond.notify_all();
                    let _ = executor.add(move || f(Err(RaftError::Cancelled)));
                }
                None => {
                    *state = CellState::Settled(Some(Err(RaftError::Cancelled)));
                    drop(state);
                    self.shared.cond.notify_all();
                    if let Some(w) = waker {
                        w.wake();
                    }
                }
            }
        }
    }
}

/// A single-assignment asynchronous result handle.
///
/// Move-only: combinators consume the handle, so at most one continuation can ever be
/// attached to a given cell.
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
    executor: Executor,
}

impl<T: Send + 'static> Completion<T> {
    /// Create a new pending cell, returning its producing and consuming halves.
    ///
    /// Continuations attached to the returned completion run inline.
    pub fn pair() -> (Resolver<T>, Completion<T>) {
        Self::pair_on(&Executor::inline())
    }

    /// Same as [`Completion::pair`], but continuations are posted to the given executor.
    pub fn pair_on(executor: &Executor) -> (Resolver<T>, Completion<T>) {
        let shared = Shared::new_pending();
        (
            Resolver {
                shared: shared.clone(),
                resolved: std::sync::atomic::AtomicBool::new(false),
            },
            Completion {
                shared,
                executor: executor.clone(),
            },
        )
    }

    /// A completion which is already fulfilled with `value`.
    pub fn ready(value: T) -> Completion<T> {
        Self::settled(Ok(value))
    }

    /// A completion which is already failed with `err`.
    pub fn failed(err: RaftError) -> Completion<T> {
        Self::settled(Err(err))
    }

    fn settled(res: RaftResult<T>) -> Completion<T> {
        Completion {
            shared: Arc::new(Shared {
                state: Mutex::new(CellState::Settled(Some(res))),
                cond: Condvar::new(),
            }),
            executor: Executor::inline(),
        }
    }

    /// Check whether the cell has settled.
    pub fn is_ready(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        matches!(&*state, CellState::Settled(_))
    }

    /// Block the calling thread until the cell settles or `timeout` elapses.
    ///
    /// Returns `true` once settled. An expired wait returns `false` without consuming the
    /// result; the cell can still be waited on or read afterwards.
    pub fn wait(&self, timeout: Duration) -> bool {
        let state = self.shared.state.lock().unwrap();
        let (state, _timeout_res) = self
            .shared
            .cond
            .wait_timeout_while(state, timeout, |s| matches!(s, CellState::Pending { .. }))
            .unwrap();
        !matches!(&*state, CellState::Pending { .. })
    }

    /// Block the calling thread until the result is available, consuming the cell.
    pub fn get(self) -> RaftResult<T> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            match &mut *state {
                CellState::Pending { .. } => state = self.shared.cond.wait(state).unwrap(),
                CellState::Settled(slot) => {
                    return match slot.take() {
                        Some(res) => res,
                        None => Err(RaftError::AlreadyFulfilled),
                    }
                }
                CellState::Cancelled => return Err(RaftError::Cancelled),
            }
        }
    }

    /// Change the executor used for continuations attached after this call.
    ///
    /// Continuations already attached upstream are unaffected.
    pub fn via(mut self, executor: &Executor) -> Completion<T> {
        self.executor = executor.clone();
        self
    }

    /// Cancel the cell. A result delivered afterwards is silently discarded.
    pub fn cancel(self) {
        let mut state = self.shared.state.lock().unwrap();
        if let CellState::Pending { .. } = &*state {
            *state = CellState::Cancelled;
            drop(state);
            self.shared.cond.notify_all();
        }
    }

    /// Attach the terminal continuation for this cell.
    ///
    /// If the cell has already settled, the continuation is posted immediately on the
    /// attached executor.
    pub(crate) fn on_settle(self, f: Continuation<T>) {
        let mut state = self.shared.state.lock().unwrap();
        match &mut *state {
            CellState::Pending { continuation, .. } => {
                *continuation = Some((f, self.executor.clone()));
            }
            CellState::Settled(slot) => {
                if let Some(res) = slot.take() {
                    drop(state);
                    let _ = self.executor.add(move || f(res));
                }
            }
            CellState::Cancelled => {
                drop(state);
                let _ = self.executor.add(move || f(Err(RaftError::Cancelled)));
            }
        }
    }

    /// Map a successful value, propagating errors untouched.
    pub fn then_value<U, F>(self, f: F) -> Completion<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let (tx, rx) = Completion::pair_on(&self.executor);
        self.on_settle(Box::new(move |res| {
            let _ = tx.resolve(res.map(f));
        }));
        rx
    }

    /// Transform the settled result. The callback may return either an immediate result or a
    /// further completion; nested completions are flattened.
    pub fn then_try<U, F, S>(self, f: F) -> Completion<U>
    where
        U: Send + 'static,
        S: Into<Step<U>>,
        F: FnOnce(RaftResult<T>) -> S + Send + 'static,
    {
        let (tx, rx) = Completion::pair_on(&self.executor);
        self.on_settle(Box::new(move |res| f(res).into().feed(tx)));
        rx
    }

    /// Recover from an error. Successful values pass through untouched; the callback may
    /// return an immediate result or a further completion, which is flattened.
    pub fn then_error<F, S>(self, f: F) -> Completion<T>
    where
        S: Into<Step<T>>,
        F: FnOnce(RaftError) -> S + Send + 'static,
    {
        let (tx, rx) = Completion::pair_on(&self.executor);
        self.on_settle(Box::new(move |res| match res {
            Ok(value) => {
                let _ = tx.fulfil(value);
            }
            Err(err) => f(err).into().feed(tx),
        }));
        rx
    }

    /// Deliver the result only after an additional `delay` has elapsed past settlement.
    pub fn delay(self, delay: Duration) -> Completion<T> {
        let (tx, rx) = Completion::pair_on(&self.executor);
        let executor = self.executor.clone();
        self.on_settle(Box::new(move |res| {
            // If the executor has shut down, dropping the resolver delivers Cancelled.
            let _ = executor.timer(delay, move || {
                let _ = tx.resolve(res);
            });
        }));
        rx
    }

    /// Bound the time to settlement. If `timeout` elapses first, the returned completion
    /// fails with `Timeout` and the eventual inner result is discarded.
    pub fn within(self, timeout: Duration) -> Completion<T> {
        let (tx, rx) = Completion::pair_on(&self.executor);
        let tx = Arc::new(tx);
        let timer_tx = tx.clone();
        let _ = self.executor.timer(timeout, move || {
            let _ = timer_tx.fail(RaftError::Timeout);
        });
        self.on_settle(Box::new(move |res| {
            let _ = tx.resolve(res);
        }));
        rx
    }
}

impl<T: Send + 'static> Future for Completion<T> {
    type Output = RaftResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock().unwrap();
        match &mut *state {
            CellState::Pending { waker, .. } => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            CellState::Settled(slot) => Poll::Ready(match slot.take() {
                Some(res) => res,
                None => Err(RaftError::AlreadyFulfilled),
            }),
            CellState::Cancelled => Poll::Ready(Err(RaftError::Cancelled)),
        }
    }
}

/// The outcome of a completion callback: either an immediate result, or a further completion
/// to chain onto. Conversions exist from both, so callbacks simply return whichever they have.
pub enum Step<T> {
    Ready(RaftResult<T>),
    Pending(Completion<T>),
}

impl<T: Send + 'static> Step<T> {
    /// An immediately available value.
    pub fn value(value: T) -> Self {
        Step::Ready(Ok(value))
    }

    /// An immediately available error.
    pub fn fail(err: RaftError) -> Self {
        Step::Ready(Err(err))
    }

    /// Route this step's eventual result into `tx`.
    fn feed(self, tx: Resolver<T>) {
        match self {
            Step::Ready(res) => {
                let _ = tx.resolve(res);
            }
            Step::Pending(completion) => completion.on_settle(Box::new(move |res| {
                let _ = tx.resolve(res);
            })),
        }
    }
}

impl<T> From<RaftResult<T>> for Step<T> {
    fn from(res: RaftResult<T>) -> Self {
        Step::Ready(res)
    }
}

impl<T> From<Completion<T>> for Step<T> {
    fn from(completion: Completion<T>) -> Self {
        Step::Pending(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fulfil_before_wait_delivers_value() {
        let (tx, rx) = Completion::<u64>::pair();
        tx.fulfil(7).unwrap();
        assert!(rx.is_ready());
        assert_eq!(rx.get().unwrap(), 7);
    }

    #[test]
    fn test_fulfil_twice_fails_already_fulfilled() {
        let (tx, rx) = Completion::<u64>::pair();
        tx.fulfil(1).unwrap();
        assert_eq!(tx.fulfil(2).unwrap_err(), RaftError::AlreadyFulfilled);
        assert_eq!(rx.get().unwrap(), 1);
    }

    #[test]
    fn test_wait_expiry_does_not_consume() {
        let (tx, rx) = Completion::<u64>::pair();
        assert!(!rx.wait(Duration::from_millis(10)));
        tx.fulfil(3).unwrap();
        assert!(rx.wait(Duration::from_millis(10)));
        assert_eq!(rx.get().unwrap(), 3);
    }

    #[test]
    fn test_then_value_identity_preserves_result() {
        let (tx, rx) = Completion::<u64>::pair();
        tx.fulfil(42).unwrap();
        assert_eq!(rx.then_value(|v| v).get().unwrap(), 42);
    }

    #[test]
    fn test_then_value_after_fulfilment_still_runs() {
        let (tx, rx) = Completion::<u64>::pair();
        tx.fulfil(10).unwrap();
        let mapped = rx.then_value(|v| v * 2);
        assert_eq!(mapped.get().unwrap(), 20);
    }

    #[test]
    fn test_then_try_flattens_completion_returning_callback() {
        let (tx, rx) = Completion::<u64>::pair();
        let (inner_tx, inner_rx) = Completion::<String>::pair();
        let chained = rx.then_try(move |res| {
            res.unwrap();
            inner_rx
        });
        tx.fulfil(1).unwrap();
        inner_tx.fulfil("flat".to_string()).unwrap();
        assert_eq!(chained.get().unwrap(), "flat");
    }

    #[test]
    fn test_then_error_recovers() {
        let rx = Completion::<u64>::failed(RaftError::Disconnected);
        let recovered = rx.then_error(|_err| Step::value(99));
        assert_eq!(recovered.get().unwrap(), 99);
    }

    #[test]
    fn test_then_error_passes_success_through() {
        let rx = Completion::<u64>::ready(5);
        let out = rx.then_error(|_err| Step::value(0));
        assert_eq!(out.get().unwrap(), 5);
    }

    #[test]
    fn test_within_on_fulfilled_returns_original_value() {
        let rx = Completion::<u64>::ready(11);
        assert_eq!(rx.within(Duration::from_millis(5)).get().unwrap(), 11);
    }

    #[test]
    fn test_within_expiry_fails_with_timeout() {
        let (_tx, rx) = Completion::<u64>::pair();
        let bounded = rx.within(Duration::from_millis(10));
        assert_eq!(bounded.get().unwrap_err(), RaftError::Timeout);
    }

    #[test]
    fn test_delay_postpones_delivery() {
        let rx = Completion::<u64>::ready(1);
        let delayed = rx.delay(Duration::from_millis(20));
        assert!(!delayed.wait(Duration::from_millis(1)));
        assert_eq!(delayed.get().unwrap(), 1);
    }

    #[test]
    fn test_dropping_resolver_cancels() {
        let (tx, rx) = Completion::<u64>::pair();
        drop(tx);
        assert_eq!(rx.get().unwrap_err(), RaftError::Cancelled);
    }

    #[test]
    fn test_fulfil_after_cancel_is_discarded() {
        let (tx, rx) = Completion::<u64>::pair();
        rx.cancel();
        assert!(tx.fulfil(1).is_ok());
    }

    #[tokio::test]
    async fn test_completion_can_be_awaited() {
        let (tx, rx) = Completion::<u64>::pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            tx.fulfil(21).unwrap();
        });
        assert_eq!(rx.await.unwrap(), 21);
    }
}
