//! Carrying ambient state across suspension points.
//!
//! A future's polls can land on any worker thread, and other tasks run on
//! the same thread in between. [`Propagate`] gives the wrapped future its own
//! ambient cell: installed before each poll, captured back out after it.
//! When the poll suspends (`Pending`), the captured transaction is only kept
//! if the scope that installed it enabled async flow; otherwise the future
//! resumes with no ambient transaction.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::JoinHandle;

use super::{AmbientContext, AmbientSnapshot, AmbientState};

/// A future that runs with its own ambient state.
///
/// Wrap futures at task boundaries. The wrapper starts from the transaction
/// visible where it was created, but only when that transaction flows; the
/// creator's scope stack is never inherited.
#[must_use = "futures do nothing unless polled"]
pub struct Propagate<F> {
    /// `None` only while being dropped.
    inner: Option<Pin<Box<F>>>,
    state: AmbientState,
}

impl<F: Future> Propagate<F> {
    /// Wrap `future`, inheriting the caller's flowing transaction.
    pub fn new(future: F) -> Self {
        Self::with_state(future, AmbientState::inherited())
    }

    /// Wrap `future`, starting from an explicit snapshot.
    pub fn with_snapshot(future: F, snapshot: AmbientSnapshot) -> Self {
        Self::with_state(future, AmbientState::from_snapshot(snapshot))
    }

    fn with_state(future: F, state: AmbientState) -> Self {
        Self {
            inner: Some(Box::pin(future)),
            state,
        }
    }
}

/// Swaps a task's state into the thread cell and back out on drop, even during unwinding.
struct Installed<'a> {
    slot: &'a mut AmbientState,
    previous: Option<AmbientState>,
}

impl<'a> Installed<'a> {
    fn new(slot: &'a mut AmbientState) -> Self {
        let previous = AmbientContext::replace(std::mem::take(slot));
        Self {
            slot,
            previous: Some(previous),
        }
    }
}

impl Drop for Installed<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *self.slot = AmbientContext::replace(previous);
        }
    }
}

impl<F: Future> Future for Propagate<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = {
            let _installed = Installed::new(&mut this.state);
            match this.inner.as_mut() {
                Some(inner) => inner.as_mut().poll(cx),
                None => Poll::Pending,
            }
        };
        if result.is_pending() {
            this.state.suspend();
        }
        result
    }
}

impl<F> Drop for Propagate<F> {
    fn drop(&mut self) {
        // Scope guards inside a cancelled future must dispose against this task's stack.
        if let Some(inner) = self.inner.take() {
            let _installed = Installed::new(&mut self.state);
            drop(inner);
        }
    }
}

/// Adapters for running futures under the propagation carrier.
pub trait AmbientFutureExt: Future + Sized {
    /// Run with its own ambient state, inheriting the caller's flowing transaction.
    fn in_ambient(self) -> Propagate<Self> {
        Propagate::new(self)
    }

    /// Run with `snapshot` as the starting ambient value.
    fn with_ambient(self, snapshot: AmbientSnapshot) -> Propagate<Self> {
        Propagate::with_snapshot(self, snapshot)
    }
}

impl<F: Future> AmbientFutureExt for F {}

/// Run `future` with `snapshot` as its ambient value, regardless of flow.
///
/// This is the explicit re-establishment path: the transaction is handed over
/// on purpose, so the flow flag only governs later suspension points.
pub fn scope<F: Future>(snapshot: AmbientSnapshot, future: F) -> Propagate<F> {
    Propagate::with_snapshot(future, snapshot)
}

/// Spawn `future` on the current tokio runtime under the carrier.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(Propagate::new(future))
}
