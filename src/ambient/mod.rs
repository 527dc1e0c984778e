//! Execution-context-local ambient transaction.
//!
//! Each thread owns one ambient cell. Synchronous code uses it directly; a
//! future wrapped in [`Propagate`] carries its own copy of the cell and swaps
//! it in for the duration of every poll, so tasks interleaved on one worker
//! never see each other's transactions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      thread-local cell                       │
//! │   current: Option<Transaction>   flow: bool   scopes: [id]   │
//! └──────────────────────────────────────────────────────────────┘
//!          ▲  set / push / pop                 ▲  swap per poll
//!          │                                   │
//!  ┌───────────────┐                   ┌───────────────┐
//!  │TransactionScope│                  │  Propagate<F> │
//!  └───────────────┘                   └───────────────┘
//! ```
//!
//! The scope stack always travels with a task. The transaction only survives
//! a suspension point when it was installed by a scope with async flow
//! enabled.

mod carrier;

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::transaction::Transaction;

pub use carrier::{scope, spawn, AmbientFutureExt, Propagate};

thread_local! {
    static AMBIENT: RefCell<AmbientState> = RefCell::new(AmbientState::default());
}

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a scope on its execution context's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Build an id from its numeric value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Numeric value of the id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// Everything one execution context knows about ambient transactions.
#[derive(Debug, Clone, Default)]
pub(crate) struct AmbientState {
    current: Option<Transaction>,
    /// Whether `current` survives a suspension point.
    flow: bool,
    scopes: Vec<ScopeEntry>,
}

/// A live scope on the stack.
#[derive(Debug, Clone)]
struct ScopeEntry {
    id: ScopeId,
    /// Value to put back on disposal instead of the scope's own capture, set
    /// when the scope right outside it was abandoned.
    restore: Option<AmbientSnapshot>,
}

impl AmbientState {
    /// State a new task starts with when created from the calling thread.
    pub(crate) fn inherited() -> Self {
        Self::from_snapshot(AmbientContext::capture().for_suspension())
    }

    pub(crate) fn from_snapshot(snapshot: AmbientSnapshot) -> Self {
        Self {
            current: snapshot.current,
            flow: snapshot.flow,
            scopes: Vec::new(),
        }
    }

    /// Apply the suspension rule: a non-flowing transaction is gone on resumption.
    pub(crate) fn suspend(&mut self) {
        if !self.flow && self.current.take().is_some() {
            tracing::trace!("ambient transaction dropped at suspension point");
        }
    }
}

/// A captured ambient value: the visible transaction and its flow flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmbientSnapshot {
    current: Option<Transaction>,
    flow: bool,
}

impl AmbientSnapshot {
    /// A snapshot with no transaction.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The captured transaction, if any.
    pub fn transaction(&self) -> Option<&Transaction> {
        self.current.as_ref()
    }

    /// Whether the captured transaction was installed with async flow.
    pub fn flows(&self) -> bool {
        self.flow
    }

    /// What of this snapshot survives a suspension point.
    pub fn for_suspension(self) -> Self {
        if self.flow {
            self
        } else {
            Self::empty()
        }
    }

    /// Run `f` on the calling thread with this snapshot as its ambient value.
    ///
    /// `f` starts with an empty scope stack, so scopes it creates must be
    /// disposed inside it. The thread's own state is reinstated afterwards,
    /// including when `f` panics.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = AmbientContext::replace(AmbientState::from_snapshot(self.clone()));
        let _restore = RestoreOnDrop(Some(previous));
        f()
    }
}

struct RestoreOnDrop(Option<AmbientState>);

impl Drop for RestoreOnDrop {
    fn drop(&mut self) {
        if let Some(previous) = self.0.take() {
            let leftover = AmbientContext::replace(previous);
            if !leftover.scopes.is_empty() {
                tracing::warn!(
                    scopes = leftover.scopes.len(),
                    "scopes still live when leaving an ambient snapshot"
                );
            }
        }
    }
}

/// Accessors for the calling execution context's ambient state.
pub struct AmbientContext;

impl AmbientContext {
    /// The transaction visible to the calling code.
    pub fn current() -> Option<Transaction> {
        AMBIENT.with(|cell| cell.borrow().current.clone())
    }

    /// Capture the ambient value. The scope stack is not part of it.
    pub fn capture() -> AmbientSnapshot {
        AMBIENT.with(|cell| {
            let state = cell.borrow();
            AmbientSnapshot {
                current: state.current.clone(),
                flow: state.flow,
            }
        })
    }

    /// Reinstate a captured ambient value, leaving the scope stack alone.
    ///
    /// Meant for executors that implement their own suspension boundaries;
    /// scopes and [`Propagate`] already call it where needed.
    pub fn restore(snapshot: AmbientSnapshot) {
        AMBIENT.with(|cell| {
            let mut state = cell.borrow_mut();
            state.current = snapshot.current;
            state.flow = snapshot.flow;
        });
    }

    /// Number of live scopes in this execution context.
    pub fn depth() -> usize {
        AMBIENT.with(|cell| cell.borrow().scopes.len())
    }

    /// The most recently constructed live scope.
    pub fn innermost_scope() -> Option<ScopeId> {
        AMBIENT.with(|cell| cell.borrow().scopes.last().map(|entry| entry.id))
    }

    pub(crate) fn set(current: Option<Transaction>, flow: bool) {
        Self::restore(AmbientSnapshot { current, flow });
    }

    pub(crate) fn push_scope(scope: ScopeId) {
        AMBIENT.with(|cell| {
            cell.borrow_mut().scopes.push(ScopeEntry {
                id: scope,
                restore: None,
            })
        });
    }

    /// Pop `scope` if it is the innermost one, else report the innermost.
    ///
    /// On success, returns the value to restore in place of the scope's own
    /// capture, if an abandoned outer scope left one.
    pub(crate) fn pop_scope(scope: ScopeId) -> Result<Option<AmbientSnapshot>, Option<ScopeId>> {
        AMBIENT.with(|cell| {
            let mut state = cell.borrow_mut();
            match state.scopes.last() {
                Some(top) if top.id == scope => Ok(state.scopes.pop().and_then(|entry| entry.restore)),
                top => Err(top.map(|entry| entry.id)),
            }
        })
    }

    /// Drop `scope` from wherever it sits on the stack.
    ///
    /// `previous` is what the scope would have restored. The next scope out
    /// of it inherits that value, so unwinding the rest of the stack ends
    /// where this scope started.
    pub(crate) fn remove_scope(scope: ScopeId, previous: AmbientSnapshot) -> bool {
        AMBIENT.with(|cell| {
            let mut state = cell.borrow_mut();
            let Some(index) = state.scopes.iter().rposition(|entry| entry.id == scope) else {
                return false;
            };
            let removed = state.scopes.remove(index);
            let previous = removed.restore.unwrap_or(previous);
            match state.scopes.get_mut(index) {
                Some(next) => next.restore = Some(previous),
                None => {
                    state.current = previous.current;
                    state.flow = previous.flow;
                }
            }
            true
        })
    }

    pub(crate) fn replace(state: AmbientState) -> AmbientState {
        AMBIENT.with(|cell| std::mem::replace(&mut *cell.borrow_mut(), state))
    }
}

/// The transaction visible to the calling code.
pub fn current_transaction() -> Option<Transaction> {
    AmbientContext::current()
}
