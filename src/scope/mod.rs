//! Transaction scopes.
//!
//! A [`TransactionScope`] is a guard. Constructing one decides, once, whether
//! the code inside joins the ambient transaction, gets a fresh one, or sees
//! none at all. Disposing it (explicitly or by dropping it) resolves an owned
//! transaction, vetoes a joined one that was never completed, and puts back
//! the ambient value that was visible before construction.
//!
//! # Usage
//!
//! ```
//! use txscope::{create_scope, current_transaction, IsolationLevel, ScopeMode, TransactionState};
//!
//! let mut outer = create_scope(ScopeMode::Required, IsolationLevel::Serializable, false)?;
//! let tx = current_transaction().expect("outer scope created a transaction");
//!
//! {
//!     let mut inner = create_scope(ScopeMode::Required, IsolationLevel::Serializable, false)?;
//!     assert_eq!(current_transaction().as_ref(), Some(&tx));
//!     inner.complete()?;
//! }
//!
//! outer.complete()?;
//! outer.dispose()?;
//! assert_eq!(tx.state(), TransactionState::Committed);
//! assert!(current_transaction().is_none());
//! # Ok::<(), txscope::TransactionError>(())
//! ```

mod options;

use std::fmt;

use crate::ambient::{AmbientContext, AmbientSnapshot, ScopeId};
use crate::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionError, TransactionResult,
};

pub use options::{ScopeMode, ScopeOptions};

/// Stack-disciplined guard over the ambient transaction.
#[must_use = "a scope is disposed as soon as it is dropped"]
pub struct TransactionScope {
    id: ScopeId,
    options: ScopeOptions,
    /// Owned or joined transaction; `None` for `Suppress`.
    transaction: Option<Transaction>,
    owns_transaction: bool,
    /// Ambient value to put back on disposal.
    previous: AmbientSnapshot,
    completed: bool,
    disposed: bool,
}

impl TransactionScope {
    /// Construct a scope and make its transaction ambient.
    pub fn new(options: ScopeOptions) -> TransactionResult<Self> {
        let previous = AmbientContext::capture();
        let ambient = previous.transaction().cloned();

        let (transaction, owns_transaction) = match options.mode {
            ScopeMode::Required => match ambient {
                Some(tx) => (Some(join(tx, options.isolation)?), false),
                None => (Some(Transaction::new(options.isolation)), true),
            },
            ScopeMode::RequiresNew => (Some(Transaction::new(options.isolation)), true),
            ScopeMode::Suppress => (None, false),
            ScopeMode::Mandatory => match ambient {
                Some(tx) => (Some(join(tx, options.isolation)?), false),
                None => return Err(TransactionError::NoActiveTransaction),
            },
        };

        Ok(Self::install(options, transaction, owns_transaction, previous))
    }

    /// Join an explicitly given transaction, making it ambient for this scope.
    ///
    /// Used to re-establish a transaction after a suspension point that did
    /// not carry it, or on a worker thread it was handed to.
    pub fn enter(tx: &Transaction, async_flow: bool) -> TransactionResult<Self> {
        let options = ScopeOptions::new(ScopeMode::Required)
            .isolation(IsolationLevel::Unspecified)
            .async_flow(async_flow);
        let tx = join(tx.clone(), options.isolation)?;
        Ok(Self::install(
            options,
            Some(tx),
            false,
            AmbientContext::capture(),
        ))
    }

    fn install(
        options: ScopeOptions,
        transaction: Option<Transaction>,
        owns_transaction: bool,
        previous: AmbientSnapshot,
    ) -> Self {
        let id = ScopeId::next();
        // A scope joining the ambient transaction stays inside the flowing
        // extent of the scope that installed it.
        let flow = match (&transaction, previous.transaction()) {
            (Some(tx), Some(ambient)) if !owns_transaction && tx == ambient => {
                previous.flows() || options.async_flow
            }
            _ => options.async_flow,
        };
        AmbientContext::set(transaction.clone(), flow);
        AmbientContext::push_scope(id);

        tracing::debug!(
            scope = %id,
            mode = %options.mode,
            tx_id = transaction.as_ref().map(|tx| tx.id()),
            owns = owns_transaction,
            async_flow = flow,
            "scope entered"
        );

        Self {
            id,
            options,
            transaction,
            owns_transaction,
            previous,
            completed: false,
            disposed: false,
        }
    }

    /// Get the scope ID.
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Get the mode the scope was created with.
    pub fn mode(&self) -> ScopeMode {
        self.options.mode
    }

    /// Get the options the scope was created with.
    pub fn options(&self) -> &ScopeOptions {
        &self.options
    }

    /// The owned or joined transaction, `None` when suppressing.
    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    /// Check if this scope created its transaction.
    pub fn owns_transaction(&self) -> bool {
        self.owns_transaction
    }

    /// Check if `complete` has been called.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Check if the scope has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Vote for commit. The outcome is decided when the owning scope is disposed.
    pub fn complete(&mut self) -> TransactionResult<()> {
        if self.disposed {
            return Err(TransactionError::ScopeDisposed { scope: self.id });
        }
        if self.completed {
            return Err(TransactionError::AlreadyCompleted { scope: self.id });
        }
        self.completed = true;
        Ok(())
    }

    /// Leave the scope. Idempotent.
    ///
    /// Fails with `InvalidNesting`, changing nothing, when a scope created
    /// after this one in the same execution context is still live.
    pub fn dispose(&mut self) -> TransactionResult<()> {
        if self.disposed {
            return Ok(());
        }
        let redirected = AmbientContext::pop_scope(self.id).map_err(|innermost| {
            TransactionError::InvalidNesting {
                scope: self.id,
                innermost,
            }
        })?;

        self.disposed = true;
        AmbientContext::restore(redirected.unwrap_or_else(|| self.previous.clone()));

        if let Some(tx) = &self.transaction {
            if self.owns_transaction {
                let state = tx.resolve(self.completed, self.options.timeout);
                tracing::debug!(scope = %self.id, tx_id = tx.id(), state = %state, "scope disposed");
            } else if !self.completed {
                // Err only if the owner already resolved it.
                let _ = tx.veto(AbortReason::Vetoed { scope: self.id });
                tracing::debug!(scope = %self.id, tx_id = tx.id(), "joined scope disposed without completion");
            }
        }
        Ok(())
    }

    /// Disposal from `Drop` that could not keep the nesting order.
    fn abandon(&mut self, err: TransactionError) {
        tracing::error!(scope = %self.id, error = %err, "scope dropped out of order; abandoning");
        self.disposed = true;
        AmbientContext::remove_scope(self.id, self.previous.clone());

        if let Some(tx) = &self.transaction {
            let reason = AbortReason::InvalidNesting { scope: self.id };
            if self.owns_transaction {
                tx.abort(reason);
            } else {
                let _ = tx.veto(reason);
            }
        }
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        if let Err(err) = self.dispose() {
            self.abandon(err);
        }
    }
}

impl fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope")
            .field("id", &self.id)
            .field("mode", &self.options.mode)
            .field("tx_id", &self.transaction.as_ref().map(|tx| tx.id()))
            .field("owns_transaction", &self.owns_transaction)
            .field("completed", &self.completed)
            .field("disposed", &self.disposed)
            .finish()
    }
}

fn join(tx: Transaction, requested: IsolationLevel) -> TransactionResult<Transaction> {
    if !requested.accepts(tx.isolation_level()) {
        return Err(TransactionError::IsolationLevelMismatch {
            requested,
            ambient: tx.isolation_level(),
        });
    }
    if !tx.is_active() {
        return Err(TransactionError::NotActive {
            tx_id: tx.id().to_string(),
            state: tx.state().to_string(),
        });
    }
    Ok(tx)
}

/// Construct a scope from its three main knobs.
pub fn create_scope(
    mode: ScopeMode,
    isolation: IsolationLevel,
    async_flow: bool,
) -> TransactionResult<TransactionScope> {
    TransactionScope::new(
        ScopeOptions::new(mode)
            .isolation(isolation)
            .async_flow(async_flow),
    )
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::time::Duration;

    use super::*;
    use crate::ambient::current_transaction;
    use crate::transaction::participant::testing::Recorder;
    use crate::transaction::{TransactionState, Vote};

    fn required() -> TransactionScope {
        create_scope(ScopeMode::Required, IsolationLevel::Serializable, false).unwrap()
    }

    #[test]
    fn test_required_creates_then_joins() {
        let mut outer = required();
        assert!(outer.owns_transaction());
        let tx = current_transaction().unwrap();

        let mut inner = required();
        assert!(!inner.owns_transaction());
        assert_eq!(current_transaction().as_ref(), Some(&tx));

        inner.complete().unwrap();
        inner.dispose().unwrap();
        assert_eq!(current_transaction().as_ref(), Some(&tx));

        outer.complete().unwrap();
        outer.dispose().unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        assert!(current_transaction().is_none());
    }

    #[test]
    fn test_joined_scope_veto_aborts_owner() {
        let mut a = required();
        let t1 = current_transaction().unwrap();

        let mut b = required();
        assert_eq!(current_transaction().as_ref(), Some(&t1));
        b.dispose().unwrap();

        a.complete().unwrap();
        a.dispose().unwrap();
        assert_eq!(t1.state(), TransactionState::Aborted);
        assert_eq!(
            t1.abort_reason(),
            Some(AbortReason::Vetoed { scope: b.id() })
        );
        assert!(current_transaction().is_none());
    }

    #[test]
    fn test_owner_without_completion_aborts() {
        let scope = required();
        let tx = scope.transaction().cloned().unwrap();
        drop(scope);
        assert_eq!(tx.state(), TransactionState::Aborted);
        assert_eq!(tx.abort_reason(), Some(AbortReason::NotCompleted));
    }

    #[test]
    fn test_requires_new_is_independent() {
        let mut outer = required();
        let t1 = current_transaction().unwrap();

        let mut inner = create_scope(ScopeMode::RequiresNew, IsolationLevel::ReadCommitted, false)
            .unwrap();
        let t2 = current_transaction().unwrap();
        assert_ne!(t1, t2);
        assert_eq!(t2.isolation_level(), IsolationLevel::ReadCommitted);

        // Inner aborts, outer still commits.
        inner.dispose().unwrap();
        assert_eq!(t2.state(), TransactionState::Aborted);
        assert_eq!(current_transaction().as_ref(), Some(&t1));

        outer.complete().unwrap();
        outer.dispose().unwrap();
        assert_eq!(t1.state(), TransactionState::Committed);
    }

    #[test]
    fn test_requires_new_survives_outer_abort() {
        let outer = required();
        let t1 = current_transaction().unwrap();

        let mut inner = create_scope(ScopeMode::RequiresNew, IsolationLevel::Serializable, false)
            .unwrap();
        let t2 = current_transaction().unwrap();
        inner.complete().unwrap();
        drop(inner);
        drop(outer);

        assert_eq!(t2.state(), TransactionState::Committed);
        assert_eq!(t1.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_suppress_hides_and_isolates() {
        let mut outer = required();
        let t1 = current_transaction().unwrap();

        {
            let _quiet = create_scope(ScopeMode::Suppress, IsolationLevel::Serializable, false)
                .unwrap();
            assert!(current_transaction().is_none());

            // Work inside: a nested Required gets its own transaction and aborts it.
            let nested = required();
            let t3 = current_transaction().unwrap();
            assert_ne!(t3, t1);
            drop(nested);
            assert_eq!(t3.state(), TransactionState::Aborted);
        }

        assert_eq!(current_transaction().as_ref(), Some(&t1));
        assert_eq!(t1.veto_count(), 0);
        outer.complete().unwrap();
        outer.dispose().unwrap();
        assert_eq!(t1.state(), TransactionState::Committed);
    }

    #[test]
    fn test_mandatory_requires_ambient() {
        let err = create_scope(ScopeMode::Mandatory, IsolationLevel::Serializable, false)
            .unwrap_err();
        assert_eq!(err, TransactionError::NoActiveTransaction);
        assert_eq!(AmbientContext::depth(), 0);

        let _outer = required();
        let joined =
            create_scope(ScopeMode::Mandatory, IsolationLevel::Unspecified, false).unwrap();
        assert!(!joined.owns_transaction());
    }

    #[test]
    fn test_isolation_mismatch() {
        let _outer =
            create_scope(ScopeMode::Required, IsolationLevel::ReadCommitted, false).unwrap();
        let tx = current_transaction().unwrap();

        let err = create_scope(ScopeMode::Required, IsolationLevel::Serializable, false)
            .unwrap_err();
        assert_eq!(
            err,
            TransactionError::IsolationLevelMismatch {
                requested: IsolationLevel::Serializable,
                ambient: IsolationLevel::ReadCommitted,
            }
        );
        // Failed construction leaves everything as it was.
        assert_eq!(AmbientContext::depth(), 1);
        assert_eq!(current_transaction(), Some(tx.clone()));

        let joined =
            create_scope(ScopeMode::Required, IsolationLevel::Unspecified, false).unwrap();
        assert_eq!(joined.transaction(), Some(&tx));
    }

    #[test]
    fn test_complete_twice_and_dispose_twice() {
        let mut scope = required();
        scope.complete().unwrap();
        assert!(matches!(
            scope.complete(),
            Err(TransactionError::AlreadyCompleted { .. })
        ));

        scope.dispose().unwrap();
        scope.dispose().unwrap();
        assert!(matches!(
            scope.complete(),
            Err(TransactionError::ScopeDisposed { .. })
        ));
        assert_eq!(
            scope.transaction().unwrap().state(),
            TransactionState::Committed
        );
    }

    #[test]
    fn test_out_of_order_dispose() {
        let mut outer = required();
        let mut inner = required();

        let err = outer.dispose().unwrap_err();
        assert_eq!(
            err,
            TransactionError::InvalidNesting {
                scope: outer.id(),
                innermost: Some(inner.id()),
            }
        );
        assert!(!outer.is_disposed());

        // In-order disposal still works afterwards.
        inner.complete().unwrap();
        inner.dispose().unwrap();
        outer.complete().unwrap();
        outer.dispose().unwrap();
        assert_eq!(
            outer.transaction().unwrap().state(),
            TransactionState::Committed
        );
    }

    #[test]
    fn test_drop_out_of_order_abandons() {
        let outer = required();
        let outer_id = outer.id();
        let tx = current_transaction().unwrap();
        let inner = create_scope(ScopeMode::Suppress, IsolationLevel::Serializable, false)
            .unwrap();

        drop(outer);
        assert_eq!(tx.state(), TransactionState::Aborted);
        assert_eq!(
            tx.abort_reason(),
            Some(AbortReason::InvalidNesting { scope: outer_id })
        );
        assert_eq!(AmbientContext::depth(), 1);

        drop(inner);
        assert_eq!(AmbientContext::depth(), 0);
        assert!(current_transaction().is_none());

        // The thread is usable again.
        let mut next = required();
        assert_ne!(next.transaction(), Some(&tx));
        next.complete().unwrap();
        next.dispose().unwrap();
        assert_eq!(
            next.transaction().unwrap().state(),
            TransactionState::Committed
        );
    }

    #[test]
    fn test_drop_out_of_order_restores_outer_capture() {
        let mut base = create_scope(ScopeMode::Required, IsolationLevel::Serializable, true)
            .unwrap();
        let t1 = current_transaction().unwrap();

        let middle = create_scope(ScopeMode::RequiresNew, IsolationLevel::Serializable, false)
            .unwrap();
        let t2 = current_transaction().unwrap();
        let inner = create_scope(ScopeMode::Suppress, IsolationLevel::Serializable, false)
            .unwrap();

        drop(middle);
        assert_eq!(t2.state(), TransactionState::Aborted);
        assert!(current_transaction().is_none());

        drop(inner);
        assert_eq!(current_transaction().as_ref(), Some(&t1));
        assert!(AmbientContext::capture().flows());

        base.complete().unwrap();
        base.dispose().unwrap();
        assert_eq!(t1.state(), TransactionState::Committed);
    }

    #[test]
    fn test_joined_scope_keeps_outer_flow() {
        let _outer = create_scope(ScopeMode::Required, IsolationLevel::Serializable, true)
            .unwrap();
        {
            let _joined = required();
            assert!(AmbientContext::capture().flows());
        }
        {
            let _fresh = create_scope(ScopeMode::RequiresNew, IsolationLevel::Serializable, false)
                .unwrap();
            assert!(!AmbientContext::capture().flows());
        }
        assert!(AmbientContext::capture().flows());
    }

    #[test]
    fn test_panic_in_body_aborts_and_restores() {
        let before = current_transaction();
        let mut captured = None;

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _scope = required();
            captured = current_transaction();
            panic!("body failed");
        }));

        assert!(result.is_err());
        assert_eq!(current_transaction(), before);
        assert_eq!(captured.unwrap().state(), TransactionState::Aborted);
        assert_eq!(AmbientContext::depth(), 0);
    }

    #[test]
    fn test_participants_vote_through_scope() {
        let mut scope = required();
        let db = Recorder::new("db", Vote::Prepared);
        crate::transaction::enlist(scope.transaction().unwrap(), db.clone()).unwrap();

        scope.complete().unwrap();
        scope.dispose().unwrap();
        assert_eq!(db.calls(), vec!["prepare", "commit"]);
    }

    #[test]
    fn test_enter_rejoins_explicitly() {
        let mut owner = required();
        let tx = current_transaction().unwrap();

        let quiet = create_scope(ScopeMode::Suppress, IsolationLevel::Serializable, false)
            .unwrap();
        {
            let mut rejoined = TransactionScope::enter(&tx, false).unwrap();
            assert_eq!(current_transaction().as_ref(), Some(&tx));
            rejoined.complete().unwrap();
        }
        assert!(current_transaction().is_none());
        drop(quiet);

        owner.complete().unwrap();
        owner.dispose().unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);

        assert!(matches!(
            TransactionScope::enter(&tx, false),
            Err(TransactionError::NotActive { .. })
        ));
    }

    #[test]
    fn test_timeout_aborts_owned_transaction() {
        let mut scope = TransactionScope::new(
            ScopeOptions::new(ScopeMode::RequiresNew).timeout(Duration::from_millis(1)),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        scope.complete().unwrap();
        scope.dispose().unwrap();
        assert!(matches!(
            scope.transaction().unwrap().abort_reason(),
            Some(AbortReason::TimedOut { .. })
        ));
    }
}
