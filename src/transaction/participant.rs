//! Resource managers enlisted in a transaction.
//!
//! A participant is asked to prepare once the owning scope resolves a
//! completed transaction. Its vote decides, together with any vetoes from
//! joined scopes, whether the transaction commits.

use std::fmt;
use std::sync::Arc;

use crate::transaction::context::{Transaction, TransactionInfo};
use crate::transaction::error::TransactionResult;

/// A participant's answer to `prepare`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vote {
    /// Ready to commit; expects a `commit` or `rollback` call.
    Prepared,
    /// Nothing to commit; receives no further notifications.
    ReadOnly,
    /// Cannot commit. The transaction aborts with this reason attached.
    Abort(String),
}

impl Vote {
    /// Check whether this vote lets the transaction commit.
    pub fn allows_commit(&self) -> bool {
        !matches!(self, Vote::Abort(_))
    }
}

/// An external resource manager taking part in a transaction's outcome.
pub trait Participant: Send + Sync {
    /// Name used in abort reasons and logs.
    fn name(&self) -> &str {
        "participant"
    }

    /// Phase one: vote on whether the transaction may commit.
    fn prepare(&self, tx: &TransactionInfo) -> Vote;

    /// Phase two after every participant prepared.
    fn commit(&self, tx: &TransactionInfo);

    /// Discard the work done on behalf of the transaction.
    fn rollback(&self, tx: &TransactionInfo);
}

impl fmt::Debug for dyn Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("name", &self.name())
            .finish()
    }
}

/// Enlist a participant in `tx`.
///
/// Fails with `NotActive` once the transaction has started resolving.
pub fn enlist(tx: &Transaction, participant: Arc<dyn Participant>) -> TransactionResult<()> {
    tx.enlist(participant)
}
