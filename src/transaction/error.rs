//! Transaction error types.

use std::fmt;

use thiserror::Error;

use crate::ambient::ScopeId;
use crate::transaction::isolation::IsolationLevel;

/// Result type for transaction and scope operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors that can occur while using scopes and transactions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// `complete()` was called twice on the same scope.
    #[error("scope {scope} has already been completed")]
    AlreadyCompleted { scope: ScopeId },

    /// A scope was disposed while it was not the innermost live scope.
    #[error("scope {scope} disposed out of order (innermost live scope: {})", innermost_display(.innermost))]
    InvalidNesting {
        scope: ScopeId,
        innermost: Option<ScopeId>,
    },

    /// A `Mandatory` scope found no ambient transaction.
    #[error("no ambient transaction is active")]
    NoActiveTransaction,

    /// A joining scope asked for an isolation level the ambient transaction doesn't run at.
    #[error("requested isolation {requested} does not match ambient transaction isolation {ambient}")]
    IsolationLevelMismatch {
        requested: IsolationLevel,
        ambient: IsolationLevel,
    },

    /// A participant refused to prepare.
    #[error("participant {participant} failed to prepare: {reason}")]
    ParticipantPrepare { participant: String, reason: String },

    /// The scope was used after being disposed.
    #[error("scope {scope} has already been disposed")]
    ScopeDisposed { scope: ScopeId },

    /// Transaction was already committed or aborted.
    #[error("transaction {tx_id} is no longer active (state: {state})")]
    NotActive { tx_id: String, state: String },

    /// Transaction resolved to aborted.
    #[error("transaction {tx_id} aborted: {reason}")]
    Aborted { tx_id: String, reason: AbortReason },
}

fn innermost_display(innermost: &Option<ScopeId>) -> String {
    match innermost {
        Some(scope) => scope.to_string(),
        None => "none".to_string(),
    }
}

impl TransactionError {
    /// Check if this error reports a programming mistake rather than a business outcome.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            TransactionError::AlreadyCompleted { .. }
                | TransactionError::InvalidNesting { .. }
                | TransactionError::ScopeDisposed { .. }
        )
    }

    /// Check if this error carries the outcome of an aborted transaction.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            TransactionError::Aborted { .. } | TransactionError::ParticipantPrepare { .. }
        )
    }
}

/// Why a transaction ended up aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The owning scope was disposed without `complete()`.
    NotCompleted,
    /// A joined scope was disposed without `complete()`.
    Vetoed { scope: ScopeId },
    /// Someone holding the handle called `Transaction::rollback`.
    RollbackRequested,
    /// A participant voted to abort during prepare.
    PrepareFailed { participant: String, reason: String },
    /// The owning scope outlived its timeout.
    TimedOut { elapsed_ms: u64, timeout_ms: u64 },
    /// The owning scope was dropped out of order and had to be abandoned.
    InvalidNesting { scope: ScopeId },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::NotCompleted => write!(f, "owning scope was not completed"),
            AbortReason::Vetoed { scope } => write!(f, "vetoed by joined scope {}", scope),
            AbortReason::RollbackRequested => write!(f, "rollback requested"),
            AbortReason::PrepareFailed {
                participant,
                reason,
            } => write!(f, "participant {} failed to prepare: {}", participant, reason),
            AbortReason::TimedOut {
                elapsed_ms,
                timeout_ms,
            } => write!(f, "timed out after {}ms (limit {}ms)", elapsed_ms, timeout_ms),
            AbortReason::InvalidNesting { scope } => {
                write!(f, "scope {} was abandoned out of order", scope)
            }
        }
    }
}

impl AbortReason {
    /// Convert into the error reported by `Transaction::outcome`.
    pub fn into_error(self, tx_id: &str) -> TransactionError {
        match self {
            AbortReason::PrepareFailed {
                participant,
                reason,
            } => TransactionError::ParticipantPrepare {
                participant,
                reason,
            },
            reason => TransactionError::Aborted {
                tx_id: tx_id.to_string(),
                reason,
            },
        }
    }
}
