//! Transactions and their outcome.
//!
//! A transaction is created by the scope that owns it and resolved when that
//! scope is disposed. Everything else (joined scopes, participants, worker
//! threads holding a clone) can only observe it, enlist in it, or veto it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TransactionManager                        │
//! │      (scope defaults, live transaction tracking)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │ Transaction │       │ Isolation   │       │ Participant │
//!  │  (states)   │       │   Level     │       │   (votes)   │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use txscope::transaction::{TransactionManager, ManagerConfig};
//! use txscope::ScopeMode;
//!
//! let manager = TransactionManager::new(ManagerConfig::default());
//!
//! manager.with_scope(ScopeMode::Required, |scope| {
//!     scope.transaction().unwrap().enlist(ledger.clone())?;
//!     Ok(())
//! })?;
//! ```

mod context;
mod error;
mod isolation;
mod manager;
pub(crate) mod participant;

pub use context::{Transaction, TransactionInfo, TransactionState};
pub use error::{AbortReason, TransactionError, TransactionResult};
pub use isolation::IsolationLevel;
pub use manager::{ManagerConfig, TransactionManager};
pub use participant::{enlist, Participant, Vote};
