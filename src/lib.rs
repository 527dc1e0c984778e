//! txscope - ambient transaction scopes
//!
//! Nested units of work share or isolate one logical transaction without
//! passing it around. A scope joins the transaction it finds, starts a new
//! one, or hides it, and the ambient value follows the code across ordinary
//! calls and, when asked to, across `.await` points.
//!
//! # Example
//!
//! ```
//! use txscope::{create_scope, current_transaction, IsolationLevel, ScopeMode};
//!
//! let mut scope = create_scope(ScopeMode::Required, IsolationLevel::Serializable, false).unwrap();
//! assert!(current_transaction().is_some());
//! scope.complete().unwrap();
//! scope.dispose().unwrap();
//! assert!(current_transaction().is_none());
//! ```

pub mod ambient;
pub mod scope;
pub mod transaction;

pub use ambient::{current_transaction, AmbientContext, AmbientFutureExt, AmbientSnapshot, Propagate, ScopeId};
pub use scope::{create_scope, ScopeMode, ScopeOptions, TransactionScope};
pub use transaction::{
    enlist, AbortReason, IsolationLevel, ManagerConfig, Participant, Transaction,
    TransactionError, TransactionInfo, TransactionManager, TransactionResult, TransactionState,
    Vote,
};
