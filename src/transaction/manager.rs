//! Transaction manager - default scope options and live transaction tracking.
//!
//! The TransactionManager is a convenience entry point. It handles:
//! - Building scope options from configured defaults
//! - Tracking transactions created through it until they resolve
//! - Running a closure or future inside a scope, completing it on success

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::ambient::{AmbientContext, Propagate};
use crate::scope::{ScopeMode, ScopeOptions, TransactionScope};
use crate::transaction::context::{Transaction, TransactionInfo};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::isolation::IsolationLevel;

/// Defaults applied to every scope the manager opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Isolation level requested by new scopes.
    pub isolation: IsolationLevel,
    /// Whether scopes carry their transaction across suspension points.
    pub async_flow: bool,
    /// Timeout for transactions owned by the manager's scopes.
    pub default_timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::Serializable,
            async_flow: false,
            default_timeout: None,
        }
    }
}

impl ManagerConfig {
    /// Set the isolation level.
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = level;
        self
    }

    /// Set the async flow flag.
    pub fn async_flow(mut self, value: bool) -> Self {
        self.async_flow = value;
        self
    }

    /// Set the default timeout.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}

/// Transaction manager - opens scopes with shared defaults.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
#[derive(Clone, Default)]
pub struct TransactionManager {
    inner: Arc<TransactionManagerInner>,
}

#[derive(Default)]
struct TransactionManagerInner {
    config: ManagerConfig,
    /// Unresolved transactions created through this manager, by ID.
    active: RwLock<HashMap<String, Transaction>>,
}

impl TransactionManager {
    /// Create a new transaction manager with the given defaults.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(TransactionManagerInner {
                config,
                active: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Get the manager's defaults.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Scope options for `mode` with the configured defaults.
    pub fn options(&self, mode: ScopeMode) -> ScopeOptions {
        let config = &self.inner.config;
        let options = ScopeOptions::new(mode)
            .isolation(config.isolation)
            .async_flow(config.async_flow);
        match config.default_timeout {
            Some(timeout) => options.timeout(timeout),
            None => options,
        }
    }

    /// Open a scope with the configured defaults.
    pub fn scope(&self, mode: ScopeMode) -> TransactionResult<TransactionScope> {
        self.scope_with(self.options(mode))
    }

    /// Open a scope with explicit options, tracking any transaction it creates.
    pub fn scope_with(&self, options: ScopeOptions) -> TransactionResult<TransactionScope> {
        let scope = TransactionScope::new(options)?;
        if scope.owns_transaction() {
            if let Some(tx) = scope.transaction() {
                self.track(tx);
            }
        }
        Ok(scope)
    }

    fn track(&self, tx: &Transaction) {
        self.inner
            .active
            .write()
            .insert(tx.id().to_string(), tx.clone());

        let inner = Arc::downgrade(&self.inner);
        tx.on_completed(move |info| {
            if let Some(inner) = inner.upgrade() {
                inner.active.write().remove(&info.tx_id);
            }
        });
    }

    /// Get the number of unresolved transactions.
    pub fn active_count(&self) -> usize {
        self.inner.active.read().len()
    }

    /// List all unresolved transaction IDs.
    pub fn active_transactions(&self) -> Vec<String> {
        self.inner.active.read().keys().cloned().collect()
    }

    /// Check if a transaction is still unresolved.
    pub fn is_active(&self, tx_id: &str) -> bool {
        self.inner.active.read().contains_key(tx_id)
    }

    /// Get current metadata for an unresolved transaction.
    pub fn get_transaction_info(&self, tx_id: &str) -> Option<TransactionInfo> {
        self.inner.active.read().get(tx_id).map(Transaction::info)
    }

    /// Execute a function within a scope, completing it if the function succeeds.
    ///
    /// If the function returns Ok, the scope is completed and disposed; an
    /// owned transaction that still aborts (veto, participant refusal) turns
    /// the result into that error. If the function returns Err or panics, the
    /// scope is disposed without completion.
    pub fn with_scope<F, T, E>(&self, mode: ScopeMode, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut TransactionScope) -> Result<T, E>,
        E: From<TransactionError>,
    {
        let mut scope = self.scope(mode)?;
        let result = f(&mut scope);
        finish(scope, result)
    }

    /// Run a future within a scope under the propagation carrier.
    ///
    /// The scope is opened on the first poll, starting from the ambient value
    /// visible when this method is called.
    pub fn with_scope_async<Fut, T, E>(
        &self,
        mode: ScopeMode,
        body: Fut,
    ) -> impl Future<Output = Result<T, E>>
    where
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError>,
    {
        let manager = self.clone();
        let work = async move {
            let scope = manager.scope(mode)?;
            let result = body.await;
            finish(scope, result)
        };
        Propagate::with_snapshot(work, AmbientContext::capture())
    }
}

fn finish<T, E>(mut scope: TransactionScope, result: Result<T, E>) -> Result<T, E>
where
    E: From<TransactionError>,
{
    if result.is_ok() && !scope.is_completed() {
        scope.complete()?;
    }
    scope.dispose()?;

    if result.is_ok() && scope.owns_transaction() {
        if let Some(Err(err)) = scope.transaction().and_then(Transaction::outcome) {
            return Err(err.into());
        }
    }
    result
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("config", &self.inner.config)
            .field("active_count", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambient::current_transaction;
    use crate::transaction::context::TransactionState;
    use crate::transaction::participant::testing::{Panicking, Recorder};
    use crate::transaction::participant::Vote;

    fn setup() -> TransactionManager {
        TransactionManager::new(ManagerConfig::default())
    }

    #[test]
    fn test_scope_tracking() {
        let manager = setup();
        assert_eq!(manager.active_count(), 0);

        let mut scope = manager.scope(ScopeMode::Required).unwrap();
        let tx_id = scope.transaction().unwrap().id().to_string();
        assert!(manager.is_active(&tx_id));
        assert_eq!(
            manager.get_transaction_info(&tx_id).unwrap().state,
            TransactionState::Active
        );

        // Joined scopes are not tracked twice.
        let joined = manager.scope(ScopeMode::Required).unwrap();
        assert_eq!(manager.active_count(), 1);
        drop(joined);

        scope.dispose().unwrap();
        assert_eq!(manager.active_count(), 0);
        assert!(manager.active_transactions().is_empty());
    }

    #[test]
    fn test_with_scope_commits() {
        let manager = setup();
        let mut seen = None;

        let result: TransactionResult<u32> = manager.with_scope(ScopeMode::Required, |scope| {
            seen = scope.transaction().cloned();
            assert_eq!(current_transaction(), seen);
            Ok(7)
        });

        assert_eq!(result.unwrap(), 7);
        assert_eq!(seen.unwrap().state(), TransactionState::Committed);
        assert!(current_transaction().is_none());
    }

    #[test]
    fn test_with_scope_rollback_on_error() {
        let manager = setup();
        let mut seen = None;

        let result: TransactionResult<()> = manager.with_scope(ScopeMode::Required, |scope| {
            seen = scope.transaction().cloned();
            Err(TransactionError::NoActiveTransaction)
        });

        assert!(result.is_err());
        assert_eq!(seen.unwrap().state(), TransactionState::Aborted);
    }

    #[test]
    fn test_with_scope_reports_abort() {
        let manager = setup();
        let result: TransactionResult<()> = manager.with_scope(ScopeMode::Required, |scope| {
            let refusing = Recorder::new("ledger", Vote::Abort("out of balance".into()));
            scope.transaction().unwrap().enlist(refusing)?;
            Ok(())
        });

        assert_eq!(
            result.unwrap_err(),
            TransactionError::ParticipantPrepare {
                participant: "ledger".to_string(),
                reason: "out of balance".to_string(),
            }
        );
    }

    #[test]
    fn test_panicking_participant_is_untracked() {
        let manager = setup();
        let mut scope = manager.scope(ScopeMode::Required).unwrap();
        let tx = scope.transaction().cloned().unwrap();
        tx.enlist(Arc::new(Panicking)).unwrap();

        scope.complete().unwrap();
        scope.dispose().unwrap();
        assert_eq!(tx.state(), TransactionState::Aborted);
        assert_eq!(manager.active_count(), 0);
        assert!(current_transaction().is_none());
    }

    #[test]
    fn test_nested_with_scope_veto() {
        let manager = setup();
        let result: TransactionResult<()> = manager.with_scope(ScopeMode::Required, |_| {
            let inner: TransactionResult<()> =
                manager.with_scope(ScopeMode::Required, |_| Err(TransactionError::NoActiveTransaction));
            assert!(inner.is_err());
            Ok(())
        });

        assert!(matches!(
            result,
            Err(TransactionError::Aborted { .. })
        ));
    }

    #[test]
    fn test_config_defaults_flow_into_options() {
        let manager = TransactionManager::new(
            ManagerConfig::default()
                .isolation(IsolationLevel::ReadCommitted)
                .async_flow(true)
                .default_timeout(Duration::from_secs(30)),
        );
        let options = manager.options(ScopeMode::RequiresNew);
        assert_eq!(options.mode, ScopeMode::RequiresNew);
        assert_eq!(options.isolation, IsolationLevel::ReadCommitted);
        assert!(options.async_flow);
        assert_eq!(options.timeout, Some(Duration::from_secs(30)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_with_scope_async_flowing() {
        let manager = TransactionManager::new(ManagerConfig::default().async_flow(true));

        let (before, after) = manager
            .with_scope_async(ScopeMode::Required, async {
                let before = current_transaction();
                tokio::task::yield_now().await;
                Ok::<_, TransactionError>((before, current_transaction()))
            })
            .await
            .unwrap();

        let tx = before.unwrap();
        assert_eq!(after.as_ref(), Some(&tx));
        assert_eq!(tx.state(), TransactionState::Committed);
        assert_eq!(manager.active_count(), 0);
    }
}
