//! The transaction state machine.
//!
//! A `Transaction` is a cheap, cloneable handle. Scopes, participants and
//! worker threads holding clones all observe the same state:
//!
//! ```text
//! Active ──(owner disposes, completed, no veto)──► Committing ──► Committed
//!    │                                                  │
//!    └──(not completed / vetoed / timed out)──► Aborted ◄┘ (a participant voted Abort)
//! ```
//!
//! Only the owning scope moves a transaction out of `Active`. Joined scopes
//! and other handle holders can only add vetoes, which is safe from any
//! number of threads at once.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::transaction::error::{AbortReason, TransactionError, TransactionResult};
use crate::transaction::isolation::IsolationLevel;
use crate::transaction::participant::{Participant, Vote};

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Accepting joins, participants and vetoes.
    Active,
    /// The owner completed; participants are voting.
    Committing,
    /// Successfully committed.
    Committed,
    /// Rolled back.
    Aborted,
}

impl TransactionState {
    /// Committed and aborted transactions never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "active"),
            TransactionState::Committing => write!(f, "committing"),
            TransactionState::Committed => write!(f, "committed"),
            TransactionState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Point-in-time description of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    /// Unique transaction ID.
    pub tx_id: String,
    /// Isolation level fixed at creation.
    pub isolation: IsolationLevel,
    /// State when the snapshot was taken.
    pub state: TransactionState,
    /// When the transaction started.
    pub started_at: DateTime<Utc>,
    /// Number of enlisted participants.
    pub participants: usize,
    /// Number of vetoes registered so far.
    pub vetoes: usize,
}

type CompletionCallback = Box<dyn FnOnce(&TransactionInfo) + Send>;

struct Status {
    state: TransactionState,
    /// Set once the owner started deciding the outcome.
    resolving: bool,
    abort_reason: Option<AbortReason>,
}

impl Status {
    fn accepting(&self) -> bool {
        self.state == TransactionState::Active && !self.resolving
    }

    fn describe(&self) -> String {
        if self.state == TransactionState::Active && self.resolving {
            "resolving".to_string()
        } else {
            self.state.to_string()
        }
    }
}

struct Enlistment {
    participant: Arc<dyn Participant>,
    vote: Option<Vote>,
}

struct TransactionInner {
    tx_id: String,
    isolation: IsolationLevel,
    started_at: DateTime<Utc>,
    started: Instant,
    status: Mutex<Status>,
    /// Lock order: `status` before `participants` and `callbacks`.
    participants: Mutex<Vec<Enlistment>>,
    vetoes: Mutex<Vec<AbortReason>>,
    callbacks: Mutex<Vec<CompletionCallback>>,
}

/// Handle to a logical transaction shared by every scope that joins it.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    /// Create a new active transaction.
    pub(crate) fn new(isolation: IsolationLevel) -> Self {
        let tx_id = Ulid::new().to_string().to_lowercase();
        let isolation = isolation.resolve();
        tracing::debug!(tx_id = %tx_id, isolation = %isolation, "transaction created");

        Self {
            inner: Arc::new(TransactionInner {
                tx_id,
                isolation,
                started_at: Utc::now(),
                started: Instant::now(),
                status: Mutex::new(Status {
                    state: TransactionState::Active,
                    resolving: false,
                    abort_reason: None,
                }),
                participants: Mutex::new(Vec::new()),
                vetoes: Mutex::new(Vec::new()),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Get the transaction ID.
    pub fn id(&self) -> &str {
        &self.inner.tx_id
    }

    /// Get the isolation level.
    pub fn isolation_level(&self) -> IsolationLevel {
        self.inner.isolation
    }

    /// Get the current state.
    pub fn state(&self) -> TransactionState {
        self.inner.status.lock().state
    }

    /// Check if the transaction still accepts work.
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// When the transaction started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Why the transaction aborted, once it has.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.inner.status.lock().abort_reason.clone()
    }

    /// Final outcome: `None` until terminal, then `Ok` for committed or the abort cause.
    pub fn outcome(&self) -> Option<TransactionResult<()>> {
        let status = self.inner.status.lock();
        match status.state {
            TransactionState::Committed => Some(Ok(())),
            TransactionState::Aborted => {
                let reason = status
                    .abort_reason
                    .clone()
                    .unwrap_or(AbortReason::NotCompleted);
                Some(Err(reason.into_error(&self.inner.tx_id)))
            }
            _ => None,
        }
    }

    /// Take a snapshot of the transaction's metadata.
    pub fn info(&self) -> TransactionInfo {
        let state = self.state();
        TransactionInfo {
            tx_id: self.inner.tx_id.clone(),
            isolation: self.inner.isolation,
            state,
            started_at: self.inner.started_at,
            participants: self.inner.participants.lock().len(),
            vetoes: self.inner.vetoes.lock().len(),
        }
    }

    /// Number of vetoes registered against this transaction.
    pub fn veto_count(&self) -> usize {
        self.inner.vetoes.lock().len()
    }

    /// Enlist a participant that will vote on the outcome.
    pub fn enlist(&self, participant: Arc<dyn Participant>) -> TransactionResult<()> {
        let status = self.inner.status.lock();
        if !status.accepting() {
            return Err(self.not_active(&status));
        }
        tracing::debug!(tx_id = %self.inner.tx_id, participant = participant.name(), "participant enlisted");
        self.inner.participants.lock().push(Enlistment {
            participant,
            vote: None,
        });
        Ok(())
    }

    /// Doom the transaction. The owning scope still decides when it resolves.
    pub fn rollback(&self) -> TransactionResult<()> {
        self.veto(AbortReason::RollbackRequested)
    }

    /// Run `callback` once the transaction is committed or aborted.
    ///
    /// Runs immediately on the calling thread if it already is.
    pub fn on_completed<F>(&self, callback: F)
    where
        F: FnOnce(&TransactionInfo) + Send + 'static,
    {
        {
            let status = self.inner.status.lock();
            if !status.state.is_terminal() {
                self.inner.callbacks.lock().push(Box::new(callback));
                return;
            }
        }
        callback(&self.info());
    }

    /// Register a veto. Ignored with `NotActive` once the outcome is being decided.
    pub(crate) fn veto(&self, reason: AbortReason) -> TransactionResult<()> {
        let status = self.inner.status.lock();
        if !status.accepting() {
            tracing::debug!(tx_id = %self.inner.tx_id, reason = %reason, "veto after resolution ignored");
            return Err(self.not_active(&status));
        }
        tracing::debug!(tx_id = %self.inner.tx_id, reason = %reason, "veto registered");
        self.inner.vetoes.lock().push(reason);
        Ok(())
    }

    /// Decide the outcome. Called once by the owning scope on disposal.
    pub(crate) fn resolve(&self, completed: bool, timeout: Option<Duration>) -> TransactionState {
        let early_abort = {
            let mut status = self.inner.status.lock();
            if !status.accepting() {
                return status.state;
            }
            status.resolving = true;

            let reason = if !completed {
                Some(AbortReason::NotCompleted)
            } else if let Some(veto) = self.inner.vetoes.lock().first().cloned() {
                Some(veto)
            } else {
                timeout.and_then(|limit| {
                    let elapsed = self.inner.started.elapsed();
                    (elapsed > limit).then(|| AbortReason::TimedOut {
                        elapsed_ms: elapsed.as_millis() as u64,
                        timeout_ms: limit.as_millis() as u64,
                    })
                })
            };
            if reason.is_none() {
                status.state = TransactionState::Committing;
            }
            reason
        };

        if let Some(reason) = early_abort {
            self.rollback_participants();
            return self.finish(TransactionState::Aborted, Some(reason));
        }

        match self.prepare_participants() {
            None => {
                let info = self.info();
                for participant in self.voted(|vote| *vote == Vote::Prepared) {
                    guarded(participant.as_ref(), "commit", || participant.commit(&info));
                }
                self.finish(TransactionState::Committed, None)
            }
            Some(reason) => {
                self.rollback_participants();
                self.finish(TransactionState::Aborted, Some(reason))
            }
        }
    }

    /// Abort straight from `Active`, skipping the vote.
    pub(crate) fn abort(&self, reason: AbortReason) -> TransactionState {
        {
            let mut status = self.inner.status.lock();
            if !status.accepting() {
                return status.state;
            }
            status.resolving = true;
        }
        self.rollback_participants();
        self.finish(TransactionState::Aborted, Some(reason))
    }

    /// Phase one. Returns the abort reason of the first participant that refuses.
    fn prepare_participants(&self) -> Option<AbortReason> {
        let participants: Vec<Arc<dyn Participant>> = self
            .inner
            .participants
            .lock()
            .iter()
            .map(|e| e.participant.clone())
            .collect();
        let info = self.info();

        for (index, participant) in participants.iter().enumerate() {
            let vote = guarded(participant.as_ref(), "prepare", || participant.prepare(&info))
                .unwrap_or_else(|| Vote::Abort("panicked".to_string()));
            let allows_commit = vote.allows_commit();
            let refused = match &vote {
                Vote::Abort(reason) => Some(AbortReason::PrepareFailed {
                    participant: participant.name().to_string(),
                    reason: reason.clone(),
                }),
                _ => None,
            };
            if let Some(enlistment) = self.inner.participants.lock().get_mut(index) {
                enlistment.vote = Some(vote);
            }
            if !allows_commit {
                return refused;
            }
        }
        None
    }

    /// Notify everyone that still expects an answer. Read-only and refusing voters are skipped.
    fn rollback_participants(&self) {
        let info = self.info();
        for participant in self.voted(|vote| *vote == Vote::Prepared) {
            guarded(participant.as_ref(), "rollback", || participant.rollback(&info));
        }
        let unvoted: Vec<Arc<dyn Participant>> = self
            .inner
            .participants
            .lock()
            .iter()
            .filter(|e| e.vote.is_none())
            .map(|e| e.participant.clone())
            .collect();
        for participant in unvoted {
            guarded(participant.as_ref(), "rollback", || participant.rollback(&info));
        }
    }

    fn voted(&self, pred: impl Fn(&Vote) -> bool) -> Vec<Arc<dyn Participant>> {
        self.inner
            .participants
            .lock()
            .iter()
            .filter(|e| e.vote.as_ref().is_some_and(&pred))
            .map(|e| e.participant.clone())
            .collect()
    }

    fn finish(&self, state: TransactionState, reason: Option<AbortReason>) -> TransactionState {
        {
            let mut status = self.inner.status.lock();
            status.state = state;
            status.abort_reason = reason.clone();
        }

        match &reason {
            Some(reason) => {
                tracing::info!(tx_id = %self.inner.tx_id, reason = %reason, "transaction aborted")
            }
            None => tracing::info!(tx_id = %self.inner.tx_id, "transaction committed"),
        }

        let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
        let info = self.info();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&info))).is_err() {
                tracing::error!(tx_id = %self.inner.tx_id, "completion callback panicked");
            }
        }
        state
    }

    fn not_active(&self, status: &Status) -> TransactionError {
        TransactionError::NotActive {
            tx_id: self.inner.tx_id.clone(),
            state: status.describe(),
        }
    }
}

/// Call into a participant. A panic is logged and reported as `None`.
fn guarded<R>(
    participant: &dyn Participant,
    phase: &'static str,
    call: impl FnOnce() -> R,
) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::error!(participant = participant.name(), phase, "participant panicked");
            None
        }
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Transaction {}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("tx_id", &self.inner.tx_id)
            .field("isolation", &self.inner.isolation)
            .field("state", &self.state())
            .finish()
    }
}
