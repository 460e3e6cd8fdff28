//! Session State Manager
//!
//! Single mutation point for session records. Operations on one session id
//! are serialised through a per-id async mutex; different ids never contend.
//! A new iteration is staged in memory, decided on, then persisted exactly
//! once, so a crash before the write loses only that iteration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::store::{validate_session_id, SharedSessionStore, StoreError};
use super::types::{IterationRecord, SessionConfig, SessionState};
use crate::clock::{Clock, SystemClock};
use crate::completion::{CompletionReason, TerminationDecision};
use crate::error::{AuditError, AuditResult};
use crate::review::Review;
use crate::stagnation::StagnationVerdict;

/// Proof that the caller holds the lock for one session id
pub struct SessionLease {
    session_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// How `open` obtained the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    Created,
    Resumed,
    /// The stored record was corrupted and replaced by a fresh one
    Recreated,
}

/// Result of staging an iteration
#[derive(Debug, Clone, PartialEq)]
pub enum Staged {
    /// The loop index was already recorded; nothing changes
    Duplicate,
    /// Prospective state with the new iteration appended, not yet persisted
    Next(SessionState),
}

/// Decisions recorded alongside a staged iteration
#[derive(Debug, Clone, Default)]
pub struct LoopOutcome {
    pub stagnation: Option<StagnationVerdict>,
    pub completion: Option<CompletionReason>,
    pub termination: Option<TerminationDecision>,
}

/// Append `review` for `loop_index` to a copy of `state`.
///
/// A loop index that is already recorded is a duplicate retry. A complete
/// session or a gap in the sequence is an error.
pub fn stage_iteration(
    state: &SessionState,
    loop_index: u32,
    candidate: String,
    review: Review,
    now: chrono::DateTime<chrono::Utc>,
) -> AuditResult<Staged> {
    if loop_index == 0 {
        return Err(AuditError::validation("loop index is 1-based"));
    }
    if state.has_loop(loop_index) {
        return Ok(Staged::Duplicate);
    }
    if state.is_complete {
        return Err(AuditError::SessionComplete {
            session_id: state.session_id.clone(),
            reason: state
                .completion_reason
                .map(|r| r.to_string())
                .unwrap_or_default(),
        });
    }
    if loop_index != state.next_loop() {
        return Err(AuditError::OutOfSequence {
            session_id: state.session_id.clone(),
            expected: state.next_loop(),
            got: loop_index,
        });
    }

    let mut next = state.clone();
    next.iterations.push(IterationRecord {
        loop_index,
        candidate,
        review: review.clone(),
        timestamp: now,
    });
    next.current_loop = loop_index;
    next.last_review = Some(review);
    // advisory terminations hold for one loop; the new one is reassessed
    next.termination = None;
    next.updated_at = now;
    Ok(Staged::Next(next))
}

/// Fold the loop's decisions into a staged state
pub fn record_outcome(state: &mut SessionState, outcome: LoopOutcome) {
    if let Some(verdict) = outcome.stagnation {
        state.last_stagnation = Some(verdict);
    }
    if let Some(reason) = outcome.completion.filter(|r| r.is_terminal()) {
        state.is_complete = true;
        state.completion_reason = Some(reason);
    }
    if let Some(termination) = outcome.termination {
        state.termination = Some(termination);
    }
}

/// Owns session persistence and per-session serialisation
pub struct SessionManager {
    store: SharedSessionStore,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(store: SharedSessionStore) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: SharedSessionStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Wait for exclusive access to `session_id`
    pub async fn lock(&self, session_id: &str) -> AuditResult<SessionLease> {
        validate_session_id(session_id)?;
        let mutex = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Drop entries nobody holds or waits on
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;
        Ok(SessionLease {
            session_id: session_id.to_string(),
            _guard: guard,
        })
    }

    /// Load a session without creating it
    pub async fn load(&self, session_id: &str) -> AuditResult<Option<SessionState>> {
        let _lease = self.lock(session_id).await?;
        Ok(self.store.load(session_id).await?)
    }

    /// Load under an existing lease
    pub async fn load_locked(&self, lease: &SessionLease) -> AuditResult<Option<SessionState>> {
        Ok(self.store.load(lease.session_id()).await?)
    }

    /// Load the session, or build a fresh (unpersisted) one.
    ///
    /// A corrupted record is replaced rather than propagated.
    pub async fn open(
        &self,
        lease: &SessionLease,
        config: SessionConfig,
        context_id: Option<String>,
    ) -> AuditResult<(SessionState, SessionOrigin)> {
        let session_id = lease.session_id();
        let fresh = |config: SessionConfig| {
            let mut state = SessionState::new(session_id, config.sanitized(), self.clock.now());
            state.context_id = context_id.clone();
            state
        };

        match self.store.load(session_id).await {
            Ok(Some(state)) => {
                debug!(session_id, summary = %state.summary(), "Resumed session");
                Ok((state, SessionOrigin::Resumed))
            }
            Ok(None) => {
                info!(session_id, "Created session");
                Ok((fresh(config), SessionOrigin::Created))
            }
            Err(StoreError::Corrupted { message, .. }) => {
                warn!(session_id, error = %message, "Session record corrupted, recreating");
                Ok((fresh(config), SessionOrigin::Recreated))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a staged state
    pub async fn persist(&self, lease: &SessionLease, state: &SessionState) -> AuditResult<()> {
        if state.session_id != lease.session_id() {
            return Err(AuditError::validation(format!(
                "lease for {} cannot persist session {}",
                lease.session_id(),
                state.session_id
            )));
        }
        state
            .check_invariants()
            .map_err(|e| AuditError::validation(format!("refusing to persist: {}", e)))?;
        self.store.save(state).await?;
        debug!(session_id = %state.session_id, summary = %state.summary(), "Persisted session");
        Ok(())
    }

    /// Append one iteration and persist it.
    ///
    /// Retrying an already-recorded loop index returns the stored state
    /// unchanged. A missing session is created with default configuration.
    pub async fn append(
        &self,
        session_id: &str,
        loop_index: u32,
        candidate: impl Into<String>,
        review: Review,
    ) -> AuditResult<SessionState> {
        let lease = self.lock(session_id).await?;
        let (state, _) = self.open(&lease, SessionConfig::default(), None).await?;
        match stage_iteration(&state, loop_index, candidate.into(), review, self.clock.now())? {
            Staged::Duplicate => {
                info!(session_id, loop_index, "Duplicate iteration ignored");
                Ok(state)
            }
            Staged::Next(next) => {
                self.persist(&lease, &next).await?;
                info!(session_id, loop_index, "Iteration appended");
                Ok(next)
            }
        }
    }

    /// Mark a session complete. Idempotent; `in_progress` is rejected.
    pub async fn mark_complete(
        &self,
        session_id: &str,
        reason: CompletionReason,
    ) -> AuditResult<SessionState> {
        let lease = self.lock(session_id).await?;
        let state = self
            .load_locked(&lease)
            .await?
            .ok_or_else(|| AuditError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        self.complete_locked(&lease, state, reason, None).await
    }

    /// Mark complete under an existing lease, optionally recording a termination
    pub async fn complete_locked(
        &self,
        lease: &SessionLease,
        mut state: SessionState,
        reason: CompletionReason,
        termination: Option<TerminationDecision>,
    ) -> AuditResult<SessionState> {
        if !reason.is_terminal() {
            return Err(AuditError::validation(
                "in_progress is not a completion reason",
            ));
        }
        if state.is_complete {
            debug!(session_id = %state.session_id, "Session already complete");
            return Ok(state);
        }
        record_outcome(
            &mut state,
            LoopOutcome {
                stagnation: None,
                completion: Some(reason),
                termination,
            },
        );
        state.updated_at = self.clock.now();
        self.persist(lease, &state).await?;
        info!(session_id = %state.session_id, reason = %reason, "Session marked complete");
        Ok(state)
    }

    /// Known session ids
    pub async fn list(&self) -> AuditResult<Vec<String>> {
        Ok(self.store.list().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::review::Verdict;
    use crate::session::store::MemorySessionStore;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn manager() -> (SessionManager, Arc<MemorySessionStore>) {
        let store = Arc::new(MemorySessionStore::new());
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap());
        (
            SessionManager::with_clock(store.clone(), Arc::new(clock)),
            store,
        )
    }

    fn review(score: f64) -> Review {
        Review::new(score, Verdict::Revise, "")
    }

    #[tokio::test]
    async fn test_append_is_idempotent_per_loop() {
        let (mgr, _) = manager();
        let s = mgr.append("s1", 1, "v1", review(50.0)).await.unwrap();
        assert_eq!(s.current_loop, 1);

        let again = mgr.append("s1", 1, "v1-retry", review(99.0)).await.unwrap();
        assert_eq!(again.iterations.len(), 1);
        assert_eq!(again.iterations[0].candidate, "v1");
        assert_eq!(again.last_review.unwrap().score, 50.0);
    }

    #[tokio::test]
    async fn test_out_of_sequence_rejected() {
        let (mgr, _) = manager();
        mgr.append("s1", 1, "v1", review(50.0)).await.unwrap();
        let err = mgr.append("s1", 3, "v3", review(60.0)).await.unwrap_err();
        assert!(matches!(
            err,
            AuditError::OutOfSequence {
                expected: 2,
                got: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_complete_session_is_immutable() {
        let (mgr, _) = manager();
        mgr.append("s1", 1, "v1", review(50.0)).await.unwrap();
        let done = mgr
            .mark_complete("s1", CompletionReason::Manual)
            .await
            .unwrap();
        assert!(done.is_complete);

        let err = mgr.append("s1", 2, "v2", review(60.0)).await.unwrap_err();
        assert!(matches!(err, AuditError::SessionComplete { .. }));

        // Retry of the last recorded loop is still a no-op
        let same = mgr.append("s1", 1, "v1", review(50.0)).await.unwrap();
        assert_eq!(same.iterations.len(), 1);

        // Idempotent completion keeps the first reason
        let again = mgr
            .mark_complete("s1", CompletionReason::MaxLoopsReached)
            .await
            .unwrap();
        assert_eq!(again.completion_reason, Some(CompletionReason::Manual));
    }

    #[tokio::test]
    async fn test_mark_complete_validation() {
        let (mgr, _) = manager();
        assert!(matches!(
            mgr.mark_complete("missing", CompletionReason::Manual).await,
            Err(AuditError::SessionNotFound { .. })
        ));
        mgr.append("s1", 1, "v1", review(50.0)).await.unwrap();
        assert!(mgr
            .mark_complete("s1", CompletionReason::InProgress)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_corrupted_record_is_recreated() {
        let (mgr, store) = manager();
        store.put_raw("s1", "{ truncated").await;

        let lease = mgr.lock("s1").await.unwrap();
        let (state, origin) = mgr
            .open(&lease, SessionConfig::for_task("retry"), None)
            .await
            .unwrap();
        assert_eq!(origin, SessionOrigin::Recreated);
        assert_eq!(state.current_loop, 0);
        assert_eq!(state.config.task, "retry");
    }

    #[tokio::test]
    async fn test_same_session_serialised_other_sessions_not() {
        let (mgr, _) = manager();
        let mgr = Arc::new(mgr);

        let lease = mgr.lock("busy").await.unwrap();

        // Another id proceeds while "busy" is held
        let other = tokio::time::timeout(Duration::from_secs(1), mgr.lock("free")).await;
        assert!(other.is_ok());

        // Same id waits
        let waiting = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.append("busy", 1, "v1", review(10.0)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(lease);
        let state = waiting.await.unwrap().unwrap();
        assert_eq!(state.current_loop, 1);
    }

    #[tokio::test]
    async fn test_concurrent_appends_same_loop_record_once() {
        let (mgr, _) = manager();
        let mgr = Arc::new(mgr);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let mgr = mgr.clone();
                tokio::spawn(async move { mgr.append("race", 1, format!("v{}", i), review(40.0)).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let state = mgr.load("race").await.unwrap().unwrap();
        assert_eq!(state.iterations.len(), 1);
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_stage_iteration_does_not_touch_input() {
        let now = Utc::now();
        let state = SessionState::new("s", SessionConfig::default(), now);
        let staged = stage_iteration(&state, 1, "v1".into(), review(70.0), now).unwrap();
        assert_eq!(state.current_loop, 0);
        match staged {
            Staged::Next(next) => {
                assert_eq!(next.current_loop, 1);
                assert!(next.check_invariants().is_ok());
            }
            Staged::Duplicate => panic!("expected a new iteration"),
        }
        assert!(stage_iteration(&state, 0, String::new(), review(1.0), now).is_err());
    }

    #[test]
    fn test_stage_iteration_clears_advisory_termination() {
        use crate::completion::{TerminationCategory, TerminationDecision};

        let now = Utc::now();
        let mut state = SessionState::new("s", SessionConfig::default(), now);
        state.termination = Some(TerminationDecision {
            should_terminate: true,
            reason: "Judge failed 3 consecutive times".to_string(),
            estimated_failure_rate: 100.0,
            critical_issues: Vec::new(),
            final_assessment: String::new(),
            category: TerminationCategory::Failure,
        });
        match stage_iteration(&state, 1, "v1".into(), review(70.0), now).unwrap() {
            Staged::Next(next) => assert!(next.termination.is_none()),
            Staged::Duplicate => panic!("expected a new iteration"),
        }
    }
}
