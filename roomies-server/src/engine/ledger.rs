//! Point mutations.
//!
//! Every mutation runs as one immediate SQLite transaction: the total is changed with
//! an in-place `MAX(point_total + delta, 0)`, the ledger row is appended and badge
//! rules are checked against the new counters. Events go out only after commit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use roomies_shared::api::EventPayload;
use roomies_shared::domain::TaskCompleted;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::{BadgeEngine, Clock, EngineError, EventBroker, household_scope};
use crate::storage::models::{Badge, LedgerEntry};
use crate::storage::{StorageError, Store};

type UserLockMap = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Holds one user's mutation lock. The map entry is dropped with the last holder, so
/// the map only ever contains users with a mutation in flight.
struct UserLock {
    locks: UserLockMap,
    user_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserLock {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one in our guard: nobody else is waiting.
        if Arc::strong_count(OwnedMutexGuard::mutex(&guard)) == 2 {
            map.remove(&self.user_id);
        }
        drop(guard);
    }
}

/// Outcome of [`PointsLedger::award_for_task`].
#[derive(Debug, Clone)]
pub enum TaskAward {
    Awarded {
        household_id: String,
        new_total: i64,
        badges: Vec<Badge>,
    },
    /// The task had been completed before; nothing was awarded.
    AlreadyCompleted,
}

#[derive(Clone)]
pub struct PointsLedger {
    store: Store,
    badges: BadgeEngine,
    broker: EventBroker,
    clock: Arc<dyn Clock>,
    user_locks: UserLockMap,
}

impl PointsLedger {
    pub fn new(store: Store, badges: BadgeEngine, broker: EventBroker, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            badges,
            broker,
            clock,
            user_locks: Default::default(),
        }
    }

    async fn lock_user(&self, user_id: &str) -> UserLock {
        let mutex = {
            let mut map = self.user_locks.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(user_id.to_string())
                .or_insert_with(Default::default)
                .clone()
        };
        UserLock {
            locks: self.user_locks.clone(),
            user_id: user_id.to_string(),
            guard: Some(mutex.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.user_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub async fn award(&self, user_id: &str, delta: i32, reason: &str) -> Result<i64, EngineError> {
        if delta <= 0 {
            return Err(EngineError::Validation("award delta must be positive".into()));
        }
        self.apply(user_id, delta, reason).await
    }

    /// Subtract points; the total never drops below zero.
    pub async fn deduct(&self, user_id: &str, delta: i32, reason: &str) -> Result<i64, EngineError> {
        if delta <= 0 {
            return Err(EngineError::Validation("deduct delta must be positive".into()));
        }
        self.apply(user_id, -delta, reason).await
    }

    async fn apply(&self, user_id: &str, delta: i32, reason: &str) -> Result<i64, EngineError> {
        let _lock = self.lock_user(user_id).await;
        let now = self.clock.now();
        let applied = retry_once(user_id, || {
            self.store
                .apply_point_delta(user_id, delta, reason, now, self.badges.evaluator(now))
        })
        .await?;
        info!(
            user_id = %user_id,
            delta,
            new_total = applied.new_total,
            reason = %reason,
            "ledger: points applied"
        );

        let scope = household_scope(&self.store, user_id).await;
        self.announce_total(&scope, user_id, applied.new_total);
        self.badges.announce(&scope, user_id, &applied.new_badges);
        Ok(applied.new_total)
    }

    /// Mark the task completed and award its points in one transaction.
    /// A completion time later than the clock's "now" is rejected.
    pub async fn award_for_task(&self, event: &TaskCompleted) -> Result<TaskAward, EngineError> {
        if event.points <= 0 {
            return Err(EngineError::Validation(format!(
                "task {} must be worth a positive number of points",
                event.task_id
            )));
        }
        let now = self.clock.now();
        if event.completed_at > now {
            return Err(EngineError::Validation(format!(
                "task {} completion time {} is in the future",
                event.task_id,
                event.completed_at.to_rfc3339()
            )));
        }
        let _lock = self.lock_user(&event.user_id).await;
        let completed = retry_once(&event.user_id, || {
            self.store.complete_task_and_award(
                &event.task_id,
                &event.user_id,
                event.points,
                event.completed_at,
                now,
                self.badges.evaluator(now),
            )
        })
        .await?;
        let Some(completed) = completed else {
            debug!(task_id = %event.task_id, user_id = %event.user_id, "ledger: duplicate completion ignored");
            return Ok(TaskAward::AlreadyCompleted);
        };
        let new_total = completed.applied.new_total;
        info!(
            task_id = %event.task_id,
            user_id = %event.user_id,
            points = event.points,
            new_total,
            "ledger: task completed"
        );

        let mut scope = household_scope(&self.store, &event.user_id).await;
        if !scope.contains(&completed.household_id) {
            scope.push(completed.household_id.clone());
        }
        self.announce_total(&scope, &event.user_id, new_total);
        self.badges
            .announce(&scope, &event.user_id, &completed.applied.new_badges);
        for household in &scope {
            self.broker.broadcast(
                household,
                EventPayload::TaskCompleted {
                    task_id: event.task_id.clone(),
                    user_id: event.user_id.clone(),
                    points: event.points,
                },
            );
            self.broker.broadcast(
                household,
                EventPayload::LeaderboardChanged {
                    household_id: household.clone(),
                },
            );
        }

        Ok(TaskAward::Awarded {
            household_id: completed.household_id,
            new_total,
            badges: completed.applied.new_badges,
        })
    }

    /// Complete a stored task on behalf of `user_id`, worth the task's own points.
    pub async fn complete_task(
        &self,
        task_id: &str,
        user_id: &str,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<TaskAward, EngineError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let event = TaskCompleted {
            user_id: user_id.to_string(),
            task_id: task.id,
            points: task.points,
            due_date: task.due_date.map(|d| d.and_utc()),
            completed_at: completed_at.unwrap_or_else(|| self.clock.now()),
        };
        self.award_for_task(&event).await
    }

    /// Store a finished challenge and check challenge badges.
    /// Returns whether the completion was new and the badges it unlocked.
    pub async fn record_challenge(
        &self,
        user_id: &str,
        challenge_id: &str,
    ) -> Result<(bool, Vec<Badge>), EngineError> {
        if challenge_id.trim().is_empty() {
            return Err(EngineError::Validation("challenge id is empty".into()));
        }
        let _lock = self.lock_user(user_id).await;
        let now = self.clock.now();
        let recorded = retry_once(user_id, || {
            self.store.record_challenge(user_id, challenge_id, now)
        })
        .await?;
        if recorded {
            info!(user_id = %user_id, challenge_id = %challenge_id, "ledger: challenge recorded");
        }
        let badges = self.badges.evaluate(user_id).await?;
        Ok((recorded, badges))
    }

    /// Ledger rows for a user, newest first.
    pub async fn history(
        &self,
        user_id: &str,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<LedgerEntry>, EngineError> {
        if self.store.get_user(user_id).await?.is_none() {
            return Err(EngineError::UserNotFound(user_id.to_string()));
        }
        Ok(self.store.list_ledger_for_user(user_id, page, per_page).await?)
    }

    fn announce_total(&self, households: &[String], user_id: &str, new_total: i64) {
        for household in households {
            self.broker.broadcast(
                household,
                EventPayload::PointsUpdated {
                    user_id: user_id.to_string(),
                    new_total,
                },
            );
        }
    }
}

/// Run `op`, retrying once if SQLite reports the write lock as busy.
async fn retry_once<T, F, Fut>(user_id: &str, mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    match op().await {
        Err(e) if e.is_busy() => {
            warn!(user_id = %user_id, error = %e, "ledger: write lock busy; retrying");
            match op().await {
                Err(e) if e.is_busy() => Err(EngineError::Conflict(user_id.to_string())),
                other => Ok(other?),
            }
        }
        other => Ok(other?),
    }
}
