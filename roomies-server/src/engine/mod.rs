//! Engagement state engine: points, badges, streaks, standings, analytics and
//! live fan-out. Every component is an explicitly constructed, cheaply cloneable
//! service; [`Engine::new`] wires them together around one [`Store`].

pub mod analytics;
pub mod badges;
pub mod broker;
pub mod leaderboard;
pub mod ledger;
pub mod streak;

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::storage::{StorageError, Store};

pub use analytics::AnalyticsEngine;
pub use badges::{BadgeCatalog, BadgeEngine, BadgeRule, Metric};
pub use broker::{DeliveryError, EventBroker, EventSink};
pub use leaderboard::LeaderboardAggregator;
pub use ledger::{PointsLedger, TaskAward};
pub use streak::StreakTracker;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Rejected before any mutation.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("household not found: {0}")]
    HouseholdNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The write lock stayed contended after one retry.
    #[error("concurrent update conflict for user {0}")]
    Conflict(String),

    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for EngineError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound { entity: "user", id } => EngineError::UserNotFound(id),
            StorageError::NotFound { entity: "task", id } => EngineError::TaskNotFound(id),
            StorageError::NotFound {
                entity: "household",
                id,
            } => EngineError::HouseholdNotFound(id),
            other => EngineError::Storage(other),
        }
    }
}

/// Source of "now" for every time-dependent computation.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Zone whose midnight separates calendar days for streaks and windows.
    pub timezone: Tz,
    pub catalog: BadgeCatalog,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            catalog: BadgeCatalog::default(),
        }
    }
}

/// All engine services, sharing one store, broker and clock.
#[derive(Clone)]
pub struct Engine {
    pub ledger: PointsLedger,
    pub badges: BadgeEngine,
    pub streaks: StreakTracker,
    pub leaderboard: LeaderboardAggregator,
    pub analytics: AnalyticsEngine,
    pub broker: EventBroker,
    store: Store,
}

impl Engine {
    pub fn new(store: Store, settings: EngineSettings, clock: Arc<dyn Clock>) -> Self {
        let broker = EventBroker::new();
        let streaks = StreakTracker::new(store.clone(), settings.timezone, clock.clone());
        let badges = BadgeEngine::new(
            store.clone(),
            broker.clone(),
            settings.catalog,
            settings.timezone,
            clock.clone(),
        );
        let ledger = PointsLedger::new(store.clone(), badges.clone(), broker.clone(), clock.clone());
        let leaderboard =
            LeaderboardAggregator::new(store.clone(), settings.timezone, clock.clone());
        let analytics = AnalyticsEngine::new(store.clone(), settings.timezone, clock);
        Self {
            ledger,
            badges,
            streaks,
            leaderboard,
            analytics,
            broker,
            store,
        }
    }

    pub async fn household_exists(&self, household_id: &str) -> Result<bool, EngineError> {
        Ok(self.store.household_exists(household_id).await?)
    }
}

/// Households a user's events fan out to. Lookup failures only cost the broadcast.
async fn household_scope(store: &Store, user_id: &str) -> Vec<String> {
    match store.households_for_user(user_id).await {
        Ok(households) => households,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "broadcast: failed to resolve households");
            Vec::new()
        }
    }
}
