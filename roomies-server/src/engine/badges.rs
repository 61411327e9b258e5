//! Threshold badges.
//!
//! Rules are data: a [`BadgeCatalog`] is a list of `(metric, threshold) -> badge`
//! pairs checked generically. Awarding relies on the `UNIQUE(user_id, type_key)`
//! constraint, so [`BadgeEngine::evaluate`] may run any number of times, concurrently,
//! and still creates each badge at most once.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use roomies_shared::api::EventPayload;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Clock, EngineError, EventBroker, household_scope, streak};
use crate::storage::Store;
use crate::storage::models::{Badge, BadgeGrant, UserProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Points,
    TasksCompleted,
    Streak,
    ChallengesCompleted,
}

/// Cumulative counters a rule is checked against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BadgeStats {
    pub point_total: i64,
    pub tasks_completed: i64,
    pub current_streak: u32,
    pub challenges_completed: i64,
}

impl BadgeStats {
    pub fn from_progress(progress: &UserProgress, as_of: DateTime<Utc>, tz: Tz) -> Self {
        let stamps: Vec<DateTime<Utc>> = progress
            .completion_times
            .iter()
            .map(|t| t.and_utc())
            .collect();
        Self {
            point_total: progress.point_total,
            tasks_completed: progress.tasks_completed,
            current_streak: streak::current_streak(&stamps, as_of, tz),
            challenges_completed: progress.challenges_completed,
        }
    }

    fn value(&self, metric: Metric) -> i64 {
        match metric {
            Metric::Points => self.point_total,
            Metric::TasksCompleted => self.tasks_completed,
            Metric::Streak => i64::from(self.current_streak),
            Metric::ChallengesCompleted => self.challenges_completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeRule {
    pub type_key: String,
    pub name: String,
    pub description: String,
    pub icon_key: String,
    pub metric: Metric,
    pub threshold: i64,
}

impl BadgeRule {
    fn new(
        type_key: &str,
        name: &str,
        description: &str,
        icon_key: &str,
        metric: Metric,
        threshold: i64,
    ) -> Self {
        Self {
            type_key: type_key.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            icon_key: icon_key.to_string(),
            metric,
            threshold,
        }
    }

    pub fn is_satisfied(&self, stats: &BadgeStats) -> bool {
        stats.value(self.metric) >= self.threshold
    }

    fn grant(&self) -> BadgeGrant {
        BadgeGrant {
            type_key: self.type_key.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            icon_key: self.icon_key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadgeCatalog {
    rules: Vec<BadgeRule>,
}

impl BadgeCatalog {
    pub fn new(rules: Vec<BadgeRule>) -> Result<Self, EngineError> {
        let mut seen = HashSet::new();
        for rule in &rules {
            if rule.type_key.trim().is_empty() {
                return Err(EngineError::Validation("badge type_key is empty".into()));
            }
            if rule.threshold <= 0 {
                return Err(EngineError::Validation(format!(
                    "badge {} must have a positive threshold",
                    rule.type_key
                )));
            }
            if !seen.insert(rule.type_key.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate badge type_key: {}",
                    rule.type_key
                )));
            }
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[BadgeRule] {
        &self.rules
    }

    pub fn satisfied<'a>(&'a self, stats: &'a BadgeStats) -> impl Iterator<Item = &'a BadgeRule> {
        self.rules.iter().filter(move |r| r.is_satisfied(stats))
    }
}

impl Default for BadgeCatalog {
    fn default() -> Self {
        use Metric::*;
        Self {
            rules: vec![
                BadgeRule::new("first_task", "First Steps", "Completed your first task", "star", TasksCompleted, 1),
                BadgeRule::new("tasks_10", "Helping Hand", "Completed 10 tasks", "hand", TasksCompleted, 10),
                BadgeRule::new("tasks_50", "Chore Champion", "Completed 50 tasks", "trophy", TasksCompleted, 50),
                BadgeRule::new("tasks_100", "Household Hero", "Completed 100 tasks", "crown", TasksCompleted, 100),
                BadgeRule::new("points_100", "Century", "Earned 100 points", "coin", Points, 100),
                BadgeRule::new("points_500", "Point Collector", "Earned 500 points", "coins", Points, 500),
                BadgeRule::new("points_1000", "Point Master", "Earned 1000 points", "gem", Points, 1000),
                BadgeRule::new("streak_3", "On a Roll", "3-day completion streak", "flame", Streak, 3),
                BadgeRule::new("streak_7", "Week Warrior", "7-day completion streak", "fire", Streak, 7),
                BadgeRule::new("streak_30", "Unstoppable", "30-day completion streak", "bolt", Streak, 30),
                BadgeRule::new("challenge_1", "Challenger", "Completed a challenge", "flag", ChallengesCompleted, 1),
                BadgeRule::new("challenges_5", "Challenge Seeker", "Completed 5 challenges", "medal", ChallengesCompleted, 5),
            ],
        }
    }
}

#[derive(Clone)]
pub struct BadgeEngine {
    inner: Arc<BadgeEngineInner>,
}

struct BadgeEngineInner {
    store: Store,
    broker: EventBroker,
    catalog: Arc<BadgeCatalog>,
    tz: Tz,
    clock: Arc<dyn Clock>,
}

impl BadgeEngine {
    pub fn new(
        store: Store,
        broker: EventBroker,
        catalog: BadgeCatalog,
        tz: Tz,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(BadgeEngineInner {
                store,
                broker,
                catalog: Arc::new(catalog),
                tz,
                clock,
            }),
        }
    }

    pub fn catalog(&self) -> &BadgeCatalog {
        &self.inner.catalog
    }

    /// Rule check handed to storage; runs against post-mutation counters inside the
    /// writing transaction.
    pub(crate) fn evaluator(
        &self,
        as_of: DateTime<Utc>,
    ) -> impl FnOnce(&UserProgress) -> Vec<BadgeGrant> + Send + 'static {
        let catalog = self.inner.catalog.clone();
        let tz = self.inner.tz;
        move |progress: &UserProgress| {
            let stats = BadgeStats::from_progress(progress, as_of, tz);
            catalog.satisfied(&stats).map(BadgeRule::grant).collect()
        }
    }

    /// Award every newly satisfied badge. Returns only the badges created by this call.
    pub async fn evaluate(&self, user_id: &str) -> Result<Vec<Badge>, EngineError> {
        let now = self.inner.clock.now();
        let created = self
            .inner
            .store
            .grant_badges(user_id, now, self.evaluator(now))
            .await?;
        if created.is_empty() {
            debug!(user_id = %user_id, "badges: nothing new");
            return Ok(created);
        }
        let scope = household_scope(&self.inner.store, user_id).await;
        self.announce(&scope, user_id, &created);
        Ok(created)
    }

    pub async fn list_badges(&self, user_id: &str) -> Result<Vec<Badge>, EngineError> {
        if self.inner.store.get_user(user_id).await?.is_none() {
            return Err(EngineError::UserNotFound(user_id.to_string()));
        }
        Ok(self.inner.store.list_badges(user_id).await?)
    }

    pub(crate) fn announce(&self, households: &[String], user_id: &str, badges: &[Badge]) {
        for badge in badges {
            info!(user_id = %user_id, badge = %badge.type_key, "badges: earned");
            for household in households {
                self.inner.broker.broadcast(
                    household,
                    EventPayload::BadgeEarned {
                        user_id: user_id.to_string(),
                        badge_type: badge.type_key.clone(),
                        name: badge.name.clone(),
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn keys<'a>(catalog: &'a BadgeCatalog, stats: &'a BadgeStats) -> Vec<&'a str> {
        catalog.satisfied(stats).map(|r| r.type_key.as_str()).collect()
    }

    #[test]
    fn fresh_user_earns_nothing() {
        let catalog = BadgeCatalog::default();
        assert!(keys(&catalog, &BadgeStats::default()).is_empty());
    }

    #[test]
    fn thresholds_are_inclusive() {
        let catalog = BadgeCatalog::default();
        let stats = BadgeStats {
            point_total: 100,
            tasks_completed: 10,
            current_streak: 7,
            challenges_completed: 0,
        };
        assert_eq!(
            keys(&catalog, &stats),
            vec!["first_task", "tasks_10", "points_100", "streak_3", "streak_7"]
        );
    }

    #[test]
    fn just_below_threshold_is_not_earned() {
        let catalog = BadgeCatalog::default();
        let stats = BadgeStats {
            point_total: 99,
            tasks_completed: 0,
            current_streak: 6,
            challenges_completed: 4,
        };
        assert_eq!(keys(&catalog, &stats), vec!["streak_3", "challenge_1"]);
    }

    #[test]
    fn custom_catalog_is_data_only() {
        let catalog = BadgeCatalog::new(vec![BadgeRule::new(
            "points_42",
            "Answer",
            "Earned 42 points",
            "towel",
            Metric::Points,
            42,
        )])
        .unwrap();
        let stats = BadgeStats {
            point_total: 42,
            ..Default::default()
        };
        assert_eq!(keys(&catalog, &stats), vec!["points_42"]);
    }

    #[test]
    fn catalog_rejects_duplicates_and_bad_thresholds() {
        let rule = BadgeRule::new("x", "X", "x", "x", Metric::Points, 1);
        assert!(BadgeCatalog::new(vec![rule.clone(), rule.clone()]).is_err());
        let zero = BadgeRule {
            threshold: 0,
            ..rule
        };
        assert!(matches!(
            BadgeCatalog::new(vec![zero]),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn stats_derive_streak_from_progress() {
        let day = |d| {
            Utc.with_ymd_and_hms(2026, 5, d, 10, 0, 0)
                .unwrap()
                .naive_utc()
        };
        let progress = UserProgress {
            point_total: 30,
            tasks_completed: 3,
            completion_times: vec![day(1), day(2), day(3)],
            challenges_completed: 0,
        };
        let as_of = Utc.with_ymd_and_hms(2026, 5, 3, 20, 0, 0).unwrap();
        let stats = BadgeStats::from_progress(&progress, as_of, Tz::UTC);
        assert_eq!(stats.current_streak, 3);
        assert_eq!(stats.tasks_completed, 3);
    }

    #[test]
    fn rules_deserialize_from_yaml() {
        let rules: Vec<BadgeRule> = serde_yaml::from_str(
            r#"
- type_key: streak_14
  name: Fortnight
  description: 14-day streak
  icon_key: moon
  metric: streak
  threshold: 14
"#,
        )
        .unwrap();
        assert_eq!(rules[0].metric, Metric::Streak);
        assert_eq!(rules[0].threshold, 14);
    }
}
