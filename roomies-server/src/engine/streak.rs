//! Calendar-day streaks.
//!
//! A streak is the number of consecutive days, walking backward from the day of
//! `as_of`, on which a user completed at least one task. Days are cut at midnight
//! of a fixed reference zone. The anchor day may still be empty: a user who has
//! not acted yet today keeps yesterday's streak. Any other gap ends the walk.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

use super::{Clock, EngineError};
use crate::storage::Store;

/// Calendar day of `at` in `tz`.
pub fn local_day(at: DateTime<Utc>, tz: Tz) -> NaiveDate {
    at.with_timezone(&tz).date_naive()
}

/// Current streak as of `as_of`. Pure: same inputs, same answer.
pub fn current_streak(timestamps: &[DateTime<Utc>], as_of: DateTime<Utc>, tz: Tz) -> u32 {
    let today = local_day(as_of, tz);
    let days: HashSet<NaiveDate> = timestamps
        .iter()
        .map(|t| local_day(*t, tz))
        .filter(|d| *d <= today)
        .collect();
    if days.is_empty() {
        return 0;
    }

    let mut day = today;
    if !days.contains(&day) {
        match day.pred_opt() {
            Some(prev) => day = prev,
            None => return 0,
        }
    }
    let mut streak = 0;
    while days.contains(&day) {
        streak += 1;
        match day.pred_opt() {
            Some(prev) => day = prev,
            None => break,
        }
    }
    streak
}

/// Longest run of consecutive active days anywhere in the history.
pub fn longest_streak(timestamps: &[DateTime<Utc>], tz: Tz) -> u32 {
    let days: BTreeSet<NaiveDate> = timestamps.iter().map(|t| local_day(*t, tz)).collect();
    let mut best = 0;
    let mut run = 0;
    let mut prev: Option<NaiveDate> = None;
    for day in days {
        run = match prev {
            Some(p) if p.succ_opt() == Some(day) => run + 1,
            _ => 1,
        };
        best = best.max(run);
        prev = Some(day);
    }
    best
}

/// Streaks computed on demand from stored completion history.
#[derive(Clone)]
pub struct StreakTracker {
    store: Store,
    tz: Tz,
    clock: Arc<dyn Clock>,
}

impl StreakTracker {
    pub fn new(store: Store, tz: Tz, clock: Arc<dyn Clock>) -> Self {
        Self { store, tz, clock }
    }

    pub async fn current_streak(&self, user_id: &str) -> Result<u32, EngineError> {
        self.current_streak_at(user_id, self.clock.now()).await
    }

    pub async fn current_streak_at(
        &self,
        user_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<u32, EngineError> {
        if self.store.get_user(user_id).await?.is_none() {
            return Err(EngineError::UserNotFound(user_id.to_string()));
        }
        let mut times = self
            .store
            .completion_times_for_users(&[user_id.to_string()])
            .await?;
        let stamps: Vec<DateTime<Utc>> = times
            .remove(user_id)
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.and_utc())
            .collect();
        Ok(current_streak(&stamps, as_of, self.tz))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn three_consecutive_days() {
        let ts = [at(1, 9), at(2, 18), at(3, 7)];
        assert_eq!(current_streak(&ts, at(3, 23), Tz::UTC), 3);
    }

    #[test]
    fn gap_before_today_breaks_chain() {
        let ts = [at(1, 9), at(3, 9)];
        assert_eq!(current_streak(&ts, at(3, 12), Tz::UTC), 1);
    }

    #[test]
    fn no_history_is_zero() {
        assert_eq!(current_streak(&[], at(3, 12), Tz::UTC), 0);
    }

    #[test]
    fn today_plus_three_prior_days_then_gap() {
        let ts = [at(1, 9), at(3, 9), at(4, 9), at(5, 9), at(6, 9)];
        assert_eq!(current_streak(&ts, at(6, 20), Tz::UTC), 4);
    }

    #[test]
    fn empty_today_keeps_yesterdays_streak() {
        let ts = [at(4, 9), at(5, 9)];
        assert_eq!(current_streak(&ts, at(6, 8), Tz::UTC), 2);
    }

    #[test]
    fn two_empty_days_reset() {
        let ts = [at(3, 9), at(4, 9)];
        assert_eq!(current_streak(&ts, at(6, 8), Tz::UTC), 0);
    }

    #[test]
    fn multiple_completions_same_day_count_once() {
        let ts = [at(5, 8), at(5, 9), at(5, 22), at(6, 1)];
        assert_eq!(current_streak(&ts, at(6, 12), Tz::UTC), 2);
    }

    #[test]
    fn later_days_are_ignored() {
        let ts = [at(5, 8), at(6, 9), at(9, 9)];
        assert_eq!(current_streak(&ts, at(6, 12), Tz::UTC), 2);
    }

    #[test]
    fn reference_zone_decides_the_day() {
        // 23:30 UTC on the 4th is already the 5th in Tokyo.
        let ts = [at(4, 1), Utc.with_ymd_and_hms(2026, 3, 4, 23, 30, 0).unwrap()];
        assert_eq!(current_streak(&ts, at(5, 6), Tz::UTC), 1);
        assert_eq!(current_streak(&ts, at(5, 6), Tz::Asia__Tokyo), 2);
    }

    #[test]
    fn pure_for_identical_inputs() {
        let ts = [at(1, 9), at(2, 9), at(3, 9)];
        let a = current_streak(&ts, at(3, 10), Tz::Europe__Warsaw);
        let b = current_streak(&ts, at(3, 10), Tz::Europe__Warsaw);
        assert_eq!(a, b);
    }

    #[test]
    fn longest_run_in_history() {
        let ts = [at(1, 9), at(2, 9), at(3, 9), at(7, 9), at(8, 9)];
        assert_eq!(longest_streak(&ts, Tz::UTC), 3);
        assert_eq!(longest_streak(&[], Tz::UTC), 0);
    }
}
