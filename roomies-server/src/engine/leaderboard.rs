//! Period-scoped household standings.
//!
//! Points are the awards (positive ledger deltas) recorded inside the period window;
//! deductions never lower a standing. A task award counts only in the household that
//! owns the task, while manual awards count in every household
//! the user belongs to. Ties break on current streak, then on who joined
//! the household first, then on user id.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use roomies_shared::api::LeaderboardEntryDto;
use roomies_shared::domain::Period;
use tracing::debug;

use super::{Clock, EngineError, streak};
use crate::storage::Store;

/// Inclusive start of `period` as of `now`, cut at midnight in `tz`.
pub fn window_start(period: Period, now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let today = streak::local_day(now, tz);
    let first_day = match period {
        Period::Week => today
            .checked_sub_days(Days::new(u64::from(today.weekday().num_days_from_monday())))
            .unwrap_or(today),
        Period::Month => today.with_day(1).unwrap_or(today),
        Period::AllTime => return DateTime::<Utc>::UNIX_EPOCH,
    };
    local_midnight(first_day, tz)
}

fn local_midnight(day: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = day.and_time(NaiveTime::MIN);
    match tz.from_local_datetime(&naive).earliest() {
        Some(t) => t.with_timezone(&Utc),
        // Midnight skipped by a DST jump; the day starts at the first valid instant.
        None => (1..=3)
            .filter_map(|h| {
                tz.from_local_datetime(&(naive + chrono::Duration::hours(h)))
                    .earliest()
            })
            .next()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| naive.and_utc()),
    }
}

/// One member's numbers before ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Standing {
    pub user_id: String,
    pub display_name: String,
    pub points: i64,
    pub tasks_completed: i64,
    pub current_streak: u32,
    pub joined_at: NaiveDateTime,
}

fn compare(a: &Standing, b: &Standing) -> Ordering {
    b.points
        .cmp(&a.points)
        .then_with(|| b.current_streak.cmp(&a.current_streak))
        .then_with(|| a.joined_at.cmp(&b.joined_at))
        .then_with(|| a.user_id.cmp(&b.user_id))
}

/// Sort and number standings; rank is the 1-based position.
pub fn order_standings(mut standings: Vec<Standing>) -> Vec<LeaderboardEntryDto> {
    standings.sort_by(compare);
    standings
        .into_iter()
        .zip(1u32..)
        .map(|(s, rank)| LeaderboardEntryDto {
            rank,
            user_id: s.user_id,
            display_name: s.display_name,
            points: s.points,
            tasks_completed: s.tasks_completed,
            current_streak: s.current_streak,
        })
        .collect()
}

#[derive(Clone)]
pub struct LeaderboardAggregator {
    store: Store,
    tz: Tz,
    clock: Arc<dyn Clock>,
}

impl LeaderboardAggregator {
    pub fn new(store: Store, tz: Tz, clock: Arc<dyn Clock>) -> Self {
        Self { store, tz, clock }
    }

    pub async fn rank(
        &self,
        household_id: &str,
        period: Period,
    ) -> Result<Vec<LeaderboardEntryDto>, EngineError> {
        self.rank_at(household_id, period, self.clock.now()).await
    }

    pub async fn rank_at(
        &self,
        household_id: &str,
        period: Period,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeaderboardEntryDto>, EngineError> {
        if !self.store.household_exists(household_id).await? {
            return Err(EngineError::HouseholdNotFound(household_id.to_string()));
        }
        let since = window_start(period, now, self.tz);
        let members = self.store.list_members(household_id).await?;
        let ids: Vec<String> = members.iter().map(|m| m.user.id.clone()).collect();
        let points = self.store.points_earned_since(household_id, &ids, since).await?;
        let tasks = self.store.tasks_completed_since(household_id, since).await?;
        let mut times = self.store.completion_times_for_users(&ids).await?;

        let standings: Vec<Standing> = members
            .into_iter()
            .map(|m| {
                let stamps: Vec<DateTime<Utc>> = times
                    .remove(&m.user.id)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|t| t.and_utc())
                    .collect();
                Standing {
                    points: points.get(&m.user.id).copied().unwrap_or(0),
                    tasks_completed: tasks.get(&m.user.id).copied().unwrap_or(0),
                    current_streak: streak::current_streak(&stamps, now, self.tz),
                    display_name: m.user.display_name,
                    user_id: m.user.id,
                    joined_at: m.joined_at,
                }
            })
            .collect();
        debug!(
            household_id = %household_id,
            period = %period,
            since = %since,
            members = standings.len(),
            "leaderboard: ranked"
        );
        Ok(order_standings(standings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, day)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn standing(id: &str, points: i64, streak: u32, joined_day: u32) -> Standing {
        Standing {
            user_id: id.to_string(),
            display_name: id.to_uppercase(),
            points,
            tasks_completed: 0,
            current_streak: streak,
            joined_at: joined(joined_day),
        }
    }

    fn ids(entries: &[LeaderboardEntryDto]) -> Vec<&str> {
        entries.iter().map(|e| e.user_id.as_str()).collect()
    }

    #[test]
    fn ranks_by_points_descending() {
        let out = order_standings(vec![
            standing("a", 30, 0, 1),
            standing("b", 10, 0, 1),
            standing("c", 20, 0, 1),
        ]);
        assert_eq!(ids(&out), vec!["a", "c", "b"]);
        assert_eq!(out.iter().map(|e| e.points).collect::<Vec<_>>(), vec![30, 20, 10]);
        assert_eq!(out.iter().map(|e| e.rank).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn ties_break_on_streak_then_join_time_then_id() {
        let out = order_standings(vec![
            standing("d", 10, 1, 1),
            standing("c", 10, 4, 5),
            standing("b", 10, 1, 1),
            standing("a", 10, 1, 3),
        ]);
        assert_eq!(ids(&out), vec!["c", "b", "d", "a"]);
    }

    #[test]
    fn empty_household_is_empty_board() {
        assert!(order_standings(Vec::new()).is_empty());
    }

    #[test]
    fn week_starts_monday_midnight() {
        // Thursday
        let now = Utc.with_ymd_and_hms(2026, 4, 16, 15, 0, 0).unwrap();
        assert_eq!(
            window_start(Period::Week, now, Tz::UTC),
            Utc.with_ymd_and_hms(2026, 4, 13, 0, 0, 0).unwrap()
        );
        // Monday itself
        let monday = Utc.with_ymd_and_hms(2026, 4, 13, 0, 30, 0).unwrap();
        assert_eq!(
            window_start(Period::Week, monday, Tz::UTC),
            Utc.with_ymd_and_hms(2026, 4, 13, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn month_starts_on_the_first_in_reference_zone() {
        // Already May 1st in Warsaw (UTC+2).
        let now = Utc.with_ymd_and_hms(2026, 4, 30, 23, 0, 0).unwrap();
        assert_eq!(
            window_start(Period::Month, now, Tz::Europe__Warsaw),
            Utc.with_ymd_and_hms(2026, 4, 30, 22, 0, 0).unwrap()
        );
        assert_eq!(
            window_start(Period::Month, now, Tz::UTC),
            Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn all_time_is_unbounded() {
        let now = Utc.with_ymd_and_hms(2026, 4, 16, 15, 0, 0).unwrap();
        assert_eq!(
            window_start(Period::AllTime, now, Tz::UTC),
            DateTime::<Utc>::UNIX_EPOCH
        );
    }
}
