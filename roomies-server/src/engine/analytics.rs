//! Descriptive household analytics.
//!
//! Everything here is computed from the task table on demand; nothing is stored.
//! [`compute_snapshot`] is pure so the arithmetic can be checked without a database.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use roomies_shared::api::{
    AnalyticsSnapshotDto, CountDto, DailyPointDto, DistributionDto, MemberPerformanceDto, Trend,
};
use roomies_shared::domain::{Priority, Recurrence};
use tracing::debug;

use super::{Clock, EngineError, streak};
use crate::storage::Store;
use crate::storage::models::{Member, TaskRecord};

/// Trailing window for rates and the daily series.
pub const WINDOW_DAYS: i64 = 30;
const OVERDUE_ALERT: u32 = 5;
const LOW_COMPLETION_RATE: f64 = 0.5;
const TREND_BAND: f64 = 0.10;

const CATEGORIES: &[(&str, &[&str])] = &[
    ("kitchen", &["dish", "kitchen", "cook", "fridge", "oven", "stove", "meal"]),
    ("laundry", &["laundry", "fold", "iron", "sheets", "towel", "clothes"]),
    ("pets", &["pet", "dog", "cat", "litter", "aquarium", "fish"]),
    ("outdoor", &["garden", "lawn", "mow", "yard", "weed", "leaves", "snow", "plant"]),
    ("shopping", &["shop", "grocer", "buy", "errand", "supermarket"]),
    ("maintenance", &["fix", "repair", "replace", "filter", "bulb", "paint", "leak"]),
    ("cleaning", &["clean", "vacuum", "mop", "dust", "sweep", "bathroom", "toilet", "trash", "garbage", "tidy", "wipe"]),
];
const OTHER_CATEGORY: &str = "other";

/// Best-effort category for a task title. Not authoritative.
///
/// Keywords are stems: a title word matches when it starts with one, so "dishwasher"
/// is kitchen work but "vacation" is not a cat.
pub fn categorize(title: &str) -> &'static str {
    let title = title.to_lowercase();
    let words: Vec<&str> = title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    CATEGORIES
        .iter()
        .find(|(_, stems)| {
            stems
                .iter()
                .any(|stem| words.iter().any(|w| w.starts_with(stem)))
        })
        .map(|(name, _)| *name)
        .unwrap_or(OTHER_CATEGORY)
}

fn ratio(num: u32, den: u32) -> f64 {
    if den == 0 {
        0.0
    } else {
        f64::from(num) / f64::from(den)
    }
}

pub fn classify_trend(recent: u32, prior: u32) -> Trend {
    if prior == 0 {
        return if recent > 0 {
            Trend::Improving
        } else {
            Trend::Stable
        };
    }
    let change = (f64::from(recent) - f64::from(prior)) / f64::from(prior);
    if change > TREND_BAND {
        Trend::Improving
    } else if change < -TREND_BAND {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

struct Completion<'a> {
    task: &'a TaskRecord,
    at: DateTime<Utc>,
}

fn completions(tasks: &[TaskRecord]) -> Vec<Completion<'_>> {
    tasks
        .iter()
        .filter(|t| t.is_completed)
        .filter_map(|t| {
            t.completed_at.map(|at| Completion {
                task: t,
                at: at.and_utc(),
            })
        })
        .collect()
}

fn daily_series(done: &[Completion<'_>], as_of: DateTime<Utc>, tz: Tz) -> Vec<DailyPointDto> {
    let today = streak::local_day(as_of, tz);
    let mut by_day: HashMap<NaiveDate, (u32, i64)> = HashMap::new();
    for c in done {
        let slot = by_day.entry(streak::local_day(c.at, tz)).or_default();
        slot.0 += 1;
        slot.1 += i64::from(c.task.points);
    }
    (0..WINDOW_DAYS)
        .rev()
        .filter_map(|back| today.checked_sub_signed(Duration::days(back)))
        .map(|date| {
            let (count, points) = by_day.get(&date).copied().unwrap_or_default();
            DailyPointDto {
                date,
                tasks_completed: count,
                points_earned: points,
                avg_task_value: if count == 0 {
                    0.0
                } else {
                    points as f64 / f64::from(count)
                },
            }
        })
        .collect()
}

fn count_by<'a>(keys: impl Iterator<Item = &'a str>, values: impl Iterator<Item = &'a str> + Clone) -> Vec<CountDto> {
    keys.map(|key| CountDto {
        key: key.to_string(),
        count: values.clone().filter(|v| *v == key).count() as u32,
    })
    .collect()
}

fn distribution(tasks: &[TaskRecord]) -> DistributionDto {
    DistributionDto {
        by_priority: count_by(
            Priority::ALL.iter().map(|p| p.as_str()),
            tasks.iter().map(|t| t.priority.as_str()),
        ),
        by_category: count_by(
            CATEGORIES
                .iter()
                .map(|(name, _)| *name)
                .chain(std::iter::once(OTHER_CATEGORY)),
            tasks.iter().map(|t| categorize(&t.title)),
        ),
        by_recurrence: count_by(
            Recurrence::ALL.iter().map(|r| r.as_str()),
            tasks.iter().map(|t| t.recurrence.as_str()),
        ),
    }
}

fn member_performance(
    tasks: &[TaskRecord],
    members: &[Member],
    histories: &HashMap<String, Vec<DateTime<Utc>>>,
    as_of: DateTime<Utc>,
    tz: Tz,
) -> Vec<MemberPerformanceDto> {
    members
        .iter()
        .map(|m| {
            let uid = m.user.id.as_str();
            let assigned: Vec<&TaskRecord> = tasks
                .iter()
                .filter(|t| t.assigned_user_id.as_deref() == Some(uid))
                .collect();
            let assigned_done = assigned.iter().filter(|t| t.is_completed).count() as u32;
            let mine: Vec<&TaskRecord> = tasks
                .iter()
                .filter(|t| t.is_completed && t.completed_by.as_deref() == Some(uid))
                .collect();
            let history = histories.get(uid).map(Vec::as_slice).unwrap_or_default();
            MemberPerformanceDto {
                user_id: m.user.id.clone(),
                display_name: m.user.display_name.clone(),
                assigned: assigned.len() as u32,
                completed: mine.len() as u32,
                points: mine.iter().map(|t| i64::from(t.points)).sum(),
                completion_rate: ratio(assigned_done, assigned.len() as u32),
                current_streak: streak::current_streak(history, as_of, tz),
                longest_streak: streak::longest_streak(history, tz),
            }
        })
        .collect()
}

fn recommendations(
    total_household_tasks: usize,
    snapshot: &AnalyticsSnapshotDto,
) -> Vec<String> {
    let mut out = Vec::new();
    if total_household_tasks == 0 {
        out.push("No tasks yet. Add a few chores to get the household started.".to_string());
        return out;
    }
    if snapshot.overdue_count > OVERDUE_ALERT {
        out.push(format!(
            "{} tasks are overdue. Consider rescheduling or reassigning some of them.",
            snapshot.overdue_count
        ));
    }
    if snapshot.total_tasks > 0 && snapshot.completion_rate < LOW_COMPLETION_RATE {
        out.push(format!(
            "Only {:.0}% of recent tasks were completed. Smaller, more frequent chores may help.",
            snapshot.completion_rate * 100.0
        ));
    }
    let loads: Vec<&MemberPerformanceDto> = snapshot.members.iter().collect();
    if loads.len() >= 2 {
        let busiest = loads.iter().max_by_key(|m| m.assigned);
        let lightest = loads.iter().min_by_key(|m| m.assigned);
        if let (Some(busiest), Some(lightest)) = (busiest, lightest)
            && busiest.assigned >= 3
            && busiest.assigned >= lightest.assigned.saturating_mul(2).max(1) + 1
        {
            out.push(format!(
                "Workload is uneven: {} has {} tasks assigned while {} has {}.",
                busiest.display_name, busiest.assigned, lightest.display_name, lightest.assigned
            ));
        }
    }
    if snapshot.trend == Trend::Declining {
        out.push("Completions dropped compared to the previous week.".to_string());
    }
    out
}

/// Build a snapshot from already loaded rows. `histories` holds every completion
/// timestamp per member, across households, for streaks.
pub fn compute_snapshot(
    household_id: &str,
    tasks: &[TaskRecord],
    members: &[Member],
    histories: &HashMap<String, Vec<DateTime<Utc>>>,
    as_of: DateTime<Utc>,
    tz: Tz,
) -> AnalyticsSnapshotDto {
    let window_start = as_of - Duration::days(WINDOW_DAYS);
    let recent: Vec<&TaskRecord> = tasks
        .iter()
        .filter(|t| t.created_at.and_utc() >= window_start)
        .collect();
    let total = recent.len() as u32;
    let completed = recent.iter().filter(|t| t.is_completed).count() as u32;
    let with_due: Vec<&&TaskRecord> = recent
        .iter()
        .filter(|t| t.is_completed && t.due_date.is_some())
        .collect();
    let on_time = with_due
        .iter()
        .filter(|t| match (t.completed_at, t.due_date) {
            (Some(done), Some(due)) => done <= due,
            _ => false,
        })
        .count() as u32;
    let overdue = recent
        .iter()
        .filter(|t| !t.is_completed && t.due_date.is_some_and(|due| due.and_utc() < as_of))
        .count() as u32;

    let done = completions(tasks);
    let within = |from: i64, to: i64| {
        done.iter()
            .filter(|c| c.at > as_of - Duration::days(from) && c.at <= as_of - Duration::days(to))
            .count() as u32
    };
    let last_week = within(7, 0);
    let prior_week = within(14, 7);
    let last_fortnight = within(14, 0);

    let mut snapshot = AnalyticsSnapshotDto {
        household_id: household_id.to_string(),
        generated_at: as_of,
        total_tasks: total,
        completed_tasks: completed,
        overdue_count: overdue,
        completion_rate: ratio(completed, total),
        on_time_rate: ratio(on_time, with_due.len() as u32),
        overdue_rate: ratio(overdue, total),
        daily: daily_series(&done, as_of, tz),
        members: member_performance(tasks, members, histories, as_of, tz),
        distribution: distribution(tasks),
        trend: classify_trend(last_week, prior_week),
        projected_weekly_completions: f64::from(last_fortnight) / 14.0 * 7.0,
        recommendations: Vec::new(),
    };
    snapshot.recommendations = recommendations(tasks.len(), &snapshot);
    snapshot
}

#[derive(Clone)]
pub struct AnalyticsEngine {
    store: Store,
    tz: Tz,
    clock: Arc<dyn Clock>,
}

impl AnalyticsEngine {
    pub fn new(store: Store, tz: Tz, clock: Arc<dyn Clock>) -> Self {
        Self { store, tz, clock }
    }

    pub async fn snapshot(&self, household_id: &str) -> Result<AnalyticsSnapshotDto, EngineError> {
        self.snapshot_at(household_id, self.clock.now()).await
    }

    pub async fn snapshot_at(
        &self,
        household_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<AnalyticsSnapshotDto, EngineError> {
        if !self.store.household_exists(household_id).await? {
            return Err(EngineError::HouseholdNotFound(household_id.to_string()));
        }
        let tasks = self.store.list_household_tasks(household_id).await?;
        let members = self.store.list_members(household_id).await?;
        let ids: Vec<String> = members.iter().map(|m| m.user.id.clone()).collect();
        let histories: HashMap<String, Vec<DateTime<Utc>>> = self
            .store
            .completion_times_for_users(&ids)
            .await?
            .into_iter()
            .map(|(user, times)| (user, times.into_iter().map(|t| t.and_utc()).collect()))
            .collect();
        let snapshot = compute_snapshot(household_id, &tasks, &members, &histories, as_of, self.tz);
        debug!(
            household_id = %household_id,
            tasks = tasks.len(),
            trend = ?snapshot.trend,
            "analytics: snapshot computed"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::User;
    use chrono::TimeZone;

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 30, 18, 0, 0).unwrap()
    }

    fn days_ago(n: i64) -> DateTime<Utc> {
        as_of() - Duration::days(n)
    }

    fn task(id: &str, title: &str, points: i32) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            household_id: "h1".to_string(),
            title: title.to_string(),
            assigned_user_id: None,
            points,
            priority: "medium".to_string(),
            recurrence: "none".to_string(),
            created_at: days_ago(20).naive_utc(),
            due_date: None,
            completed_at: None,
            completed_by: None,
            is_completed: false,
        }
    }

    fn done(mut t: TaskRecord, by: &str, at: DateTime<Utc>) -> TaskRecord {
        t.is_completed = true;
        t.completed_at = Some(at.naive_utc());
        t.completed_by = Some(by.to_string());
        t
    }

    fn member(id: &str) -> Member {
        Member {
            user: User {
                id: id.to_string(),
                display_name: id.to_uppercase(),
                point_total: 0,
                created_at: days_ago(60).naive_utc(),
            },
            joined_at: days_ago(60).naive_utc(),
        }
    }

    #[test]
    fn empty_household_has_zero_rates_and_flat_series() {
        let s = compute_snapshot("h1", &[], &[], &HashMap::new(), as_of(), Tz::UTC);
        assert_eq!(s.completion_rate, 0.0);
        assert_eq!(s.overdue_rate, 0.0);
        assert_eq!(s.on_time_rate, 0.0);
        assert_eq!(s.daily.len(), 30);
        assert!(s.daily.iter().all(|d| d.tasks_completed == 0 && d.avg_task_value == 0.0));
        assert_eq!(s.trend, Trend::Stable);
        assert_eq!(s.projected_weekly_completions, 0.0);
        assert_eq!(s.recommendations.len(), 1);
    }

    #[test]
    fn daily_series_runs_oldest_to_newest_ending_today() {
        let tasks = vec![
            done(task("t1", "Dishes", 10), "u1", days_ago(0)),
            done(task("t2", "Laundry", 20), "u1", days_ago(0)),
            done(task("t3", "Vacuum", 5), "u1", days_ago(29)),
        ];
        let s = compute_snapshot("h1", &tasks, &[], &HashMap::new(), as_of(), Tz::UTC);
        assert_eq!(s.daily.len(), 30);
        assert_eq!(s.daily[29].date, as_of().date_naive());
        assert_eq!(s.daily[29].tasks_completed, 2);
        assert_eq!(s.daily[29].points_earned, 30);
        assert_eq!(s.daily[29].avg_task_value, 15.0);
        assert_eq!(s.daily[0].tasks_completed, 1);
        assert!(s.daily.windows(2).all(|w| w[0].date < w[1].date));
    }

    #[test]
    fn rates_use_recent_tasks_only() {
        let mut old = task("old", "Mow lawn", 5);
        old.created_at = days_ago(45).naive_utc();
        let mut late = task("late", "Fix tap", 5);
        late.due_date = Some(days_ago(2).naive_utc());
        let mut on_time = task("ok", "Buy milk", 5);
        on_time.due_date = Some(days_ago(1).naive_utc());
        let on_time = done(on_time, "u1", days_ago(3));
        let tasks = vec![old, late, on_time, task("open", "Feed cat", 5)];

        let s = compute_snapshot("h1", &tasks, &[], &HashMap::new(), as_of(), Tz::UTC);
        assert_eq!(s.total_tasks, 3);
        assert_eq!(s.completed_tasks, 1);
        assert_eq!(s.overdue_count, 1);
        assert!((s.completion_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(s.on_time_rate, 1.0);
        assert!((s.overdue_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn trend_bands() {
        assert_eq!(classify_trend(0, 0), Trend::Stable);
        assert_eq!(classify_trend(3, 0), Trend::Improving);
        assert_eq!(classify_trend(10, 10), Trend::Stable);
        assert_eq!(classify_trend(11, 10), Trend::Stable);
        assert_eq!(classify_trend(12, 10), Trend::Improving);
        assert_eq!(classify_trend(8, 10), Trend::Declining);
    }

    #[test]
    fn declining_week_is_reported() {
        let mut tasks = Vec::new();
        for i in 0..6 {
            tasks.push(done(task(&format!("p{i}"), "Sweep", 5), "u1", days_ago(10)));
        }
        tasks.push(done(task("r0", "Sweep", 5), "u1", days_ago(2)));
        let s = compute_snapshot("h1", &tasks, &[], &HashMap::new(), as_of(), Tz::UTC);
        assert_eq!(s.trend, Trend::Declining);
        assert_eq!(s.projected_weekly_completions, 3.5);
        assert!(s.recommendations.iter().any(|r| r.contains("dropped")));
    }

    #[test]
    fn many_overdue_tasks_trigger_a_recommendation() {
        let tasks: Vec<TaskRecord> = (0..6)
            .map(|i| {
                let mut t = task(&format!("t{i}"), "Clean windows", 5);
                t.due_date = Some(days_ago(1).naive_utc());
                t
            })
            .collect();
        let s = compute_snapshot("h1", &tasks, &[], &HashMap::new(), as_of(), Tz::UTC);
        assert_eq!(s.overdue_count, 6);
        assert!(s.recommendations.iter().any(|r| r.starts_with("6 tasks are overdue")));
    }

    #[test]
    fn member_performance_and_uneven_load() {
        let mut tasks = Vec::new();
        for i in 0..4 {
            let mut t = task(&format!("a{i}"), "Dishes", 10);
            t.assigned_user_id = Some("u1".into());
            tasks.push(if i < 2 { done(t, "u1", days_ago(i)) } else { t });
        }
        let mut t = task("b0", "Walk dog", 5);
        t.assigned_user_id = Some("u2".into());
        tasks.push(t);

        let histories = HashMap::from([(
            "u1".to_string(),
            vec![days_ago(0), days_ago(1), days_ago(5)],
        )]);
        let s = compute_snapshot(
            "h1",
            &tasks,
            &[member("u1"), member("u2")],
            &histories,
            as_of(),
            Tz::UTC,
        );
        let u1 = &s.members[0];
        assert_eq!((u1.assigned, u1.completed, u1.points), (4, 2, 20));
        assert_eq!(u1.completion_rate, 0.5);
        assert_eq!(u1.current_streak, 2);
        assert_eq!(u1.longest_streak, 2);
        let u2 = &s.members[1];
        assert_eq!((u2.assigned, u2.completed, u2.current_streak), (1, 0, 0));
        assert!(s.recommendations.iter().any(|r| r.starts_with("Workload is uneven")));
    }

    #[test]
    fn distribution_covers_every_bucket() {
        let mut urgent = task("t1", "Wash the dishes", 5);
        urgent.priority = "urgent".into();
        urgent.recurrence = "daily".into();
        let tasks = vec![urgent, task("t2", "Call grandma", 5)];
        let s = compute_snapshot("h1", &tasks, &[], &HashMap::new(), as_of(), Tz::UTC);
        let get = |v: &[CountDto], k: &str| v.iter().find(|c| c.key == k).map(|c| c.count);
        assert_eq!(s.distribution.by_priority.len(), 4);
        assert_eq!(get(&s.distribution.by_priority, "urgent"), Some(1));
        assert_eq!(get(&s.distribution.by_priority, "medium"), Some(1));
        assert_eq!(get(&s.distribution.by_recurrence, "daily"), Some(1));
        assert_eq!(get(&s.distribution.by_category, "kitchen"), Some(1));
        assert_eq!(get(&s.distribution.by_category, "other"), Some(1));
        assert_eq!(s.distribution.by_category.len(), 8);
    }

    #[test]
    fn categories_are_keyword_based() {
        assert_eq!(categorize("Empty the DISHWASHER"), "kitchen");
        assert_eq!(categorize("Fold laundry"), "laundry");
        assert_eq!(categorize("Take out trash"), "cleaning");
        assert_eq!(categorize("Mow the lawn"), "outdoor");
        assert_eq!(categorize("Grocery run"), "shopping");
        assert_eq!(categorize("Change cat litter"), "pets");
        assert_eq!(categorize("Replace smoke alarm battery"), "maintenance");
        assert_eq!(categorize("Plan vacation"), "other");
    }

    #[test]
    fn categories_match_word_stems_not_fragments() {
        assert_eq!(categorize("Vacuum carpet"), "cleaning");
        assert_eq!(categorize("Scatter seeds"), "other");
        assert_eq!(categorize("Dishes, then wipe counters"), "kitchen");
        assert_eq!(categorize("Feed the pets"), "pets");
        assert_eq!(categorize("Groceries"), "shopping");
    }
}
