use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};

use super::API_V1_PREFIX;
use crate::domain::Period;

fn base_join(base: &str, path: &str) -> String {
    let b = base.trim_end_matches('/');
    let p = path.trim_start_matches('/');
    format!("{}/{}", b, p)
}

fn enc(s: &str) -> String {
    utf8_percent_encode(s, NON_ALPHANUMERIC).to_string()
}

pub fn user_award(base: &str, user_id: &str) -> String {
    base_join(
        base,
        &format!("{}/users/{}/points/award", API_V1_PREFIX, enc(user_id)),
    )
}
pub fn user_deduct(base: &str, user_id: &str) -> String {
    base_join(
        base,
        &format!("{}/users/{}/points/deduct", API_V1_PREFIX, enc(user_id)),
    )
}
pub fn user_badges(base: &str, user_id: &str) -> String {
    base_join(
        base,
        &format!("{}/users/{}/badges", API_V1_PREFIX, enc(user_id)),
    )
}
pub fn user_ledger(base: &str, user_id: &str, page: u32, per_page: u32) -> String {
    base_join(
        base,
        &format!(
            "{}/users/{}/points?page={}&per_page={}",
            API_V1_PREFIX,
            enc(user_id),
            page,
            per_page
        ),
    )
}
pub fn user_challenge_complete(base: &str, user_id: &str, challenge_id: &str) -> String {
    base_join(
        base,
        &format!(
            "{}/users/{}/challenges/{}/complete",
            API_V1_PREFIX,
            enc(user_id),
            enc(challenge_id)
        ),
    )
}
pub fn task_complete(base: &str, task_id: &str) -> String {
    base_join(
        base,
        &format!("{}/tasks/{}/complete", API_V1_PREFIX, enc(task_id)),
    )
}
pub fn household_leaderboard(base: &str, household_id: &str, period: Period) -> String {
    base_join(
        base,
        &format!(
            "{}/households/{}/leaderboard?period={}",
            API_V1_PREFIX,
            enc(household_id),
            period
        ),
    )
}
pub fn household_analytics(base: &str, household_id: &str) -> String {
    base_join(
        base,
        &format!("{}/households/{}/analytics", API_V1_PREFIX, enc(household_id)),
    )
}
pub fn household_events(base: &str, household_id: &str) -> String {
    base_join(
        base,
        &format!("{}/households/{}/events", API_V1_PREFIX, enc(household_id)),
    )
}
pub fn broker_metrics(base: &str) -> String {
    base_join(base, &format!("{}/broker/metrics", API_V1_PREFIX))
}
