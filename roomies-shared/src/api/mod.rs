use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Period;

pub mod endpoints;

pub const API_V1_PREFIX: &str = "/api/v1";

/// Events pushed to live household subscribers.
///
/// Serialized as `{"event": "<name>", "payload": {...}}`; transports own the
/// framing around it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum EventPayload {
    PointsUpdated {
        user_id: String,
        new_total: i64,
    },
    BadgeEarned {
        user_id: String,
        badge_type: String,
        name: String,
    },
    TaskCompleted {
        task_id: String,
        user_id: String,
        points: i32,
    },
    LeaderboardChanged {
        household_id: String,
    },
}

impl EventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::PointsUpdated { .. } => "points_updated",
            EventPayload::BadgeEarned { .. } => "badge_earned",
            EventPayload::TaskCompleted { .. } => "task_completed",
            EventPayload::LeaderboardChanged { .. } => "leaderboard_changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEvent {
    #[serde(flatten)]
    pub payload: EventPayload,
    pub server_time: DateTime<Utc>,
}

impl ServerEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            server_time: Utc::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.payload.name()
    }
}

// Points
#[derive(Debug, Serialize, Deserialize)]
pub struct PointsReq {
    pub delta: i32,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsResp {
    pub user_id: String,
    pub new_total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntryDto {
    pub delta: i32,
    pub balance_after: i64,
    pub reason: String,
    pub task_id: Option<String>,
    pub created_at: String, // RFC3339 UTC
}

// Task completion
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteTaskReq {
    pub user_id: String,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteTaskResp {
    pub task_id: String,
    /// False when the task had already been completed; nothing was awarded.
    pub awarded: bool,
    pub new_total: Option<i64>,
    pub badges: Vec<BadgeDto>,
}

// Badges
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgeDto {
    pub type_key: String,
    pub name: String,
    pub description: String,
    pub icon_key: String,
    pub earned_at: String, // RFC3339 UTC
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResp {
    pub user_id: String,
    pub challenge_id: String,
    pub recorded: bool,
    pub badges: Vec<BadgeDto>,
}

// Leaderboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntryDto {
    pub rank: u32,
    pub user_id: String,
    pub display_name: String,
    pub points: i64,
    pub tasks_completed: i64,
    pub current_streak: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardDto {
    pub household_id: String,
    pub period: Period,
    pub entries: Vec<LeaderboardEntryDto>,
}

// Analytics
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyPointDto {
    pub date: NaiveDate,
    pub tasks_completed: u32,
    pub points_earned: i64,
    pub avg_task_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberPerformanceDto {
    pub user_id: String,
    pub display_name: String,
    pub assigned: u32,
    pub completed: u32,
    pub points: i64,
    pub completion_rate: f64,
    pub current_streak: u32,
    pub longest_streak: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountDto {
    pub key: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionDto {
    pub by_priority: Vec<CountDto>,
    pub by_category: Vec<CountDto>,
    pub by_recurrence: Vec<CountDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSnapshotDto {
    pub household_id: String,
    pub generated_at: DateTime<Utc>,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub overdue_count: u32,
    pub completion_rate: f64,
    pub on_time_rate: f64,
    pub overdue_rate: f64,
    pub daily: Vec<DailyPointDto>,
    pub members: Vec<MemberPerformanceDto>,
    pub distribution: DistributionDto,
    pub trend: Trend,
    pub projected_weekly_completions: f64,
    pub recommendations: Vec<String>,
}

// Broker metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseholdConnectionsDto {
    pub household_id: String,
    pub live: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerMetricsDto {
    pub live_connections: usize,
    pub households: Vec<HouseholdConnectionsDto>,
    pub total_connected: u64,
    pub total_dropped: u64,
    pub total_skipped: u64,
    pub total_delivered: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_envelope_uses_catalog_names() {
        let ev = ServerEvent {
            payload: EventPayload::PointsUpdated {
                user_id: "u1".into(),
                new_total: 105,
            },
            server_time: DateTime::from_timestamp(0, 0).unwrap(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], json!("points_updated"));
        assert_eq!(v["payload"], json!({"userId": "u1", "newTotal": 105}));
        assert!(v.get("serverTime").is_some());
        assert_eq!(ev.name(), "points_updated");
    }

    #[test]
    fn badge_payload_fields_are_camel_case() {
        let p = EventPayload::BadgeEarned {
            user_id: "u1".into(),
            badge_type: "streak_7".into(),
            name: "Week Warrior".into(),
        };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["event"], json!("badge_earned"));
        assert_eq!(v["payload"]["badgeType"], json!("streak_7"));
    }
}
