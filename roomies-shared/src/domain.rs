use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Leaderboard window.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Week,
    Month,
    AllTime,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Week => "week",
            Period::Month => "month",
            Period::AllTime => "all_time",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = ParseEnumError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "week" => Ok(Period::Week),
            "month" => Ok(Period::Month),
            "all_time" | "allTime" | "all" => Ok(Period::AllTime),
            other => Err(ParseEnumError::new("period", other)),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Urgent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(ParseEnumError::new("priority", other)),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    None,
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    pub const ALL: [Recurrence; 4] = [
        Recurrence::None,
        Recurrence::Daily,
        Recurrence::Weekly,
        Recurrence::Monthly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Recurrence::None => "none",
            Recurrence::Daily => "daily",
            Recurrence::Weekly => "weekly",
            Recurrence::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Recurrence {
    type Err = ParseEnumError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Recurrence::None),
            "daily" => Ok(Recurrence::Daily),
            "weekly" => Ok(Recurrence::Weekly),
            "monthly" => Ok(Recurrence::Monthly),
            other => Err(ParseEnumError::new("recurrence", other)),
        }
    }
}

/// Seed/config shape of a household.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Household {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
}

/// Seed/config shape of a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub display_name: String,
}

/// Seed/config shape of a task. Completion state is never seeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub household_id: String,
    pub title: String,
    pub points: i32,
    #[serde(default)]
    pub assigned_user_id: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default = "default_recurrence")]
    pub recurrence: Recurrence,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
}

fn default_priority() -> Priority {
    Priority::Medium
}

fn default_recurrence() -> Recurrence {
    Recurrence::None
}

/// Emitted by the task-management collaborator when a user finishes a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompleted {
    pub user_id: String,
    pub task_id: String,
    pub points: i32,
    pub due_date: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_parses_aliases() {
        assert_eq!("week".parse::<Period>().unwrap(), Period::Week);
        assert_eq!("allTime".parse::<Period>().unwrap(), Period::AllTime);
        assert_eq!("all_time".parse::<Period>().unwrap(), Period::AllTime);
        assert!("fortnight".parse::<Period>().is_err());
    }

    #[test]
    fn task_defaults_apply() {
        let task: Task = serde_json::from_str(
            r#"{"id":"t1","household_id":"h1","title":"Dishes","points":5}"#,
        )
        .unwrap();
        assert_eq!(task.priority, Priority::Medium);
        assert_eq!(task.recurrence, Recurrence::None);
        assert!(task.assigned_user_id.is_none());
    }
}
