use crate::storage::schema::{
    badges, challenge_completions, household_members, households, points_ledger, tasks, users,
};
use chrono::NaiveDateTime;
use diesel::prelude::*;

#[derive(Insertable)]
#[diesel(table_name = households)]
pub struct NewHousehold<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub point_total: i64,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = users)]
pub struct NewUser<'a> {
    pub id: &'a str,
    pub display_name: &'a str,
    pub point_total: i64,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = household_members)]
pub struct NewMember<'a> {
    pub household_id: &'a str,
    pub user_id: &'a str,
    pub joined_at: NaiveDateTime,
}

/// A household member together with the time they joined.
#[derive(Debug, Clone)]
pub struct Member {
    pub user: User,
    pub joined_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = tasks)]
pub struct TaskRecord {
    pub id: String,
    pub household_id: String,
    pub title: String,
    pub assigned_user_id: Option<String>,
    pub points: i32,
    pub priority: String,
    pub recurrence: String,
    pub created_at: NaiveDateTime,
    pub due_date: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub completed_by: Option<String>,
    pub is_completed: bool,
}

#[derive(Insertable)]
#[diesel(table_name = tasks)]
pub struct NewTask<'a> {
    pub id: &'a str,
    pub household_id: &'a str,
    pub title: &'a str,
    pub assigned_user_id: Option<&'a str>,
    pub points: i32,
    pub priority: &'a str,
    pub recurrence: &'a str,
    pub created_at: NaiveDateTime,
    pub due_date: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = points_ledger)]
#[diesel(belongs_to(User, foreign_key = user_id))]
pub struct LedgerEntry {
    pub id: i32,
    pub user_id: String,
    pub delta: i32,
    pub balance_after: i64,
    pub reason: String,
    pub task_id: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = points_ledger)]
pub struct NewLedgerEntry<'a> {
    pub user_id: &'a str,
    pub delta: i32,
    pub balance_after: i64,
    pub reason: &'a str,
    pub task_id: Option<&'a str>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = badges)]
#[diesel(belongs_to(User, foreign_key = user_id))]
pub struct Badge {
    pub id: i32,
    pub user_id: String,
    pub type_key: String,
    pub name: String,
    pub description: String,
    pub icon_key: String,
    pub earned_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = badges)]
pub struct NewBadge<'a> {
    pub user_id: &'a str,
    pub type_key: &'a str,
    pub name: &'a str,
    pub description: &'a str,
    pub icon_key: &'a str,
    pub earned_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = challenge_completions)]
pub struct NewChallengeCompletion<'a> {
    pub user_id: &'a str,
    pub challenge_id: &'a str,
    pub completed_at: NaiveDateTime,
}

/// Cumulative per-user counters read after a mutation, inside the same transaction.
#[derive(Debug, Clone, Default)]
pub struct UserProgress {
    pub point_total: i64,
    pub tasks_completed: i64,
    pub completion_times: Vec<NaiveDateTime>,
    pub challenges_completed: i64,
}

/// A badge the evaluator wants to exist for a user.
#[derive(Debug, Clone)]
pub struct BadgeGrant {
    pub type_key: String,
    pub name: String,
    pub description: String,
    pub icon_key: String,
}

/// Result of a committed point mutation.
#[derive(Debug, Clone)]
pub struct PointsApplied {
    pub new_total: i64,
    pub new_badges: Vec<Badge>,
}

/// A task transition together with the points it awarded.
#[derive(Debug, Clone)]
pub struct CompletedTask {
    pub household_id: String,
    pub applied: PointsApplied,
}
