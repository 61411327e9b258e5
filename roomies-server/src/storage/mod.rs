pub mod models;
pub mod schema;

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use models::{
    Badge, BadgeGrant, CompletedTask, LedgerEntry, Member, NewBadge, NewChallengeCompletion,
    NewHousehold, NewLedgerEntry, NewMember, NewTask, NewUser, PointsApplied, TaskRecord, User,
    UserProgress,
};
use roomies_shared::domain;
use tracing::{debug, trace};

diesel::define_sql_function! {
    /// SQLite's two-argument scalar `MAX`, used to floor the point total at zero.
    #[sql_name = "MAX"]
    fn floor_at(
        value: diesel::sql_types::BigInt,
        floor: diesel::sql_types::BigInt,
    ) -> diesel::sql_types::BigInt;
}

/// Structured error type for all storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A Diesel ORM error (query failure, constraint violation, etc.)
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Failed to acquire or build a connection from the pool.
    #[error("pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    /// A `spawn_blocking` task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A database migration failed to apply.
    #[error("migration error: {0}")]
    Migration(String),

    /// A referenced row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The caller supplied invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StorageError {
    fn not_found(entity: &'static str, id: &str) -> Self {
        StorageError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True when SQLite gave up waiting for the write lock.
    pub fn is_busy(&self) -> bool {
        match self {
            StorageError::Database(diesel::result::Error::DatabaseError(_, info)) => {
                let msg = info.message();
                msg.contains("database is locked") || msg.contains("database is busy")
            }
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct Store {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl Store {
    pub async fn connect_sqlite(path: &str) -> Result<Self, StorageError> {
        let url = path.to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(url);
        let pool = Pool::builder().max_size(8).build(manager)?;

        // Run pending Diesel migrations on startup (auto-init empty DBs)
        {
            let pool_clone = pool.clone();
            tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
                const MIGRATIONS: EmbeddedMigrations = embed_migrations!();
                let mut conn = pool_clone.get()?;
                configure_sqlite_conn(&mut conn)?;
                conn.run_pending_migrations(MIGRATIONS)
                    .map_err(|e| StorageError::Migration(e.to_string()))?;
                Ok(())
            })
            .await??;
        }

        Ok(Store { pool })
    }

    pub async fn seed_from_config(
        &self,
        cfg_households: &[domain::Household],
        cfg_users: &[domain::User],
        cfg_tasks: &[domain::Task],
    ) -> Result<(), StorageError> {
        let pool = self.pool.clone();
        let households_owned = cfg_households.to_owned();
        let users_owned = cfg_users.to_owned();
        let tasks_owned = cfg_tasks.to_owned();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let now = Utc::now().naive_utc();
            conn.immediate_transaction(|conn| -> Result<(), StorageError> {
                for u in &users_owned {
                    upsert_user_conn(conn, &u.id, &u.display_name, now)?;
                }
                for h in &households_owned {
                    upsert_household_conn(conn, &h.id, &h.name, now)?;
                    for member in &h.members {
                        add_member_conn(conn, &h.id, member, now)?;
                    }
                }
                for t in &tasks_owned {
                    upsert_task_conn(conn, t, now)?;
                }
                Ok(())
            })
        })
        .await?
    }

    pub async fn upsert_user(&self, user_id: &str, display_name: &str) -> Result<(), StorageError> {
        let pool = self.pool.clone();
        let uid = user_id.to_string();
        let name = display_name.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            upsert_user_conn(&mut conn, &uid, &name, Utc::now().naive_utc())
        })
        .await?
    }

    pub async fn upsert_household(
        &self,
        household_id: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        let pool = self.pool.clone();
        let hid = household_id.to_string();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            upsert_household_conn(&mut conn, &hid, &name, Utc::now().naive_utc())
        })
        .await?
    }

    pub async fn add_member(
        &self,
        household_id: &str,
        user_id: &str,
        joined_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let pool = self.pool.clone();
        let hid = household_id.to_string();
        let uid = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            add_member_conn(&mut conn, &hid, &uid, joined_at.naive_utc())
        })
        .await?
    }

    pub async fn upsert_task(
        &self,
        task: &domain::Task,
        created_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let pool = self.pool.clone();
        let task = task.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            upsert_task_conn(&mut conn, &task, created_at.naive_utc())
        })
        .await?
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>, StorageError> {
        use schema::users::dsl::*;
        let pool = self.pool.clone();
        let uid = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<User>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(users
                .filter(id.eq(&uid))
                .first::<User>(&mut conn)
                .optional()?)
        })
        .await?
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StorageError> {
        use schema::tasks::dsl::*;
        let pool = self.pool.clone();
        let tid = task_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<TaskRecord>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(tasks
                .filter(id.eq(&tid))
                .first::<TaskRecord>(&mut conn)
                .optional()?)
        })
        .await?
    }

    pub async fn household_exists(&self, household: &str) -> Result<bool, StorageError> {
        use schema::households::dsl::*;
        let pool = self.pool.clone();
        let hid = household.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let count: i64 = households
                .filter(id.eq(&hid))
                .count()
                .get_result(&mut conn)?;
            Ok(count > 0)
        })
        .await?
    }

    /// Household roster ordered by join time, then user id.
    pub async fn list_members(&self, household: &str) -> Result<Vec<Member>, StorageError> {
        use schema::{household_members as hm, users};
        let pool = self.pool.clone();
        let hid = household.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<Member>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let rows = hm::table
                .inner_join(users::table.on(users::id.eq(hm::user_id)))
                .filter(hm::household_id.eq(&hid))
                .order((hm::joined_at.asc(), users::id.asc()))
                .select((
                    (
                        users::id,
                        users::display_name,
                        users::point_total,
                        users::created_at,
                    ),
                    hm::joined_at,
                ))
                .load::<(User, NaiveDateTime)>(&mut conn)?;
            Ok(rows
                .into_iter()
                .map(|(user, joined_at)| Member { user, joined_at })
                .collect())
        })
        .await?
    }

    pub async fn households_for_user(&self, user: &str) -> Result<Vec<String>, StorageError> {
        use schema::household_members::dsl as hm;
        let pool = self.pool.clone();
        let uid = user.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(hm::household_members
                .filter(hm::user_id.eq(&uid))
                .select(hm::household_id)
                .order(hm::household_id.asc())
                .load::<String>(&mut conn)?)
        })
        .await?
    }

    /// Apply a signed point delta and evaluate badges in one immediate transaction.
    ///
    /// The total is updated in place (`MAX(point_total + delta, 0)`) so concurrent
    /// callers never overwrite each other. `evaluate` sees post-mutation counters;
    /// the badges it asks for are inserted if absent. Any failure rolls everything back.
    pub async fn apply_point_delta<F>(
        &self,
        user_id: &str,
        delta: i32,
        reason: &str,
        at: DateTime<Utc>,
        evaluate: F,
    ) -> Result<PointsApplied, StorageError>
    where
        F: FnOnce(&UserProgress) -> Vec<BadgeGrant> + Send + 'static,
    {
        let pool = self.pool.clone();
        let uid = user_id.to_string();
        let reason = reason.to_string();
        trace!(user_id = %uid, delta, "apply_point_delta starting");
        tokio::task::spawn_blocking(move || -> Result<PointsApplied, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let at = at.naive_utc();
            conn.immediate_transaction(|conn| -> Result<PointsApplied, StorageError> {
                let new_total = apply_delta_conn(conn, &uid, delta, &reason, None, at)?;
                let new_badges = grant_badges_conn(conn, &uid, at, evaluate)?;
                Ok(PointsApplied {
                    new_total,
                    new_badges,
                })
            })
        })
        .await?
    }

    /// Flip a task to completed and award its points, atomically.
    ///
    /// Returns `Ok(None)` when the task was already completed; nothing is awarded then.
    pub async fn complete_task_and_award<F>(
        &self,
        task_id: &str,
        user_id: &str,
        points: i32,
        completed_at: DateTime<Utc>,
        at: DateTime<Utc>,
        evaluate: F,
    ) -> Result<Option<CompletedTask>, StorageError>
    where
        F: FnOnce(&UserProgress) -> Vec<BadgeGrant> + Send + 'static,
    {
        use schema::{tasks, users};
        let pool = self.pool.clone();
        let tid = task_id.to_string();
        let uid = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<CompletedTask>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let at = at.naive_utc();
            let completed_at = completed_at.naive_utc();
            conn.immediate_transaction(|conn| -> Result<Option<CompletedTask>, StorageError> {
                let household_id: String = tasks::table
                    .filter(tasks::id.eq(&tid))
                    .select(tasks::household_id)
                    .first::<String>(conn)
                    .optional()?
                    .ok_or_else(|| StorageError::not_found("task", &tid))?;
                let user_count: i64 = users::table
                    .filter(users::id.eq(&uid))
                    .count()
                    .get_result(conn)?;
                if user_count == 0 {
                    return Err(StorageError::not_found("user", &uid));
                }
                let transitioned = diesel::update(
                    tasks::table
                        .filter(tasks::id.eq(&tid))
                        .filter(tasks::is_completed.eq(false)),
                )
                .set((
                    tasks::is_completed.eq(true),
                    tasks::completed_at.eq(Some(completed_at)),
                    tasks::completed_by.eq(Some(uid.as_str())),
                ))
                .execute(conn)?;
                if transitioned == 0 {
                    debug!(task_id = %tid, "task already completed; skipping award");
                    return Ok(None);
                }
                let reason = format!("task:{}", tid);
                let new_total = apply_delta_conn(conn, &uid, points, &reason, Some(&tid), at)?;
                let new_badges = grant_badges_conn(conn, &uid, at, evaluate)?;
                Ok(Some(CompletedTask {
                    household_id,
                    applied: PointsApplied {
                        new_total,
                        new_badges,
                    },
                }))
            })
        })
        .await?
    }

    /// Insert every badge `evaluate` asks for that the user does not hold yet.
    /// Returns only the rows created by this call.
    pub async fn grant_badges<F>(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
        evaluate: F,
    ) -> Result<Vec<Badge>, StorageError>
    where
        F: FnOnce(&UserProgress) -> Vec<BadgeGrant> + Send + 'static,
    {
        let pool = self.pool.clone();
        let uid = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<Badge>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let at = at.naive_utc();
            conn.immediate_transaction(|conn| grant_badges_conn(conn, &uid, at, evaluate))
        })
        .await?
    }

    /// Record a finished challenge. Returns `false` if it was already recorded.
    pub async fn record_challenge(
        &self,
        user_id: &str,
        challenge_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        use schema::{challenge_completions, users};
        let pool = self.pool.clone();
        let uid = user_id.to_string();
        let cid = challenge_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let exists: i64 = users::table
                .filter(users::id.eq(&uid))
                .count()
                .get_result(&mut conn)?;
            if exists == 0 {
                return Err(StorageError::not_found("user", &uid));
            }
            let row = NewChallengeCompletion {
                user_id: &uid,
                challenge_id: &cid,
                completed_at: at.naive_utc(),
            };
            let inserted = diesel::insert_into(challenge_completions::table)
                .values(&row)
                .on_conflict_do_nothing()
                .execute(&mut conn)?;
            Ok(inserted > 0)
        })
        .await?
    }

    pub async fn list_badges(&self, user: &str) -> Result<Vec<Badge>, StorageError> {
        use schema::badges::dsl::*;
        let pool = self.pool.clone();
        let uid = user.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<Badge>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(badges
                .filter(user_id.eq(&uid))
                .order((earned_at.asc(), id.asc()))
                .load::<Badge>(&mut conn)?)
        })
        .await?
    }

    pub async fn list_ledger_for_user(
        &self,
        user: &str,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<LedgerEntry>, StorageError> {
        use schema::points_ledger::dsl as pl;
        let pool = self.pool.clone();
        let uid = user.to_string();
        let page = page.max(1);
        let per_page = per_page.clamp(1, 1000) as i64;
        let offset = ((page as i64) - 1) * per_page;
        tokio::task::spawn_blocking(move || -> Result<Vec<LedgerEntry>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(pl::points_ledger
                .filter(pl::user_id.eq(&uid))
                .order((pl::created_at.desc(), pl::id.desc()))
                .offset(offset)
                .limit(per_page)
                .load::<LedgerEntry>(&mut conn)?)
        })
        .await?
    }

    /// Completion timestamps of every task each user has completed, any household.
    pub async fn completion_times_for_users(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, Vec<NaiveDateTime>>, StorageError> {
        use schema::tasks::dsl as t;
        let pool = self.pool.clone();
        let ids = user_ids.to_vec();
        tokio::task::spawn_blocking(
            move || -> Result<HashMap<String, Vec<NaiveDateTime>>, StorageError> {
                let mut conn = pool.get()?;
                configure_sqlite_conn(&mut conn)?;
                let rows: Vec<(Option<String>, Option<NaiveDateTime>)> = t::tasks
                    .filter(t::completed_by.eq_any(ids))
                    .filter(t::is_completed.eq(true))
                    .select((t::completed_by, t::completed_at))
                    .load(&mut conn)?;
                let mut map: HashMap<String, Vec<NaiveDateTime>> = HashMap::new();
                for (user, at) in rows {
                    if let (Some(user), Some(at)) = (user, at) {
                        map.entry(user).or_default().push(at);
                    }
                }
                Ok(map)
            },
        )
        .await?
    }

    /// Sum of awards (positive ledger deltas) per user recorded at or after `since`.
    /// Task awards only count toward the task's own household; awards not tied to a
    /// task count everywhere the user is a member.
    pub async fn points_earned_since(
        &self,
        household: &str,
        user_ids: &[String],
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, i64>, StorageError> {
        use diesel::dsl::sum;
        use schema::points_ledger::dsl as pl;
        use schema::tasks::dsl as t;
        let pool = self.pool.clone();
        let hid = household.to_string();
        let ids = user_ids.to_vec();
        let since = since.naive_utc();
        tokio::task::spawn_blocking(move || -> Result<HashMap<String, i64>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let household_tasks = t::tasks
                .filter(t::household_id.eq(hid))
                .select(t::id.nullable());
            let rows: Vec<(String, Option<i64>)> = pl::points_ledger
                .filter(pl::user_id.eq_any(ids))
                .filter(pl::delta.gt(0))
                .filter(pl::task_id.is_null().or(pl::task_id.eq_any(household_tasks)))
                .filter(pl::created_at.ge(since))
                .group_by(pl::user_id)
                .select((pl::user_id, sum(pl::delta)))
                .load(&mut conn)?;
            Ok(rows
                .into_iter()
                .map(|(user, total)| (user, total.unwrap_or(0)))
                .collect())
        })
        .await?
    }

    /// Tasks of one household completed at or after `since`, counted per completing user.
    pub async fn tasks_completed_since(
        &self,
        household: &str,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, i64>, StorageError> {
        use diesel::dsl::count;
        use schema::tasks::dsl as t;
        let pool = self.pool.clone();
        let hid = household.to_string();
        let since = since.naive_utc();
        tokio::task::spawn_blocking(move || -> Result<HashMap<String, i64>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let rows: Vec<(Option<String>, i64)> = t::tasks
                .filter(t::household_id.eq(&hid))
                .filter(t::is_completed.eq(true))
                .filter(t::completed_at.ge(since))
                .group_by(t::completed_by)
                .select((t::completed_by, count(t::id)))
                .load(&mut conn)?;
            Ok(rows
                .into_iter()
                .filter_map(|(user, n)| user.map(|u| (u, n)))
                .collect())
        })
        .await?
    }

    pub async fn list_household_tasks(
        &self,
        household: &str,
    ) -> Result<Vec<TaskRecord>, StorageError> {
        use schema::tasks::dsl as t;
        let pool = self.pool.clone();
        let hid = household.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<TaskRecord>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(t::tasks
                .filter(t::household_id.eq(&hid))
                .order((t::created_at.asc(), t::id.asc()))
                .load::<TaskRecord>(&mut conn)?)
        })
        .await?
    }
}

fn upsert_user_conn(
    conn: &mut SqliteConnection,
    user_id: &str,
    display_name: &str,
    now: NaiveDateTime,
) -> Result<(), StorageError> {
    use schema::users;
    let new_user = NewUser {
        id: user_id,
        display_name,
        point_total: 0,
        created_at: now,
    };
    // Never touch point_total on conflict; only the ledger mutates it.
    diesel::insert_into(users::table)
        .values(&new_user)
        .on_conflict(users::id)
        .do_update()
        .set(users::display_name.eq(display_name))
        .execute(conn)?;
    Ok(())
}

fn upsert_household_conn(
    conn: &mut SqliteConnection,
    household_id: &str,
    name: &str,
    now: NaiveDateTime,
) -> Result<(), StorageError> {
    use schema::households;
    let new_household = NewHousehold {
        id: household_id,
        name,
        created_at: now,
    };
    diesel::insert_into(households::table)
        .values(&new_household)
        .on_conflict(households::id)
        .do_update()
        .set(households::name.eq(name))
        .execute(conn)?;
    Ok(())
}

fn add_member_conn(
    conn: &mut SqliteConnection,
    household_id: &str,
    user_id: &str,
    joined_at: NaiveDateTime,
) -> Result<(), StorageError> {
    use schema::household_members;
    let row = NewMember {
        household_id,
        user_id,
        joined_at,
    };
    diesel::insert_into(household_members::table)
        .values(&row)
        .on_conflict_do_nothing()
        .execute(conn)?;
    Ok(())
}

fn upsert_task_conn(
    conn: &mut SqliteConnection,
    task: &domain::Task,
    now: NaiveDateTime,
) -> Result<(), StorageError> {
    use schema::tasks;
    if task.points < 0 {
        return Err(StorageError::InvalidInput(format!(
            "task {} has negative points",
            task.id
        )));
    }
    let due = task.due_date.map(|d| d.naive_utc());
    let new_task = NewTask {
        id: &task.id,
        household_id: &task.household_id,
        title: &task.title,
        assigned_user_id: task.assigned_user_id.as_deref(),
        points: task.points,
        priority: task.priority.as_str(),
        recurrence: task.recurrence.as_str(),
        created_at: now,
        due_date: due,
    };
    // Completion columns are owned by complete_task_and_award and left untouched.
    diesel::insert_into(tasks::table)
        .values(&new_task)
        .on_conflict(tasks::id)
        .do_update()
        .set((
            tasks::title.eq(&task.title),
            tasks::assigned_user_id.eq(task.assigned_user_id.as_deref()),
            tasks::points.eq(task.points),
            tasks::priority.eq(task.priority.as_str()),
            tasks::recurrence.eq(task.recurrence.as_str()),
            tasks::due_date.eq(due),
        ))
        .execute(conn)?;
    Ok(())
}

fn apply_delta_conn(
    conn: &mut SqliteConnection,
    user_id: &str,
    delta: i32,
    reason: &str,
    task_id: Option<&str>,
    at: NaiveDateTime,
) -> Result<i64, StorageError> {
    use schema::{points_ledger, users};
    let new_total: i64 = diesel::update(users::table.filter(users::id.eq(user_id)))
        .set(users::point_total.eq(floor_at(users::point_total + i64::from(delta), 0i64)))
        .returning(users::point_total)
        .get_result::<i64>(conn)
        .optional()?
        .ok_or_else(|| StorageError::not_found("user", user_id))?;
    let entry = NewLedgerEntry {
        user_id,
        delta,
        balance_after: new_total,
        reason,
        task_id,
        created_at: at,
    };
    diesel::insert_into(points_ledger::table)
        .values(&entry)
        .execute(conn)?;
    Ok(new_total)
}

fn load_progress(conn: &mut SqliteConnection, user_id: &str) -> Result<UserProgress, StorageError> {
    use schema::{challenge_completions as cc, tasks, users};
    let point_total: i64 = users::table
        .filter(users::id.eq(user_id))
        .select(users::point_total)
        .first::<i64>(conn)
        .optional()?
        .ok_or_else(|| StorageError::not_found("user", user_id))?;
    let completion_times: Vec<NaiveDateTime> = tasks::table
        .filter(tasks::completed_by.eq(user_id))
        .filter(tasks::is_completed.eq(true))
        .select(tasks::completed_at)
        .load::<Option<NaiveDateTime>>(conn)?
        .into_iter()
        .flatten()
        .collect();
    let challenges_completed: i64 = cc::table
        .filter(cc::user_id.eq(user_id))
        .count()
        .get_result(conn)?;
    Ok(UserProgress {
        point_total,
        tasks_completed: completion_times.len() as i64,
        completion_times,
        challenges_completed,
    })
}

fn grant_badges_conn<F>(
    conn: &mut SqliteConnection,
    user_id: &str,
    at: NaiveDateTime,
    evaluate: F,
) -> Result<Vec<Badge>, StorageError>
where
    F: FnOnce(&UserProgress) -> Vec<BadgeGrant>,
{
    use schema::badges;
    let progress = load_progress(conn, user_id)?;
    let grants = evaluate(&progress);
    let mut created = Vec::new();
    for grant in &grants {
        let row = NewBadge {
            user_id,
            type_key: &grant.type_key,
            name: &grant.name,
            description: &grant.description,
            icon_key: &grant.icon_key,
            earned_at: at,
        };
        // UNIQUE(user_id, type_key) decides; zero rows means already awarded.
        let inserted = diesel::insert_into(badges::table)
            .values(&row)
            .on_conflict_do_nothing()
            .execute(conn)?;
        if inserted == 0 {
            continue;
        }
        let badge = badges::table
            .filter(badges::user_id.eq(user_id))
            .filter(badges::type_key.eq(&grant.type_key))
            .first::<Badge>(conn)?;
        created.push(badge);
    }
    Ok(created)
}

fn configure_sqlite_conn(conn: &mut SqliteConnection) -> Result<(), diesel::result::Error> {
    // Enable WAL for better read/write concurrency and set a busy timeout
    // Ignore the result rows; Diesel's execute is fine for PRAGMAs
    diesel::sql_query("PRAGMA journal_mode=WAL;").execute(conn)?;
    diesel::sql_query("PRAGMA synchronous=NORMAL;").execute(conn)?;
    diesel::sql_query("PRAGMA busy_timeout=5000;").execute(conn)?;
    diesel::sql_query("PRAGMA foreign_keys=ON;").execute(conn)?;
    Ok(())
}
