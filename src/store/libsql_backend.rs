//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases over a single shared
//! connection. Mutating statements are serialised through `write_lock` so a
//! ledger transaction never absorbs another task's writes.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::model::{Project, Recipient, Task, TimeEntry, TrackedUser, UpsertOutcome, UserTaskTotal};
use crate::store::migrations;
use crate::store::traits::Database;
use crate::threshold::level::{LedgerOutcome, ThresholdLevel, ThresholdRecord};

/// libSQL database backend.
pub struct LibSqlBackend {
    /// Owns the database handle for as long as `conn` is in use.
    _db: LibSqlDatabase,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        Ok(Self {
            _db: db,
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn writer(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format; fixed width so text comparison orders correctly.
fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_date(s: &str) -> Result<NaiveDate, DatabaseError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| DatabaseError::Serialization(format!("invalid date '{s}': {e}")))
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

/// Run a query that yields at most one integer; NULL and no-row both map to `None`.
async fn scalar_i64(
    conn: &Connection,
    context: &str,
    sql: &str,
    params: impl libsql::params::IntoParams,
) -> Result<Option<i64>, DatabaseError> {
    let mut rows = conn
        .query(sql, params)
        .await
        .map_err(|e| DatabaseError::from_libsql(context, e))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(row.get::<i64>(0).ok()),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::from_libsql(context, e)),
    }
}

fn row_to_task(row: &libsql::Row) -> Result<Task, libsql::Error> {
    Ok(Task {
        id: row.get(0)?,
        parent_id: row.get::<i64>(1).ok(),
        name: row.get(2)?,
        archived: row.get::<i64>(3)? != 0,
    })
}

fn row_to_project(row: &libsql::Row) -> Result<Project, libsql::Error> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        source_task_id: row.get(2)?,
    })
}

fn level_from_db(value: i64) -> Result<ThresholdLevel, DatabaseError> {
    ThresholdLevel::from_percent(value)
        .ok_or_else(|| DatabaseError::Serialization(format!("unknown threshold level {value}")))
}

/// Classify the upsert given whether the row existed and how many rows changed.
fn upsert_outcome(existed: bool, changed: u64) -> UpsertOutcome {
    match (existed, changed) {
        (false, _) => UpsertOutcome::Inserted,
        (true, 0) => UpsertOutcome::Unchanged,
        (true, _) => UpsertOutcome::Updated,
    }
}

async fn row_exists(conn: &Connection, table: &str, id: i64) -> Result<bool, DatabaseError> {
    let found = scalar_i64(
        conn,
        "row_exists",
        &format!("SELECT 1 FROM {table} WHERE id = ?1"),
        params![id],
    )
    .await?;
    Ok(found.is_some())
}

/// Task and duration currently stored for an entry.
async fn stored_entry(conn: &Connection, id: i64) -> Result<Option<(i64, i64)>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT task_id, duration_secs FROM time_entries WHERE id = ?1",
            params![id],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("stored_entry", e))?;

    match rows.next().await {
        Ok(Some(row)) => {
            let task_id: i64 = row
                .get(0)
                .map_err(|e| DatabaseError::from_libsql("stored_entry", e))?;
            let secs: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::from_libsql("stored_entry", e))?;
            Ok(Some((task_id, secs)))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::from_libsql("stored_entry", e)),
    }
}

/// Per-task duration movement caused by writing `entry` over `stored`.
/// Edits that leave the duration alone produce nothing.
fn duration_deltas(stored: Option<(i64, i64)>, entry: &TimeEntry) -> Vec<(i64, i64)> {
    let deltas = match stored {
        None => vec![(entry.task_id, entry.duration_secs)],
        Some((task_id, secs)) if task_id == entry.task_id => {
            vec![(task_id, entry.duration_secs - secs)]
        }
        Some((task_id, secs)) => vec![(task_id, -secs), (entry.task_id, entry.duration_secs)],
    };
    deltas.into_iter().filter(|(_, delta)| *delta != 0).collect()
}

/// Upsert one entry and log its duration deltas, on the transaction's connection.
async fn write_time_entry(conn: &Connection, entry: &TimeEntry) -> Result<UpsertOutcome, DatabaseError> {
    let stored = stored_entry(conn, entry.id).await?;
    let now = format_timestamp(Utc::now());

    let changed = conn
        .execute(
            "INSERT INTO time_entries (id, task_id, user_id, entry_date, duration_secs, description, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (id) DO UPDATE SET
                task_id = excluded.task_id,
                user_id = excluded.user_id,
                entry_date = excluded.entry_date,
                duration_secs = excluded.duration_secs,
                description = excluded.description,
                modified_at = excluded.modified_at
             WHERE time_entries.task_id IS NOT excluded.task_id
                OR time_entries.user_id IS NOT excluded.user_id
                OR time_entries.entry_date IS NOT excluded.entry_date
                OR time_entries.duration_secs IS NOT excluded.duration_secs
                OR time_entries.description IS NOT excluded.description",
            params![
                entry.id,
                entry.task_id,
                entry.user_id,
                entry.date.to_string(),
                entry.duration_secs,
                entry.description.as_str(),
                now.as_str(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("upsert_time_entry", e))?;

    for (task_id, delta) in duration_deltas(stored, entry) {
        conn.execute(
            "INSERT INTO time_entry_changes (entry_id, task_id, delta_secs, changed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![entry.id, task_id, delta, now.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("log time entry change", e))?;
    }

    Ok(upsert_outcome(stored.is_some(), changed))
}

/// Ledger decision, executed on the transaction's connection.
async fn claim_threshold(
    conn: &Connection,
    task_id: i64,
    level: ThresholdLevel,
    percentage: f64,
    entry_date: NaiveDate,
) -> Result<LedgerOutcome, DatabaseError> {
    let recorded = scalar_i64(
        conn,
        "record_threshold_crossing read",
        "SELECT MAX(threshold) FROM threshold_notifications WHERE task_id = ?1",
        params![task_id],
    )
    .await?
    .map(level_from_db)
    .transpose()?;

    let outcome = match recorded {
        Some(recorded) if recorded > level => return Ok(LedgerOutcome::Superseded { recorded }),
        Some(recorded) if recorded == level => LedgerOutcome::Refreshed,
        _ => LedgerOutcome::Recorded,
    };

    write_threshold_row(conn, task_id, level, percentage, entry_date).await?;
    Ok(outcome)
}

async fn write_threshold_row(
    conn: &Connection,
    task_id: i64,
    level: ThresholdLevel,
    percentage: f64,
    entry_date: NaiveDate,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO threshold_notifications (task_id, threshold, percentage, recorded_at, entry_date)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (task_id, threshold) DO UPDATE SET
            percentage = excluded.percentage,
            recorded_at = excluded.recorded_at,
            entry_date = excluded.entry_date",
        params![
            task_id,
            level.percent(),
            percentage,
            format_timestamp(Utc::now()),
            entry_date.to_string(),
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("upsert_threshold_record", e))?;
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

const PROJECT_COLUMNS: &str = "id, name, source_task_id";

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        self.conn()
            .query("SELECT 1", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("ping: {e}")))?;
        Ok(())
    }

    // ── Tasks & users ───────────────────────────────────────────────

    async fn upsert_task(&self, task: &Task) -> Result<UpsertOutcome, DatabaseError> {
        let _w = self.writer().await;
        let conn = self.conn();
        let existed = row_exists(conn, "tasks", task.id).await?;

        let changed = conn
            .execute(
                "INSERT INTO tasks (id, parent_id, name, archived, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (id) DO UPDATE SET
                    parent_id = excluded.parent_id,
                    name = excluded.name,
                    archived = excluded.archived,
                    updated_at = excluded.updated_at
                 WHERE tasks.parent_id IS NOT excluded.parent_id
                    OR tasks.name IS NOT excluded.name
                    OR tasks.archived IS NOT excluded.archived",
                params![
                    task.id,
                    opt_int(task.parent()),
                    task.name.as_str(),
                    task.archived as i64,
                    format_timestamp(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("upsert_task", e))?;

        Ok(upsert_outcome(existed, changed))
    }

    async fn get_task(&self, id: i64) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, parent_id, name, archived FROM tasks WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_task", e))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let task = row_to_task(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_task row parse: {e}")))?;
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_task", e)),
        }
    }

    async fn upsert_user(&self, user: &TrackedUser) -> Result<UpsertOutcome, DatabaseError> {
        let _w = self.writer().await;
        let conn = self.conn();
        let existed = row_exists(conn, "users", user.id).await?;

        let changed = conn
            .execute(
                "INSERT INTO users (id, email, display_name, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (id) DO UPDATE SET
                    email = excluded.email,
                    display_name = excluded.display_name,
                    updated_at = excluded.updated_at
                 WHERE users.email IS NOT excluded.email
                    OR users.display_name IS NOT excluded.display_name",
                params![
                    user.id,
                    user.email.as_str(),
                    user.display_name.as_str(),
                    format_timestamp(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("upsert_user", e))?;

        Ok(upsert_outcome(existed, changed))
    }

    // ── Time entries ────────────────────────────────────────────────

    async fn upsert_time_entry(&self, entry: &TimeEntry) -> Result<UpsertOutcome, DatabaseError> {
        let _w = self.writer().await;

        // The row and its change-log lines land together or not at all.
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::from_libsql("upsert_time_entry begin", e))?;

        match write_time_entry(&tx, entry).await {
            Ok(outcome) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::from_libsql("upsert_time_entry commit", e))?;
                if outcome.changed() {
                    debug!(entry_id = entry.id, task_id = entry.task_id, ?outcome, "Time entry written");
                }
                Ok(outcome)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn sum_durations(
        &self,
        task_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<i64, DatabaseError> {
        let total = scalar_i64(
            self.conn(),
            "sum_durations",
            "SELECT COALESCE(SUM(duration_secs), 0) FROM time_entries
             WHERE task_id = ?1 AND entry_date >= ?2 AND entry_date <= ?3",
            params![task_id, from.to_string(), to.to_string()],
        )
        .await?;
        Ok(total.unwrap_or(0))
    }

    async fn sum_durations_all_time(&self, task_id: i64) -> Result<i64, DatabaseError> {
        let total = scalar_i64(
            self.conn(),
            "sum_durations_all_time",
            "SELECT COALESCE(SUM(duration_secs), 0) FROM time_entries WHERE task_id = ?1",
            params![task_id],
        )
        .await?;
        Ok(total.unwrap_or(0))
    }

    async fn sum_recent_growth(
        &self,
        task_id: i64,
        since: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let total = scalar_i64(
            self.conn(),
            "sum_recent_growth",
            "SELECT COALESCE(SUM(delta_secs), 0) FROM time_entry_changes
             WHERE task_id = ?1 AND changed_at >= ?2",
            params![task_id, format_timestamp(since)],
        )
        .await?;
        Ok(total.unwrap_or(0))
    }

    async fn latest_entry_date(&self, task_id: i64) -> Result<Option<NaiveDate>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT MAX(entry_date) FROM time_entries WHERE task_id = ?1",
                params![task_id],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("latest_entry_date", e))?;

        match rows.next().await {
            Ok(Some(row)) => match row.get::<String>(0).ok() {
                Some(s) => Ok(Some(parse_date(&s)?)),
                None => Ok(None),
            },
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("latest_entry_date", e)),
        }
    }

    async fn user_task_totals(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<UserTaskTotal>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT e.user_id,
                        COALESCE(u.display_name, 'User ' || e.user_id),
                        e.task_id,
                        COALESCE(t.name, 'Task ' || e.task_id),
                        SUM(e.duration_secs) AS total
                 FROM time_entries e
                 LEFT JOIN users u ON u.id = e.user_id
                 LEFT JOIN tasks t ON t.id = e.task_id
                 WHERE e.entry_date >= ?1 AND e.entry_date <= ?2
                 GROUP BY e.user_id, e.task_id
                 ORDER BY 2 ASC, total DESC",
                params![from.to_string(), to.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("user_task_totals", e))?;

        let mut totals = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("user_task_totals", e))?
        {
            let total = (|| -> Result<UserTaskTotal, libsql::Error> {
                Ok(UserTaskTotal {
                    user_id: row.get(0)?,
                    user_name: row.get(1)?,
                    task_id: row.get(2)?,
                    task_name: row.get(3)?,
                    duration_secs: row.get(4)?,
                })
            })()
            .map_err(|e| DatabaseError::Query(format!("user_task_totals row parse: {e}")))?;
            totals.push(total);
        }
        Ok(totals)
    }

    async fn delete_orphaned_time_entries(
        &self,
        older_than: NaiveDate,
    ) -> Result<usize, DatabaseError> {
        let _w = self.writer().await;
        let count = self
            .conn()
            .execute(
                "DELETE FROM time_entries
                 WHERE entry_date < ?1 AND task_id NOT IN (SELECT id FROM tasks)",
                params![older_than.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("delete_orphaned_time_entries", e))?;

        self.conn()
            .execute(
                "DELETE FROM time_entry_changes
                 WHERE changed_at < ?1 OR entry_id NOT IN (SELECT id FROM time_entries)",
                params![older_than.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("prune time_entry_changes", e))?;

        if count > 0 {
            info!(count, %older_than, "Deleted orphaned time entries");
        }
        Ok(count as usize)
    }

    // ── Threshold ledger ────────────────────────────────────────────

    async fn max_recorded_threshold(
        &self,
        task_id: i64,
    ) -> Result<Option<ThresholdLevel>, DatabaseError> {
        scalar_i64(
            self.conn(),
            "max_recorded_threshold",
            "SELECT MAX(threshold) FROM threshold_notifications WHERE task_id = ?1",
            params![task_id],
        )
        .await?
        .map(level_from_db)
        .transpose()
    }

    async fn upsert_threshold_record(
        &self,
        task_id: i64,
        level: ThresholdLevel,
        percentage: f64,
        entry_date: NaiveDate,
    ) -> Result<(), DatabaseError> {
        let _w = self.writer().await;
        write_threshold_row(self.conn(), task_id, level, percentage, entry_date).await
    }

    async fn record_threshold_crossing(
        &self,
        task_id: i64,
        level: ThresholdLevel,
        percentage: f64,
        entry_date: NaiveDate,
    ) -> Result<LedgerOutcome, DatabaseError> {
        let _w = self.writer().await;

        // IMMEDIATE takes the database write lock up front, so the read below
        // cannot be invalidated by another writer before we commit.
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::from_libsql("record_threshold_crossing begin", e))?;

        match claim_threshold(&tx, task_id, level, percentage, entry_date).await {
            Ok(outcome) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::from_libsql("record_threshold_crossing commit", e))?;
                debug!(task_id, %level, ?outcome, "Ledger check complete");
                Ok(outcome)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn list_threshold_records(
        &self,
        task_id: i64,
    ) -> Result<Vec<ThresholdRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT task_id, threshold, percentage, recorded_at, entry_date
                 FROM threshold_notifications WHERE task_id = ?1 ORDER BY threshold",
                params![task_id],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("list_threshold_records", e))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("list_threshold_records", e))?
        {
            let parse = |e: libsql::Error| {
                DatabaseError::Query(format!("list_threshold_records row parse: {e}"))
            };
            let recorded_at: String = row.get(3).map_err(parse)?;
            let entry_date: String = row.get(4).map_err(parse)?;
            records.push(ThresholdRecord {
                task_id: row.get(0).map_err(parse)?,
                level: level_from_db(row.get(1).map_err(parse)?)?,
                percentage: row.get(2).map_err(parse)?,
                recorded_at: parse_datetime(&recorded_at),
                entry_date: parse_date(&entry_date)?,
            });
        }
        Ok(records)
    }

    // ── Notification routing ────────────────────────────────────────

    async fn upsert_project(
        &self,
        name: &str,
        source_task_id: i64,
    ) -> Result<Project, DatabaseError> {
        let _w = self.writer().await;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO projects (name, source_task_id) VALUES (?1, ?2)
             ON CONFLICT (source_task_id) DO UPDATE SET name = excluded.name",
            params![name, source_task_id],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("upsert_project", e))?;

        let mut rows = conn
            .query(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE source_task_id = ?1"),
                params![source_task_id],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("upsert_project", e))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_project(&row)
                .map_err(|e| DatabaseError::Query(format!("upsert_project row parse: {e}"))),
            Ok(None) => Err(DatabaseError::Query(format!(
                "upsert_project: project for task {source_task_id} vanished"
            ))),
            Err(e) => Err(DatabaseError::from_libsql("upsert_project", e)),
        }
    }

    async fn list_projects(&self) -> Result<Vec<Project>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY name"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("list_projects", e))?;

        let mut projects = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("list_projects", e))?
        {
            projects.push(
                row_to_project(&row)
                    .map_err(|e| DatabaseError::Query(format!("list_projects row parse: {e}")))?,
            );
        }
        Ok(projects)
    }

    async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE name = ?1 COLLATE NOCASE"),
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("find_project_by_name", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_project(&row).map_err(|e| {
                DatabaseError::Query(format!("find_project_by_name row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("find_project_by_name", e)),
        }
    }

    async fn upsert_recipient(&self, recipient: &Recipient) -> Result<(), DatabaseError> {
        let _w = self.writer().await;
        self.conn()
            .execute(
                "INSERT INTO recipients (slack_user_id, name) VALUES (?1, ?2)
                 ON CONFLICT (slack_user_id) DO UPDATE SET name = excluded.name",
                params![recipient.slack_user_id.as_str(), recipient.name.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("upsert_recipient", e))?;
        Ok(())
    }

    async fn remove_recipient(&self, slack_user_id: &str) -> Result<bool, DatabaseError> {
        let _w = self.writer().await;
        let conn = self.conn();
        conn.execute(
            "DELETE FROM user_projects WHERE slack_user_id = ?1",
            params![slack_user_id],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("remove_recipient", e))?;

        let count = conn
            .execute(
                "DELETE FROM recipients WHERE slack_user_id = ?1",
                params![slack_user_id],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("remove_recipient", e))?;
        Ok(count > 0)
    }

    async fn list_recipients(&self) -> Result<Vec<Recipient>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT slack_user_id, name FROM recipients ORDER BY created_at, slack_user_id",
                (),
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("list_recipients", e))?;

        let mut recipients = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("list_recipients", e))?
        {
            let parse =
                |e: libsql::Error| DatabaseError::Query(format!("list_recipients row parse: {e}"));
            recipients.push(Recipient {
                slack_user_id: row.get(0).map_err(parse)?,
                name: row.get(1).map_err(parse)?,
            });
        }
        Ok(recipients)
    }

    async fn assign_project(
        &self,
        slack_user_id: &str,
        project_id: i64,
    ) -> Result<(), DatabaseError> {
        let _w = self.writer().await;
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO user_projects (slack_user_id, project_id) VALUES (?1, ?2)",
                params![slack_user_id, project_id],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("assign_project", e))?;
        Ok(())
    }

    async fn unassign_project(
        &self,
        slack_user_id: &str,
        project_id: i64,
    ) -> Result<bool, DatabaseError> {
        let _w = self.writer().await;
        let count = self
            .conn()
            .execute(
                "DELETE FROM user_projects WHERE slack_user_id = ?1 AND project_id = ?2",
                params![slack_user_id, project_id],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("unassign_project", e))?;
        Ok(count > 0)
    }

    async fn user_project_assignments(
        &self,
        slack_user_id: &str,
    ) -> Result<Vec<Project>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT p.id, p.name, p.source_task_id
                 FROM user_projects up JOIN projects p ON p.id = up.project_id
                 WHERE up.slack_user_id = ?1
                 ORDER BY p.name",
                params![slack_user_id],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("user_project_assignments", e))?;

        let mut projects = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::from_libsql("user_project_assignments", e))?
        {
            projects.push(row_to_project(&row).map_err(|e| {
                DatabaseError::Query(format!("user_project_assignments row parse: {e}"))
            })?);
        }
        Ok(projects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn make_task(id: i64, parent_id: Option<i64>, name: &str) -> Task {
        Task {
            id,
            parent_id,
            name: name.to_string(),
            archived: false,
        }
    }

    fn make_entry(id: i64, task_id: i64, day: &str, secs: i64) -> TimeEntry {
        TimeEntry {
            id,
            task_id,
            user_id: 7,
            date: date(day),
            duration_secs: secs,
            description: String::new(),
        }
    }

    // ── Mirror tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn task_upsert_reports_changes() {
        let db = test_db().await;
        let task = make_task(1, Some(0), "Design [10-20]");

        assert_eq!(db.upsert_task(&task).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(db.upsert_task(&task).await.unwrap(), UpsertOutcome::Unchanged);

        let renamed = make_task(1, None, "Design [10-30]");
        assert_eq!(db.upsert_task(&renamed).await.unwrap(), UpsertOutcome::Updated);

        let fetched = db.get_task(1).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Design [10-30]");
        assert_eq!(fetched.parent_id, None);
    }

    #[tokio::test]
    async fn task_parent_is_stored() {
        let db = test_db().await;
        db.upsert_task(&make_task(2, Some(500), "Child")).await.unwrap();
        let fetched = db.get_task(2).await.unwrap().unwrap();
        assert_eq!(fetched.parent_id, Some(500));
        assert!(db.get_task(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn user_upsert_reports_changes() {
        let db = test_db().await;
        let mut user = TrackedUser {
            id: 7,
            email: "ana@example.com".into(),
            display_name: "Ana".into(),
        };
        assert_eq!(db.upsert_user(&user).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(db.upsert_user(&user).await.unwrap(), UpsertOutcome::Unchanged);
        user.display_name = "Ana B".into();
        assert_eq!(db.upsert_user(&user).await.unwrap(), UpsertOutcome::Updated);
    }

    #[tokio::test]
    async fn time_entry_last_write_wins() {
        let db = test_db().await;
        let entry = make_entry(10, 1, "2026-03-02", 3600);
        assert_eq!(db.upsert_time_entry(&entry).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(db.upsert_time_entry(&entry).await.unwrap(), UpsertOutcome::Unchanged);

        let longer = make_entry(10, 1, "2026-03-02", 7200);
        assert_eq!(db.upsert_time_entry(&longer).await.unwrap(), UpsertOutcome::Updated);
        assert_eq!(db.sum_durations_all_time(1).await.unwrap(), 7200);
    }

    #[tokio::test]
    async fn sums_respect_date_window() {
        let db = test_db().await;
        db.upsert_time_entry(&make_entry(1, 1, "2026-03-01", 100)).await.unwrap();
        db.upsert_time_entry(&make_entry(2, 1, "2026-03-02", 200)).await.unwrap();
        db.upsert_time_entry(&make_entry(3, 1, "2026-03-05", 400)).await.unwrap();
        db.upsert_time_entry(&make_entry(4, 2, "2026-03-02", 800)).await.unwrap();

        assert_eq!(
            db.sum_durations(1, date("2026-03-02"), date("2026-03-05")).await.unwrap(),
            600
        );
        assert_eq!(db.sum_durations_all_time(1).await.unwrap(), 700);
        assert_eq!(db.sum_durations_all_time(3).await.unwrap(), 0);
        assert_eq!(db.latest_entry_date(1).await.unwrap(), Some(date("2026-03-05")));
        assert_eq!(db.latest_entry_date(3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn recent_growth_follows_duration_changes() {
        let db = test_db().await;
        let past = Utc::now() - chrono::Duration::minutes(5);
        db.upsert_time_entry(&make_entry(1, 1, "2026-03-01", 100)).await.unwrap();
        assert_eq!(db.sum_recent_growth(1, past).await.unwrap(), 100);

        // Grown by 50, then shrunk by 30: net +120 in the window.
        db.upsert_time_entry(&make_entry(1, 1, "2026-03-01", 150)).await.unwrap();
        db.upsert_time_entry(&make_entry(1, 1, "2026-03-01", 120)).await.unwrap();
        assert_eq!(db.sum_recent_growth(1, past).await.unwrap(), 120);

        let future = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(db.sum_recent_growth(1, future).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn description_edit_adds_no_growth() {
        let db = test_db().await;
        db.upsert_time_entry(&make_entry(1, 1, "2026-03-01", 100)).await.unwrap();
        let after_insert = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let mut edited = make_entry(1, 1, "2026-03-01", 100);
        edited.description = "reworded".into();
        assert_eq!(db.upsert_time_entry(&edited).await.unwrap(), UpsertOutcome::Updated);
        assert_eq!(db.sum_recent_growth(1, after_insert).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn moving_an_entry_shifts_growth_between_tasks() {
        let db = test_db().await;
        db.upsert_time_entry(&make_entry(1, 1, "2026-03-01", 100)).await.unwrap();
        let after_insert = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        db.upsert_time_entry(&make_entry(1, 2, "2026-03-01", 100)).await.unwrap();
        assert_eq!(db.sum_recent_growth(1, after_insert).await.unwrap(), -100);
        assert_eq!(db.sum_recent_growth(2, after_insert).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn user_task_totals_group_by_user_and_task() {
        let db = test_db().await;
        db.upsert_task(&make_task(1, None, "Alpha")).await.unwrap();
        db.upsert_user(&TrackedUser {
            id: 7,
            email: "ana@example.com".into(),
            display_name: "Ana".into(),
        })
        .await
        .unwrap();
        db.upsert_time_entry(&make_entry(1, 1, "2026-03-02", 1800)).await.unwrap();
        db.upsert_time_entry(&make_entry(2, 1, "2026-03-03", 1800)).await.unwrap();
        db.upsert_time_entry(&make_entry(3, 2, "2026-03-03", 600)).await.unwrap();
        db.upsert_time_entry(&make_entry(4, 1, "2026-04-01", 999)).await.unwrap();

        let totals = db
            .user_task_totals(date("2026-03-01"), date("2026-03-31"))
            .await
            .unwrap();
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].user_name, "Ana");
        assert_eq!(totals[0].task_name, "Alpha");
        assert_eq!(totals[0].duration_secs, 3600);
        assert_eq!(totals[1].task_name, "Task 2");
    }

    #[tokio::test]
    async fn orphan_cleanup_only_removes_old_orphans() {
        let db = test_db().await;
        db.upsert_task(&make_task(1, None, "Alive")).await.unwrap();
        db.upsert_time_entry(&make_entry(1, 1, "2026-01-01", 100)).await.unwrap();
        db.upsert_time_entry(&make_entry(2, 2, "2026-01-01", 100)).await.unwrap();
        db.upsert_time_entry(&make_entry(3, 2, "2026-03-01", 100)).await.unwrap();
        db.record_threshold_crossing(2, ThresholdLevel::Half, 55.0, date("2026-01-01"))
            .await
            .unwrap();

        let removed = db.delete_orphaned_time_entries(date("2026-02-01")).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.sum_durations_all_time(1).await.unwrap(), 100);
        assert_eq!(db.sum_durations_all_time(2).await.unwrap(), 100);
        // The ledger is untouched by retention cleanup.
        assert_eq!(db.list_threshold_records(2).await.unwrap().len(), 1);
    }

    // ── Ledger tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn record_then_supersede() {
        let db = test_db().await;
        let day = date("2026-03-02");

        let first = db
            .record_threshold_crossing(1, ThresholdLevel::Half, 55.0, day)
            .await
            .unwrap();
        assert_eq!(first, LedgerOutcome::Recorded);

        let again = db
            .record_threshold_crossing(1, ThresholdLevel::Half, 56.0, day)
            .await
            .unwrap();
        assert_eq!(again, LedgerOutcome::Refreshed);

        let higher = db
            .record_threshold_crossing(1, ThresholdLevel::Seventy, 70.0, day)
            .await
            .unwrap();
        assert_eq!(higher, LedgerOutcome::Recorded);

        let lower = db
            .record_threshold_crossing(1, ThresholdLevel::Half, 60.0, day)
            .await
            .unwrap();
        assert_eq!(
            lower,
            LedgerOutcome::Superseded {
                recorded: ThresholdLevel::Seventy
            }
        );

        let records = db.list_threshold_records(1).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, ThresholdLevel::Half);
        assert!((records[0].percentage - 56.0).abs() < f64::EPSILON);
        assert_eq!(records[1].level, ThresholdLevel::Seventy);
        assert_eq!(
            db.max_recorded_threshold(1).await.unwrap(),
            Some(ThresholdLevel::Seventy)
        );
    }

    #[tokio::test]
    async fn upsert_threshold_record_keeps_one_row() {
        let db = test_db().await;
        let day = date("2026-03-02");
        db.upsert_threshold_record(3, ThresholdLevel::Full, 100.0, day).await.unwrap();
        db.upsert_threshold_record(3, ThresholdLevel::Full, 120.0, day).await.unwrap();

        let records = db.list_threshold_records(3).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!((records[0].percentage - 120.0).abs() < f64::EPSILON);
        assert_eq!(db.max_recorded_threshold(4).await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_claims_record_once() {
        let db = Arc::new(test_db().await);
        let day = date("2026-03-02");

        let attempts = (0..8).map(|_| {
            let db = Arc::clone(&db);
            async move {
                db.record_threshold_crossing(9, ThresholdLevel::Ninety, 91.0, day)
                    .await
                    .unwrap()
            }
        });
        let outcomes = futures::future::join_all(attempts).await;

        let recorded = outcomes
            .iter()
            .filter(|o| **o == LedgerOutcome::Recorded)
            .count();
        assert_eq!(recorded, 1);
        assert_eq!(db.list_threshold_records(9).await.unwrap().len(), 1);
    }

    // ── Routing tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn project_assignment_crud() {
        let db = test_db().await;
        let project = db.upsert_project("Website", 500).await.unwrap();
        assert_eq!(project.source_task_id, 500);

        let renamed = db.upsert_project("Website v2", 500).await.unwrap();
        assert_eq!(renamed.id, project.id);
        assert_eq!(db.list_projects().await.unwrap().len(), 1);
        assert!(db.find_project_by_name("website V2").await.unwrap().is_some());

        db.upsert_recipient(&Recipient {
            slack_user_id: "U1".into(),
            name: "ana".into(),
        })
        .await
        .unwrap();
        db.assign_project("U1", project.id).await.unwrap();
        db.assign_project("U1", project.id).await.unwrap();

        let assigned = db.user_project_assignments("U1").await.unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].name, "Website v2");

        assert!(db.unassign_project("U1", project.id).await.unwrap());
        assert!(db.user_project_assignments("U1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_recipient_drops_assignments() {
        let db = test_db().await;
        let project = db.upsert_project("Mobile", 600).await.unwrap();
        db.upsert_recipient(&Recipient {
            slack_user_id: "U2".into(),
            name: "bo".into(),
        })
        .await
        .unwrap();
        db.assign_project("U2", project.id).await.unwrap();

        assert!(db.remove_recipient("U2").await.unwrap());
        assert!(db.list_recipients().await.unwrap().is_empty());
        assert!(db.user_project_assignments("U2").await.unwrap().is_empty());
        assert!(!db.remove_recipient("U2").await.unwrap());
    }

    #[tokio::test]
    async fn open_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("pulse.db");
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        db.ping().await.unwrap();
        assert!(path.exists());
    }
}
