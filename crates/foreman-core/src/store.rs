use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::types::{
    ActivityEntry, AgentStatus, InvalidTransition, ProjectAggregate, SystemStats, Task,
    TaskPriority, TaskStatus, TaskTemplate,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("template name already exists: {0}")]
    Conflict(String),
    #[error(transparent)]
    IllegalTransition(#[from] InvalidTransition),
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] tokio_rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// helpers – enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid date")
        .with_timezone(&Utc)
}

/// Derive a human-facing project name from an opaque project key (usually a
/// filesystem path).
fn display_name_for(project_ref: &str) -> String {
    Path::new(project_ref)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| project_ref.to_string())
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Async SQLite-backed store for tasks, project aggregates, the activity
/// log, and task templates.
///
/// Every write happens inside a single `conn.call` closure and is therefore
/// atomic with respect to concurrent readers. Status transitions are guarded
/// by `WHERE status = ...` clauses so a terminal transition can only ever
/// happen once per row, no matter how many writers race.
pub struct TaskStore {
    conn: Connection,
}

impl TaskStore {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory store (useful for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS tasks (
                        id           TEXT PRIMARY KEY,
                        project_ref  TEXT NOT NULL,
                        description  TEXT NOT NULL,
                        instruction  TEXT NOT NULL,
                        status       TEXT NOT NULL,
                        priority     INTEGER NOT NULL,
                        created_at   TEXT NOT NULL,
                        started_at   TEXT,
                        completed_at TEXT,
                        result       TEXT,
                        error        TEXT,
                        context      TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_ref);
                    CREATE INDEX IF NOT EXISTS idx_tasks_status  ON tasks(status);

                    CREATE TABLE IF NOT EXISTS projects (
                        project_ref      TEXT PRIMARY KEY,
                        display_name     TEXT NOT NULL,
                        completed_count  INTEGER NOT NULL DEFAULT 0,
                        failed_count     INTEGER NOT NULL DEFAULT 0,
                        last_activity_at TEXT NOT NULL,
                        agent_status     TEXT NOT NULL DEFAULT 'idle',
                        git_branch       TEXT,
                        dirty_summary    TEXT
                    );

                    CREATE TABLE IF NOT EXISTS activity_log (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        timestamp   TEXT NOT NULL,
                        project_ref TEXT,
                        task_id     TEXT,
                        event_type  TEXT NOT NULL,
                        details     TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_activity_event ON activity_log(event_type);

                    CREATE TABLE IF NOT EXISTS templates (
                        name                 TEXT PRIMARY KEY,
                        description_template TEXT NOT NULL,
                        instruction_template TEXT NOT NULL,
                        default_priority     INTEGER NOT NULL,
                        tags                 TEXT NOT NULL,
                        use_count            INTEGER NOT NULL DEFAULT 0,
                        created_at           TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Task CRUD
    // -----------------------------------------------------------------------

    /// Insert or replace a task, keyed by id.
    pub async fn save_task(&self, task: &Task) -> Result<()> {
        let id = task.id.to_string();
        let project_ref = task.project_ref.clone();
        let description = task.description.clone();
        let instruction = task.instruction.clone();
        let status = enum_to_sql(&task.status);
        let priority = task.priority.as_i64();
        let created_at = task.created_at.to_rfc3339();
        let started_at = task.started_at.map(|d| d.to_rfc3339());
        let completed_at = task.completed_at.map(|d| d.to_rfc3339());
        let result = task.result.clone();
        let error = task.error.clone();
        let context = if task.context.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(task.context.clone()).to_string())
        };

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, project_ref, description, instruction, status,
                        priority, created_at, started_at, completed_at, result, error, context)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
                     ON CONFLICT(id) DO UPDATE SET
                        project_ref=excluded.project_ref, description=excluded.description,
                        instruction=excluded.instruction, status=excluded.status,
                        priority=excluded.priority, started_at=excluded.started_at,
                        completed_at=excluded.completed_at, result=excluded.result,
                        error=excluded.error, context=excluded.context",
                    rusqlite::params![
                        id, project_ref, description, instruction, status, priority,
                        created_at, started_at, completed_at, result, error, context,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let id_str = id.to_string();
        let task = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_ref, description, instruction, status, priority,
                            created_at, started_at, completed_at, result, error, context
                     FROM tasks WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_task(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(task)
    }

    /// List a project's tasks, ordered by priority descending then creation
    /// time ascending. This ordering is also the dispatch order.
    pub async fn list_tasks(
        &self,
        project_ref: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>> {
        let project_ref = project_ref.to_string();
        let status_str = status.map(|s| enum_to_sql(&s));
        let tasks = self
            .conn
            .call(move |conn| {
                let mut out = Vec::new();
                match status_str {
                    Some(status_str) => {
                        let mut stmt = conn.prepare(
                            "SELECT id, project_ref, description, instruction, status, priority,
                                    created_at, started_at, completed_at, result, error, context
                             FROM tasks WHERE project_ref = ?1 AND status = ?2
                             ORDER BY priority DESC, created_at ASC",
                        )?;
                        let mut rows = stmt.query(rusqlite::params![project_ref, status_str])?;
                        while let Some(row) = rows.next()? {
                            out.push(row_to_task(row)?);
                        }
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT id, project_ref, description, instruction, status, priority,
                                    created_at, started_at, completed_at, result, error, context
                             FROM tasks WHERE project_ref = ?1
                             ORDER BY priority DESC, created_at ASC",
                        )?;
                        let mut rows = stmt.query(rusqlite::params![project_ref])?;
                        while let Some(row) = rows.next()? {
                            out.push(row_to_task(row)?);
                        }
                    }
                }
                Ok(out)
            })
            .await?;
        Ok(tasks)
    }

    // -----------------------------------------------------------------------
    // Guarded transitions
    // -----------------------------------------------------------------------

    /// Pending -> Running. Returns `false` when the task was no longer
    /// Pending (e.g. cancelled while queued).
    pub async fn start_task(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<bool> {
        let id_str = id.to_string();
        let ts = started_at.to_rfc3339();
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET status = 'running', started_at = ?2
                     WHERE id = ?1 AND status = 'pending'",
                    rusqlite::params![id_str, ts],
                )?;
                Ok(n)
            })
            .await?;
        Ok(changed == 1)
    }

    /// Running -> Completed|Failed. Returns `false` when the row was not in
    /// Running state, which makes the terminal transition exactly-once under
    /// racing writers (a cancel that landed first wins). Any other target
    /// state is rejected as [`InvalidTransition`] before touching the row.
    pub async fn finish_task(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: Option<String>,
        error: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        if !matches!(status, TaskStatus::Completed | TaskStatus::Failed)
            || !TaskStatus::Running.can_transition_to(&status)
        {
            return Err(InvalidTransition {
                from: TaskStatus::Running,
                to: status,
            }
            .into());
        }
        let id_str = id.to_string();
        let status_str = enum_to_sql(&status);
        let ts = completed_at.to_rfc3339();
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET status = ?2, result = ?3, error = ?4, completed_at = ?5
                     WHERE id = ?1 AND status = 'running'",
                    rusqlite::params![id_str, status_str, result, error, ts],
                )?;
                Ok(n)
            })
            .await?;
        Ok(changed == 1)
    }

    /// Pending|Running -> Cancelled. Returns `false` when already terminal.
    pub async fn cancel_task(&self, id: Uuid, completed_at: DateTime<Utc>) -> Result<bool> {
        let id_str = id.to_string();
        let ts = completed_at.to_rfc3339();
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET status = 'cancelled', completed_at = ?2
                     WHERE id = ?1 AND status IN ('pending', 'running')",
                    rusqlite::params![id_str, ts],
                )?;
                Ok(n)
            })
            .await?;
        Ok(changed == 1)
    }

    // -----------------------------------------------------------------------
    // Project aggregates
    // -----------------------------------------------------------------------

    /// Create the aggregate row if it does not exist yet.
    pub async fn ensure_project(&self, project_ref: &str) -> Result<()> {
        let project_ref = project_ref.to_string();
        let display_name = display_name_for(&project_ref);
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO projects (project_ref, display_name, last_activity_at)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![project_ref, display_name, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_project(&self, project_ref: &str) -> Result<Option<ProjectAggregate>> {
        let project_ref = project_ref.to_string();
        let project = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT project_ref, display_name, completed_count, failed_count,
                            last_activity_at, agent_status, git_branch, dirty_summary
                     FROM projects WHERE project_ref = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_ref])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_project(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(project)
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectAggregate>> {
        let projects = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT project_ref, display_name, completed_count, failed_count,
                            last_activity_at, agent_status, git_branch, dirty_summary
                     FROM projects ORDER BY last_activity_at DESC",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_project(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(projects)
    }

    /// Mark the project's agent busy (creating the row if needed).
    pub async fn mark_project_busy(&self, project_ref: &str) -> Result<()> {
        self.ensure_project(project_ref).await?;
        let project_ref = project_ref.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE projects SET agent_status = 'busy', last_activity_at = ?2
                     WHERE project_ref = ?1",
                    rusqlite::params![project_ref, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn set_project_idle(&self, project_ref: &str) -> Result<()> {
        let project_ref = project_ref.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE projects SET agent_status = 'idle', last_activity_at = ?2
                     WHERE project_ref = ?1",
                    rusqlite::params![project_ref, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Bump the success or failure counter and return the agent to idle.
    ///
    /// The increment is a single UPDATE so concurrent completions cannot
    /// lose updates.
    pub async fn record_task_outcome(&self, project_ref: &str, success: bool) -> Result<()> {
        self.ensure_project(project_ref).await?;
        let project_ref = project_ref.to_string();
        let now = Utc::now().to_rfc3339();
        let sql = if success {
            "UPDATE projects SET completed_count = completed_count + 1,
                    agent_status = 'idle', last_activity_at = ?2
             WHERE project_ref = ?1"
        } else {
            "UPDATE projects SET failed_count = failed_count + 1,
                    agent_status = 'idle', last_activity_at = ?2
             WHERE project_ref = ?1"
        };
        self.conn
            .call(move |conn| {
                conn.execute(sql, rusqlite::params![project_ref, now])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn set_project_vcs(
        &self,
        project_ref: &str,
        git_branch: Option<String>,
        dirty_summary: Option<String>,
    ) -> Result<()> {
        let project_ref = project_ref.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE projects SET git_branch = ?2, dirty_summary = ?3
                     WHERE project_ref = ?1",
                    rusqlite::params![project_ref, git_branch, dirty_summary],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Activity log
    // -----------------------------------------------------------------------

    pub async fn append_activity(
        &self,
        project_ref: Option<&str>,
        task_id: Option<Uuid>,
        event_type: &str,
        details: Option<serde_json::Value>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let project_ref = project_ref.map(|s| s.to_string());
        let task_id = task_id.map(|u| u.to_string());
        let event_type = event_type.to_string();
        let details = details.map(|v| v.to_string());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO activity_log (timestamp, project_ref, task_id, event_type, details)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![now, project_ref, task_id, event_type, details],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Most-recent-first activity entries, optionally filtered by project
    /// and/or event type.
    pub async fn list_activity(
        &self,
        project_ref: Option<&str>,
        event_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ActivityEntry>> {
        let project_ref = project_ref.map(|s| s.to_string());
        let event_type = event_type.map(|s| s.to_string());
        let entries = self
            .conn
            .call(move |conn| {
                let mut sql = String::from(
                    "SELECT id, timestamp, project_ref, task_id, event_type, details
                     FROM activity_log WHERE 1=1",
                );
                let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                if let Some(p) = project_ref {
                    sql.push_str(&format!(" AND project_ref = ?{}", params.len() + 1));
                    params.push(Box::new(p));
                }
                if let Some(e) = event_type {
                    sql.push_str(&format!(" AND event_type = ?{}", params.len() + 1));
                    params.push(Box::new(e));
                }
                sql.push_str(&format!(" ORDER BY id DESC LIMIT ?{}", params.len() + 1));
                params.push(Box::new(limit as i64));

                let mut stmt = conn.prepare(&sql)?;
                let param_refs: Vec<&dyn rusqlite::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();
                let mut rows = stmt.query(param_refs.as_slice())?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_activity(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(entries)
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    /// Save a new template. A duplicate name fails with [`StoreError::Conflict`].
    pub async fn save_template(&self, template: &TaskTemplate) -> Result<()> {
        let name = template.name.clone();
        let description_template = template.description_template.clone();
        let instruction_template = template.instruction_template.clone();
        let default_priority = template.default_priority.as_i64();
        let tags = serde_json::to_string(&template.tags).expect("serialize tags");
        let use_count = template.use_count;
        let created_at = template.created_at.to_rfc3339();

        let conflict_name = template.name.clone();
        let inserted = self
            .conn
            .call(move |conn| {
                // Existence check and insert share one closure, so the pair
                // is atomic on the single store connection.
                let exists: bool = conn
                    .prepare("SELECT 1 FROM templates WHERE name = ?1")?
                    .exists(rusqlite::params![name])?;
                if exists {
                    return Ok(false);
                }
                conn.execute(
                    "INSERT INTO templates (name, description_template, instruction_template,
                        default_priority, tags, use_count, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    rusqlite::params![
                        name,
                        description_template,
                        instruction_template,
                        default_priority,
                        tags,
                        use_count,
                        created_at,
                    ],
                )?;
                Ok(true)
            })
            .await?;
        if inserted {
            Ok(())
        } else {
            Err(StoreError::Conflict(conflict_name))
        }
    }

    pub async fn get_template(&self, name: &str) -> Result<Option<TaskTemplate>> {
        let name = name.to_string();
        let template = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT name, description_template, instruction_template, default_priority,
                            tags, use_count, created_at
                     FROM templates WHERE name = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![name])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_template(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(template)
    }

    pub async fn list_templates(&self) -> Result<Vec<TaskTemplate>> {
        let templates = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name, description_template, instruction_template, default_priority,
                            tags, use_count, created_at
                     FROM templates ORDER BY name ASC",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_template(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(templates)
    }

    /// Bump a template's use counter (one atomic UPDATE). Fails with
    /// [`StoreError::NotFound`] for an unknown name.
    pub async fn increment_template_use(&self, name: &str) -> Result<()> {
        let name_owned = name.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE templates SET use_count = use_count + 1 WHERE name = ?1",
                    rusqlite::params![name_owned],
                )?;
                Ok(n)
            })
            .await?;
        if changed == 1 {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("template '{}'", name)))
        }
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    pub async fn status_counts(&self) -> Result<SystemStats> {
        let stats = self
            .conn
            .call(|conn| {
                let count = |status: &str| -> rusqlite::Result<u64> {
                    let mut stmt =
                        conn.prepare("SELECT COUNT(*) FROM tasks WHERE status = ?1")?;
                    stmt.query_row(rusqlite::params![status], |r| r.get::<_, u64>(0))
                };

                let total: u64 = conn
                    .prepare("SELECT COUNT(*) FROM tasks")?
                    .query_row([], |r| r.get(0))?;
                let projects: u64 = conn
                    .prepare("SELECT COUNT(*) FROM projects")?
                    .query_row([], |r| r.get(0))?;

                Ok(SystemStats {
                    total,
                    pending: count("pending")?,
                    running: count("running")?,
                    completed: count("completed")?,
                    failed: count("failed")?,
                    cancelled: count("cancelled")?,
                    projects,
                })
            })
            .await?;
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(4)?;
    let priority_val: i64 = row.get(5)?;
    let created_at_str: String = row.get(6)?;
    let started_at_str: Option<String> = row.get(7)?;
    let completed_at_str: Option<String> = row.get(8)?;
    let context_str: Option<String> = row.get(11)?;

    Ok(Task {
        id: Uuid::parse_str(&id_str).expect("valid uuid"),
        project_ref: row.get(1)?,
        description: row.get(2)?,
        instruction: row.get(3)?,
        status: enum_from_sql(&status_str),
        priority: TaskPriority::from_i64(priority_val).expect("valid priority"),
        created_at: parse_ts(&created_at_str),
        started_at: started_at_str.map(|s| parse_ts(&s)),
        completed_at: completed_at_str.map(|s| parse_ts(&s)),
        result: row.get(9)?,
        error: row.get(10)?,
        context: context_str
            .map(|s| {
                serde_json::from_str::<serde_json::Value>(&s)
                    .ok()
                    .and_then(|v| v.as_object().cloned())
                    .unwrap_or_default()
            })
            .unwrap_or_default(),
    })
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectAggregate> {
    let last_activity_str: String = row.get(4)?;
    let agent_status_str: String = row.get(5)?;

    Ok(ProjectAggregate {
        project_ref: row.get(0)?,
        display_name: row.get(1)?,
        completed_count: row.get(2)?,
        failed_count: row.get(3)?,
        last_activity_at: parse_ts(&last_activity_str),
        agent_status: enum_from_sql::<AgentStatus>(&agent_status_str),
        git_branch: row.get(6)?,
        dirty_summary: row.get(7)?,
    })
}

fn row_to_activity(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActivityEntry> {
    let timestamp_str: String = row.get(1)?;
    let task_id_str: Option<String> = row.get(3)?;
    let details_str: Option<String> = row.get(5)?;

    Ok(ActivityEntry {
        id: row.get(0)?,
        timestamp: parse_ts(&timestamp_str),
        project_ref: row.get(2)?,
        task_id: task_id_str.map(|s| Uuid::parse_str(&s).expect("valid uuid")),
        event_type: row.get(4)?,
        details: details_str.map(|s| serde_json::from_str(&s).expect("valid json")),
    })
}

fn row_to_template(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskTemplate> {
    let priority_val: i64 = row.get(3)?;
    let tags_str: String = row.get(4)?;
    let created_at_str: String = row.get(6)?;

    Ok(TaskTemplate {
        name: row.get(0)?,
        description_template: row.get(1)?,
        instruction_template: row.get(2)?,
        default_priority: TaskPriority::from_i64(priority_val).expect("valid priority"),
        tags: serde_json::from_str(&tags_str).expect("valid json"),
        use_count: row.get(5)?,
        created_at: parse_ts(&created_at_str),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
