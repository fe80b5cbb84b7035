use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Params, Row, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::allocator::{CommitOutcome, CounterStore, EntitySlugState, RetryPolicy, SlugAllocator};
use super::models::*;
use super::slug::{Slug, classify, normalize_key, normalize_slug, suggest_key};
use crate::errors::{BoardError, BoardResult};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Async-safe handle to the agency database.
///
/// Wraps `AgencyDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so SQLite I/O and allocator
/// backoff sleeps never tie up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<AgencyDb>>,
}

impl DbHandle {
    pub fn new(db: AgencyDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> BoardResult<R>
    where
        F: FnOnce(&AgencyDb) -> BoardResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup, CLI
    /// commands and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, AgencyDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Row counts removed by a cascading delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeSummary {
    pub projects: usize,
    pub sprints: usize,
    pub tasks: usize,
}

/// Fields for a new task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub priority: Option<Priority>,
    pub sprint_id: Option<i64>,
    pub due_date: Option<String>,
}

const CLIENT_COLUMNS: &str = "id, name, project_key, created_at";
const OWNER_CLIENT_COLUMNS: &str = "c.id, c.name, c.project_key, c.created_at";
const COUNTER_COLUMNS: &str = "id, key, last_task_number, last_sprint_number, last_project_number, owner_id, description, is_default, is_active";
const PROJECT_COLUMNS: &str =
    "id, client_id, name, description, status, slug, slug_key, slug_number, created_at";
const SPRINT_COLUMNS: &str = "id, project_id, name, status, start_date, end_date, slug, slug_key, slug_number, created_at";
const TASK_COLUMNS: &str = "id, project_id, sprint_id, title, description, status, priority, due_date, slug, slug_key, slug_number, created_at, updated_at";

pub struct AgencyDb {
    conn: Connection,
    slug_policy: RetryPolicy,
}

impl AgencyDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        Self::open(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open a file-backed database in WAL mode. Several `AgencyDb`s may share
    /// one file; the slug allocator's compare-and-set keeps numbering unique
    /// across them.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
        conn.busy_timeout(busy_timeout)
            .context("Failed to set busy timeout")?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("Failed to enable WAL journal mode")?;
        debug!(path = %path.display(), journal_mode = %mode, "opened database");
        let db = Self {
            conn,
            slug_policy: RetryPolicy::default(),
        };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self {
            conn,
            slug_policy: RetryPolicy::default(),
        };
        db.init()?;
        Ok(db)
    }

    pub fn with_slug_policy(mut self, policy: RetryPolicy) -> Self {
        self.slug_policy = policy;
        self
    }

    pub fn slug_policy(&self) -> RetryPolicy {
        self.slug_policy
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS clients (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    project_key TEXT UNIQUE,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS project_keys (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    key TEXT NOT NULL UNIQUE,
                    last_task_number INTEGER NOT NULL DEFAULT 0 CHECK (last_task_number >= 0),
                    last_sprint_number INTEGER NOT NULL DEFAULT 0 CHECK (last_sprint_number >= 0),
                    last_project_number INTEGER NOT NULL DEFAULT 0 CHECK (last_project_number >= 0),
                    owner_id INTEGER REFERENCES clients(id) ON DELETE SET NULL,
                    description TEXT NOT NULL DEFAULT '',
                    is_default INTEGER NOT NULL DEFAULT 1,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    client_id INTEGER NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'planning',
                    slug TEXT,
                    slug_key TEXT,
                    slug_number INTEGER,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS sprints (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'planned',
                    start_date TEXT,
                    end_date TEXT,
                    slug TEXT,
                    slug_key TEXT,
                    slug_number INTEGER,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    sprint_id INTEGER REFERENCES sprints(id) ON DELETE SET NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'todo',
                    priority TEXT NOT NULL DEFAULT 'medium',
                    due_date TEXT,
                    slug TEXT,
                    slug_key TEXT,
                    slug_number INTEGER,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_project_keys_owner ON project_keys(owner_id);
                CREATE INDEX IF NOT EXISTS idx_projects_client ON projects(client_id);
                CREATE INDEX IF NOT EXISTS idx_sprints_project ON sprints(project_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_sprint ON tasks(sprint_id);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_projects_slug ON projects(slug) WHERE slug IS NOT NULL;
                CREATE UNIQUE INDEX IF NOT EXISTS idx_sprints_slug ON sprints(slug) WHERE slug IS NOT NULL;
                CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_slug ON tasks(slug) WHERE slug IS NOT NULL;
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Query helpers ─────────────────────────────────────────────────

    fn query_one<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.conn
            .query_row(sql, params, map)
            .optional()
            .with_context(|| format!("Query failed: {}", sql))
    }

    fn query_all<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self
            .conn
            .prepare(sql)
            .with_context(|| format!("Failed to prepare: {}", sql))?;
        let rows = stmt.query_map(params, map)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read row")?);
        }
        Ok(out)
    }

    // ── Client CRUD ───────────────────────────────────────────────────

    pub fn create_client(&self, name: &str, project_key: Option<&str>) -> BoardResult<Client> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BoardError::BadRequest("Client name must not be empty".into()));
        }
        self.conn
            .execute("INSERT INTO clients (name) VALUES (?1)", params![name])
            .context("Failed to insert client")?;
        let id = self.conn.last_insert_rowid();
        info!(client_id = id, name, "created client");

        match project_key {
            Some(key) => match self.set_client_key(id, key) {
                Ok(client) => Ok(client),
                Err(e) => {
                    self.conn
                        .execute("DELETE FROM clients WHERE id = ?1", params![id])
                        .context("Failed to roll back client insert")?;
                    Err(e)
                }
            },
            None => self.require_client(id),
        }
    }

    pub fn list_clients(&self) -> Result<Vec<Client>> {
        self.query_all(
            &format!("SELECT {CLIENT_COLUMNS} FROM clients ORDER BY id"),
            [],
            client_from_row,
        )
    }

    pub fn get_client(&self, id: i64) -> Result<Option<Client>> {
        self.query_one(
            &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = ?1"),
            params![id],
            client_from_row,
        )
    }

    fn require_client(&self, id: i64) -> BoardResult<Client> {
        self.get_client(id)?
            .ok_or(BoardError::ClientNotFound { id })
    }

    pub fn get_client_detail(&self, id: i64) -> BoardResult<ClientDetail> {
        let client = self.require_client(id)?;
        let projects = self.list_projects(id)?;
        let counters = self.query_all(
            &format!("SELECT {COUNTER_COLUMNS} FROM project_keys WHERE owner_id = ?1 ORDER BY id"),
            params![id],
            counter_from_row,
        )?;
        Ok(ClientDetail {
            client,
            projects,
            counters,
        })
    }

    /// Assign (or change) a client's project key and make sure its counter
    /// record exists. A key whose counter is detached from a deleted client is
    /// re-adopted so numbering continues where it stopped.
    pub fn set_client_key(&self, client_id: i64, raw_key: &str) -> BoardResult<Client> {
        let client = self.require_client(client_id)?;
        let key = normalize_key(raw_key)?;

        let taken_by_client: Option<i64> = self.query_one(
            "SELECT id FROM clients WHERE project_key = ?1 AND id != ?2",
            params![key, client_id],
            |row| row.get(0),
        )?;
        let counter = self.find_counter(&key)?;
        let taken_by_counter = counter
            .as_ref()
            .and_then(|c| c.owner_id)
            .is_some_and(|owner| owner != client_id);
        if taken_by_client.is_some() || taken_by_counter {
            return Err(BoardError::KeyTaken { key });
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        // Another connection may claim the key between the check above and
        // this write; the UNIQUE index on clients.project_key catches it.
        match tx.execute(
            "UPDATE clients SET project_key = ?1 WHERE id = ?2",
            params![key, client_id],
        ) {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(BoardError::KeyTaken { key });
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context("Failed to update client key")
                    .into());
            }
        }
        tx.execute(
            "UPDATE project_keys SET is_default = 0 WHERE owner_id = ?1 AND key != ?2",
            params![client_id, key],
        )
        .context("Failed to clear previous default key")?;
        if counter.is_some() {
            tx.execute(
                "UPDATE project_keys SET owner_id = ?1, is_active = 1, is_default = 1 WHERE key = ?2",
                params![client_id, key],
            )
            .context("Failed to adopt counter record")?;
        }
        tx.commit().context("Failed to commit client key")?;

        let allocator = SlugAllocator::new(self, self.slug_policy);
        allocator.resolve_counter(&key, Some(client_id), &format!("Slug numbering for {}", client.name))?;
        info!(client_id, key = %key, "set client project key");
        self.require_client(client_id)
    }

    /// Propose a key for `name` that no client or counter record uses yet.
    pub fn suggest_available_key(&self, name: &str) -> Result<Option<String>> {
        let Some(base) = suggest_key(name) else {
            return Ok(None);
        };
        for suffix in 1..100 {
            let candidate = if suffix == 1 {
                base.clone()
            } else {
                let mut stem = base.clone();
                let digits = suffix.to_string();
                stem.truncate(super::slug::MAX_KEY_LEN - digits.len());
                stem + &digits
            };
            let in_use: bool = self.conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM clients WHERE project_key = ?1)
                     OR EXISTS(SELECT 1 FROM project_keys WHERE key = ?1)",
                params![candidate],
                |row| row.get(0),
            )?;
            if !in_use {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Delete a client with its projects, sprints and tasks. Counter records
    /// are detached and deactivated, never deleted, so slugs are not reissued.
    pub fn delete_client(&self, id: i64) -> BoardResult<CascadeSummary> {
        self.require_client(id)?;
        let summary = self.cascade_counts("p.client_id = ?1", id)?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "UPDATE project_keys SET is_active = 0 WHERE owner_id = ?1",
            params![id],
        )
        .context("Failed to deactivate counter records")?;
        tx.execute("DELETE FROM clients WHERE id = ?1", params![id])
            .context("Failed to delete client")?;
        tx.commit().context("Failed to commit client delete")?;

        info!(client_id = id, projects = summary.projects, sprints = summary.sprints, tasks = summary.tasks, "deleted client");
        Ok(summary)
    }

    fn cascade_counts(&self, project_filter: &str, id: i64) -> Result<CascadeSummary> {
        let count = |sql: String| -> Result<usize> {
            let n: i64 = self.conn.query_row(&sql, params![id], |row| row.get(0))?;
            Ok(usize::try_from(n).unwrap_or(0))
        };
        Ok(CascadeSummary {
            projects: count(format!("SELECT COUNT(*) FROM projects p WHERE {project_filter}"))?,
            sprints: count(format!(
                "SELECT COUNT(*) FROM sprints s JOIN projects p ON p.id = s.project_id WHERE {project_filter}"
            ))?,
            tasks: count(format!(
                "SELECT COUNT(*) FROM tasks t JOIN projects p ON p.id = t.project_id WHERE {project_filter}"
            ))?,
        })
    }

    // ── Project CRUD ──────────────────────────────────────────────────

    pub fn create_project(
        &self,
        client_id: i64,
        name: &str,
        description: &str,
    ) -> BoardResult<Project> {
        let client = self.require_client(client_id)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(BoardError::BadRequest("Project name must not be empty".into()));
        }
        self.conn
            .execute(
                "INSERT INTO projects (client_id, name, description) VALUES (?1, ?2, ?3)",
                params![client_id, name, description],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.assign_new_slug(EntityKind::Project, id, &client)?;
        self.require_project(id)
    }

    pub fn list_projects(&self, client_id: i64) -> Result<Vec<Project>> {
        self.query_all(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE client_id = ?1 ORDER BY id"),
            params![client_id],
            project_from_row,
        )
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.query_one(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
            params![id],
            project_from_row,
        )
    }

    fn require_project(&self, id: i64) -> BoardResult<Project> {
        self.get_project(id)?
            .ok_or(BoardError::ProjectNotFound { id })
    }

    pub fn update_project_status(&self, id: i64, status: ProjectStatus) -> BoardResult<Project> {
        let count = self
            .conn
            .execute(
                "UPDATE projects SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update project status")?;
        if count == 0 {
            return Err(BoardError::ProjectNotFound { id });
        }
        self.require_project(id)
    }

    /// Delete a project with its sprints and tasks.
    pub fn delete_project(&self, id: i64) -> BoardResult<CascadeSummary> {
        self.require_project(id)?;
        let summary = self.cascade_counts("p.id = ?1", id)?;
        self.conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .context("Failed to delete project")?;
        info!(project_id = id, sprints = summary.sprints, tasks = summary.tasks, "deleted project");
        Ok(summary)
    }

    // ── Sprint CRUD ───────────────────────────────────────────────────

    pub fn create_sprint(
        &self,
        project_id: i64,
        name: &str,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> BoardResult<Sprint> {
        let client = self
            .owner_client(EntityKind::Project, project_id)?
            .ok_or(BoardError::ProjectNotFound { id: project_id })?;
        let name = name.trim();
        if name.is_empty() {
            return Err(BoardError::BadRequest("Sprint name must not be empty".into()));
        }
        let start = start_date.map(parse_date).transpose()?;
        let end = end_date.map(parse_date).transpose()?;
        if let (Some(s), Some(e)) = (start, end)
            && e < s
        {
            return Err(BoardError::BadRequest(format!(
                "Sprint ends ({}) before it starts ({})",
                e, s
            )));
        }

        self.conn
            .execute(
                "INSERT INTO sprints (project_id, name, start_date, end_date) VALUES (?1, ?2, ?3, ?4)",
                params![
                    project_id,
                    name,
                    start.map(|d| d.to_string()),
                    end.map(|d| d.to_string())
                ],
            )
            .context("Failed to insert sprint")?;
        let id = self.conn.last_insert_rowid();
        self.assign_new_slug(EntityKind::Sprint, id, &client)?;
        self.require_sprint(id)
    }

    pub fn list_sprints(&self, project_id: i64) -> Result<Vec<Sprint>> {
        self.query_all(
            &format!("SELECT {SPRINT_COLUMNS} FROM sprints WHERE project_id = ?1 ORDER BY id"),
            params![project_id],
            sprint_from_row,
        )
    }

    pub fn get_sprint(&self, id: i64) -> Result<Option<Sprint>> {
        self.query_one(
            &format!("SELECT {SPRINT_COLUMNS} FROM sprints WHERE id = ?1"),
            params![id],
            sprint_from_row,
        )
    }

    fn require_sprint(&self, id: i64) -> BoardResult<Sprint> {
        self.get_sprint(id)?
            .ok_or(BoardError::SprintNotFound { id })
    }

    pub fn update_sprint_status(&self, id: i64, status: SprintStatus) -> BoardResult<Sprint> {
        let count = self
            .conn
            .execute(
                "UPDATE sprints SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update sprint status")?;
        if count == 0 {
            return Err(BoardError::SprintNotFound { id });
        }
        self.require_sprint(id)
    }

    /// Delete a sprint. Its tasks stay in the project backlog.
    pub fn delete_sprint(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM sprints WHERE id = ?1", params![id])
            .context("Failed to delete sprint")?;
        Ok(count > 0)
    }

    // ── Task CRUD ─────────────────────────────────────────────────────

    pub fn create_task(&self, project_id: i64, new: NewTask) -> BoardResult<Task> {
        let client = self
            .owner_client(EntityKind::Project, project_id)?
            .ok_or(BoardError::ProjectNotFound { id: project_id })?;
        let title = new.title.trim();
        if title.is_empty() {
            return Err(BoardError::BadRequest("Task title must not be empty".into()));
        }
        if let Some(sprint_id) = new.sprint_id {
            self.check_sprint_in_project(sprint_id, project_id)?;
        }
        let due_date = new.due_date.as_deref().map(parse_date).transpose()?;
        let priority = new.priority.unwrap_or(Priority::Medium);

        self.conn
            .execute(
                "INSERT INTO tasks (project_id, sprint_id, title, description, priority, due_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    project_id,
                    new.sprint_id,
                    title,
                    new.description,
                    priority.as_str(),
                    due_date.map(|d| d.to_string())
                ],
            )
            .context("Failed to insert task")?;
        let id = self.conn.last_insert_rowid();
        self.assign_new_slug(EntityKind::Task, id, &client)?;
        self.require_task(id)
    }

    pub fn list_tasks(&self, project_id: i64) -> Result<Vec<Task>> {
        self.query_all(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE project_id = ?1 ORDER BY id"),
            params![project_id],
            task_from_row,
        )
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        self.query_one(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
            task_from_row,
        )
    }

    fn require_task(&self, id: i64) -> BoardResult<Task> {
        self.get_task(id)?.ok_or(BoardError::TaskNotFound { id })
    }

    pub fn update_task(&self, id: i64, update: TaskUpdate) -> BoardResult<Task> {
        let task = self.require_task(id)?;
        if let Some(Some(sprint_id)) = update.sprint_id {
            self.check_sprint_in_project(sprint_id, task.project_id)?;
        }
        let due_date = match &update.due_date {
            Some(Some(raw)) => Some(Some(parse_date(raw)?.to_string())),
            Some(None) => Some(None),
            None => None,
        };
        if let Some(title) = &update.title
            && title.trim().is_empty()
        {
            return Err(BoardError::BadRequest("Task title must not be empty".into()));
        }

        // Use unchecked_transaction so all updates are atomic.
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(title) = &update.title {
            touch_task(&tx, id, "title", &title.trim())?;
        }
        if let Some(description) = &update.description {
            touch_task(&tx, id, "description", description)?;
        }
        if let Some(status) = update.status {
            touch_task(&tx, id, "status", &status.as_str())?;
        }
        if let Some(priority) = update.priority {
            touch_task(&tx, id, "priority", &priority.as_str())?;
        }
        if let Some(sprint_id) = update.sprint_id {
            touch_task(&tx, id, "sprint_id", &sprint_id)?;
        }
        if let Some(due_date) = due_date {
            touch_task(&tx, id, "due_date", &due_date)?;
        }
        tx.commit().context("Failed to commit task update")?;
        self.require_task(id)
    }

    pub fn delete_task(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .context("Failed to delete task")?;
        Ok(count > 0)
    }

    fn check_sprint_in_project(&self, sprint_id: i64, project_id: i64) -> BoardResult<()> {
        let sprint = self.require_sprint(sprint_id)?;
        if sprint.project_id != project_id {
            return Err(BoardError::BadRequest(format!(
                "Sprint {} belongs to project {}, not {}",
                sprint_id, sprint.project_id, project_id
            )));
        }
        Ok(())
    }

    // ── Board view ────────────────────────────────────────────────────

    pub fn get_project_board(&self, project_id: i64) -> BoardResult<ProjectBoard> {
        let project = self.require_project(project_id)?;
        let sprints = self.list_sprints(project_id)?;
        let tasks = self.list_tasks(project_id)?;

        let columns = TaskStatus::ALL
            .iter()
            .map(|status| TaskColumn {
                status: *status,
                tasks: tasks.iter().filter(|t| t.status == *status).cloned().collect(),
            })
            .collect();

        Ok(ProjectBoard {
            project,
            sprints,
            columns,
        })
    }

    // ── Slugs ─────────────────────────────────────────────────────────

    /// Client owning the entity, or `None` if the entity does not exist.
    fn owner_client(&self, kind: EntityKind, id: i64) -> Result<Option<Client>> {
        let sql = match kind {
            EntityKind::Project => format!(
                "SELECT {OWNER_CLIENT_COLUMNS} FROM projects p
                 JOIN clients c ON c.id = p.client_id WHERE p.id = ?1"
            ),
            EntityKind::Sprint => format!(
                "SELECT {OWNER_CLIENT_COLUMNS} FROM sprints s
                 JOIN projects p ON p.id = s.project_id
                 JOIN clients c ON c.id = p.client_id WHERE s.id = ?1"
            ),
            EntityKind::Task => format!(
                "SELECT {OWNER_CLIENT_COLUMNS} FROM tasks t
                 JOIN projects p ON p.id = t.project_id
                 JOIN clients c ON c.id = p.client_id WHERE t.id = ?1"
            ),
        };
        self.query_one(&sql, params![id], client_from_row)
    }

    /// Slug assignment for a freshly inserted entity. Clients without a key
    /// leave the entity slug-less for a later backfill; any other failure
    /// removes the row so keyed clients never hold slug-less entities.
    fn assign_new_slug(&self, kind: EntityKind, id: i64, client: &Client) -> BoardResult<()> {
        let Some(key) = client.project_key.as_deref() else {
            debug!(kind = %kind, entity_id = id, client_id = client.id, "client has no project key, slug deferred");
            return Ok(());
        };
        let allocator = SlugAllocator::new(self, self.slug_policy);
        match allocator.allocate(kind, id, key, Some(client.id)) {
            Ok(slug) => {
                info!(kind = %kind, entity_id = id, slug = %slug, "created entity");
                Ok(())
            }
            Err(e) => {
                warn!(kind = %kind, entity_id = id, error = %e, "slug allocation failed, removing entity");
                self.conn
                    .execute(
                        &format!("DELETE FROM {} WHERE id = ?1", kind.table()),
                        params![id],
                    )
                    .context("Failed to remove entity after slug failure")?;
                Err(e.into())
            }
        }
    }

    /// Assign a slug to an existing entity, or return the one it has.
    pub fn allocate_slug(&self, kind: EntityKind, entity_id: i64) -> BoardResult<Slug> {
        let client = self
            .owner_client(kind, entity_id)?
            .ok_or_else(|| not_found_for(kind, entity_id))?;
        let key = client.project_key.as_deref().ok_or_else(|| {
            BoardError::BadRequest(format!("Client {} has no project key", client.id))
        })?;
        let allocator = SlugAllocator::new(self, self.slug_policy);
        Ok(allocator.allocate(kind, entity_id, key, Some(client.id))?)
    }

    /// Resolve a user-supplied slug to its entity.
    pub fn resolve_slug(&self, raw: &str, hint: Option<EntityKind>) -> Result<Option<SlugTarget>> {
        let slug = normalize_slug(raw);
        if slug.is_empty() {
            return Ok(None);
        }
        if let Some(kind) = hint.or_else(|| classify(&slug)) {
            return self.find_by_slug(kind, &slug);
        }
        for kind in [EntityKind::Task, EntityKind::Project, EntityKind::Sprint] {
            if let Some(target) = self.find_by_slug(kind, &slug)? {
                return Ok(Some(target));
            }
        }
        Ok(None)
    }

    fn find_by_slug(&self, kind: EntityKind, slug: &str) -> Result<Option<SlugTarget>> {
        Ok(match kind {
            EntityKind::Task => self
                .query_one(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE slug = ?1"),
                    params![slug],
                    task_from_row,
                )?
                .map(SlugTarget::Task),
            EntityKind::Sprint => self
                .query_one(
                    &format!("SELECT {SPRINT_COLUMNS} FROM sprints WHERE slug = ?1"),
                    params![slug],
                    sprint_from_row,
                )?
                .map(SlugTarget::Sprint),
            EntityKind::Project => self
                .query_one(
                    &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE slug = ?1"),
                    params![slug],
                    project_from_row,
                )?
                .map(SlugTarget::Project),
        })
    }

    /// Allocate slugs for every slug-less entity whose client now has a key.
    /// Projects go first, then sprints, then tasks, each oldest first.
    pub fn backfill_slugs(&self) -> Result<BackfillReport> {
        let mut pending: Vec<(EntityKind, i64)> = Vec::new();
        for kind in [EntityKind::Project, EntityKind::Sprint, EntityKind::Task] {
            let sql = match kind {
                EntityKind::Project => "SELECT p.id FROM projects p
                     JOIN clients c ON c.id = p.client_id
                     WHERE (p.slug IS NULL OR p.slug = '') AND c.project_key IS NOT NULL
                     ORDER BY p.id"
                    .to_string(),
                EntityKind::Sprint => "SELECT s.id FROM sprints s
                     JOIN projects p ON p.id = s.project_id
                     JOIN clients c ON c.id = p.client_id
                     WHERE (s.slug IS NULL OR s.slug = '') AND c.project_key IS NOT NULL
                     ORDER BY s.id"
                    .to_string(),
                EntityKind::Task => "SELECT t.id FROM tasks t
                     JOIN projects p ON p.id = t.project_id
                     JOIN clients c ON c.id = p.client_id
                     WHERE (t.slug IS NULL OR t.slug = '') AND c.project_key IS NOT NULL
                     ORDER BY t.id"
                    .to_string(),
            };
            let ids: Vec<i64> = self.query_all(&sql, [], |row| row.get(0))?;
            pending.extend(ids.into_iter().map(|id| (kind, id)));
        }

        let mut report = BackfillReport {
            scanned: pending.len(),
            ..Default::default()
        };
        for (kind, entity_id) in pending {
            match self.allocate_slug(kind, entity_id) {
                Ok(slug) => report.assigned.push(slug.slug),
                Err(e) => {
                    warn!(kind = %kind, entity_id, error = %e, "backfill allocation failed");
                    report.failed.push(BackfillFailure {
                        kind,
                        entity_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        info!(
            scanned = report.scanned,
            assigned = report.assigned.len(),
            failed = report.failed.len(),
            "slug backfill finished"
        );
        Ok(report)
    }

    pub fn list_counters(&self) -> Result<Vec<CounterRecord>> {
        self.query_all(
            &format!("SELECT {COUNTER_COLUMNS} FROM project_keys ORDER BY key"),
            [],
            counter_from_row,
        )
    }
}

// ── Counter store ─────────────────────────────────────────────────────

impl CounterStore for AgencyDb {
    fn find_counter(&self, key: &str) -> Result<Option<CounterRecord>> {
        self.query_one(
            &format!("SELECT {COUNTER_COLUMNS} FROM project_keys WHERE key = ?1"),
            params![key],
            counter_from_row,
        )
    }

    fn insert_counter(&self, new: &NewCounter<'_>) -> Result<bool> {
        // The UNIQUE index on `key` makes a racing creator a no-op.
        let count = self
            .conn
            .execute(
                "INSERT INTO project_keys (key, owner_id, description) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO NOTHING",
                params![new.key, new.owner_id, new.description],
            )
            .context("Failed to insert counter record")?;
        Ok(count == 1)
    }

    fn load_counter(&self, id: i64) -> Result<Option<CounterRecord>> {
        self.query_one(
            &format!("SELECT {COUNTER_COLUMNS} FROM project_keys WHERE id = ?1"),
            params![id],
            counter_from_row,
        )
    }

    fn entity_slug(&self, kind: EntityKind, entity_id: i64) -> Result<EntitySlugState> {
        read_entity_slug(&self.conn, kind, entity_id)
    }

    fn commit_allocation(
        &self,
        counter_id: i64,
        kind: EntityKind,
        expected_last: i64,
        entity_id: i64,
        slug: &Slug,
    ) -> Result<CommitOutcome> {
        let column = kind.counter_column();
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin allocation transaction")?;

        let advanced = tx
            .execute(
                &format!("UPDATE project_keys SET {column} = ?1 WHERE id = ?2 AND {column} = ?3"),
                params![slug.number, counter_id, expected_last],
            )
            .context("Failed to advance counter")?;
        if advanced == 0 {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM project_keys WHERE id = ?1)",
                params![counter_id],
                |row| row.get(0),
            )?;
            // Dropping `tx` rolls back.
            return Ok(if exists {
                CommitOutcome::Conflict
            } else {
                CommitOutcome::CounterMissing
            });
        }

        let stamped = tx
            .execute(
                &format!(
                    "UPDATE {} SET slug = ?1, slug_key = ?2, slug_number = ?3
                     WHERE id = ?4 AND (slug IS NULL OR slug = '')",
                    kind.table()
                ),
                params![slug.slug, slug.key, slug.number, entity_id],
            )
            .context("Failed to write entity slug")?;
        if stamped == 0 {
            return Ok(match read_entity_slug(&tx, kind, entity_id)? {
                EntitySlugState::Assigned(existing) => CommitOutcome::AlreadyAssigned(existing),
                EntitySlugState::Missing | EntitySlugState::Unassigned => {
                    CommitOutcome::EntityMissing
                }
            });
        }

        tx.commit().context("Failed to commit slug allocation")?;
        Ok(CommitOutcome::Committed)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

fn read_entity_slug(conn: &Connection, kind: EntityKind, entity_id: i64) -> Result<EntitySlugState> {
    let row: Option<(Option<String>, Option<String>, Option<i64>)> = conn
        .query_row(
            &format!(
                "SELECT slug, slug_key, slug_number FROM {} WHERE id = ?1",
                kind.table()
            ),
            params![entity_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .context("Failed to read entity slug")?;
    Ok(match row {
        None => EntitySlugState::Missing,
        Some((Some(slug), Some(key), Some(number))) if !slug.is_empty() => {
            EntitySlugState::Assigned(Slug { slug, key, number })
        }
        Some(_) => EntitySlugState::Unassigned,
    })
}

fn touch_task(tx: &Transaction<'_>, id: i64, column: &str, value: &dyn rusqlite::ToSql) -> Result<()> {
    tx.execute(
        &format!("UPDATE tasks SET {column} = ?1, updated_at = datetime('now') WHERE id = ?2"),
        params![value, id],
    )
    .with_context(|| format!("Failed to update task {}", column))?;
    Ok(())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn parse_date(raw: &str) -> BoardResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| BoardError::BadRequest(format!("Invalid date '{}': {}", raw, e)))
}

fn not_found_for(kind: EntityKind, id: i64) -> BoardError {
    match kind {
        EntityKind::Task => BoardError::TaskNotFound { id },
        EntityKind::Sprint => BoardError::SprintNotFound { id },
        EntityKind::Project => BoardError::ProjectNotFound { id },
    }
}

fn parse_col<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn client_from_row(row: &Row<'_>) -> rusqlite::Result<Client> {
    Ok(Client {
        id: row.get(0)?,
        name: row.get(1)?,
        project_key: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn counter_from_row(row: &Row<'_>) -> rusqlite::Result<CounterRecord> {
    Ok(CounterRecord {
        id: row.get(0)?,
        key: row.get(1)?,
        last_task_number: row.get(2)?,
        last_sprint_number: row.get(3)?,
        last_project_number: row.get(4)?,
        owner_id: row.get(5)?,
        description: row.get(6)?,
        is_default: row.get(7)?,
        is_active: row.get(8)?,
    })
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        client_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        status: parse_col(row, 4)?,
        slug: row.get(5)?,
        slug_key: row.get(6)?,
        slug_number: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn sprint_from_row(row: &Row<'_>) -> rusqlite::Result<Sprint> {
    Ok(Sprint {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        status: parse_col(row, 3)?,
        start_date: row.get(4)?,
        end_date: row.get(5)?,
        slug: row.get(6)?,
        slug_key: row.get(7)?,
        slug_number: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        sprint_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        status: parse_col(row, 5)?,
        priority: parse_col(row, 6)?,
        due_date: row.get(7)?,
        slug: row.get(8)?,
        slug_key: row.get(9)?,
        slug_number: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────
