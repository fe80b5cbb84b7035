use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Entity kinds ──────────────────────────────────────────────────────

/// The three entity kinds that carry a slug, each numbered by its own
/// counter on the client's `project_keys` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Sprint,
    Project,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Sprint => "sprint",
            Self::Project => "project",
        }
    }

    /// Column on `project_keys` holding the last number issued for this kind.
    pub(crate) fn counter_column(&self) -> &'static str {
        match self {
            Self::Task => "last_task_number",
            Self::Sprint => "last_sprint_number",
            Self::Project => "last_project_number",
        }
    }

    /// Table holding entities of this kind.
    pub(crate) fn table(&self) -> &'static str {
        match self {
            Self::Task => "tasks",
            Self::Sprint => "sprints",
            Self::Project => "projects",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "task" => Ok(Self::Task),
            "sprint" => Ok(Self::Sprint),
            "project" => Ok(Self::Project),
            _ => Err(format!("Invalid entity kind: {}", s)),
        }
    }
}

// ── Counter records ───────────────────────────────────────────────────

/// Per-key numbering state. One row per tenant key, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub id: i64,
    pub key: String,
    pub last_task_number: i64,
    pub last_sprint_number: i64,
    pub last_project_number: i64,
    pub owner_id: Option<i64>,
    pub description: String,
    pub is_default: bool,
    pub is_active: bool,
}

impl CounterRecord {
    pub fn last_number(&self, kind: EntityKind) -> i64 {
        match kind {
            EntityKind::Task => self.last_task_number,
            EntityKind::Sprint => self.last_sprint_number,
            EntityKind::Project => self.last_project_number,
        }
    }
}

/// Fields needed to lazily create a counter record for a key.
#[derive(Debug, Clone)]
pub struct NewCounter<'a> {
    pub key: &'a str,
    pub owner_id: Option<i64>,
    pub description: &'a str,
}

// ── Clients ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub name: String,
    pub project_key: Option<String>,
    pub created_at: String,
}

// ── Projects ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Planning,
    Active,
    OnHold,
    Completed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Active => "active",
            Self::OnHold => "on_hold",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "active" => Ok(Self::Active),
            "on_hold" => Ok(Self::OnHold),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub client_id: i64,
    pub name: String,
    pub description: String,
    pub status: ProjectStatus,
    pub slug: Option<String>,
    pub slug_key: Option<String>,
    pub slug_number: Option<i64>,
    pub created_at: String,
}

// ── Sprints ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SprintStatus {
    Planned,
    Active,
    Completed,
}

impl SprintStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for SprintStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(Self::Planned),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid sprint status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sprint {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub status: SprintStatus,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub slug: Option<String>,
    pub slug_key: Option<String>,
    pub slug_number: Option<i64>,
    pub created_at: String,
}

// ── Tasks ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Review,
    Done,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [Self::Todo, Self::InProgress, Self::Review, Self::Done];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub project_id: i64,
    pub sprint_id: Option<i64>,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub due_date: Option<String>,
    pub slug: Option<String>,
    pub slug_key: Option<String>,
    pub slug_number: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

/// Optional field changes for a task. `None` leaves a field untouched;
/// `sprint_id: Some(None)` moves the task back to the backlog.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub sprint_id: Option<Option<i64>>,
    pub due_date: Option<Option<String>>,
}

// ── Slug lookup result ────────────────────────────────────────────────

/// An entity resolved from a slug string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entity", rename_all = "snake_case")]
pub enum SlugTarget {
    Task(Task),
    Sprint(Sprint),
    Project(Project),
}

impl SlugTarget {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Task(_) => EntityKind::Task,
            Self::Sprint(_) => EntityKind::Sprint,
            Self::Project(_) => EntityKind::Project,
        }
    }

    pub fn slug(&self) -> Option<&str> {
        match self {
            Self::Task(t) => t.slug.as_deref(),
            Self::Sprint(s) => s.slug.as_deref(),
            Self::Project(p) => p.slug.as_deref(),
        }
    }
}

// ── Backfill ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillFailure {
    pub kind: EntityKind,
    pub entity_id: i64,
    pub error: String,
}

/// Outcome of re-running slug allocation over slug-less entities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackfillReport {
    pub scanned: usize,
    pub assigned: Vec<String>,
    pub failed: Vec<BackfillFailure>,
}

// API view types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectBoard {
    pub project: Project,
    pub sprints: Vec<Sprint>,
    pub columns: Vec<TaskColumn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskColumn {
    pub status: TaskStatus,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDetail {
    #[serde(flatten)]
    pub client: Client,
    pub projects: Vec<Project>,
    pub counters: Vec<CounterRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_roundtrips_through_str() {
        for kind in [EntityKind::Task, EntityKind::Sprint, EntityKind::Project] {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert_eq!(" Sprint ".parse::<EntityKind>().unwrap(), EntityKind::Sprint);
        assert!("epic".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_counter_record_last_number_selects_field() {
        let record = CounterRecord {
            id: 1,
            key: "ACME".into(),
            last_task_number: 12,
            last_sprint_number: 3,
            last_project_number: 2,
            owner_id: Some(1),
            description: String::new(),
            is_default: true,
            is_active: true,
        };
        assert_eq!(record.last_number(EntityKind::Task), 12);
        assert_eq!(record.last_number(EntityKind::Sprint), 3);
        assert_eq!(record.last_number(EntityKind::Project), 2);
    }

    #[test]
    fn test_task_status_rejects_unknown() {
        assert_eq!("in_progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
        let err = "blocked".parse::<TaskStatus>().unwrap_err();
        assert!(err.contains("Invalid task status"));
    }

    #[test]
    fn test_slug_target_serializes_with_kind_tag() {
        let project = Project {
            id: 4,
            client_id: 1,
            name: "Website".into(),
            description: String::new(),
            status: ProjectStatus::Active,
            slug: Some("ACME-P-1".into()),
            slug_key: Some("ACME".into()),
            slug_number: Some(1),
            created_at: "2024-01-01".into(),
        };
        let json = serde_json::to_string(&SlugTarget::Project(project)).unwrap();
        assert!(json.contains("\"kind\":\"project\""));
        assert!(json.contains("\"slug\":\"ACME-P-1\""));
    }
}
