use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses are absorbing: no further transitions exist.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

/// An illegal state edge was attempted. This is a programming error in the
/// engine, not a user-facing condition.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

// ---------------------------------------------------------------------------
// TaskPriority
// ---------------------------------------------------------------------------

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl TaskPriority {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(TaskPriority::Low),
            2 => Some(TaskPriority::Medium),
            3 => Some(TaskPriority::High),
            4 => Some(TaskPriority::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown priority level: {0}")]
pub struct UnknownPriority(pub String);

impl FromStr for TaskPriority {
    type Err = UnknownPriority;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(UnknownPriority(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of instructed work handed to an external coding agent.
///
/// `started_at` and `completed_at` are each set exactly once, at the
/// Pending->Running and terminal transitions respectively. `result` and
/// `error` are mutually exclusive and only set on a terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_ref: String,
    pub description: String,
    pub instruction: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Provenance map: `retry_of`, `retry_attempt`, `template`, ...
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    pub fn new(
        project_ref: impl Into<String>,
        description: impl Into<String>,
        instruction: impl Into<String>,
        priority: TaskPriority,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_ref: project_ref.into(),
            description: description.into(),
            instruction: instruction.into(),
            status: TaskStatus::Pending,
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            context: serde_json::Map::new(),
        }
    }

    /// The retry attempt this task represents (0 for a first submission).
    pub fn retry_attempt(&self) -> u32 {
        self.context
            .get("retry_attempt")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
    }
}

// ---------------------------------------------------------------------------
// ProjectAggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
}

/// Per-project rollup maintained by the dispatcher as a side effect of task
/// transitions. Never created independently of a task event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectAggregate {
    pub project_ref: String,
    pub display_name: String,
    pub completed_count: i64,
    pub failed_count: i64,
    pub last_activity_at: DateTime<Utc>,
    pub agent_status: AgentStatus,
    pub git_branch: Option<String>,
    pub dirty_summary: Option<String>,
}

// ---------------------------------------------------------------------------
// ActivityEntry
// ---------------------------------------------------------------------------

/// Append-only audit record. Used for observability, never for control
/// decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub project_ref: Option<String>,
    pub task_id: Option<Uuid>,
    pub event_type: String,
    pub details: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// TaskTemplate
// ---------------------------------------------------------------------------

/// Reusable parameterized task blueprint. `{placeholder}` markers in the
/// templates are substituted literally on instantiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub name: String,
    pub description_template: String,
    pub instruction_template: String,
    pub default_priority: TaskPriority,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub use_count: i64,
    pub created_at: DateTime<Utc>,
}

impl TaskTemplate {
    pub fn new(
        name: impl Into<String>,
        description_template: impl Into<String>,
        instruction_template: impl Into<String>,
        default_priority: TaskPriority,
    ) -> Self {
        Self {
            name: name.into(),
            description_template: description_template.into(),
            instruction_template: instruction_template.into(),
            default_priority,
            tags: Vec::new(),
            use_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Render the description and instruction with literal placeholder
    /// substitution. Unmatched placeholders are left as-is.
    pub fn render(&self, values: &HashMap<String, String>) -> (String, String) {
        (
            substitute(&self.description_template, values),
            substitute(&self.instruction_template, values),
        )
    }
}

fn substitute(template: &str, values: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

// ---------------------------------------------------------------------------
// ProgressRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// The cross-process handoff document, one JSON file per task.
///
/// This is the only channel by which the external agent reports back; any
/// writer that produces this schema can drive the engine. The engine must
/// tolerate the file being absent, malformed, or stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub task_id: Uuid,
    pub status: ProgressStatus,
    /// 0-100.
    pub progress: u8,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub instruction: String,
    pub project_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressRecord {
    /// The seed record the engine writes before handing a task off.
    pub fn seed(task: &Task) -> Self {
        let now = Utc::now();
        Self {
            task_id: task.id,
            status: ProgressStatus::Pending,
            progress: 0,
            message: "queued for external agent".to_string(),
            created_at: now,
            updated_at: now,
            instruction: task.instruction.clone(),
            project_ref: task.project_ref.clone(),
            result: None,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// SystemStats
// ---------------------------------------------------------------------------

/// Counts by status over the whole task table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub projects: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_edges_only() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(&Running));
        assert!(Pending.can_transition_to(&Cancelled));
        assert!(Running.can_transition_to(&Completed));
        assert!(Running.can_transition_to(&Failed));
        assert!(Running.can_transition_to(&Cancelled));

        assert!(!Pending.can_transition_to(&Completed));
        assert!(!Pending.can_transition_to(&Failed));
        assert!(!Running.can_transition_to(&Pending));
        assert!(!Completed.can_transition_to(&Running));
    }

    #[test]
    fn terminal_states_absorb() {
        use TaskStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for target in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(
                    !terminal.can_transition_to(&target),
                    "{terminal} -> {target} should be illegal"
                );
            }
        }
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
    }

    #[test]
    fn priority_parse() {
        assert_eq!("high".parse::<TaskPriority>().unwrap(), TaskPriority::High);
        assert_eq!("low".parse::<TaskPriority>().unwrap(), TaskPriority::Low);
        assert!("urgent".parse::<TaskPriority>().is_err());
        assert_eq!(TaskPriority::from_i64(4), Some(TaskPriority::Critical));
        assert_eq!(TaskPriority::from_i64(9), None);
    }

    #[test]
    fn new_task_is_pending() {
        let task = Task::new("/tmp/proj", "desc", "do the thing", TaskPriority::Medium);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
        assert!(task.result.is_none());
        assert!(task.error.is_none());
        assert_eq!(task.retry_attempt(), 0);
    }

    #[test]
    fn template_render_substitutes_placeholders() {
        let tpl = TaskTemplate::new(
            "refactor",
            "Refactor {module}",
            "Refactor the {module} module to use {pattern}",
            TaskPriority::High,
        );
        let mut values = HashMap::new();
        values.insert("module".to_string(), "parser".to_string());
        values.insert("pattern".to_string(), "builder".to_string());

        let (desc, instr) = tpl.render(&values);
        assert_eq!(desc, "Refactor parser");
        assert_eq!(instr, "Refactor the parser module to use builder");
    }

    #[test]
    fn template_render_leaves_unmatched_markers() {
        let tpl = TaskTemplate::new("t", "Fix {what}", "Fix {what} in {file}", TaskPriority::Low);
        let mut values = HashMap::new();
        values.insert("what".to_string(), "bug".to_string());

        let (_, instr) = tpl.render(&values);
        assert_eq!(instr, "Fix bug in {file}");
    }

    #[test]
    fn progress_record_roundtrip() {
        let task = Task::new("/tmp/p", "d", "i", TaskPriority::Low);
        let record = ProgressRecord::seed(&task);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"status\":\"pending\""));
        // Optional fields stay out of the wire format until set.
        assert!(!json.contains("\"result\""));

        let back: ProgressRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_id, task.id);
        assert_eq!(back.status, ProgressStatus::Pending);
        assert_eq!(back.project_ref, "/tmp/p");
    }

    #[test]
    fn progress_status_wire_names() {
        let s: ProgressStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(s, ProgressStatus::InProgress);
        assert_eq!(
            serde_json::to_string(&ProgressStatus::Completed).unwrap(),
            "\"completed\""
        );
    }
}
