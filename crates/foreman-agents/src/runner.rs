use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use foreman_core::types::{ProgressRecord, Task};
use tracing::{debug, info};

use crate::progress::{ProgressChannel, ProgressError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("progress watch error: {0}")]
    Watch(#[from] ProgressError),
}

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// What the runner observed for the task.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub success: bool,
    pub payload: Option<String>,
    pub error: Option<String>,
}

impl RunResult {
    pub fn ok(payload: impl Into<String>) -> Self {
        Self {
            success: true,
            payload: Some(payload.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error.into()),
        }
    }
}

/// Whether the outcome is known when `run` returns.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The runner saw the task through to an outcome.
    Immediate(RunResult),
    /// The task was handed off; the outcome will arrive as a progress
    /// update from the handoff directory.
    Deferred,
}

// ---------------------------------------------------------------------------
// AgentRunner trait
// ---------------------------------------------------------------------------

/// Abstraction over how instructed work reaches an external coding agent.
///
/// The dispatcher owns the wall-clock budget; a runner that blocks past it
/// is cancelled by dropping its future (subprocess runners must set
/// `kill_on_drop` so the child dies with the future).
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, task: &Task) -> Result<RunOutcome, RunnerError>;
}

// ---------------------------------------------------------------------------
// ProcessRunner (direct mode)
// ---------------------------------------------------------------------------

/// Runs the agent binary as a subprocess in the project directory, passing
/// the instruction as a prompt and asking for JSON output.
pub struct ProcessRunner {
    command: String,
}

impl ProcessRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl AgentRunner for ProcessRunner {
    async fn run(&self, task: &Task) -> Result<RunOutcome, RunnerError> {
        debug!(task_id = %task.id, command = %self.command, "spawning agent process");
        let output = tokio::process::Command::new(&self.command)
            .current_dir(&task.project_ref)
            .arg("-p")
            .arg(&task.instruction)
            .arg("--output-format")
            .arg("json")
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let msg = if stderr.is_empty() {
                format!("agent exited with {}", output.status)
            } else {
                stderr
            };
            return Ok(RunOutcome::Immediate(RunResult::failure(msg)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        // Success requires both a zero exit and parseable JSON output.
        match serde_json::from_str::<serde_json::Value>(&stdout) {
            Ok(_) => Ok(RunOutcome::Immediate(RunResult::ok(stdout))),
            Err(err) => Ok(RunOutcome::Immediate(RunResult::failure(format!(
                "agent output was not valid json: {err}"
            )))),
        }
    }
}

// ---------------------------------------------------------------------------
// DropRunner (instruction-drop mode)
// ---------------------------------------------------------------------------

/// Writes the instruction artifact into the handoff directory and considers
/// the handoff itself the outcome. Used when a human (or an agent polled out
/// of band) picks instructions up later.
pub struct DropRunner {
    layout: crate::progress::ProgressLayout,
}

impl DropRunner {
    pub fn new(layout: crate::progress::ProgressLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl AgentRunner for DropRunner {
    async fn run(&self, task: &Task) -> Result<RunOutcome, RunnerError> {
        let path = self.layout.artifact_path(&task.project_ref, task.id);
        tokio::fs::create_dir_all(self.layout.queue_dir_for(&task.project_ref)).await?;
        tokio::fs::write(&path, instruction_artifact(task)).await?;
        info!(task_id = %task.id, path = %path.display(), "instruction artifact dropped");
        Ok(RunOutcome::Immediate(RunResult::ok(format!(
            "instructions written to {}",
            path.display()
        ))))
    }
}

// ---------------------------------------------------------------------------
// BidirectionalRunner (handoff + watch)
// ---------------------------------------------------------------------------

/// Drops the instruction artifact plus a seed progress record, starts
/// watching the project's handoff directory, and defers the outcome to
/// whatever writes the record back.
pub struct BidirectionalRunner {
    progress: Arc<ProgressChannel>,
}

impl BidirectionalRunner {
    pub fn new(progress: Arc<ProgressChannel>) -> Self {
        Self { progress }
    }
}

#[async_trait]
impl AgentRunner for BidirectionalRunner {
    async fn run(&self, task: &Task) -> Result<RunOutcome, RunnerError> {
        let layout = self.progress.layout();
        tokio::fs::create_dir_all(layout.queue_dir_for(&task.project_ref)).await?;

        let artifact = layout.artifact_path(&task.project_ref, task.id);
        tokio::fs::write(&artifact, instruction_artifact(task)).await?;

        let record = ProgressRecord::seed(task);
        let record_path = layout.record_path(&task.project_ref, task.id);
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&record_path, json).await?;

        // The watch must be live before we report the handoff, or a fast
        // agent could resolve the record unobserved.
        self.progress.watch(&task.project_ref)?;
        info!(task_id = %task.id, record = %record_path.display(), "task handed off, awaiting record updates");
        Ok(RunOutcome::Deferred)
    }
}

// ---------------------------------------------------------------------------
// SimulatedRunner
// ---------------------------------------------------------------------------

/// Completes after a fixed delay without touching any external agent.
/// Default mode, so a fresh install works end to end.
pub struct SimulatedRunner {
    delay: Duration,
    fail: bool,
}

impl SimulatedRunner {
    pub fn new(delay: Duration) -> Self {
        Self { delay, fail: false }
    }

    pub fn failing(delay: Duration) -> Self {
        Self { delay, fail: true }
    }
}

#[async_trait]
impl AgentRunner for SimulatedRunner {
    async fn run(&self, task: &Task) -> Result<RunOutcome, RunnerError> {
        tokio::time::sleep(self.delay).await;
        if self.fail {
            Ok(RunOutcome::Immediate(RunResult::failure(
                "simulated failure",
            )))
        } else {
            Ok(RunOutcome::Immediate(RunResult::ok(format!(
                "simulated completion of '{}'",
                task.description
            ))))
        }
    }
}

// ---------------------------------------------------------------------------
// Mode selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerMode {
    Direct,
    InstructionDrop,
    Bidirectional,
    Simulated,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown agent mode: {0}")]
pub struct UnknownMode(pub String);

impl FromStr for RunnerMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(RunnerMode::Direct),
            "instruction_drop" => Ok(RunnerMode::InstructionDrop),
            "bidirectional" => Ok(RunnerMode::Bidirectional),
            "simulated" => Ok(RunnerMode::Simulated),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}

/// Build the runner for a configured mode.
pub fn runner_for_mode(
    mode: RunnerMode,
    command: &str,
    simulated_delay: Duration,
    progress: &Arc<ProgressChannel>,
) -> Arc<dyn AgentRunner> {
    match mode {
        RunnerMode::Direct => Arc::new(ProcessRunner::new(command)),
        RunnerMode::InstructionDrop => Arc::new(DropRunner::new(progress.layout().clone())),
        RunnerMode::Bidirectional => Arc::new(BidirectionalRunner::new(Arc::clone(progress))),
        RunnerMode::Simulated => Arc::new(SimulatedRunner::new(simulated_delay)),
    }
}

fn instruction_artifact(task: &Task) -> String {
    format!(
        "# Task {id}\n\n\
         **Project:** {project}\n\
         **Priority:** {priority:?}\n\
         **Created:** {created}\n\n\
         ## Description\n\n{description}\n\n\
         ## Instruction\n\n{instruction}\n",
        id = task.id,
        project = task.project_ref,
        priority = task.priority,
        created = task.created_at.to_rfc3339(),
        description = task.description,
        instruction = task.instruction,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressLayout;
    use foreman_core::types::{ProgressStatus, TaskPriority};

    fn task_in(dir: &tempfile::TempDir) -> Task {
        Task::new(
            dir.path().to_str().unwrap(),
            "tidy the parser",
            "refactor the parser module",
            TaskPriority::Medium,
        )
    }

    #[tokio::test]
    async fn simulated_runner_completes() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SimulatedRunner::new(Duration::from_millis(5));
        match runner.run(&task_in(&dir)).await.unwrap() {
            RunOutcome::Immediate(result) => {
                assert!(result.success);
                assert!(result.payload.unwrap().contains("tidy the parser"));
            }
            RunOutcome::Deferred => panic!("simulated runner must be immediate"),
        }
    }

    #[tokio::test]
    async fn simulated_runner_can_fail() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SimulatedRunner::failing(Duration::from_millis(5));
        match runner.run(&task_in(&dir)).await.unwrap() {
            RunOutcome::Immediate(result) => {
                assert!(!result.success);
                assert_eq!(result.error.as_deref(), Some("simulated failure"));
            }
            RunOutcome::Deferred => panic!("simulated runner must be immediate"),
        }
    }

    #[tokio::test]
    async fn drop_runner_writes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_in(&dir);
        let layout = ProgressLayout::default();
        let runner = DropRunner::new(layout.clone());

        let outcome = runner.run(&task).await.unwrap();
        let artifact = layout.artifact_path(&task.project_ref, task.id);
        let body = std::fs::read_to_string(&artifact).unwrap();
        assert!(body.contains("refactor the parser module"));
        assert!(body.contains(&task.id.to_string()));

        match outcome {
            RunOutcome::Immediate(result) => {
                assert!(result.success);
                assert!(result.payload.unwrap().contains("task_"));
            }
            RunOutcome::Deferred => panic!("drop runner must be immediate"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bidirectional_runner_seeds_record_and_defers() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_in(&dir);
        let (tx, _rx) = flume::unbounded();
        let progress = Arc::new(ProgressChannel::new(ProgressLayout::default(), tx));
        let runner = BidirectionalRunner::new(Arc::clone(&progress));

        let outcome = runner.run(&task).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Deferred));
        assert_eq!(progress.watched_projects(), vec![task.project_ref.clone()]);

        let record_path = progress.layout().record_path(&task.project_ref, task.id);
        let record: ProgressRecord =
            serde_json::from_str(&std::fs::read_to_string(record_path).unwrap()).unwrap();
        assert_eq!(record.task_id, task.id);
        assert_eq!(record.status, ProgressStatus::Pending);
        assert_eq!(record.progress, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_parses_json_success() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-agent.sh");
        std::fs::write(&script, "#!/bin/sh\necho '{\"status\": \"done\"}'\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = ProcessRunner::new(script.to_str().unwrap());
        match runner.run(&task_in(&dir)).await.unwrap() {
            RunOutcome::Immediate(result) => {
                assert!(result.success);
                assert!(result.payload.unwrap().contains("done"));
            }
            RunOutcome::Deferred => panic!("process runner must be immediate"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_nonzero_exit_fails() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("broken-agent.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'agent blew up' >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = ProcessRunner::new(script.to_str().unwrap());
        match runner.run(&task_in(&dir)).await.unwrap() {
            RunOutcome::Immediate(result) => {
                assert!(!result.success);
                assert_eq!(result.error.as_deref(), Some("agent blew up"));
            }
            RunOutcome::Deferred => panic!("process runner must be immediate"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_rejects_non_json_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("chatty-agent.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'all done, no json here'\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = ProcessRunner::new(script.to_str().unwrap());
        match runner.run(&task_in(&dir)).await.unwrap() {
            RunOutcome::Immediate(result) => {
                assert!(!result.success);
                assert!(result.error.unwrap().contains("not valid json"));
            }
            RunOutcome::Deferred => panic!("process runner must be immediate"),
        }
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("direct".parse::<RunnerMode>().unwrap(), RunnerMode::Direct);
        assert_eq!(
            "instruction_drop".parse::<RunnerMode>().unwrap(),
            RunnerMode::InstructionDrop
        );
        assert_eq!(
            "bidirectional".parse::<RunnerMode>().unwrap(),
            RunnerMode::Bidirectional
        );
        assert!("pty".parse::<RunnerMode>().is_err());
    }
}
