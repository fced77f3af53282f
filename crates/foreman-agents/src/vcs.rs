use async_trait::async_trait;
use thiserror::Error;

/// Errors from shelling out to the version-control binary.
#[derive(Debug, Error)]
pub enum VcsError {
    /// The command returned a non-zero exit code (stderr in the message).
    #[error("git command failed: {0}")]
    Command(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("utf8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Committed,
    NothingToCommit,
}

/// Branch name plus a short working-tree summary, e.g. `"3 changed files"`.
#[derive(Debug, Clone)]
pub struct VcsSummary {
    pub branch: Option<String>,
    pub dirty_summary: Option<String>,
}

/// Post-completion snapshot hook.
///
/// Intentionally narrow: stage-all plus commit, and a read-only status
/// summary. Failures here are reported to the caller but must never affect
/// a task's recorded outcome.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    async fn snapshot(&self, project_dir: &str, message: &str)
        -> Result<SnapshotOutcome, VcsError>;
    async fn summary(&self, project_dir: &str) -> Result<VcsSummary, VcsError>;
}

/// Shell-based snapshotter. Baseline behavior; requires `git` on PATH.
pub struct ShellGitSnapshotter;

impl ShellGitSnapshotter {
    async fn run_git(project_dir: &str, args: &[&str]) -> Result<String, VcsError> {
        let output = tokio::process::Command::new("git")
            .current_dir(project_dir)
            .args(args)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8(output.stderr)
                .unwrap_or_else(|_| "git returned non-utf8 stderr".to_string());
            return Err(VcsError::Command(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8(output.stdout)?;
        Ok(stdout.trim().to_string())
    }
}

#[async_trait]
impl Snapshotter for ShellGitSnapshotter {
    async fn snapshot(
        &self,
        project_dir: &str,
        message: &str,
    ) -> Result<SnapshotOutcome, VcsError> {
        let status = Self::run_git(project_dir, &["status", "--porcelain"]).await?;
        if status.is_empty() {
            return Ok(SnapshotOutcome::NothingToCommit);
        }
        Self::run_git(project_dir, &["add", "."]).await?;
        Self::run_git(project_dir, &["commit", "-m", message]).await?;
        Ok(SnapshotOutcome::Committed)
    }

    async fn summary(&self, project_dir: &str) -> Result<VcsSummary, VcsError> {
        let out = Self::run_git(project_dir, &["status", "--porcelain", "-b"]).await?;
        Ok(parse_porcelain_branch(&out))
    }
}

/// Parse `git status --porcelain -b` output: the `## branch...` header line
/// plus one line per changed path.
fn parse_porcelain_branch(out: &str) -> VcsSummary {
    let mut branch = None;
    let mut changed = 0usize;
    for line in out.lines() {
        if let Some(header) = line.strip_prefix("## ") {
            let name = header.split("...").next().unwrap_or(header);
            branch = Some(name.trim().to_string());
        } else if !line.trim().is_empty() {
            changed += 1;
        }
    }
    let dirty_summary = if changed > 0 {
        Some(format!(
            "{} changed file{}",
            changed,
            if changed == 1 { "" } else { "s" }
        ))
    } else {
        None
    };
    VcsSummary {
        branch,
        dirty_summary,
    }
}
