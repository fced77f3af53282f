use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use foreman_core::types::{ProgressRecord, ProgressStatus};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("watcher error: {0}")]
    Notify(#[from] notify::Error),
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Where the handoff files live inside a project, and how changes are
/// coalesced.
#[derive(Debug, Clone)]
pub struct ProgressLayout {
    /// Handoff directory relative to the project root.
    pub queue_dir: String,
    /// Progress record filename prefix (`<prefix><task_id>.json`).
    pub record_prefix: String,
    /// Per-file quiet window before a change is read and delivered.
    pub debounce: Duration,
}

impl Default for ProgressLayout {
    fn default() -> Self {
        Self {
            queue_dir: ".foreman-tasks".into(),
            record_prefix: "api_".into(),
            debounce: Duration::from_millis(1000),
        }
    }
}

impl ProgressLayout {
    pub fn queue_dir_for(&self, project_dir: &str) -> PathBuf {
        Path::new(project_dir).join(&self.queue_dir)
    }

    /// The progress record the external agent writes back into.
    pub fn record_path(&self, project_dir: &str, task_id: Uuid) -> PathBuf {
        self.queue_dir_for(project_dir)
            .join(format!("{}{}.json", self.record_prefix, task_id))
    }

    /// The human-readable instruction artifact dropped alongside the record.
    pub fn artifact_path(&self, project_dir: &str, task_id: Uuid) -> PathBuf {
        self.queue_dir_for(project_dir)
            .join(format!("task_{}.md", task_id))
    }

    fn is_record_file(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(&self.record_prefix) && n.ends_with(".json"))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

/// A progress-file change, already parsed and classified.
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    /// The agent reported intermediate progress; the task stays Running.
    Progress {
        task_id: Uuid,
        project_ref: String,
        percent: u8,
        message: String,
    },
    /// The agent reported a final outcome.
    Resolved {
        task_id: Uuid,
        project_ref: String,
        success: bool,
        result: Option<String>,
        error: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// ProgressChannel
// ---------------------------------------------------------------------------

/// Watches per-project handoff directories and turns settled progress-file
/// writes into [`ProgressUpdate`]s on a single channel.
///
/// Agents tend to rewrite the record many times in a burst, so each file
/// gets a trailing-edge debounce: the first event opens a quiet window, and
/// the file is read once when the window closes, delivering its settled
/// contents. Malformed or unreadable records are dropped with a warning;
/// they must never take the channel down.
pub struct ProgressChannel {
    layout: ProgressLayout,
    updates_tx: flume::Sender<ProgressUpdate>,
    watchers: Mutex<HashMap<String, RecommendedWatcher>>,
    pending: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ProgressChannel {
    pub fn new(layout: ProgressLayout, updates_tx: flume::Sender<ProgressUpdate>) -> Self {
        Self {
            layout,
            updates_tx,
            watchers: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn layout(&self) -> &ProgressLayout {
        &self.layout
    }

    /// Start watching a project's handoff directory. Idempotent: a second
    /// call for the same project is a no-op.
    pub fn watch(&self, project_dir: &str) -> Result<(), ProgressError> {
        let mut watchers = self.watchers.lock().expect("watchers lock");
        if watchers.contains_key(project_dir) {
            return Ok(());
        }

        let dir = self.layout.queue_dir_for(project_dir);
        std::fs::create_dir_all(&dir)?;

        let (raw_tx, raw_rx) = flume::unbounded::<notify::Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = raw_tx.send(event);
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let layout = self.layout.clone();
        let updates_tx = self.updates_tx.clone();
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            // Exits when the watcher is dropped and the raw sender goes away.
            while let Ok(event) = raw_rx.recv_async().await {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    continue;
                }
                for path in event.paths {
                    if !layout.is_record_file(&path) {
                        continue;
                    }
                    schedule_read(&layout, &updates_tx, &pending, path);
                }
            }
        });

        watchers.insert(project_dir.to_string(), watcher);
        Ok(())
    }

    /// Stop watching a project. Safe to call for a project that was never
    /// watched.
    pub fn unwatch(&self, project_dir: &str) {
        let mut watchers = self.watchers.lock().expect("watchers lock");
        watchers.remove(project_dir);
    }

    pub fn watched_projects(&self) -> Vec<String> {
        let watchers = self.watchers.lock().expect("watchers lock");
        watchers.keys().cloned().collect()
    }
}

/// Open a quiet window for `path` unless one is already open, then read and
/// deliver the record when the window closes.
fn schedule_read(
    layout: &ProgressLayout,
    updates_tx: &flume::Sender<ProgressUpdate>,
    pending: &Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
) {
    {
        let mut pending_set = pending.lock().expect("pending lock");
        if !pending_set.insert(path.clone()) {
            return;
        }
    }

    let debounce = layout.debounce;
    let updates_tx = updates_tx.clone();
    let pending = Arc::clone(pending);
    tokio::spawn(async move {
        tokio::time::sleep(debounce).await;
        pending.lock().expect("pending lock").remove(&path);

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "progress record unreadable, dropping");
                return;
            }
        };
        let record: ProgressRecord = match serde_json::from_str(&text) {
            Ok(record) => record,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "progress record malformed, dropping");
                return;
            }
        };

        let update = match record.status {
            ProgressStatus::Pending => {
                debug!(task_id = %record.task_id, "record still pending, ignoring");
                return;
            }
            ProgressStatus::InProgress => ProgressUpdate::Progress {
                task_id: record.task_id,
                project_ref: record.project_ref,
                percent: record.progress.min(100),
                message: record.message,
            },
            ProgressStatus::Completed => ProgressUpdate::Resolved {
                task_id: record.task_id,
                project_ref: record.project_ref,
                success: true,
                result: record.result,
                error: None,
            },
            ProgressStatus::Failed => ProgressUpdate::Resolved {
                task_id: record.task_id,
                project_ref: record.project_ref,
                success: false,
                result: None,
                error: record.error.or_else(|| Some(record.message.clone())),
            },
        };
        let _ = updates_tx.send_async(update).await;
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
