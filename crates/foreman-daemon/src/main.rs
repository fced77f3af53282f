//! foreman daemon — loads config, opens the task store, wires the
//! dispatcher to the configured agent runner, and runs until ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use foreman_agents::dispatcher::{Dispatcher, DispatcherSettings};
use foreman_agents::progress::{ProgressChannel, ProgressLayout};
use foreman_agents::runner::{runner_for_mode, RunnerMode};
use foreman_agents::vcs::{ShellGitSnapshotter, Snapshotter};
use foreman_core::config::Config;
use foreman_core::store::TaskStore;
use tracing::{info, warn};

mod logging;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Load config first so its log level can seed the filter; report any
    // load problem once logging is up.
    let (config, load_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(err) => (Config::default(), Some(err)),
    };
    if std::env::var("FOREMAN_LOG_JSON").is_ok() {
        logging::init_logging_json("foreman-daemon", &config.general.log_level);
    } else {
        logging::init_logging("foreman-daemon", &config.general.log_level);
    }
    if let Some(err) = load_error {
        warn!(error = %err, "failed to load config, using defaults");
    }

    info!(version = env!("CARGO_PKG_VERSION"), "foreman daemon starting");

    let data_dir = config
        .general
        .data_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(Config::data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    let store = Arc::new(
        TaskStore::open(data_dir.join("foreman.db"))
            .await
            .context("failed to open task store")?,
    );

    let (updates_tx, updates_rx) = flume::unbounded();
    let progress = Arc::new(ProgressChannel::new(
        ProgressLayout {
            queue_dir: config.queue.dir.clone(),
            record_prefix: config.queue.record_prefix.clone(),
            debounce: config.queue.debounce(),
        },
        updates_tx,
    ));

    let mode: RunnerMode = config
        .agent
        .mode
        .parse()
        .with_context(|| format!("invalid agent.mode '{}'", config.agent.mode))?;
    let runner = runner_for_mode(
        mode,
        &config.agent.command,
        Duration::from_millis(config.agent.simulated_delay_ms),
        &progress,
    );
    let snapshotter: Option<Arc<dyn Snapshotter>> = if config.git.auto_snapshot {
        Some(Arc::new(ShellGitSnapshotter))
    } else {
        None
    };

    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        runner,
        progress,
        snapshotter,
        DispatcherSettings {
            max_concurrent: config.dispatcher.max_concurrent,
            task_timeout: config.dispatcher.task_timeout(),
            auto_snapshot: config.git.auto_snapshot,
        },
        updates_rx,
    );
    dispatcher.start();
    info!(
        mode = %config.agent.mode,
        max_concurrent = config.dispatcher.max_concurrent,
        timeout_secs = config.dispatcher.task_timeout_secs,
        "dispatcher running"
    );

    // Periodic stats heartbeat.
    let heartbeat = Arc::clone(&dispatcher);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            match heartbeat.stats().await {
                Ok(stats) => info!(
                    total = stats.system.total,
                    pending = stats.system.pending,
                    running = stats.running,
                    queued = stats.queued,
                    completed = stats.system.completed,
                    failed = stats.system.failed,
                    "heartbeat"
                ),
                Err(err) => warn!(error = %err, "heartbeat stats unavailable"),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("ctrl-c received, shutting down");
    Ok(())
}
