//! Command-line interface for the tracker.
//!
//! Each invocation opens the task store in the data directory, runs one
//! command and flushes before returning. Local mutations are captured into
//! the sync outbox so a later `sync` (or another client sharing the data
//! directory) can push them.

use crate::clock::{Clock, SystemClock};
use crate::config::TrackerConfig;
use crate::error::{Error, Result};
use crate::persistence::{KeyValueHost, PersistenceGateway, SqliteHost, DATABASE_FILENAME};
use crate::sync::{Connectivity, DetachedRemote, RemoteTaskService, SyncEngine};
use crate::tasks::{Task, TaskPatch, TaskStore};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

const SHORT_ID_LEN: usize = 8;

/// Local-first task tracker.
#[derive(Parser, Debug)]
#[command(name = "tasksync")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Directory holding the task database and `tasksync.yaml`
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
///
/// Task ids may be abbreviated to any unique prefix.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Add a task.
    Add {
        /// Task text (words are joined with spaces)
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// List active tasks, newest first.
    List {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Mark a task complete.
    Complete {
        /// Task ID
        id: String,
    },

    /// Mark a completed task as not done.
    Reopen {
        /// Task ID
        id: String,
    },

    /// Replace a task's text.
    Edit {
        /// Task ID
        id: String,

        /// New text (words are joined with spaces)
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// Move a task to the trash.
    Delete {
        /// Task ID
        id: String,
    },

    /// Bring a task back from the trash.
    Restore {
        /// Task ID
        id: String,
    },

    /// Permanently remove tasks that have been in the trash too long.
    Purge {
        /// Retention in days (defaults to the configured retention)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Show storage usage and sync queue state.
    Stats,

    /// List deleted tasks, most recently deleted first.
    Trash {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Push queued changes and pull remote ones.
    Sync,
}

/// Output from running the CLI, with separate stdout and stderr messages.
#[derive(Debug)]
pub struct CliOutput {
    /// Exit code for the process.
    pub exit_code: ExitCode,
    /// Messages to print to stdout.
    pub stdout: Vec<String>,
    /// Messages to print to stderr.
    pub stderr: Vec<String>,
}

struct Session {
    config: TrackerConfig,
    store: TaskStore,
    engine: Arc<SyncEngine>,
}

/// Run a parsed command line.
pub async fn run(cli: Cli) -> CliOutput {
    match execute(cli).await {
        Ok(stdout) => CliOutput { exit_code: ExitCode::SUCCESS, stdout, stderr: vec![] },
        Err(e) => CliOutput {
            exit_code: ExitCode::from(1),
            stdout: vec![],
            stderr: vec![format!("Error: {e}")],
        },
    }
}

/// The data directory used when `--data-dir` is not given.
///
/// # Errors
///
/// Returns an error if the platform has no data directory.
pub fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("tasksync")).ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no data directory on this platform; pass --data-dir",
        ))
    })
}

async fn execute(cli: Cli) -> Result<Vec<String>> {
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    let session = open_session(&data_dir).await?;
    let result = run_command(&session, cli.command).await;

    session.engine.capture_local_changes().await;
    session.store.flush().await?;
    session.engine.save().await?;
    result
}

async fn open_session(data_dir: &Path) -> Result<Session> {
    let config = TrackerConfig::load_from(data_dir)?;
    let host: Arc<dyn KeyValueHost> = Arc::new(SqliteHost::with_path(
        data_dir.join(DATABASE_FILENAME),
        config.storage.capacity_bytes,
    )?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let gateway = PersistenceGateway::new(Arc::clone(&host), config.gateway_options());
    let store = TaskStore::open(gateway, Arc::clone(&clock), config.store_options()).await?;

    let (remote, connectivity) = remote_for(&config)?;
    let engine = SyncEngine::open(store.clone(), remote, host, clock, config.sync_options()).await?;
    engine.set_connectivity(connectivity);

    Ok(Session { config, store, engine })
}

#[cfg(feature = "http")]
fn remote_for(config: &TrackerConfig) -> Result<(Arc<dyn RemoteTaskService>, Connectivity)> {
    use crate::sync::http::{HttpRemote, DEFAULT_TIMEOUT};

    match &config.sync.endpoint {
        Some(endpoint) => {
            let remote = HttpRemote::new(endpoint, DEFAULT_TIMEOUT)?;
            Ok((Arc::new(remote), Connectivity::Online))
        }
        None => Ok((Arc::new(DetachedRemote), Connectivity::Offline)),
    }
}

#[cfg(not(feature = "http"))]
#[allow(clippy::unnecessary_wraps)]
fn remote_for(_config: &TrackerConfig) -> Result<(Arc<dyn RemoteTaskService>, Connectivity)> {
    Ok((Arc::new(DetachedRemote), Connectivity::Offline))
}

async fn run_command(session: &Session, command: Command) -> Result<Vec<String>> {
    let store = &session.store;
    match command {
        Command::Add { text } => {
            let task = store.create(&text.join(" "))?;
            Ok(vec![format!("Added {}", format_task(&task))])
        }
        Command::List { json } => list(&store.list_active(), json, "No tasks."),
        Command::Complete { id } => {
            let task = store.update(&resolve_id(store, &id)?, TaskPatch::completed(true))?;
            Ok(vec![format!("Completed {}", format_task(&task))])
        }
        Command::Reopen { id } => {
            let task = store.update(&resolve_id(store, &id)?, TaskPatch::completed(false))?;
            Ok(vec![format!("Reopened {}", format_task(&task))])
        }
        Command::Edit { id, text } => {
            let task = store.update(&resolve_id(store, &id)?, TaskPatch::text(text.join(" ")))?;
            Ok(vec![format!("Updated {}", format_task(&task))])
        }
        Command::Delete { id } => {
            let id = resolve_id(store, &id)?;
            store.delete(&id)?;
            Ok(vec![format!("Moved {} to the trash", short_id(&id))])
        }
        Command::Restore { id } => {
            let task = store.restore(&resolve_id(store, &id)?)?;
            Ok(vec![format!("Restored {}", format_task(&task))])
        }
        Command::Purge { days } => {
            let retention = match days {
                Some(days) => chrono::Duration::days(i64::from(days)),
                None => session.config.store_options().retention,
            };
            let purged = store.purge_expired_deletions(retention);
            Ok(vec![format!("Purged {purged} task(s)")])
        }
        Command::Stats => Ok(stats(session).await),
        Command::Trash { json } => list(&store.list_deleted(), json, "Trash is empty."),
        Command::Sync => sync(session).await,
    }
}

#[cfg(feature = "http")]
async fn sync(session: &Session) -> Result<Vec<String>> {
    if session.config.sync.endpoint.is_none() {
        return Err(Error::Remote("no sync endpoint configured in tasksync.yaml".to_string()));
    }
    let report = session.engine.flush_queue().await;
    Ok(vec![format!(
        "Pushed {}, pulled {}, conflicts {}, abandoned {}, waiting {}",
        report.pushed, report.pulled, report.conflicts, report.abandoned, report.deferred
    )])
}

#[cfg(not(feature = "http"))]
#[allow(clippy::unused_async)]
async fn sync(_session: &Session) -> Result<Vec<String>> {
    Err(Error::Remote(
        "this build has no HTTP support; rebuild with the `http` feature".to_string(),
    ))
}

async fn stats(session: &Session) -> Vec<String> {
    session.engine.capture_local_changes().await;
    let usage = session.store.gateway().usage_stats().await;
    vec![
        format!("Active tasks:    {}", session.store.list_active().len()),
        format!("In trash:        {}", session.store.list_deleted().len()),
        format!("Storage used:    {} / {} bytes", usage.used_bytes, usage.estimated_capacity_bytes),
        format!("Queued changes:  {}", session.engine.pending_operations().len()),
        format!("Conflicts:       {}", session.engine.conflicts().len()),
    ]
}

fn list(tasks: &[Task], json: bool, empty: &str) -> Result<Vec<String>> {
    if json {
        return Ok(vec![serde_json::to_string_pretty(tasks)?]);
    }
    if tasks.is_empty() {
        return Ok(vec![empty.to_string()]);
    }
    Ok(tasks.iter().map(format_task).collect())
}

fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

fn format_task(task: &Task) -> String {
    let mark = if task.completed { "x" } else { " " };
    format!("[{mark}] {}  {}", short_id(&task.id), task.text)
}

/// Resolve a full id or a unique id prefix.
fn resolve_id(store: &TaskStore, given: &str) -> Result<String> {
    if store.get(given).is_some() {
        return Ok(given.to_string());
    }
    let matches: Vec<String> = store
        .list_active()
        .into_iter()
        .chain(store.list_deleted())
        .filter(|t| t.id.starts_with(given))
        .map(|t| t.id)
        .collect();
    match matches.as_slice() {
        [id] => Ok(id.clone()),
        [] => Err(Error::NotFound(given.to_string())),
        _ => Err(Error::NotFound(format!("{given} is ambiguous ({} matches)", matches.len()))),
    }
}
