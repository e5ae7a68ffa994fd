//! Persistent task queue on SQLite.
//!
//! One table, `tasks`, ordered by an autoincrement `id`. Every operation is a
//! single statement, so several processes can share the file; a partial
//! unique index on `status = 'running'` backs the one-running-task rule that
//! [`TaskQueue::next`] enforces.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL UNIQUE,
    run_id TEXT,
    status TEXT NOT NULL DEFAULT 'queued' CHECK (status IN ('queued', 'running')),
    command_json TEXT NOT NULL,
    credentials_json TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    started_at TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS tasks_one_running ON tasks (status) WHERE status = 'running';
CREATE INDEX IF NOT EXISTS tasks_status ON tasks (status);
CREATE INDEX IF NOT EXISTS tasks_created_at ON tasks (created_at);
CREATE INDEX IF NOT EXISTS tasks_run_id ON tasks (run_id);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            other => Err(anyhow!("unknown task status {other:?}")),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of one `mlrunner run` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommand {
    pub input_data_folder: PathBuf,
    pub output_folder: PathBuf,
    pub config_path: PathBuf,
    pub max_iterations: u32,
    #[serde(default)]
    pub need_user_input: bool,
    #[serde(default)]
    pub initial_user_input: Option<String>,
    #[serde(default)]
    pub extract_to: Option<PathBuf>,
}

impl RunCommand {
    /// Argument list for the `mlrunner` binary.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "run".into(),
            self.input_data_folder.clone().into(),
            self.output_folder.clone().into(),
            self.config_path.clone().into(),
            self.max_iterations.to_string().into(),
        ];
        if self.need_user_input {
            args.push("--need-user-input".into());
        }
        if let Some(input) = &self.initial_user_input {
            args.push("-u".into());
            args.push(input.into());
        }
        if let Some(dir) = &self.extract_to {
            args.push("-e".into());
            args.push(dir.clone().into());
        }
        args
    }
}

/// Environment variables handed to the run.
pub type Credentials = BTreeMap<String, String>;

/// A task claimed by [`TaskQueue::next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub task_id: String,
    pub command: RunCommand,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskState {
    pub task_id: String,
    pub status: TaskStatus,
    /// Queued or running tasks submitted before this one.
    pub position: u64,
    pub run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

pub struct TaskQueue {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl TaskQueue {
    /// Open (creating if needed) the queue database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let conn = Connection::open(path).with_context(|| format!("open {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set busy timeout")?;
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("enable WAL")?;
        debug!(mode = %mode, "journal mode");
        conn.execute_batch(SCHEMA).context("create tasks schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a task; returns how many queued or running tasks are ahead.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn submit(&self, task_id: &str, command: &RunCommand, credentials: &Credentials) -> Result<u64> {
        let command_json = serde_json::to_string(command).context("serialize command")?;
        let credentials_json = if credentials.is_empty() {
            None
        } else {
            Some(serde_json::to_string(credentials).context("serialize credentials")?)
        };
        let conn = self.conn();
        let id: i64 = conn
            .query_row(
                "INSERT INTO tasks (task_id, status, command_json, credentials_json, created_at)
                 VALUES (?1, 'queued', ?2, ?3, ?4)
                 RETURNING id",
                params![task_id, command_json, credentials_json, timestamp(Utc::now())],
                |row| row.get(0),
            )
            .with_context(|| format!("submit task {task_id}"))?;
        let position = position_before(&conn, id)?;
        info!(position, "task queued");
        Ok(position)
    }

    /// Claim the oldest queued task, unless a task is already running.
    pub fn next(&self) -> Result<Option<ClaimedTask>> {
        let conn = self.conn();
        let claimed = conn
            .query_row(
                "UPDATE tasks SET status = 'running', started_at = ?1
                 WHERE id = (SELECT id FROM tasks WHERE status = 'queued' ORDER BY id LIMIT 1)
                   AND NOT EXISTS (SELECT 1 FROM tasks WHERE status = 'running')
                 RETURNING task_id, command_json, credentials_json",
                params![timestamp(Utc::now())],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional();
        let claimed = match claimed {
            Ok(claimed) => claimed,
            // Another process claimed a task between the check and the update.
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                debug!("lost the race for the running slot");
                None
            }
            Err(e) => return Err(e).context("claim next task"),
        };
        let Some((task_id, command_json, credentials_json)) = claimed else {
            return Ok(None);
        };
        let command = serde_json::from_str(&command_json)
            .with_context(|| format!("parse command of task {task_id}"))?;
        let credentials = match credentials_json {
            Some(json) => serde_json::from_str(&json)
                .with_context(|| format!("parse credentials of task {task_id}"))?,
            None => Credentials::new(),
        };
        info!(task_id = %task_id, "task started");
        Ok(Some(ClaimedTask {
            task_id,
            command,
            credentials,
        }))
    }

    pub fn update_run_id(&self, task_id: &str, run_id: &str) -> Result<()> {
        let updated = self
            .conn()
            .execute(
                "UPDATE tasks SET run_id = ?1 WHERE task_id = ?2",
                params![run_id, task_id],
            )
            .with_context(|| format!("record run id of task {task_id}"))?;
        if updated == 0 {
            warn!(task_id, "run id recorded for a task that no longer exists");
        }
        Ok(())
    }

    /// Current state, or `None` once the task completed or was cancelled.
    pub fn status(&self, task_id: &str) -> Result<Option<TaskState>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, status, run_id, created_at, started_at FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("read task {task_id}"))?;
        let Some((id, status, run_id, created_at, started_at)) = row else {
            return Ok(None);
        };
        Ok(Some(TaskState {
            task_id: task_id.to_string(),
            status: TaskStatus::parse(&status)?,
            position: position_before(&conn, id)?,
            run_id,
            created_at: parse_timestamp(&created_at)?,
            started_at: started_at.as_deref().map(parse_timestamp).transpose()?,
        }))
    }

    /// Remove a task that has not started yet. Running tasks are left alone.
    pub fn cancel(&self, task_id: &str) -> Result<bool> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM tasks WHERE task_id = ?1 AND status = 'queued'",
                params![task_id],
            )
            .with_context(|| format!("cancel task {task_id}"))?;
        if removed > 0 {
            info!(task_id, "task cancelled");
        }
        Ok(removed > 0)
    }

    pub fn complete(&self, task_id: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM tasks WHERE task_id = ?1", params![task_id])
            .with_context(|| format!("complete task {task_id}"))?;
        info!(task_id, "task completed");
        Ok(())
    }

    pub fn by_run_id(&self, run_id: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT task_id FROM tasks WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("look up run {run_id}"))
    }

    /// Drop running tasks that started more than `timeout` ago.
    pub fn cleanup_stale(&self, timeout: Duration) -> Result<usize> {
        let timeout = chrono::Duration::from_std(timeout).context("stale timeout out of range")?;
        let cutoff = timestamp(Utc::now() - timeout);
        let removed = self
            .conn()
            .execute(
                "DELETE FROM tasks WHERE status = 'running' AND started_at < ?1",
                params![cutoff],
            )
            .context("remove stale tasks")?;
        if removed > 0 {
            warn!(removed, "removed stale running tasks");
        }
        Ok(removed)
    }
}

fn position_before(conn: &Connection, id: i64) -> Result<u64> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM tasks WHERE id < ?1 AND status IN ('queued', 'running')",
            params![id],
            |row| row.get(0),
        )
        .context("count tasks ahead")?;
    Ok(u64::try_from(count).unwrap_or_default())
}

/// Fixed-width UTC timestamps, so SQL string comparison orders them.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .with_context(|| format!("parse timestamp {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(name: &str) -> RunCommand {
        RunCommand {
            input_data_folder: PathBuf::from("/data").join(name),
            output_folder: PathBuf::from("/out").join(name),
            config_path: PathBuf::from("/cfg.toml"),
            max_iterations: 3,
            need_user_input: false,
            initial_user_input: Some("use f1".to_string()),
            extract_to: None,
        }
    }

    fn queue(temp: &tempfile::TempDir) -> TaskQueue {
        TaskQueue::open(&temp.path().join("queue.db")).expect("open")
    }

    #[test]
    fn positions_count_tasks_ahead() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = queue(&temp);
        let creds = Credentials::new();
        assert_eq!(queue.submit("a", &command("a"), &creds).expect("a"), 0);
        assert_eq!(queue.submit("b", &command("b"), &creds).expect("b"), 1);
        assert_eq!(queue.submit("c", &command("c"), &creds).expect("c"), 2);

        assert!(queue.cancel("b").expect("cancel"));
        let state = queue.status("c").expect("status").expect("c exists");
        assert_eq!(state.status, TaskStatus::Queued);
        assert_eq!(state.position, 1);
        assert!(queue.status("b").expect("status").is_none());
    }

    #[test]
    fn at_most_one_task_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = queue(&temp);
        let mut creds = Credentials::new();
        creds.insert("API_KEY".to_string(), "secret".to_string());
        queue.submit("a", &command("a"), &creds).expect("a");
        queue.submit("b", &command("b"), &Credentials::new()).expect("b");

        let first = queue.next().expect("next").expect("claimed");
        assert_eq!(first.task_id, "a");
        assert_eq!(first.command, command("a"));
        assert_eq!(first.credentials.get("API_KEY").map(String::as_str), Some("secret"));
        assert!(queue.next().expect("next").is_none());

        let running = queue.status("a").expect("status").expect("a");
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());
        assert!(!queue.cancel("a").expect("cancel running"));

        queue.complete("a").expect("complete");
        assert_eq!(queue.next().expect("next").expect("b").task_id, "b");
    }

    #[test]
    fn run_ids_map_back_to_tasks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = queue(&temp);
        queue.submit("a", &command("a"), &Credentials::new()).expect("a");
        queue.next().expect("next");
        queue.update_run_id("a", "run_1").expect("run id");
        assert_eq!(queue.by_run_id("run_1").expect("lookup").as_deref(), Some("a"));
        assert_eq!(queue.by_run_id("run_2").expect("lookup"), None);
        assert_eq!(
            queue.status("a").expect("status").expect("a").run_id.as_deref(),
            Some("run_1")
        );
    }

    #[test]
    fn stale_running_tasks_are_removed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = queue(&temp);
        queue.submit("a", &command("a"), &Credentials::new()).expect("a");
        queue.submit("b", &command("b"), &Credentials::new()).expect("b");
        queue.next().expect("next");

        assert_eq!(queue.cleanup_stale(Duration::from_secs(3600)).expect("cleanup"), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.cleanup_stale(Duration::from_millis(1)).expect("cleanup"), 1);
        assert!(queue.status("a").expect("status").is_none());
        assert_eq!(queue.status("b").expect("status").expect("b").status, TaskStatus::Queued);
    }

    #[test]
    fn empty_credentials_are_stored_as_null() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = queue(&temp);
        queue.submit("a", &command("a"), &Credentials::new()).expect("a");
        let stored: Option<String> = queue
            .conn()
            .query_row("SELECT credentials_json FROM tasks WHERE task_id = 'a'", [], |row| row.get(0))
            .expect("select");
        assert_eq!(stored, None);
        assert!(queue.next().expect("next").expect("a").credentials.is_empty());
    }

    #[test]
    fn rows_written_without_timestamps_get_a_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = queue(&temp);
        let command_json = serde_json::to_string(&command("raw")).expect("json");
        queue
            .conn()
            .execute(
                "INSERT INTO tasks (task_id, command_json) VALUES ('raw', ?1)",
                params![command_json],
            )
            .expect("insert");

        let state = queue.status("raw").expect("status").expect("raw");
        assert_eq!(state.status, TaskStatus::Queued);
        assert!((Utc::now() - state.created_at).num_seconds().abs() < 60);
        let claimed = queue.next().expect("next").expect("raw");
        assert!(claimed.credentials.is_empty());
    }

    #[test]
    fn command_args_follow_the_run_surface() {
        let mut cmd = command("a");
        cmd.extract_to = Some(PathBuf::from("/extract"));
        let args: Vec<String> = cmd
            .args()
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec!["run", "/data/a", "/out/a", "/cfg.toml", "3", "-u", "use f1", "-e", "/extract"]
        );
    }
}
