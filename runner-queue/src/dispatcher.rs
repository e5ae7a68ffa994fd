//! Background loop that claims queued tasks and runs them one at a time.
//!
//! Each run is a child process in its own process group. Its stdout and
//! stderr are merged line by line into a [`LogTailer`] so callers can follow
//! the run while it is in flight.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use mlrunner::io::signals::{GroupSignal, signal_group};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::store::{ClaimedTask, TaskQueue};
use crate::tailer::LogTailer;

/// Turns a claimed task into the process that runs it.
pub trait CommandBuilder: Send + Sync {
    fn build(&self, task: &ClaimedTask) -> Command;
}

/// Runs tasks with the `mlrunner` binary. Credentials become environment
/// variables of the child.
#[derive(Debug, Clone)]
pub struct MlrunnerCommand {
    program: PathBuf,
}

impl MlrunnerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl CommandBuilder for MlrunnerCommand {
    fn build(&self, task: &ClaimedTask) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(task.command.args()).envs(&task.credentials);
        cmd
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long to sleep when the queue is empty or a task is running elsewhere.
    pub poll_interval: Duration,
    pub cleanup_interval: Duration,
    /// Running tasks older than this are treated as abandoned.
    pub stale_timeout: Duration,
    /// Time between SIGTERM and SIGKILL when terminating a run.
    pub kill_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(60),
            stale_timeout: Duration::from_secs(24 * 60 * 60),
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Outcome of one dispatched run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedRun {
    pub task_id: String,
    pub run_id: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub terminated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentRun {
    pub task_id: String,
    pub run_id: String,
}

pub struct Dispatcher {
    queue: Arc<TaskQueue>,
    builder: Arc<dyn CommandBuilder>,
    config: DispatcherConfig,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    terminate: Notify,
    current: Mutex<Option<CurrentRun>>,
    logs: Mutex<HashMap<String, Arc<LogTailer>>>,
    finished: Mutex<Vec<FinishedRun>>,
}

impl Dispatcher {
    pub fn new(queue: Arc<TaskQueue>, builder: Arc<dyn CommandBuilder>, config: DispatcherConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue,
            builder,
            config,
            started: AtomicBool::new(false),
            shutdown,
            terminate: Notify::new(),
            current: Mutex::new(None),
            logs: Mutex::new(HashMap::new()),
            finished: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the dispatch loop. Returns `None` if it is already running.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("dispatcher already started");
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::spawn(async move { this.run().await }))
    }

    /// Stop claiming tasks and terminate the current run, if any.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.terminate_current();
    }

    /// Ask the current run to stop. Returns false when nothing is running.
    pub fn terminate_current(&self) -> bool {
        let running = lock(&self.current).is_some();
        if running {
            self.terminate.notify_waiters();
        }
        running
    }

    pub fn current(&self) -> Option<CurrentRun> {
        lock(&self.current).clone()
    }

    /// Output of a task that has started, kept after the run finishes.
    pub fn logs(&self, task_id: &str) -> Option<Arc<LogTailer>> {
        lock(&self.logs).get(task_id).cloned()
    }

    /// Drop the captured output of a finished task.
    pub fn forget_logs(&self, task_id: &str) -> bool {
        lock(&self.logs).remove(task_id).is_some()
    }

    pub fn finished(&self) -> Vec<FinishedRun> {
        lock(&self.finished).clone()
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut last_cleanup: Option<Instant> = None;
        info!("dispatcher started");
        while !*shutdown.borrow() {
            if last_cleanup.is_none_or(|at| at.elapsed() >= self.config.cleanup_interval) {
                if let Err(e) = self.queue.cleanup_stale(self.config.stale_timeout) {
                    warn!(err = %format!("{e:#}"), "stale task cleanup failed");
                }
                last_cleanup = Some(Instant::now());
            }

            match self.queue.next() {
                Ok(Some(task)) => {
                    if let Err(e) = self.dispatch(task).await {
                        warn!(err = %format!("{e:#}"), "dispatch failed");
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(err = %format!("{e:#}"), "claim next task failed"),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        info!("dispatcher stopped");
    }

    /// Run one claimed task to completion and remove it from the queue.
    #[instrument(skip_all, fields(task_id = %task.task_id))]
    pub async fn dispatch(&self, task: ClaimedTask) -> Result<FinishedRun> {
        let run_id = format!("run_{}_{}", Utc::now().format("%Y%m%d%H%M%S"), task.task_id);
        let tailer = Arc::new(LogTailer::new());
        lock(&self.logs).insert(task.task_id.clone(), Arc::clone(&tailer));
        *lock(&self.current) = Some(CurrentRun {
            task_id: task.task_id.clone(),
            run_id: run_id.clone(),
        });

        let outcome = match self.queue.update_run_id(&task.task_id, &run_id) {
            Ok(()) => self.supervise(&task, &run_id, &tailer).await,
            Err(e) => Err(e),
        };

        tailer.close();
        *lock(&self.current) = None;
        let completed = self.queue.complete(&task.task_id);
        let (exit_code, terminated) = outcome?;
        completed?;

        let finished = FinishedRun {
            task_id: task.task_id,
            run_id,
            exit_code,
            terminated,
        };
        info!(run_id = %finished.run_id, exit_code = ?exit_code, terminated, "run finished");
        lock(&self.finished).push(finished.clone());
        Ok(finished)
    }

    async fn supervise(&self, task: &ClaimedTask, run_id: &str, tailer: &Arc<LogTailer>) -> Result<(Option<i32>, bool)> {
        // Registered before spawning so a terminate request during startup is not lost.
        let terminate = self.terminate.notified();
        tokio::pin!(terminate);
        terminate.as_mut().enable();
        if *self.shutdown.borrow() {
            info!(run_id = %run_id, "shutting down; run not started");
            return Ok((None, true));
        }

        let mut cmd = self.builder.build(task);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn run {run_id}"))?;
        let pid = child.id();
        info!(run_id = %run_id, pid = ?pid, "run started");

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, Arc::clone(tailer))));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, Arc::clone(tailer))));
        }

        let (status, terminated) = tokio::select! {
            status = child.wait() => (status.context("wait for run")?, false),
            _ = &mut terminate => {
                info!(run_id = %run_id, "terminating run");
                if let Some(pid) = pid {
                    signal_group(pid, GroupSignal::Terminate)?;
                }
                let status = match tokio::time::timeout(self.config.kill_grace, child.wait()).await {
                    Ok(status) => status.context("wait for run")?,
                    Err(_) => {
                        warn!(run_id = %run_id, "run ignored SIGTERM; killing");
                        if let Some(pid) = pid {
                            signal_group(pid, GroupSignal::Kill)?;
                        }
                        child.kill().await.ok();
                        child.wait().await.context("wait for killed run")?
                    }
                };
                (status, true)
            }
        };

        // Processes left behind in the group keep the output pipes open.
        let grace = self.config.kill_grace;
        if !drain(&mut readers, grace).await {
            warn!(run_id = %run_id, "run left processes holding its output; terminating its group");
            if let Some(pid) = pid {
                signal_group(pid, GroupSignal::Terminate)?;
            }
            if !drain(&mut readers, grace).await {
                if let Some(pid) = pid {
                    signal_group(pid, GroupSignal::Kill)?;
                }
                if !drain(&mut readers, grace).await {
                    warn!(run_id = %run_id, "output still open after SIGKILL; abandoning readers");
                    for reader in &readers {
                        reader.abort();
                    }
                }
            }
        }
        Ok((status.code(), terminated))
    }
}

/// Await the output readers for at most `window`. Readers that finish are
/// removed, so a later call only waits on the rest.
async fn drain(readers: &mut Vec<JoinHandle<()>>, window: Duration) -> bool {
    let joined = async {
        while let Some(reader) = readers.last_mut() {
            if let Err(e) = reader.await {
                warn!(err = %e, "output reader failed");
            }
            readers.pop();
        }
    };
    tokio::time::timeout(window, joined).await.is_ok()
}

async fn pump<R: AsyncRead + Unpin>(reader: R, tailer: Arc<LogTailer>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tailer.push(line),
            Ok(None) => break,
            Err(e) => {
                debug!(err = %e, "output stream closed");
                break;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
