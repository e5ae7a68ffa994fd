//! Helpers for running child processes with timeouts and bounded output.
//!
//! Every child is started as the leader of its own process group so that a
//! timeout or a cancellation can reach anything the child spawned: the group
//! gets SIGTERM, then SIGKILL once the grace period runs out. The deadline
//! also covers background processes that outlive the leader while holding
//! its output pipes.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::signals::{CancelToken, GroupSignal, signal_group};

/// Longest uninterrupted wait between deadline and cancellation checks.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Poll step while waiting for output readers to reach EOF.
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out && !self.cancelled
    }

    /// Stdout as text, with a notice if bytes were dropped.
    pub fn stdout_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        text
    }

    /// Stderr as text, with notices for dropped bytes, timeout and cancellation.
    pub fn stderr_text(&self, timeout: Duration) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stderr_truncated > 0 {
            text.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        if self.timed_out {
            text.push_str(&format!(
                "\n[process killed after exceeding the {}s timeout]\n",
                timeout.as_secs()
            ));
        }
        if self.cancelled {
            text.push_str("\n[process terminated by cancellation]\n");
        }
        text
    }
}

/// Bounds applied to one child process.
#[derive(Debug, Clone)]
pub struct RunLimits<'a> {
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory; the rest is drained and counted.
    pub output_limit_bytes: usize,
    /// Wait between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    pub cancel: Option<&'a CancelToken>,
    /// Emit each output line on the `mlrunner::exec` target.
    pub tee: bool,
}

impl<'a> RunLimits<'a> {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            timeout,
            output_limit_bytes,
            kill_grace: Duration::from_secs(5),
            cancel: None,
            tee: false,
        }
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn cancel(mut self, token: &'a CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn tee(mut self, tee: bool) -> Self {
        self.tee = tee;
        self
    }
}

/// Run a command in its own process group and capture stdout/stderr without
/// risking pipe deadlocks.
///
/// Output is read on helper threads while the child runs; stdin (if any) is
/// written on a third thread so a child that never reads cannot block us.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), tee = limits.tee))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    limits: &RunLimits<'_>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            Some(thread::spawn(move || pipe.write_all(&input)))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = limits.output_limit_bytes;
    let stdout_tee = limits.tee.then_some("stdout");
    let stderr_tee = limits.tee.then_some("stderr");
    let readers = Readers {
        stdout: thread::spawn(move || read_stream_limited(stdout, limit, stdout_tee)),
        stderr: thread::spawn(move || read_stream_limited(stderr, limit, stderr_tee)),
    };

    let pid = child.id();
    let deadline = Instant::now() + limits.timeout;
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Some(status) = child
            .wait_timeout(remaining.min(POLL_INTERVAL))
            .context("wait for command")?
        {
            break status;
        }
        if limits.cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("cancellation requested, terminating process group");
            cancelled = true;
            break terminate_group(&mut child, limits.kill_grace)?;
        }
        if Instant::now() >= deadline {
            warn!(
                timeout_secs = limits.timeout.as_secs(),
                "command timed out, terminating process group"
            );
            timed_out = true;
            break terminate_group(&mut child, limits.kill_grace)?;
        }
    };

    // Anything left in the group keeps the pipes open after the leader exits.
    if timed_out || cancelled {
        if !readers.finished() {
            readers.stop_group(pid, limits.kill_grace)?;
        }
    } else {
        match readers.drain(deadline, limits.cancel) {
            Drain::Done => {}
            Drain::Cancelled => {
                warn!("cancellation requested while draining output, terminating process group");
                cancelled = true;
                readers.stop_group(pid, limits.kill_grace)?;
            }
            Drain::DeadlinePassed => {
                warn!(
                    timeout_secs = limits.timeout.as_secs(),
                    "process group outlived the timeout, terminating it"
                );
                timed_out = true;
                readers.stop_group(pid, limits.kill_grace)?;
            }
        }
    }

    let settle = Instant::now() + limits.kill_grace;
    readers.wait_until(settle, None);
    if let Some(handle) = stdin_handle {
        while !handle.is_finished() && Instant::now() < settle {
            thread::sleep(DRAIN_POLL);
        }
        if handle.is_finished() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(err = %e, "child did not consume stdin"),
                Err(_) => return Err(anyhow!("stdin writer thread panicked")),
            }
        } else {
            warn!("stdin writer still blocked, abandoning it");
        }
    }
    let (stdout, stdout_truncated) = join_output(readers.stdout, "stdout")?;
    let (stderr, stderr_truncated) = join_output(readers.stderr, "stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

/// SIGTERM the child's group, then SIGKILL after `grace`.
fn terminate_group(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    let pid = child.id();
    signal_group(pid, GroupSignal::Terminate)?;
    if let Some(status) = child.wait_timeout(grace).context("wait after SIGTERM")? {
        return Ok(status);
    }
    warn!(pid, grace_secs = grace.as_secs(), "process group ignored SIGTERM, killing");
    signal_group(pid, GroupSignal::Kill)?;
    #[cfg(not(unix))]
    child.kill().context("kill command")?;
    child.wait().context("wait command after kill")
}

type ReaderHandle = thread::JoinHandle<Result<(Vec<u8>, usize)>>;

/// How draining the output pipes ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    Done,
    Cancelled,
    DeadlinePassed,
}

/// The stdout/stderr reader threads of one child.
struct Readers {
    stdout: ReaderHandle,
    stderr: ReaderHandle,
}

impl Readers {
    fn finished(&self) -> bool {
        self.stdout.is_finished() && self.stderr.is_finished()
    }

    /// Wait for both readers to reach EOF, giving up at `until` or on
    /// cancellation. Returns whether both finished.
    fn wait_until(&self, until: Instant, cancel: Option<&CancelToken>) -> bool {
        loop {
            if self.finished() {
                return true;
            }
            let now = Instant::now();
            if now >= until || cancel.is_some_and(CancelToken::is_cancelled) {
                return false;
            }
            thread::sleep((until - now).min(DRAIN_POLL));
        }
    }

    fn drain(&self, deadline: Instant, cancel: Option<&CancelToken>) -> Drain {
        if self.wait_until(deadline, cancel) {
            Drain::Done
        } else if cancel.is_some_and(CancelToken::is_cancelled) {
            Drain::Cancelled
        } else {
            Drain::DeadlinePassed
        }
    }

    /// SIGTERM what is left of the group, SIGKILL it if the pipes are still
    /// open after `grace`.
    fn stop_group(&self, pid: u32, grace: Duration) -> Result<()> {
        signal_group(pid, GroupSignal::Terminate)?;
        if self.wait_until(Instant::now() + grace, None) {
            return Ok(());
        }
        warn!(pid, grace_secs = grace.as_secs(), "process group ignored SIGTERM, killing");
        signal_group(pid, GroupSignal::Kill)
    }
}

/// Collect a reader's output. A reader still blocked at this point is held
/// by a process outside the group; it is left behind with nothing captured.
fn join_output(handle: ReaderHandle, stream: &'static str) -> Result<(Vec<u8>, usize)> {
    if !handle.is_finished() {
        warn!(stream, "output pipe still open after the group was killed, abandoning reader");
        return Ok((Vec::new(), 0));
    }
    match handle.join() {
        Ok(result) => result.with_context(|| format!("join {stream}")),
        Err(_) => Err(anyhow!("{stream} reader thread panicked")),
    }
}

/// Read a stream line by line, keeping at most `limit` bytes and optionally
/// logging every line under `tee`.
fn read_stream_limited<R: Read>(
    reader: R,
    limit: usize,
    tee: Option<&'static str>,
) -> Result<(Vec<u8>, usize)> {
    let mut reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).context("read output")?;
        if n == 0 {
            break;
        }
        if let Some(stream) = tee {
            let text = String::from_utf8_lossy(&line);
            info!(target: "mlrunner::exec", stream, "{}", text.trim_end());
        }
        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}
