//! Cooperative cancellation and process-group signalling.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};

static SIGTERM_RECEIVED: AtomicBool = AtomicBool::new(false);

/// Marker error raised when a suspension point observes cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl fmt::Display for CancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("run cancelled")
    }
}

impl std::error::Error for CancelledError {}

/// Cloneable cancellation flag checked at every suspension point.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    observe_sigterm: bool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also trips when the process receives SIGTERM.
    pub fn with_sigterm() -> Result<Self> {
        install_sigterm_handler()?;
        Ok(Self {
            flag: Arc::new(AtomicBool::new(false)),
            observe_sigterm: true,
        })
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || (self.observe_sigterm && SIGTERM_RECEIVED.load(Ordering::SeqCst))
    }

    /// `Err(CancelledError)` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(CancelledError.into());
        }
        Ok(())
    }
}

/// True if `err` (or anything in its chain) is a [`CancelledError`].
pub fn is_cancelled_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<CancelledError>().is_some())
}

#[cfg(unix)]
extern "C" fn on_sigterm(_: libc::c_int) {
    SIGTERM_RECEIVED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn install_sigterm_handler() -> Result<()> {
    let handler = on_sigterm as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    let previous = unsafe { libc::signal(libc::SIGTERM, handler) };
    if previous == libc::SIG_ERR {
        return Err(std::io::Error::last_os_error()).context("install SIGTERM handler");
    }
    Ok(())
}

#[cfg(not(unix))]
fn install_sigterm_handler() -> Result<()> {
    Ok(())
}

/// Signals understood by [`signal_group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    Terminate,
    Kill,
}

/// Send `signal` to the process group led by `pid`.
///
/// A group that has already exited is not an error.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn signal_group(pid: u32, signal: GroupSignal) -> Result<()> {
    let signo = match signal {
        GroupSignal::Terminate => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| anyhow!("pid {pid} out of range"))?;
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, signo) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err).with_context(|| format!("signal process group {pid}"));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _signal: GroupSignal) -> Result<()> {
    Ok(())
}
