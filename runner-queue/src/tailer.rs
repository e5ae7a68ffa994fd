//! In-memory capture of a run's merged output with per-consumer cursors.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Inner {
    lines: Vec<String>,
    cursors: HashMap<String, usize>,
    closed: bool,
}

/// Lines of one run, in arrival order. Each consumer only sees lines it has
/// not read yet.
#[derive(Debug, Default)]
pub struct LogTailer {
    inner: Mutex<Inner>,
}

impl LogTailer {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, line: impl Into<String>) {
        self.inner().lines.push(line.into());
    }

    /// Mark the stream finished; no more lines will arrive.
    pub fn close(&self) {
        self.inner().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner().closed
    }

    /// Lines `consumer` has not seen yet; advances its cursor.
    pub fn read_new(&self, consumer: &str) -> Vec<String> {
        let mut inner = self.inner();
        let start = inner.cursors.get(consumer).copied().unwrap_or(0);
        let new = inner.lines[start..].to_vec();
        let end = inner.lines.len();
        inner.cursors.insert(consumer.to_string(), end);
        new
    }

    pub fn all(&self) -> Vec<String> {
        self.inner().lines.clone()
    }

    pub fn len(&self) -> usize {
        self.inner().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumers_have_independent_cursors() {
        let tailer = LogTailer::new();
        tailer.push("one");
        tailer.push("two");
        assert_eq!(tailer.read_new("cli"), vec!["one", "two"]);
        assert!(tailer.read_new("cli").is_empty());

        tailer.push("three");
        assert_eq!(tailer.read_new("cli"), vec!["three"]);
        assert_eq!(tailer.read_new("web"), vec!["one", "two", "three"]);
        assert_eq!(tailer.len(), 3);
        assert!(!tailer.is_closed());
        tailer.close();
        assert!(tailer.is_closed());
    }
}
