//! Durable queue of `mlrunner` runs.
//!
//! Submissions land in a SQLite file shared by every process that opens it.
//! A single [`dispatcher::Dispatcher`] drains it one run at a time, capturing
//! each run's output in a [`tailer::LogTailer`].

pub mod dispatcher;
pub mod store;
pub mod tailer;
