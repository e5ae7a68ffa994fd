//! Command surface for the run queue.
//!
//! `submit`, `status` and `cancel` are one-shot operations on the database;
//! `dispatch` drains it in the foreground until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use mlrunner::exit_codes;
use mlrunner::logging;
use mlrunner_queue::dispatcher::{Dispatcher, DispatcherConfig, MlrunnerCommand};
use mlrunner_queue::store::{Credentials, RunCommand, TaskQueue};
use tracing::info;

#[derive(Parser)]
#[command(name = "mlrunner-queue", version, about = "Queue mlrunner runs and execute them one at a time")]
struct Cli {
    /// Queue database file.
    #[arg(long, default_value = "mlrunner-queue.db")]
    db: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue a run and print its position.
    Submit {
        task_id: String,
        input_data_folder: PathBuf,
        output_folder: PathBuf,
        config_path: PathBuf,
        max_iterations: u32,
        #[arg(long)]
        need_user_input: bool,
        #[arg(short = 'u', long = "initial-user-input")]
        initial_user_input: Option<String>,
        #[arg(short = 'e', long = "extract-to")]
        extract_to: Option<PathBuf>,
        /// Environment variable for the run, as KEY=VALUE. Repeatable.
        #[arg(long = "credential", value_parser = parse_credential)]
        credentials: Vec<(String, String)>,
    },
    /// Print a task's state as JSON.
    Status { task_id: String },
    /// Remove a task that has not started.
    Cancel { task_id: String },
    /// Run queued tasks until interrupted.
    Dispatch {
        /// The `mlrunner` binary to launch.
        #[arg(long, default_value = "mlrunner")]
        mlrunner: PathBuf,
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,
        /// Running tasks older than this are dropped as abandoned.
        #[arg(long, default_value_t = 24 * 60 * 60)]
        stale_secs: u64,
        #[arg(long, default_value_t = 5)]
        kill_grace_secs: u64,
    },
}

fn parse_credential(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let queue = TaskQueue::open(&cli.db)?;
    match cli.command {
        Command::Submit {
            task_id,
            input_data_folder,
            output_folder,
            config_path,
            max_iterations,
            need_user_input,
            initial_user_input,
            extract_to,
            credentials,
        } => {
            let command = RunCommand {
                input_data_folder: absolute(input_data_folder)?,
                output_folder: absolute(output_folder)?,
                config_path: absolute(config_path)?,
                max_iterations,
                need_user_input,
                initial_user_input,
                extract_to: extract_to.map(absolute).transpose()?,
            };
            let credentials: Credentials = credentials.into_iter().collect();
            let position = queue.submit(&task_id, &command, &credentials)?;
            println!("{task_id} queued at position {position}");
            Ok(exit_codes::OK)
        }
        Command::Status { task_id } => {
            let state = queue
                .status(&task_id)?
                .ok_or_else(|| anyhow!("no queued or running task {task_id:?}"))?;
            println!("{}", serde_json::to_string_pretty(&state).context("serialize status")?);
            Ok(exit_codes::OK)
        }
        Command::Cancel { task_id } => {
            if queue.cancel(&task_id)? {
                println!("{task_id} cancelled");
                Ok(exit_codes::OK)
            } else {
                eprintln!("{task_id} is running or unknown; not cancelled");
                Ok(exit_codes::INVALID)
            }
        }
        Command::Dispatch {
            mlrunner,
            poll_ms,
            stale_secs,
            kill_grace_secs,
        } => {
            let config = DispatcherConfig {
                poll_interval: Duration::from_millis(poll_ms),
                stale_timeout: Duration::from_secs(stale_secs),
                kill_grace: Duration::from_secs(kill_grace_secs),
                ..DispatcherConfig::default()
            };
            dispatch(queue, MlrunnerCommand::new(mlrunner), config)?;
            Ok(exit_codes::OK)
        }
    }
}

fn absolute(path: PathBuf) -> Result<PathBuf> {
    std::path::absolute(&path).with_context(|| format!("resolve {}", path.display()))
}

#[tokio::main]
async fn dispatch(queue: TaskQueue, command: MlrunnerCommand, config: DispatcherConfig) -> Result<()> {
    let poll = config.poll_interval;
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(queue), Arc::new(command), config));
    let Some(handle) = dispatcher.start() else {
        return Ok(());
    };

    let printer = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let mut shown: Option<String> = None;
            loop {
                if let Some(run) = dispatcher.current() {
                    if let Some(done) = shown.replace(run.task_id.clone())
                        && done != run.task_id
                    {
                        flush(&dispatcher, &done);
                    }
                    flush(&dispatcher, &run.task_id);
                } else if let Some(done) = shown.take() {
                    flush(&dispatcher, &done);
                }
                tokio::time::sleep(poll.min(Duration::from_millis(200))).await;
            }
        })
    };

    tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
    info!("interrupted; stopping dispatcher");
    dispatcher.shutdown();
    handle.await.context("dispatcher loop")?;
    printer.abort();
    if let Some(run) = dispatcher.finished().last() {
        flush(&dispatcher, &run.task_id);
    }
    Ok(())
}

/// Print unread output of `task_id`, dropping it once the run has finished.
fn flush(dispatcher: &Dispatcher, task_id: &str) {
    let Some(logs) = dispatcher.logs(task_id) else {
        return;
    };
    for line in logs.read_new("cli") {
        println!("[{task_id}] {line}");
    }
    if logs.is_closed() {
        dispatcher.forget_logs(task_id);
    }
}
