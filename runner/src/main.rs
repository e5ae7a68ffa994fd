//! Tree-search agent for machine-learning tasks.
//!
//! `mlrunner run` grows a search tree of generated programs over the input
//! folder and points `<output>/best_run` at the best one.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mlrunner::core::template::validate_template;
use mlrunner::exit_codes;
use mlrunner::logging;
use mlrunner::mcts::LoopStop;
use mlrunner::run::{RunRequest, run_once};

#[derive(Parser)]
#[command(
    name = "mlrunner",
    version,
    about = "Tree-search agent that writes and runs machine learning programs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search for a working solution and promote the best node to `best_run`.
    Run {
        input_data_folder: PathBuf,
        output_folder: PathBuf,
        config_path: PathBuf,
        max_iterations: u32,
        /// Ask for extra instructions on stdin before every iteration.
        #[arg(long)]
        need_user_input: bool,
        /// Instructions given to every agent from the first iteration on.
        #[arg(short = 'u', long = "initial-user-input")]
        initial_user_input: Option<String>,
        /// Also copy the promoted outputs into this directory.
        #[arg(short = 'e', long = "extract-to")]
        extract_to: Option<PathBuf>,
    },
    /// Report unknown variables in a prompt template file.
    ValidateTemplate { file: PathBuf },
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
    match cli.command {
        Command::Run {
            input_data_folder,
            output_folder,
            config_path,
            max_iterations,
            need_user_input,
            initial_user_input,
            extract_to,
        } => cmd_run(RunRequest {
            input_data_folder,
            output_folder,
            config_path,
            max_iterations,
            need_user_input,
            initial_user_input,
            extract_to,
        }),
        Command::ValidateTemplate { file } => cmd_validate_template(&file),
    }
}

fn cmd_run(req: RunRequest) -> Result<i32> {
    let report = run_once(&req)?;
    if let LoopStop::Failed(err) = &report.stop {
        eprintln!("search stopped early: {err}");
    }
    let code = match (&report.stop, report.promoted) {
        (LoopStop::Cancelled, _) => exit_codes::CANCELLED,
        (_, Some(node)) => {
            match report.best_score {
                Some(score) => println!("best_run: node_{node} (validation score {score})"),
                None => println!("best_run: node_{node}"),
            }
            exit_codes::OK
        }
        (_, None) => {
            eprintln!("no node succeeded after {} iterations", report.iterations);
            exit_codes::NO_SUCCESS
        }
    };
    Ok(code)
}

fn cmd_validate_template(file: &Path) -> Result<i32> {
    let template =
        fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let report = validate_template(&template);
    for name in &report.referenced {
        println!("{name}");
    }
    if report.is_valid() {
        return Ok(exit_codes::OK);
    }
    eprintln!("unknown variables:\n- {}", report.unknown.join("\n- "));
    Ok(exit_codes::INVALID)
}
