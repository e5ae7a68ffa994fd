//! `mlrunner run`: wire the real collaborators and drive one search.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::tokens::TokenLedger;
use crate::io::artifacts::copy_tree;
use crate::io::config::{RunConfig, load_config};
use crate::io::llm::CommandChatProvider;
use crate::io::signals::{CancelToken, is_cancelled_error};
use crate::io::tools::{PromptFragment, ToolCatalog, ToolDescriptor, ToolRegistry};
use crate::io::tutorials::KeywordTutorialIndex;
use crate::io::user_input::{NoUserInput, StdinUserInput, UserInputSource};
use crate::mcts::{Collaborators, Controller, LoopStop};
use crate::state::TaskContext;
use crate::tree::NodeId;

/// Arguments of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub input_data_folder: PathBuf,
    pub output_folder: PathBuf,
    pub config_path: PathBuf,
    pub max_iterations: u32,
    pub need_user_input: bool,
    pub initial_user_input: Option<String>,
    pub extract_to: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub stop: LoopStop,
    /// Node `best_run` points at, if any succeeded.
    pub promoted: Option<NodeId>,
    pub best_score: Option<f64>,
    pub iterations: u32,
}

/// Catalog from the configured file, or a single entry for the default tool.
pub fn tool_registry(cfg: &RunConfig) -> Result<Arc<dyn ToolRegistry>> {
    let catalog = match &cfg.tool_catalog {
        Some(path) => ToolCatalog::load(path)?,
        None => ToolCatalog::new(vec![ToolDescriptor {
            name: cfg.default_tool.clone(),
            version: String::new(),
            description: "General purpose machine learning with the Python scientific stack.".to_string(),
            prompt_fragment: PromptFragment::default(),
            tutorials_root: None,
            requirements: Vec::new(),
        }]),
    };
    Ok(Arc::new(catalog))
}

/// Load the configuration and run the search with the command-backed chat
/// provider, stdin user input and the keyword tutorial index.
pub fn run_once(req: &RunRequest) -> Result<RunReport> {
    let cfg = load_config(&req.config_path)?;
    let cancel = CancelToken::with_sigterm()?;
    let user_input: Box<dyn UserInputSource> = if req.need_user_input {
        Box::new(StdinUserInput)
    } else {
        Box::new(NoUserInput)
    };
    let collab = Collaborators {
        provider: Arc::new(CommandChatProvider::new(cfg.llm.clone(), cancel.clone())),
        tools: tool_registry(&cfg)?,
        tutorials: Arc::new(KeywordTutorialIndex),
        user_input,
        ledger: Arc::new(TokenLedger::new()),
        cancel,
    };
    let task = TaskContext {
        input_data_folder: absolute(&req.input_data_folder)?,
        output_folder: absolute(&req.output_folder)?,
        initial_user_input: req.initial_user_input.clone(),
        per_iteration_input: req.need_user_input,
    };
    run_with(cfg, task, collab, req.max_iterations, req.extract_to.as_deref())
}

/// Drive initialization, the loop and the final promotion.
#[instrument(skip_all, fields(output = %task.output_folder.display(), max_iterations = max_iterations))]
pub fn run_with(
    cfg: RunConfig,
    task: TaskContext,
    collab: Collaborators,
    max_iterations: u32,
    extract_to: Option<&Path>,
) -> Result<RunReport> {
    let mut controller = Controller::new(cfg, task, collab)?;
    let stop = match controller.initialize() {
        Ok(()) => controller.run_loop(max_iterations),
        Err(e) if is_cancelled_error(&e) => LoopStop::Cancelled,
        Err(e) => {
            if let Err(usage) = controller.write_token_usage() {
                warn!(err = %format!("{usage:#}"), "token usage not written");
            }
            return Err(e.context("initialization failed"));
        }
    };

    let promoted = controller.finish(&stop)?;
    let best_score = promoted
        .and_then(|id| controller.tree().get(id))
        .and_then(|node| node.validation_score);
    if let (Some(id), Some(dest)) = (promoted, extract_to) {
        let output = controller.layout().node(id).output_dir;
        copy_tree(&output, dest)
            .with_context(|| format!("extract best run to {}", dest.display()))?;
        info!(dest = %dest.display(), "best run extracted");
    }
    info!(stop = %stop, promoted = ?promoted, iterations = controller.iterations(), "run finished");
    Ok(RunReport {
        stop,
        promoted,
        best_score,
        iterations: controller.iterations(),
    })
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("resolve {}", path.display()))
}
