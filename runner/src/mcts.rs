//! Search controller: initialization, the select/expand/simulate/backpropagate
//! loop, best-run promotion and the end-of-run report.
//!
//! The controller is the only owner of the tree and the session state. Every
//! agent call receives a [`NodeVariables`] view built from disjoint borrows of
//! those fields, so agents never hold references across iterations.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::agents::executor::ExecutionAgent;
use crate::agents::perception::PerceptionAgent;
use crate::agents::tutorials::TutorialAgent;
use crate::agents::{Agent, AgentContext};
use crate::core::search::{PolicyView, mark_terminal, select_node};
use crate::core::template::{Layered, TruncateMode, VariableMap, truncate, validate_template};
use crate::core::tokens::TokenLedger;
use crate::core::types::{AgentRole, SimulationOutcome, Stage};
use crate::core::uct::ScoreRange;
use crate::io::artifacts::{NodePaths, RunLayout, write_state, write_state_json, write_text};
use crate::io::config::RunConfig;
use crate::io::llm::ChatProvider;
use crate::io::signals::{CancelToken, is_cancelled_error};
use crate::io::tools::ToolRegistry;
use crate::io::tutorials::TutorialIndex;
use crate::io::user_input::{UserInputSource, iteration_input};
use crate::prompts::{
    BashCoderPrompt, DescriptionFileRetrieverPrompt, ErrorAnalyzerPrompt, MetaPromptingPrompt,
    PromptBuilder, PythonCoderPrompt, TaskDescriptorPrompt, ToolSelectorPrompt,
};
use crate::state::{NodeVariables, SessionState, TaskContext};
use crate::summary::{NodeRecord, RunSummary};
use crate::tree::{NodeId, ROOT_ID, SearchTree};

const DESCRIPTION_FILE_CHARS: usize = 8192;

/// External services the controller drives.
pub struct Collaborators {
    pub provider: Arc<dyn ChatProvider>,
    pub tools: Arc<dyn ToolRegistry>,
    pub tutorials: Arc<dyn TutorialIndex>,
    pub user_input: Box<dyn UserInputSource>,
    pub ledger: Arc<TokenLedger>,
    pub cancel: CancelToken,
}

/// Why the search loop stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum LoopStop {
    /// Every branch was exhausted.
    RootTerminal,
    MaxIterations,
    Cancelled,
    /// A fatal error ended the search early.
    Failed(String),
}

impl fmt::Display for LoopStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopStop::RootTerminal => f.write_str("search space exhausted"),
            LoopStop::MaxIterations => f.write_str("max iterations reached"),
            LoopStop::Cancelled => f.write_str("cancelled"),
            LoopStop::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Agents used on every node.
struct NodeAgents {
    python_coder: Agent<PythonCoderPrompt>,
    bash_coder: Agent<BashCoderPrompt>,
    error_analyzer: Agent<ErrorAnalyzerPrompt>,
    execution: ExecutionAgent,
    tutorials: TutorialAgent,
}

pub struct Controller {
    cfg: RunConfig,
    task: TaskContext,
    layout: RunLayout,
    tree: SearchTree,
    session: SessionState,
    tools: Arc<dyn ToolRegistry>,
    user_input: Box<dyn UserInputSource>,
    ctx: AgentContext,
    agents: NodeAgents,
    iteration: u32,
    promoted: Option<NodeId>,
}

impl Controller {
    pub fn new(cfg: RunConfig, task: TaskContext, collab: Collaborators) -> Result<Self> {
        cfg.validate()?;
        let layout = RunLayout::new(&task.output_folder);
        layout.create()?;
        let ctx = AgentContext::new(collab.provider, collab.ledger, collab.cancel);
        let agents = NodeAgents {
            python_coder: Agent::new(PythonCoderPrompt::new(&cfg)?, &cfg, ctx.clone()),
            bash_coder: Agent::new(BashCoderPrompt::new(&cfg)?, &cfg, ctx.clone()),
            error_analyzer: Agent::new(ErrorAnalyzerPrompt::new(&cfg)?, &cfg, ctx.clone()),
            execution: ExecutionAgent::new(&cfg, ctx.clone())?,
            tutorials: TutorialAgent::new(&cfg, ctx.clone(), collab.tutorials)?,
        };
        Ok(Self {
            cfg,
            task,
            layout,
            tree: SearchTree::new(),
            session: SessionState::default(),
            tools: collab.tools,
            user_input: collab.user_input,
            ctx,
            agents,
            iteration: 0,
            promoted: None,
        })
    }

    pub fn tree(&self) -> &SearchTree {
        &self.tree
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn iterations(&self) -> u32 {
        self.iteration
    }

    fn root_vars(&self) -> NodeVariables<'_> {
        NodeVariables::new(&self.cfg, &self.task, &self.session, &self.tree, ROOT_ID, None)
    }

    /// Perceive the data, describe the task and pick the tools.
    ///
    /// An unknown tool in the final selection is fatal.
    #[instrument(skip_all)]
    pub fn initialize(&mut self) -> Result<()> {
        let states = self.layout.init_states_dir();
        fs::create_dir_all(&states)
            .with_context(|| format!("create directory {}", states.display()))?;

        let mut perception = PerceptionAgent::new(&self.cfg, self.ctx.clone())?;
        let data = perception.run(&self.task.input_data_folder, &states)?;
        self.session.data_prompt = data.data_prompt;
        self.session.data_files = data
            .files
            .iter()
            .map(|file| file.path.display().to_string())
            .collect();

        let mut retriever = Agent::new(DescriptionFileRetrieverPrompt::new(&self.cfg)?, &self.cfg, self.ctx.clone());
        let named = retriever.call(&self.root_vars(), &states)?;
        self.read_description_files(named);
        write_state(&states, "description_file_contents.txt", &self.session.description_file_contents);

        let mut descriptor = Agent::new(TaskDescriptorPrompt::new(&self.cfg)?, &self.cfg, self.ctx.clone());
        self.session.task_description = descriptor.call(&self.root_vars(), &states)?;
        if self.session.task_description.is_empty() {
            warn!("task descriptor returned nothing, continuing without a description");
        }
        write_state(&states, "task_description.txt", &self.session.task_description);

        self.select_tools(&states)?;

        if self.cfg.enable_meta_prompting {
            self.rewrite_coder_templates(&states)?;
        }
        write_state_json(&states, "session.json", &self.session);
        info!(
            tools = ?self.session.available_tools,
            files = self.session.data_files.len(),
            "initialization complete"
        );
        Ok(())
    }

    /// Keep the named description files that exist under the input folder.
    /// Names that resolve outside it are skipped.
    fn read_description_files(&mut self, named: Vec<String>) {
        let mut found = Vec::new();
        let mut sections = Vec::new();
        let root = match fs::canonicalize(&self.task.input_data_folder) {
            Ok(root) => root,
            Err(e) => {
                warn!(
                    folder = %self.task.input_data_folder.display(),
                    err = %e,
                    "cannot resolve input folder, skipping description files"
                );
                self.session.description_files = Vec::new();
                self.session.description_file_contents = String::new();
                return;
            }
        };
        for name in named {
            let path = match fs::canonicalize(self.task.input_data_folder.join(&name)) {
                Ok(path) => path,
                Err(e) => {
                    warn!(file = %name, err = %e, "skipping description file");
                    continue;
                }
            };
            if !path.starts_with(&root) {
                warn!(file = %name, "description file is outside the input folder, skipping");
                continue;
            }
            match fs::read_to_string(&path) {
                Ok(text) => {
                    sections.push(format!(
                        "### {name}\n{}",
                        truncate(text.trim_end(), TruncateMode::End, DESCRIPTION_FILE_CHARS)
                    ));
                    found.push(name);
                }
                Err(e) => warn!(file = %path.display(), err = %e, "skipping description file"),
            }
        }
        self.session.description_files = found;
        self.session.description_file_contents = sections.join("\n\n");
    }

    fn select_tools(&mut self, states: &Path) -> Result<()> {
        let names = self.tools.names();
        self.session.tool_listing = names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                if tool.version.is_empty() {
                    format!("- {}: {}", tool.name, tool.description)
                } else {
                    format!("- {} ({}): {}", tool.name, tool.version, tool.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut selector = Agent::new(ToolSelectorPrompt::new(&self.cfg, names)?, &self.cfg, self.ctx.clone());
        let selection = selector.call(&self.root_vars(), states)?;
        let mut selected = selection.ranked;
        selected.truncate(self.cfg.initial_root_children);

        for name in &selected {
            let tool = self
                .tools
                .require(name)
                .with_context(|| format!("selected tool {name:?}"))?;
            self.session
                .tool_prompts
                .insert(name.clone(), tool.prompt_fragment.text());
            self.session
                .tool_requirements
                .insert(name.clone(), tool.requirements.clone());
        }
        info!(tools = ?selected, "tools selected");
        self.session.available_tools = selected;
        Ok(())
    }

    /// Let the meta-prompting agent rewrite both coder templates. A rewrite
    /// that is empty or references unknown variables is discarded.
    fn rewrite_coder_templates(&mut self, states: &Path) -> Result<()> {
        let mut meta = Agent::new(MetaPromptingPrompt::new(&self.cfg)?, &self.cfg, self.ctx.clone());
        for role in [AgentRole::PythonCoder, AgentRole::BashCoder] {
            let original = match role {
                AgentRole::PythonCoder => self.agents.python_coder.builder().template().to_string(),
                _ => self.agents.bash_coder.builder().template().to_string(),
            };
            let local = VariableMap::new()
                .with("template", original)
                .with("target_agent", role.as_str());
            let rewritten = {
                let root = self.root_vars();
                meta.call(&Layered::new(&local, &root), &states.join("meta_prompting").join(role.as_str()))?
            };
            let report = validate_template(&rewritten);
            if rewritten.trim().is_empty() || !report.is_valid() {
                warn!(agent = %role, unknown = ?report.unknown, "discarding rewritten template");
                continue;
            }
            write_state(states, &format!("{role}_template.txt"), &rewritten);
            match role {
                AgentRole::PythonCoder => self.agents.python_coder.builder_mut().set_template(rewritten),
                _ => self.agents.bash_coder.builder_mut().set_template(rewritten),
            }
            debug!(agent = %role, "template rewritten");
        }
        Ok(())
    }

    /// One MCTS iteration. Returns the new node, or `None` once the root is
    /// terminal.
    pub fn step(&mut self) -> Result<Option<NodeId>> {
        self.ctx.cancel.check()?;
        let selected = {
            let view = policy_view(&self.cfg, &self.session);
            let range = ScoreRange {
                best: self.session.best_validation_score,
                worst: self.session.worst_validation_score,
            };
            select_node(&mut self.tree, &view, &self.cfg.uct_params(), range)
        };
        let Some(selected) = selected else {
            info!("root is terminal, nothing left to expand");
            return Ok(None);
        };

        let id = self.expand(selected)?;
        let iteration = self.iteration;
        self.iteration += 1;
        let paths = self.layout.node(id);
        paths.create()?;
        self.generate(id, iteration, &paths)?;
        let outcome = self.simulate(id, &paths)?;
        self.tree.backpropagate(
            id,
            outcome.validation_score,
            outcome.is_validated,
            outcome.is_failure,
        );
        write_state_json(&paths.states_dir, "node.json", &NodeRecord::from_node(self.tree.node(id)?));
        info!(
            node = id,
            iteration,
            success = !outcome.is_failure,
            score = ?outcome.validation_score,
            "iteration finished"
        );
        self.promote_current()?;
        if self.cfg.remove_current_iteration_folder && self.layout.prune_iteration(&paths.dir)? {
            debug!(node = id, "iteration folder removed");
        }
        Ok(Some(id))
    }

    /// Attach a new child for `selected`: evolve from the root or a success,
    /// debug from a failure.
    fn expand(&mut self, selected: NodeId) -> Result<NodeId> {
        let node = self.tree.node(selected)?;
        let evolve = node.is_root() || node.is_successful;
        let tool = node.tool_used.clone();
        let attempts = node.debug_attempts + 1;

        if evolve {
            let id = match self.session.first_unused_tool().map(str::to_string) {
                Some(unused) => self.tree.add_child(ROOT_ID, Stage::Evolve, Some(unused))?,
                None => {
                    let tool = tool.or_else(|| self.session.available_tools.first().cloned());
                    self.tree.add_child(selected, Stage::Evolve, tool)?
                }
            };
            debug!(node = id, parent = selected, "evolve node created");
            return Ok(id);
        }

        let id = self.tree.add_child(selected, Stage::Debug, tool)?;
        self.tree.node_mut(id)?.debug_attempts = attempts;
        debug!(node = id, parent = selected, attempts, "debug node created");
        if attempts >= self.cfg.max_debug_depth {
            info!(node = id, "debug depth exhausted, node is terminal");
            let view = policy_view(&self.cfg, &self.session);
            mark_terminal(&mut self.tree, id, &view);
        }
        Ok(id)
    }

    /// Tutorials, program and launcher script for a fresh node.
    #[instrument(skip_all, fields(node = id))]
    fn generate(&mut self, id: NodeId, iteration: u32, paths: &NodePaths) -> Result<()> {
        let tool_name = self
            .tree
            .node(id)?
            .tool_used
            .clone()
            .ok_or_else(|| anyhow!("node {id} has no tool"))?;
        let tool = self.tools.require(&tool_name)?.clone();
        self.session.mark_tool_used(&tool_name);

        let input = iteration_input(
            self.task.initial_user_input.as_deref(),
            self.task.per_iteration_input,
            iteration,
            &mut *self.user_input,
        )?;
        self.tree.node_mut(id)?.artifacts.user_input = truncate(&input, TruncateMode::End, self.cfg.max_user_input_length);

        let tutorials = {
            let vars = NodeVariables::new(&self.cfg, &self.task, &self.session, &self.tree, id, Some(paths));
            self.agents.tutorials.run(&tool, &vars, &paths.states_dir)?
        };
        {
            let node = self.tree.node_mut(id)?;
            node.artifacts.tutorial_retrieval = tutorials.retrieval;
            node.artifacts.tutorial_prompt = tutorials.prompt;
        }

        let code = {
            let vars = NodeVariables::new(&self.cfg, &self.task, &self.session, &self.tree, id, Some(paths));
            self.agents.python_coder.call(&vars, &paths.states_dir)?
        };
        if code.trim().is_empty() {
            warn!("python coder produced no code");
        }
        write_text(&paths.python_path, &code)?;
        self.tree.node_mut(id)?.artifacts.python_code = code;

        let mut script = {
            let vars = NodeVariables::new(&self.cfg, &self.task, &self.session, &self.tree, id, Some(paths));
            self.agents.bash_coder.call(&vars, &paths.states_dir)?
        };
        if script.trim().is_empty() {
            warn!("bash coder produced no script, running the program directly");
            script = format!(
                "#!/bin/bash\nset -e\n{} {}\n",
                self.cfg.python,
                paths.python_path.display()
            );
        }
        write_text(&paths.script_path, &script)?;
        self.tree.node_mut(id)?.artifacts.bash_script = script;
        Ok(())
    }

    /// Execute the node and fold the verdict into the tree and session.
    #[instrument(skip_all, fields(node = id))]
    fn simulate(&mut self, id: NodeId, paths: &NodePaths) -> Result<SimulationOutcome> {
        let result = {
            let vars = NodeVariables::new(&self.cfg, &self.task, &self.session, &self.tree, id, Some(paths));
            self.agents.execution.run(paths, &vars)?
        };
        let stage = {
            let node = self.tree.node_mut(id)?;
            node.artifacts.stdout = truncate(&result.stdout, TruncateMode::Mid, self.cfg.max_stdout_length);
            node.artifacts.stderr = truncate(&result.stderr, TruncateMode::Mid, self.cfg.max_stderr_length);
            node.stage
        };

        if result.decision.is_success() {
            {
                let node = self.tree.node_mut(id)?;
                node.is_successful = true;
                node.validation_score = result.validation_score;
                node.artifacts.error_message.clear();
            }
            self.session.last_successful_node = Some(id);
            if let Some(score) = result.validation_score {
                self.session.record_score(id, score);
            }
            if stage == Stage::Debug {
                self.resolve_debug_chain(id)?;
            }
        } else {
            let error_message = format!("{}\n\n{}", result.stderr.trim_end(), result.error_summary)
                .trim()
                .to_string();
            self.tree.node_mut(id)?.artifacts.error_message = error_message.clone();

            let analysis = {
                let node = self.tree.node(id)?;
                let local = VariableMap::new()
                    .with("previous_error_message", error_message)
                    .with("previous_python_code", node.artifacts.python_code.clone())
                    .with("previous_bash_script", node.artifacts.bash_script.clone())
                    .with("previous_tutorial_prompt", node.artifacts.tutorial_prompt.clone());
                let vars = NodeVariables::new(&self.cfg, &self.task, &self.session, &self.tree, id, Some(paths));
                self.agents
                    .error_analyzer
                    .call(&Layered::new(&local, &vars), &paths.states_dir)?
            };
            if !analysis.trim().is_empty() {
                self.session.all_error_analyses.push(analysis.clone());
            }
            self.tree.node_mut(id)?.artifacts.error_analysis = analysis;

            if stage == Stage::Debug {
                self.count_debug_failure(id)?;
            }
        }
        Ok(SimulationOutcome::new(result.decision, result.validation_score))
    }

    /// Charge a failed debug attempt to the node being debugged.
    fn count_debug_failure(&mut self, id: NodeId) -> Result<()> {
        let parent = self
            .tree
            .node(id)?
            .parent
            .ok_or_else(|| anyhow!("debug node {id} has no parent"))?;
        let exhausted = {
            let node = self.tree.node_mut(parent)?;
            node.debug_attempts += 1;
            node.debug_attempts >= self.cfg.max_debug_depth && !node.is_terminal
        };
        if exhausted {
            info!(node = parent, "debug attempts exhausted");
            let view = policy_view(&self.cfg, &self.session);
            mark_terminal(&mut self.tree, parent, &view);
        }
        Ok(())
    }

    /// Move a successful debug node next to the evolve node its chain started
    /// from, then close that failed branch.
    fn resolve_debug_chain(&mut self, id: NodeId) -> Result<()> {
        let mut chain = Vec::new();
        let mut cursor = self.tree.node(id)?.parent;
        let origin = loop {
            let Some(current) = cursor else {
                return Ok(());
            };
            let node = self.tree.node(current)?;
            if node.is_root() {
                return Ok(());
            }
            chain.push(current);
            if node.stage != Stage::Debug {
                break current;
            }
            cursor = node.parent;
        };
        let new_parent = self
            .tree
            .node(origin)?
            .parent
            .ok_or_else(|| anyhow!("debug origin {origin} has no parent"))?;

        self.tree.reparent(id, new_parent)?;
        for node_id in chain {
            self.tree.node_mut(node_id)?.is_debug_successful = true;
        }
        let view = policy_view(&self.cfg, &self.session);
        mark_terminal(&mut self.tree, origin, &view);
        info!(node = id, origin, parent = new_parent, "debug succeeded, node re-parented");
        Ok(())
    }

    /// Point `best_run` at the current promotion target when it changed.
    fn promote_current(&mut self) -> Result<()> {
        let Some(target) = self.session.promotion_target() else {
            return Ok(());
        };
        if self.promoted == Some(target) {
            return Ok(());
        }
        let dir = self.layout.node(target).dir;
        self.layout
            .promote_best_run(&dir, self.cfg.remove_current_iteration_folder)?;
        self.promoted = Some(target);
        Ok(())
    }

    /// Iterate until the root is terminal, the budget is spent, the run is
    /// cancelled, or a fatal error occurs.
    pub fn run_loop(&mut self, max_iterations: u32) -> LoopStop {
        while self.iteration < max_iterations {
            match self.step() {
                Ok(Some(_)) => {}
                Ok(None) => return LoopStop::RootTerminal,
                Err(e) if is_cancelled_error(&e) => {
                    warn!("run cancelled");
                    return LoopStop::Cancelled;
                }
                Err(e) => {
                    error!(err = %format!("{e:#}"), "search aborted");
                    return LoopStop::Failed(format!("{e:#}"));
                }
            }
        }
        LoopStop::MaxIterations
    }

    /// Final promotion, run summary and token usage. Returns the promoted node.
    pub fn finish(&mut self, stop: &LoopStop) -> Result<Option<NodeId>> {
        let problems = self.tree.validate();
        if !problems.is_empty() {
            warn!(problems = ?problems, "tree invariants violated");
        }
        let target = self.session.promotion_target();
        match target {
            Some(target) => {
                self.promote_current()?;
                let summary = RunSummary::collect(&self.tree, &self.session, self.iteration, &stop.to_string());
                match summary.render() {
                    Ok(text) => write_state(&self.layout.node(target).states_dir, "best_run_summary.md", &text),
                    Err(e) => warn!(err = %format!("{e:#}"), "run summary not written"),
                }
            }
            None => warn!("no node succeeded, best_run not created"),
        }
        self.write_token_usage()?;
        Ok(target)
    }

    /// Written whenever at least one LLM call was made.
    pub fn write_token_usage(&self) -> Result<()> {
        if self.ctx.ledger.has_calls() {
            self.layout.write_token_usage(&self.ctx.ledger.snapshot())?;
        }
        Ok(())
    }
}

fn policy_view<'a>(cfg: &RunConfig, session: &'a SessionState) -> PolicyView<'a> {
    PolicyView {
        limits: cfg.expansion_limits(),
        available_tools: &session.available_tools,
        has_unused_tool: session.has_unused_tool(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedChat, catalog, controller_with, task_in};

    #[test]
    fn loop_stop_reads_well() {
        assert_eq!(LoopStop::MaxIterations.to_string(), "max iterations reached");
        assert_eq!(LoopStop::Failed("boom".into()).to_string(), "failed: boom");
    }

    #[test]
    fn initialization_keeps_catalog_tools_in_rank_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let task = task_in(temp.path(), &[("train.csv", "id,y\n1,0\n"), ("README.md", "Predict y.")]);
        let chat = ScriptedChat::new()
            .reply(AgentRole::DescriptionFileRetriever, "Description Files:\n- README.md\n- missing.md")
            .reply(AgentRole::TaskDescriptor, "Task Description: predict y from id")
            .reply(
                AgentRole::ToolSelector,
                "EXPLANATION: tabular\nRANKED_LIBRARIES:\n1. autogluon\n2. LightGBM\n3. pytorch",
            );
        let cfg = RunConfig {
            initial_root_children: 2,
            ..RunConfig::default()
        };
        let mut controller = controller_with(cfg, task, &chat, catalog(&["autogluon", "lightgbm", "pytorch"]));
        controller.initialize().expect("initialize");

        let session = controller.session();
        assert_eq!(session.available_tools, vec!["autogluon", "lightgbm"]);
        assert_eq!(session.description_files, vec!["README.md"]);
        assert!(session.description_file_contents.contains("Predict y."));
        assert_eq!(session.task_description, "predict y from id");
        assert!(controller.layout().init_states_dir().join("session.json").exists());
    }

    #[test]
    fn description_files_outside_the_input_folder_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let task = task_in(temp.path(), &[("train.csv", "id,y\n1,0\n"), ("docs/metric.txt", "Use RMSE.")]);
        let secret = temp.path().join("secret.txt");
        fs::write(&secret, "do not read").expect("write secret");
        let reply = format!(
            "Description Files:\n- ../secret.txt\n- {}\n- docs/../../secret.txt\n- docs/metric.txt",
            secret.display()
        );
        let chat = ScriptedChat::new()
            .reply(AgentRole::DescriptionFileRetriever, &reply)
            .reply(AgentRole::ToolSelector, "RANKED_LIBRARIES:\n1. autogluon");
        let mut controller = controller_with(RunConfig::default(), task, &chat, catalog(&["autogluon"]));
        controller.initialize().expect("initialize");

        let session = controller.session();
        assert_eq!(session.description_files, vec!["docs/metric.txt"]);
        assert!(session.description_file_contents.contains("Use RMSE."));
        assert!(!session.description_file_contents.contains("do not read"));
    }

    #[test]
    fn failed_node_gets_a_debug_child_that_inherits_its_tool() {
        let temp = tempfile::tempdir().expect("tempdir");
        let task = task_in(temp.path(), &[("train.csv", "id,y\n1,0\n")]);
        let chat = ScriptedChat::new()
            .reply(AgentRole::ToolSelector, "RANKED_LIBRARIES:\n1. autogluon")
            .default_reply(AgentRole::PythonCoder, "```python\nprint('hi')\n```")
            .default_reply(AgentRole::BashCoder, "```bash\nexit 1\n```")
            .default_reply(AgentRole::Executer, "DECISION: FIX\nERROR_SUMMARY: exit 1");
        let cfg = RunConfig {
            max_evolve_children: 1,
            ..RunConfig::default()
        };
        let mut controller = controller_with(cfg, task, &chat, catalog(&["autogluon"]));
        controller.initialize().expect("initialize");
        let first = controller.step().expect("step").expect("node");
        let second = controller.step().expect("step").expect("node");

        let tree = controller.tree();
        let debug = tree.node(second).expect("debug");
        assert_eq!(debug.stage, Stage::Debug);
        assert_eq!(debug.parent, Some(first));
        assert_eq!(debug.tool_used.as_deref(), Some("autogluon"));
        assert_eq!(debug.debug_attempts, 1);
        assert!(!debug.is_terminal, "depth 1 of 3 is still open");
        assert_eq!(tree.node(first).expect("first").debug_attempts, 1);
        assert!(!tree.node(first).expect("first").artifacts.error_message.is_empty());
    }
}
