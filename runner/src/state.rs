//! Run-level session state and the per-node variable provider.
//!
//! [`SessionState`] holds what initialization produced plus the running
//! aggregates the controller maintains. [`NodeVariables`] answers template
//! lookups for one node; every "previous" value is read through the node's
//! parent link.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::core::template::{TruncateMode, VariableProvider, truncate};
use crate::core::types::Stage;
use crate::io::artifacts::NodePaths;
use crate::io::config::RunConfig;
use crate::tree::{Node, NodeId, SearchTree};

/// Facts fixed at run start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub input_data_folder: PathBuf,
    pub output_folder: PathBuf,
    pub initial_user_input: Option<String>,
    pub per_iteration_input: bool,
}

/// Initialization results and cross-iteration aggregates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionState {
    pub data_prompt: String,
    pub data_files: Vec<String>,
    pub description_files: Vec<String>,
    pub description_file_contents: String,
    pub task_description: String,
    /// Tool catalog listing shown to the selector.
    pub tool_listing: String,
    /// Selected tools in priority order.
    pub available_tools: Vec<String>,
    /// Prompt fragment per available tool.
    pub tool_prompts: BTreeMap<String, String>,
    pub tool_requirements: BTreeMap<String, Vec<String>>,
    /// Tools in the order they were first used.
    pub used_tools: Vec<String>,
    pub all_error_analyses: Vec<String>,
    pub best_node: Option<NodeId>,
    pub best_validation_score: Option<f64>,
    pub worst_validation_score: Option<f64>,
    pub last_successful_node: Option<NodeId>,
}

impl SessionState {
    pub fn has_unused_tool(&self) -> bool {
        self.available_tools
            .iter()
            .any(|tool| !self.used_tools.contains(tool))
    }

    pub fn first_unused_tool(&self) -> Option<&str> {
        self.available_tools
            .iter()
            .find(|tool| !self.used_tools.contains(tool))
            .map(String::as_str)
    }

    pub fn mark_tool_used(&mut self, tool: &str) {
        if !self.used_tools.iter().any(|t| t == tool) {
            self.used_tools.push(tool.to_string());
        }
    }

    /// Fold a validated score into the best/worst aggregates.
    pub fn record_score(&mut self, node: NodeId, score: f64) {
        if self.best_validation_score.is_none_or(|best| score > best) {
            self.best_validation_score = Some(score);
            self.best_node = Some(node);
        }
        if self.worst_validation_score.is_none_or(|worst| score < worst) {
            self.worst_validation_score = Some(score);
        }
    }

    /// Node `best_run` should point at: the best score, else the last success.
    pub fn promotion_target(&self) -> Option<NodeId> {
        self.best_node.or(self.last_successful_node)
    }
}

/// Template variables for one node, or for the run as a whole when `node`
/// is the root.
pub struct NodeVariables<'a> {
    pub cfg: &'a RunConfig,
    pub task: &'a TaskContext,
    pub session: &'a SessionState,
    pub tree: &'a SearchTree,
    pub node: NodeId,
    pub paths: Option<&'a NodePaths>,
}

impl<'a> NodeVariables<'a> {
    pub fn new(
        cfg: &'a RunConfig,
        task: &'a TaskContext,
        session: &'a SessionState,
        tree: &'a SearchTree,
        node: NodeId,
        paths: Option<&'a NodePaths>,
    ) -> Self {
        Self {
            cfg,
            task,
            session,
            tree,
            node,
            paths,
        }
    }
}

impl NodeVariables<'_> {
    fn current(&self) -> Option<&Node> {
        self.tree.get(self.node)
    }

    /// Parent of the current node, unless it is the root.
    fn previous(&self) -> Option<&Node> {
        let parent = self.current()?.parent?;
        self.tree.get(parent).filter(|node| !node.is_root())
    }

    fn user_input(&self) -> String {
        self.current()
            .map(|node| node.artifacts.user_input.clone())
            .filter(|input| !input.is_empty())
            .or_else(|| self.task.initial_user_input.clone())
            .unwrap_or_default()
    }

    fn previous_error_prompt(&self) -> String {
        let Some(node) = self.current() else {
            return String::new();
        };
        if node.stage != Stage::Debug {
            return String::new();
        }
        let Some(prev) = self.previous() else {
            return String::new();
        };
        let mut out = String::from(
            "## Previous attempt\nThe program below failed. Fix it and keep what already works.\n\n```python\n",
        );
        out.push_str(prev.artifacts.python_code.trim_end());
        out.push_str("\n```\n\n### Error\n");
        out.push_str(&truncate(
            prev.artifacts.error_message.trim(),
            TruncateMode::Mid,
            self.cfg.max_error_message_length,
        ));
        if !prev.artifacts.error_analysis.trim().is_empty() {
            out.push_str("\n\n### Analysis\n");
            out.push_str(prev.artifacts.error_analysis.trim());
        }
        out.push('\n');
        out
    }

    fn best_code_prompt(&self) -> String {
        let Some(node) = self.current() else {
            return String::new();
        };
        if node.stage != Stage::Evolve {
            return String::new();
        }
        let Some(prev) = self.previous().filter(|prev| prev.is_successful) else {
            return String::new();
        };
        let score = match prev.validation_score {
            Some(score) => format!(" with validation score {score}"),
            None => String::new(),
        };
        format!(
            "## Previous solution\nThe program below succeeded{score}. Improve on it; try a different model, features or settings rather than repeating it.\n\n```python\n{}\n```\n",
            prev.artifacts.python_code.trim_end()
        )
    }

    fn all_error_analyses(&self) -> String {
        let analyses = &self.session.all_error_analyses;
        let skip = analyses.len().saturating_sub(self.cfg.max_error_analyses);
        analyses[skip..]
            .iter()
            .map(|analysis| format!("- {}", analysis.trim()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn environment_prompt(&self) -> String {
        let requirements = self
            .current()
            .and_then(|node| node.tool_used.as_ref())
            .and_then(|tool| self.session.tool_requirements.get(tool))
            .filter(|reqs| !reqs.is_empty())
            .map(|reqs| reqs.join(" "));
        let mut lines = Vec::new();
        if self.cfg.create_venv {
            lines.push("Create a virtual environment in .venv next to the program with `python3 -m venv`, activate it, and install everything the program imports.".to_string());
        }
        if self.cfg.configure_env {
            match requirements {
                Some(reqs) => lines.push(format!("Install the tool's requirements with pip before running: {reqs}")),
                None => lines.push("Install any missing packages with pip before running the program.".to_string()),
            }
        }
        if lines.is_empty() {
            lines.push("The environment is already configured. Do not create environments or install packages.".to_string());
        }
        lines.join("\n")
    }

    fn validation_prompt(&self) -> String {
        let mut out = String::from(
            "- If a validation metric can be computed, print it on its own line as `VALIDATION_SCORE: <value>`.",
        );
        if self.cfg.continuous_improvement {
            out.push_str("\n- Hold out 10% of the training data as a validation set and report the metric on it.");
        }
        out
    }

    fn system_resources_prompt(&self) -> String {
        if !self.cfg.optimize_system_resources {
            return String::new();
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        format!("- Use the available hardware efficiently: {cpus} CPU cores; use a GPU if one is present.")
    }

    fn node_artifact(&self, pick: fn(&Node) -> &String) -> Option<String> {
        self.current().map(|node| pick(node).clone())
    }

    fn previous_artifact(&self, pick: fn(&Node) -> &String) -> Option<String> {
        self.previous().map(|node| pick(node).clone())
    }
}

impl VariableProvider for NodeVariables<'_> {
    fn get(&self, name: &str) -> Option<String> {
        let value = match name {
            "user_input" => self.user_input(),
            "task_description" => self.session.task_description.clone(),
            "data_prompt" => self.session.data_prompt.clone(),
            "input_data_folder" => self.task.input_data_folder.display().to_string(),
            "output_folder" => match self.paths {
                Some(paths) => paths.output_dir.display().to_string(),
                None => self.task.output_folder.display().to_string(),
            },
            "iteration_folder" => self.paths?.dir.display().to_string(),
            "python_file_path" => self.paths?.python_path.display().to_string(),
            "python_code" => self.node_artifact(|n| &n.artifacts.python_code)?,
            "previous_python_code" => self.previous_artifact(|n| &n.artifacts.python_code)?,
            "bash_script" => self.node_artifact(|n| &n.artifacts.bash_script)?,
            "previous_bash_script" => self.previous_artifact(|n| &n.artifacts.bash_script)?,
            "error_message" => self.node_artifact(|n| &n.artifacts.error_message)?,
            "previous_error_message" => self.previous_artifact(|n| &n.artifacts.error_message)?,
            "previous_error_prompt" => self.previous_error_prompt(),
            "all_error_analyses" => self.all_error_analyses(),
            "tutorial_prompt" => self.node_artifact(|n| &n.artifacts.tutorial_prompt)?,
            "previous_tutorial_prompt" => self.previous_artifact(|n| &n.artifacts.tutorial_prompt)?,
            "tutorial_retrieval" => self.node_artifact(|n| &n.artifacts.tutorial_retrieval)?,
            "selected_tool" => self.current()?.tool_used.clone()?,
            "tool_prompt" => {
                let tool = self.current()?.tool_used.as_ref()?;
                self.session.tool_prompts.get(tool)?.clone()
            }
            "available_tools" => self.session.tool_listing.clone(),
            "environment_prompt" => self.environment_prompt(),
            "system_resources_prompt" => self.system_resources_prompt(),
            "stdout" => self.node_artifact(|n| &n.artifacts.stdout)?,
            "stderr" => self.node_artifact(|n| &n.artifacts.stderr)?,
            "validation_prompt" => self.validation_prompt(),
            "best_code_prompt" => self.best_code_prompt(),
            "data_file_list" => self.session.data_files.join("\n"),
            "description_file_contents" => self.session.description_file_contents.clone(),
            "max_num_tutorials" => self.cfg.max_num_tutorials.to_string(),
            _ => return None,
        };
        Some(value)
    }
}
