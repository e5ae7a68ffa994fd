//! Run configuration loaded from a TOML file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::search::ExpansionLimits;
use crate::core::types::AgentRole;
use crate::core::uct::UctParams;

/// Run configuration (TOML).
///
/// Every field has a default so a config file only needs to name what it
/// changes. Relative paths are resolved against the config file's directory
/// by [`load_config`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Direct children of the root before it counts as fully expanded.
    pub initial_root_children: usize,
    pub max_debug_children: usize,
    pub max_evolve_children: usize,
    /// Debug-chain length cap, also the per-parent debug-attempt cap.
    pub max_debug_depth: u32,
    pub exploration_constant: f64,
    pub failure_offset: f64,
    pub failure_penalty_weight: f64,

    /// Executor subprocess timeout in seconds.
    pub per_execution_timeout: u64,
    /// Wait between SIGTERM and SIGKILL.
    pub kill_grace_period_secs: u64,
    /// Tee subprocess output to the log.
    pub stream_output: bool,
    /// In-memory cap per captured stream.
    pub output_limit_bytes: usize,

    pub continuous_improvement: bool,
    pub optimize_system_resources: bool,
    pub create_venv: bool,
    pub configure_env: bool,
    pub remove_current_iteration_folder: bool,
    pub enable_meta_prompting: bool,

    pub prompt_char_budget: usize,
    pub max_user_input_length: usize,
    pub max_stdout_length: usize,
    pub max_stderr_length: usize,
    pub max_error_message_length: usize,
    /// How many recent error analyses the coder sees.
    pub max_error_analyses: usize,

    pub max_num_tutorials: usize,
    pub max_tutorial_length: usize,
    pub max_tutorial_candidates: usize,

    pub max_data_files: usize,
    pub max_chars_per_file: usize,
    pub reader_timeout_secs: u64,
    /// Interpreter used by the file reader.
    pub python: String,

    /// Tool used when the selector produces nothing usable.
    pub default_tool: String,
    pub tool_catalog: Option<PathBuf>,

    pub llm: LlmConfig,
    /// Per-agent overrides keyed by agent name.
    pub agents: BTreeMap<String, AgentConfig>,
    /// Template overrides keyed by agent name: a file path or a literal template.
    pub templates: BTreeMap<String, String>,
}

/// Chat backend shared by every agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LlmConfig {
    /// Backend argv; `{model}` in an argument is replaced by the agent's model.
    pub command: Vec<String>,
    pub model: String,
    pub multi_turn: bool,
    pub max_output_tokens: Option<u32>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm".to_string(), "-m".to_string(), "{model}".to_string()],
            model: "gpt-4o".to_string(),
            multi_turn: false,
            max_output_tokens: None,
            timeout_secs: 600,
            max_retries: 3,
            retry_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub multi_turn: Option<bool>,
    pub model: Option<String>,
    pub max_output_tokens: Option<u32>,
}

/// Effective chat settings for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub multi_turn: bool,
    pub model: String,
    pub max_output_tokens: Option<u32>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            initial_root_children: 3,
            max_debug_children: 2,
            max_evolve_children: 2,
            max_debug_depth: 3,
            exploration_constant: 1.414,
            failure_offset: 0.0,
            failure_penalty_weight: 0.5,
            per_execution_timeout: 60 * 60,
            kill_grace_period_secs: 5,
            stream_output: true,
            output_limit_bytes: 1_000_000,
            continuous_improvement: false,
            optimize_system_resources: false,
            create_venv: false,
            configure_env: false,
            remove_current_iteration_folder: false,
            enable_meta_prompting: false,
            prompt_char_budget: 80_000,
            max_user_input_length: 2_048,
            max_stdout_length: 8_192,
            max_stderr_length: 8_192,
            max_error_message_length: 8_192,
            max_error_analyses: 5,
            max_num_tutorials: 5,
            max_tutorial_length: 8_192,
            max_tutorial_candidates: 20,
            max_data_files: 50,
            max_chars_per_file: 1_024,
            reader_timeout_secs: 60,
            python: "python3".to_string(),
            default_tool: "machine learning".to_string(),
            tool_catalog: None,
            llm: LlmConfig::default(),
            agents: BTreeMap::new(),
            templates: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_root_children == 0 {
            return Err(anyhow!("initial_root_children must be > 0"));
        }
        if self.max_debug_children == 0 || self.max_evolve_children == 0 {
            return Err(anyhow!("max_debug_children and max_evolve_children must be > 0"));
        }
        if self.max_debug_depth == 0 {
            return Err(anyhow!("max_debug_depth must be > 0"));
        }
        if !self.exploration_constant.is_finite() || self.exploration_constant < 0.0 {
            return Err(anyhow!("exploration_constant must be a finite value >= 0"));
        }
        if !self.failure_offset.is_finite() || !self.failure_penalty_weight.is_finite() {
            return Err(anyhow!("failure_offset and failure_penalty_weight must be finite"));
        }
        if self.per_execution_timeout == 0 {
            return Err(anyhow!("per_execution_timeout must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.prompt_char_budget == 0 {
            return Err(anyhow!("prompt_char_budget must be > 0"));
        }
        if self.max_num_tutorials > self.max_tutorial_candidates {
            return Err(anyhow!(
                "max_num_tutorials ({}) must not exceed max_tutorial_candidates ({})",
                self.max_num_tutorials,
                self.max_tutorial_candidates
            ));
        }
        if self.reader_timeout_secs == 0 {
            return Err(anyhow!("reader_timeout_secs must be > 0"));
        }
        if self.python.trim().is_empty() {
            return Err(anyhow!("python must be a non-empty interpreter name"));
        }
        if self.default_tool.trim().is_empty() {
            return Err(anyhow!("default_tool must be non-empty"));
        }
        if self.llm.command.is_empty() || self.llm.command[0].trim().is_empty() {
            return Err(anyhow!("llm.command must be a non-empty array"));
        }
        if self.llm.timeout_secs == 0 {
            return Err(anyhow!("llm.timeout_secs must be > 0"));
        }
        for name in self.agents.keys() {
            if AgentRole::parse(name).is_none() {
                return Err(anyhow!("agents.{name}: unknown agent"));
            }
        }
        for name in self.templates.keys() {
            if AgentRole::parse(name).is_none() {
                return Err(anyhow!("templates.{name}: unknown agent"));
            }
        }
        Ok(())
    }

    pub fn expansion_limits(&self) -> ExpansionLimits {
        ExpansionLimits {
            initial_root_children: self.initial_root_children,
            max_debug_children: self.max_debug_children,
            max_evolve_children: self.max_evolve_children,
            max_debug_depth: self.max_debug_depth,
        }
    }

    pub fn uct_params(&self) -> UctParams {
        UctParams {
            exploration_constant: self.exploration_constant,
            failure_offset: self.failure_offset,
            failure_penalty_weight: self.failure_penalty_weight,
        }
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.per_execution_timeout)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_period_secs)
    }

    /// Chat settings for `role`, with per-agent overrides applied.
    pub fn agent_settings(&self, role: AgentRole) -> AgentSettings {
        let overrides = self.agents.get(role.as_str());
        AgentSettings {
            multi_turn: overrides
                .and_then(|a| a.multi_turn)
                .unwrap_or(self.llm.multi_turn),
            model: overrides
                .and_then(|a| a.model.clone())
                .unwrap_or_else(|| self.llm.model.clone()),
            max_output_tokens: overrides
                .and_then(|a| a.max_output_tokens)
                .or(self.llm.max_output_tokens),
        }
    }

    pub fn template_override(&self, role: AgentRole) -> Option<&str> {
        self.templates.get(role.as_str()).map(String::as_str)
    }

    fn resolve_paths(&mut self, base: &Path) {
        if let Some(catalog) = &self.tool_catalog
            && catalog.is_relative()
        {
            self.tool_catalog = Some(base.join(catalog));
        }
        for value in self.templates.values_mut() {
            let candidate = base.join(value.as_str());
            if Path::new(value.as_str()).is_relative() && candidate.is_file() {
                *value = candidate.to_string_lossy().into_owned();
            }
        }
    }
}

/// Load and validate config from a TOML file.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut cfg: RunConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    if let Some(base) = path.parent() {
        cfg.resolve_paths(base);
    }
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
