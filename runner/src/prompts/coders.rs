//! Code-generating roles: the Python coder and the bash launcher.

use anyhow::Result;
use tracing::warn;

use crate::core::template::{Layered, TruncateMode, VariableMap, VariableProvider, render, truncate};
use crate::core::types::AgentRole;
use crate::io::config::RunConfig;
use crate::prompts::parse::fenced_block;
use crate::prompts::{PromptBuilder, load_template};

const PYTHON_CODER_TEMPLATE: &str = include_str!("templates/python_coder.txt");
const BASH_CODER_TEMPLATE: &str = include_str!("templates/bash_coder.txt");

#[derive(Debug, Clone)]
pub struct PythonCoderPrompt {
    template: String,
    max_user_input_length: usize,
    prompt_char_budget: usize,
}

impl PythonCoderPrompt {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        Ok(Self {
            template: load_template(cfg, AgentRole::PythonCoder, PYTHON_CODER_TEMPLATE)?,
            max_user_input_length: cfg.max_user_input_length,
            prompt_char_budget: cfg.prompt_char_budget,
        })
    }
}

impl PromptBuilder for PythonCoderPrompt {
    type Output = String;

    fn role(&self) -> AgentRole {
        AgentRole::PythonCoder
    }

    fn template(&self) -> &str {
        &self.template
    }

    fn set_template(&mut self, template: String) {
        self.template = template;
    }

    /// Renders with the user input capped, then caps the whole prompt.
    fn build(&self, vars: &dyn VariableProvider) -> String {
        let user_input = vars.get("user_input").unwrap_or_default();
        let local = VariableMap::new().with(
            "user_input",
            truncate(&user_input, TruncateMode::End, self.max_user_input_length),
        );
        let prompt = render(&self.template, &Layered::new(&local, vars));
        let chars = prompt.chars().count();
        if chars > self.prompt_char_budget {
            warn!(chars, budget = self.prompt_char_budget, "coder prompt over budget, truncating");
            return truncate(&prompt, TruncateMode::End, self.prompt_char_budget);
        }
        prompt
    }

    fn parse(&self, reply: &str) -> String {
        fenced_block(reply, &["python", "py", "python3"]).unwrap_or_else(|| reply.trim().to_string())
    }
}

#[derive(Debug, Clone)]
pub struct BashCoderPrompt {
    template: String,
}

impl BashCoderPrompt {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        Ok(Self {
            template: load_template(cfg, AgentRole::BashCoder, BASH_CODER_TEMPLATE)?,
        })
    }
}

impl PromptBuilder for BashCoderPrompt {
    type Output = String;

    fn role(&self) -> AgentRole {
        AgentRole::BashCoder
    }

    fn template(&self) -> &str {
        &self.template
    }

    fn set_template(&mut self, template: String) {
        self.template = template;
    }

    fn parse(&self, reply: &str) -> String {
        fenced_block(reply, &["bash", "sh", "shell"]).unwrap_or_else(|| reply.trim().to_string())
    }
}
