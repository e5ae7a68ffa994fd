//! Auxiliary roles: free-form chat, template rewriting and data-file readers.

use anyhow::Result;

use crate::core::types::AgentRole;
use crate::io::config::RunConfig;
use crate::prompts::parse::{any_fenced_block, fenced_block};
use crate::prompts::{PromptBuilder, load_template};

const CHAT_TEMPLATE: &str = include_str!("templates/chat.txt");
const META_PROMPTING_TEMPLATE: &str = include_str!("templates/meta_prompting.txt");
const PYTHON_READER_TEMPLATE: &str = include_str!("templates/python_reader.txt");

#[derive(Debug, Clone)]
pub struct ChatPrompt {
    template: String,
}

impl ChatPrompt {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        Ok(Self {
            template: load_template(cfg, AgentRole::Chat, CHAT_TEMPLATE)?,
        })
    }
}

impl PromptBuilder for ChatPrompt {
    type Output = String;

    fn role(&self) -> AgentRole {
        AgentRole::Chat
    }

    fn template(&self) -> &str {
        &self.template
    }

    fn set_template(&mut self, template: String) {
        self.template = template;
    }

    fn parse(&self, reply: &str) -> String {
        reply.trim().to_string()
    }
}

/// Rewrites another role's template for the current task.
#[derive(Debug, Clone)]
pub struct MetaPromptingPrompt {
    template: String,
}

impl MetaPromptingPrompt {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        Ok(Self {
            template: load_template(cfg, AgentRole::MetaPrompting, META_PROMPTING_TEMPLATE)?,
        })
    }
}

impl PromptBuilder for MetaPromptingPrompt {
    type Output = String;

    fn role(&self) -> AgentRole {
        AgentRole::MetaPrompting
    }

    fn template(&self) -> &str {
        &self.template
    }

    fn set_template(&mut self, template: String) {
        self.template = template;
    }

    fn parse(&self, reply: &str) -> String {
        fenced_block(reply, &["text", "txt", "markdown", "md"])
            .or_else(|| any_fenced_block(reply))
            .unwrap_or_else(|| reply.trim().to_string())
    }
}

/// Writes a snippet that summarizes one input file.
#[derive(Debug, Clone)]
pub struct PythonReaderPrompt {
    template: String,
}

impl PythonReaderPrompt {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        Ok(Self {
            template: load_template(cfg, AgentRole::PythonReader, PYTHON_READER_TEMPLATE)?,
        })
    }
}

impl PromptBuilder for PythonReaderPrompt {
    type Output = String;

    fn role(&self) -> AgentRole {
        AgentRole::PythonReader
    }

    fn template(&self) -> &str {
        &self.template
    }

    fn set_template(&mut self, template: String) {
        self.template = template;
    }

    fn parse(&self, reply: &str) -> String {
        fenced_block(reply, &["python", "py", "python3"]).unwrap_or_else(|| reply.trim().to_string())
    }
}
