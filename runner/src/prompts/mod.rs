//! Prompt builders, one per agent role.
//!
//! A builder owns a template (the shipped default or an override from the
//! config), renders it against a [`VariableProvider`] and parses the model's
//! reply into a typed result. Parsing never fails: a reply that does not match
//! the expected shape yields the role's conservative default.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::warn;

use crate::core::template::{VariableProvider, render, validate_template};
use crate::core::types::AgentRole;
use crate::io::config::RunConfig;

pub mod assist;
pub mod coders;
pub mod evaluation;
mod parse;
pub mod planning;
pub mod tutorials;

pub use assist::{ChatPrompt, MetaPromptingPrompt, PythonReaderPrompt};
pub use coders::{BashCoderPrompt, PythonCoderPrompt};
pub use evaluation::{ErrorAnalyzerPrompt, Evaluation, ExecuterPrompt};
pub use planning::{DescriptionFileRetrieverPrompt, TaskDescriptorPrompt, ToolSelection, ToolSelectorPrompt};
pub use tutorials::{RerankerPrompt, RetrieverPrompt};

/// Contract shared by every agent role.
pub trait PromptBuilder {
    type Output: Serialize;

    fn role(&self) -> AgentRole;

    fn template(&self) -> &str;

    fn set_template(&mut self, template: String);

    fn build(&self, vars: &dyn VariableProvider) -> String {
        render(self.template(), vars)
    }

    fn parse(&self, reply: &str) -> Self::Output;
}

/// Where a template override comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    Literal(String),
    File(PathBuf),
}

impl TemplateSource {
    /// A value naming an existing file is read from disk; anything else is
    /// used as the template text itself.
    pub fn from_override(value: &str) -> Self {
        let path = PathBuf::from(value);
        if path.is_file() {
            TemplateSource::File(path)
        } else {
            TemplateSource::Literal(value.to_string())
        }
    }

    pub fn load(&self) -> Result<String> {
        match self {
            TemplateSource::Literal(text) => Ok(text.clone()),
            TemplateSource::File(path) => {
                fs::read_to_string(path).with_context(|| format!("read template {}", path.display()))
            }
        }
    }
}

/// Template for `role`: the configured override, else `default`.
pub fn load_template(cfg: &RunConfig, role: AgentRole, default: &str) -> Result<String> {
    let Some(value) = cfg.template_override(role) else {
        return Ok(default.to_string());
    };
    let template = TemplateSource::from_override(value)
        .load()
        .with_context(|| format!("load {role} template override"))?;
    let report = validate_template(&template);
    if !report.is_valid() {
        warn!(agent = %role, unknown = ?report.unknown, "template override references unknown variables");
    }
    Ok(template)
}
