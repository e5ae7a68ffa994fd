//! Roles that run once before the search: tool selection, task description
//! and description-file discovery.

use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::core::types::AgentRole;
use crate::io::config::RunConfig;
use crate::io::tools::closest_name;
use crate::prompts::parse::{is_none_marker, section, tail_after};
use crate::prompts::{PromptBuilder, load_template};

const TOOL_SELECTOR_TEMPLATE: &str = include_str!("templates/tool_selector.txt");
const TASK_DESCRIPTOR_TEMPLATE: &str = include_str!("templates/task_descriptor.txt");
const DESCRIPTION_FILES_TEMPLATE: &str = include_str!("templates/description_file_retriever.txt");

static NUMBERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+\s*[.)]\s*(.+)$").expect("numbered regex"));
static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*•+]\s+(.+)$").expect("bullet regex"));

/// Ranked tool names, all present in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolSelection {
    pub explanation: String,
    pub ranked: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ToolSelectorPrompt {
    template: String,
    catalog_names: Vec<String>,
    default_tool: String,
}

impl ToolSelectorPrompt {
    pub fn new(cfg: &RunConfig, catalog_names: Vec<String>) -> Result<Self> {
        Ok(Self {
            template: load_template(cfg, AgentRole::ToolSelector, TOOL_SELECTOR_TEMPLATE)?,
            catalog_names,
            default_tool: cfg.default_tool.clone(),
        })
    }
}

impl PromptBuilder for ToolSelectorPrompt {
    type Output = ToolSelection;

    fn role(&self) -> AgentRole {
        AgentRole::ToolSelector
    }

    fn template(&self) -> &str {
        &self.template
    }

    fn set_template(&mut self, template: String) {
        self.template = template;
    }

    fn parse(&self, reply: &str) -> ToolSelection {
        let explanation = section(reply, "EXPLANATION").unwrap_or_default();
        let region = section(reply, "RANKED_LIBRARIES").unwrap_or_else(|| reply.to_string());

        let mut ranked: Vec<String> = Vec::new();
        for item in list_items(&region) {
            match closest_name(clean_item(&item), &self.catalog_names) {
                Some(name) if !ranked.contains(&name) => ranked.push(name),
                Some(_) => {}
                None => warn!(item = %item, "tool selector named an unknown tool"),
            }
        }
        if ranked.is_empty() {
            warn!(default = %self.default_tool, "no usable tool in selector reply, using default");
            ranked.push(self.default_tool.clone());
        }
        ToolSelection { explanation, ranked }
    }
}

/// Items of a list: numbered entries if any, else bullets, else plain lines
/// split on commas.
fn list_items(region: &str) -> Vec<String> {
    let numbered: Vec<String> = region
        .lines()
        .filter_map(|line| NUMBERED_RE.captures(line).map(|caps| caps[1].to_string()))
        .collect();
    if !numbered.is_empty() {
        return numbered;
    }
    let bullets: Vec<String> = region
        .lines()
        .filter_map(|line| BULLET_RE.captures(line).map(|caps| caps[1].to_string()))
        .collect();
    if !bullets.is_empty() {
        return bullets;
    }
    region
        .lines()
        .flat_map(|line| line.split(','))
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Drop emphasis, quoting and any trailing explanation from a list item.
fn clean_item(item: &str) -> &str {
    let mut cleaned = item.trim();
    for separator in [" - ", " – ", ": ", " (", ","] {
        if let Some((head, _)) = cleaned.split_once(separator) {
            cleaned = head;
        }
    }
    cleaned.trim().trim_matches(['*', '`', '"', '\'']).trim()
}

#[derive(Debug, Clone)]
pub struct TaskDescriptorPrompt {
    template: String,
}

impl TaskDescriptorPrompt {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        Ok(Self {
            template: load_template(cfg, AgentRole::TaskDescriptor, TASK_DESCRIPTOR_TEMPLATE)?,
        })
    }
}

impl PromptBuilder for TaskDescriptorPrompt {
    type Output = String;

    fn role(&self) -> AgentRole {
        AgentRole::TaskDescriptor
    }

    fn template(&self) -> &str {
        &self.template
    }

    fn set_template(&mut self, template: String) {
        self.template = template;
    }

    fn parse(&self, reply: &str) -> String {
        tail_after(reply, "Task Description").unwrap_or_else(|| reply.trim().to_string())
    }
}

#[derive(Debug, Clone)]
pub struct DescriptionFileRetrieverPrompt {
    template: String,
}

impl DescriptionFileRetrieverPrompt {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        Ok(Self {
            template: load_template(
                cfg,
                AgentRole::DescriptionFileRetriever,
                DESCRIPTION_FILES_TEMPLATE,
            )?,
        })
    }
}

impl PromptBuilder for DescriptionFileRetrieverPrompt {
    type Output = Vec<String>;

    fn role(&self) -> AgentRole {
        AgentRole::DescriptionFileRetriever
    }

    fn template(&self) -> &str {
        &self.template
    }

    fn set_template(&mut self, template: String) {
        self.template = template;
    }

    /// Relative paths listed after `Description Files:`; empty for `None`.
    fn parse(&self, reply: &str) -> Vec<String> {
        let Some(region) = tail_after(reply, "Description Files") else {
            return Vec::new();
        };
        let mut files = Vec::new();
        for item in list_items(&region) {
            let path = item.trim().trim_matches(['`', '"', '\'', '*']).trim().to_string();
            if !is_none_marker(&path) && !files.contains(&path) {
                files.push(path);
            }
        }
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> ToolSelectorPrompt {
        let names = ["autogluon", "scikit-learn", "pytorch"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        ToolSelectorPrompt::new(&RunConfig::default(), names).expect("selector")
    }

    #[test]
    fn numbered_list_is_preferred() {
        let reply = "EXPLANATION: Tabular data suits AutoML.\nRANKED_LIBRARIES:\n1. **AutoGluon** - best for tables\n2. scikit-learn (baseline)\n3. autogluon\n- pytorch";
        let selection = selector().parse(reply);
        assert_eq!(selection.explanation, "Tabular data suits AutoML.");
        assert_eq!(selection.ranked, vec!["autogluon", "scikit-learn"]);
    }

    #[test]
    fn bullets_then_plain_lines_are_fallbacks() {
        let bullets = selector().parse("RANKED_LIBRARIES:\n- pytorch\n- autogluon");
        assert_eq!(bullets.ranked, vec!["pytorch", "autogluon"]);

        let plain = selector().parse("RANKED_LIBRARIES: scikit-learn, pytorch");
        assert_eq!(plain.ranked, vec!["scikit-learn", "pytorch"]);
    }

    #[test]
    fn misspelled_names_map_to_closest_entry() {
        let selection = selector().parse("RANKED_LIBRARIES:\n1. pytorh\n2. scikit-lern");
        assert_eq!(selection.ranked, vec!["pytorch", "scikit-learn"]);
    }

    #[test]
    fn total_failure_returns_default_tool() {
        let selection = selector().parse("I cannot decide.");
        assert_eq!(selection.ranked, vec![RunConfig::default().default_tool]);
    }

    #[test]
    fn task_description_follows_header() {
        let descriptor = TaskDescriptorPrompt::new(&RunConfig::default()).expect("descriptor");
        let reply = "Sure.\nTask Description: Predict `price` from train.csv.\nReport RMSE.";
        assert_eq!(descriptor.parse(reply), "Predict `price` from train.csv.\nReport RMSE.");
        assert_eq!(descriptor.parse("  Just text  "), "Just text");
    }

    #[test]
    fn description_files_are_listed_or_none() {
        let retriever = DescriptionFileRetrieverPrompt::new(&RunConfig::default()).expect("retriever");
        let reply = "Description Files:\n- `README.md`\n- docs/metric.txt";
        assert_eq!(retriever.parse(reply), vec!["README.md", "docs/metric.txt"]);
        assert!(retriever.parse("Description Files: None").is_empty());
        assert!(retriever.parse("no idea").is_empty());
    }
}
