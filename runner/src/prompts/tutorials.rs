//! Tutorial retrieval roles: query writing and reranking.

use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use tracing::warn;

use crate::core::types::AgentRole;
use crate::io::config::RunConfig;
use crate::prompts::parse::header_value;
use crate::prompts::{PromptBuilder, load_template};

const RETRIEVER_TEMPLATE: &str = include_str!("templates/retriever.txt");
const RERANKER_TEMPLATE: &str = include_str!("templates/reranker.txt");

static INDEX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("index regex"));

#[derive(Debug, Clone)]
pub struct RetrieverPrompt {
    template: String,
}

impl RetrieverPrompt {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        Ok(Self {
            template: load_template(cfg, AgentRole::Retriever, RETRIEVER_TEMPLATE)?,
        })
    }
}

impl PromptBuilder for RetrieverPrompt {
    type Output = String;

    fn role(&self) -> AgentRole {
        AgentRole::Retriever
    }

    fn template(&self) -> &str {
        &self.template
    }

    fn set_template(&mut self, template: String) {
        self.template = template;
    }

    fn parse(&self, reply: &str) -> String {
        header_value(reply, "SEARCH_QUERY")
            .filter(|query| !query.is_empty())
            .or_else(|| {
                reply
                    .lines()
                    .map(str::trim)
                    .find(|line| !line.is_empty())
                    .map(str::to_string)
            })
            .map(|query| query.trim_matches(['"', '`']).to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct RerankerPrompt {
    template: String,
}

impl RerankerPrompt {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        Ok(Self {
            template: load_template(cfg, AgentRole::Reranker, RERANKER_TEMPLATE)?,
        })
    }
}

impl PromptBuilder for RerankerPrompt {
    /// 1-based candidate numbers, in the order the model ranked them.
    type Output = Vec<usize>;

    fn role(&self) -> AgentRole {
        AgentRole::Reranker
    }

    fn template(&self) -> &str {
        &self.template
    }

    fn set_template(&mut self, template: String) {
        self.template = template;
    }

    fn parse(&self, reply: &str) -> Vec<usize> {
        let Some(value) = header_value(reply, "SELECTED_TUTORIALS") else {
            warn!("reranker reply has no SELECTED_TUTORIALS line");
            return Vec::new();
        };
        let mut picked = Vec::new();
        for m in INDEX_RE.find_iter(&value) {
            if let Ok(index) = m.as_str().parse::<usize>()
                && index > 0
                && !picked.contains(&index)
            {
                picked.push(index);
            }
        }
        picked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriever_reads_query_header() {
        let retriever = RetrieverPrompt::new(&RunConfig::default()).expect("retriever");
        assert_eq!(
            retriever.parse("SEARCH_QUERY: \"tabular regression time limit\""),
            "tabular regression time limit"
        );
        assert_eq!(retriever.parse("\n  image classification\nmore"), "image classification");
        assert_eq!(retriever.parse(""), "");
    }

    #[test]
    fn reranker_keeps_order_and_drops_duplicates() {
        let reranker = RerankerPrompt::new(&RunConfig::default()).expect("reranker");
        assert_eq!(reranker.parse("SELECTED_TUTORIALS: 3, 1, 3, 0"), vec![3, 1]);
        assert_eq!(reranker.parse("**SELECTED_TUTORIALS:** [2]"), vec![2]);
        assert!(reranker.parse("none of them").is_empty());
    }
}
