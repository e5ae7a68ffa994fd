//! Shared deterministic types for the search core.
//!
//! These types define stable contracts between the controller, the agents and
//! the artifact store. They carry no I/O and serialize to stable lowercase or
//! uppercase tags.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role of a node in the search tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Root,
    /// Explores from a success (or opens a new tool under the root).
    Evolve,
    /// Repairs a failure.
    Debug,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Root => "root",
            Stage::Evolve => "evolve",
            Stage::Debug => "debug",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every agent the runner drives. The string form names config sections,
/// template overrides, state files and token-ledger entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    PythonCoder,
    BashCoder,
    Executer,
    ErrorAnalyzer,
    ToolSelector,
    TaskDescriptor,
    DescriptionFileRetriever,
    Retriever,
    Reranker,
    Chat,
    MetaPrompting,
    PythonReader,
}

impl AgentRole {
    pub const ALL: [AgentRole; 12] = [
        AgentRole::PythonCoder,
        AgentRole::BashCoder,
        AgentRole::Executer,
        AgentRole::ErrorAnalyzer,
        AgentRole::ToolSelector,
        AgentRole::TaskDescriptor,
        AgentRole::DescriptionFileRetriever,
        AgentRole::Retriever,
        AgentRole::Reranker,
        AgentRole::Chat,
        AgentRole::MetaPrompting,
        AgentRole::PythonReader,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::PythonCoder => "python_coder",
            AgentRole::BashCoder => "bash_coder",
            AgentRole::Executer => "executer",
            AgentRole::ErrorAnalyzer => "error_analyzer",
            AgentRole::ToolSelector => "tool_selector",
            AgentRole::TaskDescriptor => "task_descriptor",
            AgentRole::DescriptionFileRetriever => "description_file_retriever",
            AgentRole::Retriever => "retriever",
            AgentRole::Reranker => "reranker",
            AgentRole::Chat => "chat",
            AgentRole::MetaPrompting => "meta_prompting",
            AgentRole::PythonReader => "python_reader",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.as_str() == raw)
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evaluator verdict on one execution.
///
/// `Restart` is accepted from the evaluator but handled exactly like `Fix`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Success,
    Fix,
    Restart,
}

impl Decision {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().trim_matches('*').to_ascii_uppercase().as_str() {
            "SUCCESS" => Some(Decision::Success),
            "FIX" => Some(Decision::Fix),
            "RESTART" => Some(Decision::Restart),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Decision::Success)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Decision::Success => "SUCCESS",
            Decision::Fix => "FIX",
            Decision::Restart => "RESTART",
        };
        f.write_str(tag)
    }
}

/// Triple produced by one simulation and replayed on every ancestor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimulationOutcome {
    pub validation_score: Option<f64>,
    pub is_validated: bool,
    pub is_failure: bool,
}

impl SimulationOutcome {
    pub fn new(decision: Decision, validation_score: Option<f64>) -> Self {
        Self {
            validation_score,
            is_validated: validation_score.is_some(),
            is_failure: !decision.is_success(),
        }
    }
}
