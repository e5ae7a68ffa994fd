//! Roles that judge an execution: the evaluator and the error analyzer.

use anyhow::Result;
use serde::Serialize;
use tracing::warn;

use crate::core::template::{Layered, TruncateMode, VariableMap, VariableProvider, render, truncate};
use crate::core::types::{AgentRole, Decision};
use crate::io::config::RunConfig;
use crate::prompts::parse::{first_number, header_value, is_none_marker, section};
use crate::prompts::{PromptBuilder, load_template};

const EXECUTER_TEMPLATE: &str = include_str!("templates/executer.txt");
const ERROR_ANALYZER_TEMPLATE: &str = include_str!("templates/error_analyzer.txt");

/// Parsed evaluator verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub decision: Decision,
    pub error_summary: String,
    /// Only kept when the decision is `SUCCESS`.
    pub validation_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ExecuterPrompt {
    template: String,
    max_stdout_length: usize,
    max_stderr_length: usize,
}

impl ExecuterPrompt {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        Ok(Self {
            template: load_template(cfg, AgentRole::Executer, EXECUTER_TEMPLATE)?,
            max_stdout_length: cfg.max_stdout_length,
            max_stderr_length: cfg.max_stderr_length,
        })
    }
}

impl PromptBuilder for ExecuterPrompt {
    type Output = Evaluation;

    fn role(&self) -> AgentRole {
        AgentRole::Executer
    }

    fn template(&self) -> &str {
        &self.template
    }

    fn set_template(&mut self, template: String) {
        self.template = template;
    }

    fn build(&self, vars: &dyn VariableProvider) -> String {
        let stdout = vars.get("stdout").unwrap_or_default();
        let stderr = vars.get("stderr").unwrap_or_default();
        let local = VariableMap::new()
            .with("stdout", truncate(&stdout, TruncateMode::Mid, self.max_stdout_length))
            .with("stderr", truncate(&stderr, TruncateMode::Mid, self.max_stderr_length));
        render(&self.template, &Layered::new(&local, vars))
    }

    fn parse(&self, reply: &str) -> Evaluation {
        let decision = header_value(reply, "DECISION")
            .and_then(|value| {
                value
                    .split_whitespace()
                    .next()
                    .and_then(Decision::parse)
            })
            .unwrap_or_else(|| {
                warn!("evaluator reply has no usable DECISION, assuming FIX");
                Decision::Fix
            });
        let error_summary = section(reply, "ERROR_SUMMARY")
            .filter(|summary| !is_none_marker(summary))
            .unwrap_or_default();
        let validation_score = if decision.is_success() {
            header_value(reply, "VALIDATION_SCORE")
                .filter(|value| !is_none_marker(value))
                .and_then(|value| first_number(&value))
        } else {
            None
        };
        Evaluation {
            decision,
            error_summary,
            validation_score,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorAnalyzerPrompt {
    template: String,
    max_error_message_length: usize,
}

impl ErrorAnalyzerPrompt {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        Ok(Self {
            template: load_template(cfg, AgentRole::ErrorAnalyzer, ERROR_ANALYZER_TEMPLATE)?,
            max_error_message_length: cfg.max_error_message_length,
        })
    }
}

impl PromptBuilder for ErrorAnalyzerPrompt {
    type Output = String;

    fn role(&self) -> AgentRole {
        AgentRole::ErrorAnalyzer
    }

    fn template(&self) -> &str {
        &self.template
    }

    fn set_template(&mut self, template: String) {
        self.template = template;
    }

    fn build(&self, vars: &dyn VariableProvider) -> String {
        let error = vars.get("previous_error_message").unwrap_or_default();
        let local = VariableMap::new().with(
            "previous_error_message",
            truncate(&error, TruncateMode::Mid, self.max_error_message_length),
        );
        render(&self.template, &Layered::new(&local, vars))
    }

    fn parse(&self, reply: &str) -> String {
        reply
            .lines()
            .find_map(|line| line.trim().strip_prefix("ERROR_SUMMARY:"))
            .map(|summary| summary.trim().to_string())
            .unwrap_or_else(|| reply.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executer() -> ExecuterPrompt {
        ExecuterPrompt::new(&RunConfig::default()).expect("executer")
    }

    #[test]
    fn success_keeps_score() {
        let eval = executer().parse("DECISION: SUCCESS\nERROR_SUMMARY: None\nVALIDATION_SCORE: 0.873");
        assert_eq!(eval.decision, Decision::Success);
        assert_eq!(eval.error_summary, "");
        assert_eq!(eval.validation_score, Some(0.873));
    }

    #[test]
    fn failure_drops_score() {
        let eval = executer().parse(
            "DECISION: FIX\nERROR_SUMMARY: ModuleNotFoundError: autogluon\nVALIDATION_SCORE: 0.5",
        );
        assert_eq!(eval.decision, Decision::Fix);
        assert_eq!(eval.error_summary, "ModuleNotFoundError: autogluon");
        assert_eq!(eval.validation_score, None);
    }

    #[test]
    fn unparseable_reply_defaults_to_fix() {
        let eval = executer().parse("looks fine to me");
        assert_eq!(eval.decision, Decision::Fix);
        assert_eq!(eval.validation_score, None);
    }

    #[test]
    fn restart_is_parsed_as_its_own_decision() {
        let eval = executer().parse("**DECISION:** RESTART\nERROR_SUMMARY: wrong approach");
        assert_eq!(eval.decision, Decision::Restart);
    }

    #[test]
    fn missing_score_on_success_is_none() {
        let eval = executer().parse("DECISION: SUCCESS\nVALIDATION_SCORE: None");
        assert!(eval.decision.is_success());
        assert_eq!(eval.validation_score, None);
    }

    #[test]
    fn outputs_are_mid_truncated() {
        let cfg = RunConfig {
            max_stdout_length: 10,
            ..RunConfig::default()
        };
        let mut prompt = ExecuterPrompt::new(&cfg).expect("executer");
        prompt.set_template("{stdout}".to_string());
        let vars = VariableMap::new().with("stdout", format!("START{}END!!", "-".repeat(100)));
        let rendered = prompt.build(&vars);
        assert!(rendered.starts_with("START"));
        assert!(rendered.ends_with("END!!"));
        assert!(rendered.contains("100 characters"));
    }

    #[test]
    fn analyzer_takes_first_summary_line() {
        let analyzer = ErrorAnalyzerPrompt::new(&RunConfig::default()).expect("analyzer");
        let reply = "Thinking...\nERROR_SUMMARY: label column is 'y'; use it.\nERROR_SUMMARY: second";
        assert_eq!(analyzer.parse(reply), "label column is 'y'; use it.");
        assert_eq!(analyzer.parse("free text"), "free text");
    }
}
