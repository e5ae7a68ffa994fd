//! Execution agent: run a node's launcher script and have the evaluator judge it.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::agents::{Agent, AgentContext};
use crate::core::template::{Layered, VariableMap, VariableProvider};
use crate::core::types::Decision;
use crate::io::artifacts::{NodePaths, write_state};
use crate::io::config::RunConfig;
use crate::io::process::{RunLimits, run_command};
use crate::io::signals::CancelledError;
use crate::prompts::{ExecuterPrompt, PromptBuilder};

/// Outcome of one simulation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub decision: Decision,
    pub error_summary: String,
    pub validation_score: Option<f64>,
    pub evaluator_prompt: String,
    pub stderr: String,
    pub stdout: String,
}

pub struct ExecutionAgent {
    evaluator: Agent<ExecuterPrompt>,
    shell: String,
    timeout: Duration,
    grace: Duration,
    output_limit_bytes: usize,
    tee: bool,
    ctx: AgentContext,
}

impl ExecutionAgent {
    pub fn new(cfg: &RunConfig, ctx: AgentContext) -> Result<Self> {
        Ok(Self {
            evaluator: Agent::new(ExecuterPrompt::new(cfg)?, cfg, ctx.clone()),
            shell: "bash".to_string(),
            timeout: cfg.execution_timeout(),
            grace: cfg.kill_grace(),
            output_limit_bytes: cfg.output_limit_bytes,
            tee: cfg.stream_output,
            ctx,
        })
    }

    /// Run `execution_script.sh` inside the node's `output/` directory.
    ///
    /// A script that exits non-zero or times out is never reported as a
    /// success, whatever the evaluator says.
    #[instrument(skip_all, fields(node = %paths.dir.display()))]
    pub fn run(&mut self, paths: &NodePaths, vars: &dyn VariableProvider) -> Result<ExecutionResult> {
        self.ctx.cancel.check()?;
        let mut cmd = Command::new(&self.shell);
        cmd.arg(&paths.script_path).current_dir(&paths.output_dir);
        let limits = RunLimits::new(self.timeout, self.output_limit_bytes)
            .kill_grace(self.grace)
            .cancel(&self.ctx.cancel)
            .tee(self.tee);

        info!(script = %paths.script_path.display(), "executing generated script");
        let output = run_command(cmd, None, &limits)
            .with_context(|| format!("run {}", paths.script_path.display()))?;
        if output.cancelled {
            return Err(CancelledError.into());
        }
        let stdout = output.stdout_text();
        let stderr = output.stderr_text(self.timeout);
        write_state(&paths.states_dir, "stdout.txt", &stdout);
        write_state(&paths.states_dir, "stderr.txt", &stderr);
        info!(
            exit = ?output.status.code(),
            timed_out = output.timed_out,
            "script finished"
        );

        let local = VariableMap::new()
            .with("stdout", stdout.clone())
            .with("stderr", stderr.clone());
        let layered = Layered::new(&local, vars);
        let evaluator_prompt = self.evaluator.builder().build(&layered);
        let mut evaluation = self.evaluator.call(&layered, &paths.states_dir)?;

        if evaluation.decision.is_success() && !output.success() {
            warn!(
                exit = ?output.status.code(),
                timed_out = output.timed_out,
                "evaluator reported success for a failed script, treating as FIX"
            );
            evaluation.decision = Decision::Fix;
            evaluation.validation_score = None;
            if evaluation.error_summary.is_empty() {
                evaluation.error_summary = match (output.timed_out, output.status.code()) {
                    (true, _) => format!("The script exceeded the {}s timeout.", self.timeout.as_secs()),
                    (false, Some(code)) => format!("The script exited with code {code}."),
                    (false, None) => "The script was killed by a signal.".to_string(),
                };
            }
        }

        Ok(ExecutionResult {
            decision: evaluation.decision,
            error_summary: evaluation.error_summary,
            validation_score: evaluation.validation_score,
            evaluator_prompt,
            stderr,
            stdout,
        })
    }
}
