//! Chat backends.
//!
//! Agents talk to a [`ChatSession`] opened from a [`ChatProvider`]. The bundled
//! [`CommandChatProvider`] pipes each prompt into a configured command and
//! reads the reply from its stdout.

use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::tokens::estimate_tokens;
use crate::core::types::AgentRole;
use crate::io::config::{AgentSettings, LlmConfig};
use crate::io::process::{RunLimits, run_command};
use crate::io::signals::{CancelToken, CancelledError};

const REPLY_LIMIT_BYTES: usize = 4 * 1024 * 1024;

/// One reply with its token usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A conversation with the backend. Multi-turn sessions keep their history.
pub trait ChatSession: Send {
    fn send(&mut self, prompt: &str) -> Result<ChatReply>;
}

pub trait ChatProvider: Send + Sync {
    fn open_session(&self, role: AgentRole, settings: &AgentSettings) -> Result<Box<dyn ChatSession>>;
}

/// Runs the configured backend command once per message.
#[derive(Debug, Clone)]
pub struct CommandChatProvider {
    config: LlmConfig,
    cancel: CancelToken,
}

impl CommandChatProvider {
    pub fn new(config: LlmConfig, cancel: CancelToken) -> Self {
        Self { config, cancel }
    }
}

impl ChatProvider for CommandChatProvider {
    fn open_session(&self, role: AgentRole, settings: &AgentSettings) -> Result<Box<dyn ChatSession>> {
        let argv: Vec<String> = self
            .config
            .command
            .iter()
            .map(|arg| arg.replace("{model}", &settings.model))
            .collect();
        if argv.is_empty() {
            return Err(anyhow!("llm.command is empty"));
        }
        Ok(Box::new(CommandSession {
            role,
            argv,
            settings: settings.clone(),
            timeout: Duration::from_secs(self.config.timeout_secs),
            max_retries: self.config.max_retries,
            backoff: Duration::from_millis(self.config.retry_backoff_ms),
            cancel: self.cancel.clone(),
            history: Vec::new(),
        }))
    }
}

struct CommandSession {
    role: AgentRole,
    argv: Vec<String>,
    settings: AgentSettings,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
    cancel: CancelToken,
    /// Completed (prompt, reply) exchanges; only kept for multi-turn sessions.
    history: Vec<(String, String)>,
}

impl CommandSession {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        cmd.env("MLRUNNER_AGENT", self.role.as_str());
        cmd.env("MLRUNNER_MODEL", &self.settings.model);
        if let Some(max) = self.settings.max_output_tokens {
            cmd.env("MLRUNNER_MAX_OUTPUT_TOKENS", max.to_string());
        }
        cmd
    }

    fn input_for(&self, prompt: &str) -> String {
        if !self.settings.multi_turn || self.history.is_empty() {
            return prompt.to_string();
        }
        render_transcript(&self.history, prompt)
    }
}

impl ChatSession for CommandSession {
    #[instrument(skip_all, fields(agent = %self.role, turn = self.history.len()))]
    fn send(&mut self, prompt: &str) -> Result<ChatReply> {
        let input = self.input_for(prompt);
        let limits = RunLimits::new(self.timeout, REPLY_LIMIT_BYTES).cancel(&self.cancel);
        let mut last_error = String::new();

        for attempt in 0..=self.max_retries {
            self.cancel.check()?;
            if attempt > 0 {
                let wait = self.backoff * attempt;
                debug!(attempt, wait_ms = wait.as_millis() as u64, "retrying chat backend");
                thread::sleep(wait);
            }
            let output = run_command(self.command(), Some(input.clone().into_bytes()), &limits)?;
            if output.cancelled {
                return Err(CancelledError.into());
            }
            if output.success() {
                let text = output.stdout_text();
                let reply = ChatReply {
                    input_tokens: estimate_tokens(&input),
                    output_tokens: estimate_tokens(&text),
                    text,
                };
                if self.settings.multi_turn {
                    self.history.push((prompt.to_string(), reply.text.clone()));
                }
                return Ok(reply);
            }
            last_error = if output.timed_out {
                format!("timed out after {}s", self.timeout.as_secs())
            } else {
                format!(
                    "exit {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                )
            };
            warn!(attempt, error = %last_error, "chat backend failed");
        }
        Err(anyhow!(
            "chat backend failed after {} attempts: {last_error}",
            self.max_retries + 1
        ))
    }
}

/// Render prior exchanges plus the new prompt as `### user` / `### assistant` blocks.
pub fn render_transcript(history: &[(String, String)], prompt: &str) -> String {
    let mut out = String::new();
    for (user, assistant) in history {
        out.push_str("### user\n");
        out.push_str(user.trim_end());
        out.push_str("\n\n### assistant\n");
        out.push_str(assistant.trim_end());
        out.push_str("\n\n");
    }
    out.push_str("### user\n");
    out.push_str(prompt);
    out
}
