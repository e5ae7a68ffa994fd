//! Agent wrappers: a prompt builder bound to a chat backend.
//!
//! [`Agent`] is the single contract every role goes through: build the prompt,
//! persist it, chat, persist the reply, parse. The composite agents in the
//! submodules (data perception, execution, tutorials) chain several of those
//! calls with local work in between.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::template::VariableProvider;
use crate::core::tokens::TokenLedger;
use crate::io::artifacts::{write_state, write_state_json};
use crate::io::config::{AgentSettings, RunConfig};
use crate::io::llm::{ChatProvider, ChatSession};
use crate::io::signals::{CancelToken, is_cancelled_error};
use crate::prompts::PromptBuilder;

pub mod executor;
pub mod perception;
pub mod tutorials;

/// Collaborators shared by every agent of a run.
#[derive(Clone)]
pub struct AgentContext {
    pub provider: Arc<dyn ChatProvider>,
    pub ledger: Arc<TokenLedger>,
    pub cancel: CancelToken,
}

impl AgentContext {
    pub fn new(provider: Arc<dyn ChatProvider>, ledger: Arc<TokenLedger>, cancel: CancelToken) -> Self {
        Self {
            provider,
            ledger,
            cancel,
        }
    }
}

/// A prompt builder plus the chat session it talks through.
///
/// Single-turn agents open a fresh session per call; multi-turn agents keep
/// the first session for the lifetime of the agent.
pub struct Agent<B: PromptBuilder> {
    builder: B,
    settings: AgentSettings,
    ctx: AgentContext,
    session: Option<Box<dyn ChatSession>>,
}

impl<B: PromptBuilder> Agent<B> {
    pub fn new(builder: B, cfg: &RunConfig, ctx: AgentContext) -> Self {
        let settings = cfg.agent_settings(builder.role());
        Self {
            builder,
            settings,
            ctx,
            session: None,
        }
    }

    pub fn builder(&self) -> &B {
        &self.builder
    }

    pub fn builder_mut(&mut self) -> &mut B {
        &mut self.builder
    }

    /// Build, chat and parse, persisting each step under `states_dir`.
    ///
    /// Backend failures are logged and the builder's default (the parse of an
    /// empty reply) is returned. Only cancellation is propagated.
    #[instrument(skip_all, fields(agent = %self.builder.role()))]
    pub fn call(&mut self, vars: &dyn VariableProvider, states_dir: &Path) -> Result<B::Output> {
        self.ctx.cancel.check()?;
        let role = self.builder.role();
        let prompt = self.builder.build(vars);
        write_state(states_dir, &format!("{role}_prompt.txt"), &prompt);

        let reply = match self.chat(&prompt) {
            Ok(reply) => reply,
            Err(e) if is_cancelled_error(&e) => return Err(e),
            Err(e) => {
                warn!(err = %format!("{e:#}"), "chat failed, using default result");
                write_state(states_dir, &format!("{role}_error.txt"), &format!("{e:#}"));
                String::new()
            }
        };
        write_state(states_dir, &format!("{role}_response.txt"), &reply);

        let parsed = self.builder.parse(&reply);
        write_state_json(states_dir, &format!("{role}_parsed.json"), &parsed);
        Ok(parsed)
    }

    fn chat(&mut self, prompt: &str) -> Result<String> {
        let role = self.builder.role();
        if !self.settings.multi_turn {
            self.session = None;
        }
        let session = match &mut self.session {
            Some(session) => session,
            slot => slot.insert(
                self.ctx
                    .provider
                    .open_session(role, &self.settings)
                    .with_context(|| format!("open {role} session"))?,
            ),
        };
        let reply = session.send(prompt)?;
        self.ctx
            .ledger
            .record(role.as_str(), reply.input_tokens, reply.output_tokens);
        debug!(
            input_tokens = reply.input_tokens,
            output_tokens = reply.output_tokens,
            "chat reply received"
        );
        Ok(reply.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::template::VariableMap;
    use crate::core::types::AgentRole;
    use crate::prompts::ChatPrompt;
    use crate::test_support::ScriptedChat;

    fn context(chat: &ScriptedChat) -> AgentContext {
        AgentContext::new(Arc::new(chat.clone()), Arc::new(TokenLedger::new()), CancelToken::new())
    }

    #[test]
    fn call_persists_prompt_reply_and_parse() {
        let temp = tempfile::tempdir().expect("tempdir");
        let chat = ScriptedChat::new().reply(AgentRole::Chat, "  an answer  ");
        let cfg = RunConfig::default();
        let ctx = context(&chat);
        let mut agent = Agent::new(ChatPrompt::new(&cfg).expect("chat"), &cfg, ctx.clone());

        let vars = VariableMap::new().with("user_input", "what now?");
        let answer = agent.call(&vars, temp.path()).expect("call");

        assert_eq!(answer, "an answer");
        let prompt = std::fs::read_to_string(temp.path().join("chat_prompt.txt")).expect("prompt");
        assert!(prompt.contains("what now?"));
        assert!(temp.path().join("chat_response.txt").exists());
        assert!(temp.path().join("chat_parsed.json").exists());
        assert!(ctx.ledger.snapshot().per_agent.contains_key("chat"));
    }

    #[test]
    fn backend_failure_yields_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let chat = ScriptedChat::new().fail(AgentRole::Chat);
        let cfg = RunConfig::default();
        let mut agent = Agent::new(ChatPrompt::new(&cfg).expect("chat"), &cfg, context(&chat));
        let answer = agent.call(&VariableMap::new(), temp.path()).expect("call");
        assert_eq!(answer, "");
        assert!(temp.path().join("chat_error.txt").exists());
    }

    #[test]
    fn cancellation_is_propagated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let chat = ScriptedChat::new().reply(AgentRole::Chat, "unused");
        let cfg = RunConfig::default();
        let ctx = context(&chat);
        ctx.cancel.cancel();
        let mut agent = Agent::new(ChatPrompt::new(&cfg).expect("chat"), &cfg, ctx);
        let err = agent.call(&VariableMap::new(), temp.path()).expect_err("cancelled");
        assert!(is_cancelled_error(&err));
    }

    #[test]
    fn multi_turn_agent_reuses_its_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let chat = ScriptedChat::new()
            .reply(AgentRole::Chat, "one")
            .reply(AgentRole::Chat, "two");
        let mut cfg = RunConfig::default();
        cfg.llm.multi_turn = true;
        let mut agent = Agent::new(ChatPrompt::new(&cfg).expect("chat"), &cfg, context(&chat));
        agent.call(&VariableMap::new(), temp.path()).expect("first");
        agent.call(&VariableMap::new(), temp.path()).expect("second");
        assert_eq!(chat.sessions_opened(AgentRole::Chat), 1);

        cfg.llm.multi_turn = false;
        let chat = ScriptedChat::new()
            .reply(AgentRole::Chat, "one")
            .reply(AgentRole::Chat, "two");
        let mut agent = Agent::new(ChatPrompt::new(&cfg).expect("chat"), &cfg, context(&chat));
        agent.call(&VariableMap::new(), temp.path()).expect("first");
        agent.call(&VariableMap::new(), temp.path()).expect("second");
        assert_eq!(chat.sessions_opened(AgentRole::Chat), 2);
    }
}
