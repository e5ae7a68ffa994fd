//! Test doubles and fixtures shared by unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};

use crate::core::tokens::{TokenLedger, estimate_tokens};
use crate::core::types::AgentRole;
use crate::io::config::{AgentSettings, RunConfig};
use crate::io::llm::{ChatProvider, ChatReply, ChatSession};
use crate::io::signals::CancelToken;
use crate::io::tools::{PromptFragment, ToolCatalog, ToolDescriptor};
use crate::io::tutorials::KeywordTutorialIndex;
use crate::io::user_input::UserInputSource;
use crate::mcts::{Collaborators, Controller};
use crate::state::TaskContext;

#[derive(Debug, Default)]
struct Script {
    queued: BTreeMap<AgentRole, VecDeque<String>>,
    defaults: BTreeMap<AgentRole, String>,
    failing: BTreeSet<AgentRole>,
    sessions: BTreeMap<AgentRole, usize>,
    prompts: BTreeMap<AgentRole, Vec<String>>,
}

/// Chat backend answering from per-role scripts.
///
/// Queued replies are consumed first, then the role's default reply. A role
/// with neither, or marked failing, returns an error.
#[derive(Debug, Clone, Default)]
pub struct ScriptedChat {
    script: Arc<Mutex<Script>>,
}

impl ScriptedChat {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn reply(self, role: AgentRole, text: &str) -> Self {
        self.lock()
            .queued
            .entry(role)
            .or_default()
            .push_back(text.to_string());
        self
    }

    pub fn default_reply(self, role: AgentRole, text: &str) -> Self {
        self.lock().defaults.insert(role, text.to_string());
        self
    }

    pub fn fail(self, role: AgentRole) -> Self {
        self.lock().failing.insert(role);
        self
    }

    pub fn sessions_opened(&self, role: AgentRole) -> usize {
        self.lock().sessions.get(&role).copied().unwrap_or(0)
    }

    /// Prompts sent for `role`, oldest first.
    pub fn prompts(&self, role: AgentRole) -> Vec<String> {
        self.lock().prompts.get(&role).cloned().unwrap_or_default()
    }
}

impl ChatProvider for ScriptedChat {
    fn open_session(&self, role: AgentRole, _settings: &AgentSettings) -> Result<Box<dyn ChatSession>> {
        *self.lock().sessions.entry(role).or_default() += 1;
        Ok(Box::new(ScriptedSession {
            role,
            chat: self.clone(),
        }))
    }
}

struct ScriptedSession {
    role: AgentRole,
    chat: ScriptedChat,
}

impl ChatSession for ScriptedSession {
    fn send(&mut self, prompt: &str) -> Result<ChatReply> {
        let mut script = self.chat.lock();
        script
            .prompts
            .entry(self.role)
            .or_default()
            .push(prompt.to_string());
        if script.failing.contains(&self.role) {
            return Err(anyhow!("scripted failure for {}", self.role));
        }
        let text = match script.queued.get_mut(&self.role).and_then(VecDeque::pop_front) {
            Some(text) => text,
            None => script
                .defaults
                .get(&self.role)
                .cloned()
                .ok_or_else(|| anyhow!("no scripted reply for {}", self.role))?,
        };
        Ok(ChatReply {
            input_tokens: estimate_tokens(prompt),
            output_tokens: estimate_tokens(&text),
            text,
        })
    }
}

/// Replays fixed answers and records which iterations asked.
#[derive(Debug, Clone, Default)]
pub struct RecordingUserInput {
    answers: VecDeque<String>,
    pub asked: Arc<Mutex<Vec<u32>>>,
}

impl RecordingUserInput {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: answers.iter().map(|a| a.to_string()).collect(),
            asked: Arc::default(),
        }
    }
}

impl UserInputSource for RecordingUserInput {
    fn prompt(&mut self, iteration: u32) -> Result<Option<String>> {
        self.asked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(iteration);
        Ok(self.answers.pop_front())
    }
}

/// Create `base/input` holding `files` (relative path, contents).
pub fn write_input_folder(base: &Path, files: &[(&str, &str)]) -> PathBuf {
    let input = base.join("input");
    fs::create_dir_all(&input).expect("create input folder");
    for (name, contents) in files {
        let path = input.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create input subfolder");
        }
        fs::write(&path, contents).expect("write input file");
    }
    input
}

/// Task reading `base/input` and writing `base/output`.
pub fn task_in(base: &Path, files: &[(&str, &str)]) -> TaskContext {
    TaskContext {
        input_data_folder: write_input_folder(base, files),
        output_folder: base.join("output"),
        initial_user_input: None,
        per_iteration_input: false,
    }
}

pub fn tool(name: &str, tutorials_root: Option<PathBuf>) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        version: "1.0".to_string(),
        description: format!("{name} for tests"),
        prompt_fragment: PromptFragment::One(format!("Use {name}.")),
        tutorials_root,
        requirements: Vec::new(),
    }
}

pub fn catalog(names: &[&str]) -> ToolCatalog {
    ToolCatalog::new(names.iter().map(|name| tool(name, None)).collect())
}

/// Scripted collaborators with no user input and a fresh ledger.
pub fn collaborators(chat: &ScriptedChat, tools: ToolCatalog, cancel: CancelToken) -> Collaborators {
    Collaborators {
        provider: Arc::new(chat.clone()),
        tools: Arc::new(tools),
        tutorials: Arc::new(KeywordTutorialIndex),
        user_input: Box::new(crate::io::user_input::NoUserInput),
        ledger: Arc::new(TokenLedger::new()),
        cancel,
    }
}

pub fn controller_with(cfg: RunConfig, task: TaskContext, chat: &ScriptedChat, tools: ToolCatalog) -> Controller {
    Controller::new(cfg, task, collaborators(chat, tools, CancelToken::new())).expect("controller")
}
