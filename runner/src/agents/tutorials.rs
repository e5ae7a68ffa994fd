//! Tutorial retrieval for one node: query, search, rerank, format.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::agents::{Agent, AgentContext};
use crate::core::template::{Layered, TruncateMode, VariableMap, VariableProvider, truncate};
use crate::io::artifacts::{write_state, write_state_json};
use crate::io::config::RunConfig;
use crate::io::tools::ToolDescriptor;
use crate::io::tutorials::{TutorialHit, TutorialIndex};
use crate::prompts::{RerankerPrompt, RetrieverPrompt};

/// What the coder gets to see for one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TutorialSelection {
    pub query: String,
    /// Raw ranked candidate list shown to the reranker.
    pub retrieval: String,
    /// Formatted bodies of the selected tutorials.
    pub prompt: String,
    pub selected: Vec<TutorialHit>,
}

pub struct TutorialAgent {
    retriever: Agent<RetrieverPrompt>,
    reranker: Agent<RerankerPrompt>,
    index: Arc<dyn TutorialIndex>,
    max_candidates: usize,
    max_selected: usize,
    max_length: usize,
}

impl TutorialAgent {
    pub fn new(cfg: &RunConfig, ctx: AgentContext, index: Arc<dyn TutorialIndex>) -> Result<Self> {
        Ok(Self {
            retriever: Agent::new(RetrieverPrompt::new(cfg)?, cfg, ctx.clone()),
            reranker: Agent::new(RerankerPrompt::new(cfg)?, cfg, ctx),
            index,
            max_candidates: cfg.max_tutorial_candidates,
            max_selected: cfg.max_num_tutorials,
            max_length: cfg.max_tutorial_length,
        })
    }

    #[instrument(skip_all, fields(tool = %tool.name))]
    pub fn run(
        &mut self,
        tool: &ToolDescriptor,
        vars: &dyn VariableProvider,
        states_dir: &Path,
    ) -> Result<TutorialSelection> {
        if self.max_selected == 0 {
            return Ok(TutorialSelection::default());
        }
        let mut query = self.retriever.call(vars, states_dir)?;
        if query.trim().is_empty() {
            query = tool.name.clone();
        }

        let candidates = match self.index.search(tool, &query, self.max_candidates) {
            Ok(hits) => hits,
            Err(e) => {
                warn!(err = %format!("{e:#}"), "tutorial search failed");
                Vec::new()
            }
        };
        if candidates.is_empty() {
            debug!("no tutorial candidates");
            return Ok(TutorialSelection {
                query,
                ..TutorialSelection::default()
            });
        }
        let retrieval = format_candidates(&candidates);
        write_state(states_dir, "tutorial_retrieval.txt", &retrieval);

        let local = VariableMap::new()
            .with("tutorial_retrieval", retrieval.clone())
            .with("max_num_tutorials", self.max_selected.to_string());
        let picked = self.reranker.call(&Layered::new(&local, vars), states_dir)?;
        let selected = pick(&candidates, &picked, self.max_selected);

        let mut sections = Vec::new();
        for (i, hit) in selected.iter().enumerate() {
            let body = match hit.body() {
                Ok(body) => truncate(&body, TruncateMode::End, self.max_length),
                Err(e) => {
                    warn!(path = %hit.path.display(), err = %format!("{e:#}"), "skipping unreadable tutorial");
                    continue;
                }
            };
            write_state(states_dir, &format!("tutorials/{:02}_{}.md", i + 1, file_stem(hit)), &body);
            sections.push(format!("## {}\n\n{}", hit.title, body.trim_end()));
        }
        let prompt = sections.join("\n\n");
        write_state(states_dir, "tutorial_prompt.txt", &prompt);
        write_state_json(states_dir, "selected_tutorials.json", &selected);

        Ok(TutorialSelection {
            query,
            retrieval,
            prompt,
            selected,
        })
    }
}

fn format_candidates(hits: &[TutorialHit]) -> String {
    hits.iter()
        .enumerate()
        .map(|(i, hit)| format!("{}. {}\n   {}", i + 1, hit.title, hit.summary.replace('\n', " ")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Map 1-based picks onto candidates, first mention wins; falls back to the
/// top candidates when the reranker named nothing usable.
fn pick(candidates: &[TutorialHit], picked: &[usize], max: usize) -> Vec<TutorialHit> {
    let mut seen = HashSet::new();
    let mut selected: Vec<TutorialHit> = picked
        .iter()
        .filter(|&&n| seen.insert(n))
        .filter_map(|&n| candidates.get(n.wrapping_sub(1)))
        .take(max)
        .cloned()
        .collect();
    if selected.is_empty() {
        warn!("reranker picked no valid tutorial, keeping the top candidates");
        selected = candidates.iter().take(max).cloned().collect();
    }
    selected
}

fn file_stem(hit: &TutorialHit) -> String {
    hit.path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tutorial".to_string())
}
