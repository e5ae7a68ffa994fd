//! Tutorial search over a tool's tutorial corpus.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::io::tools::ToolDescriptor;

const SUMMARY_CHARS: usize = 300;
const EXTENSIONS: [&str; 3] = ["md", "txt", "rst"];

/// One candidate tutorial.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TutorialHit {
    pub title: String,
    pub summary: String,
    pub path: PathBuf,
    pub score: f64,
}

impl TutorialHit {
    pub fn body(&self) -> Result<String> {
        fs::read_to_string(&self.path).with_context(|| format!("read tutorial {}", self.path.display()))
    }
}

/// Ranked lookup over a tool's tutorials.
pub trait TutorialIndex: Send + Sync {
    fn search(&self, tool: &ToolDescriptor, query: &str, k: usize) -> Result<Vec<TutorialHit>>;
}

/// Scores documents by how many query terms they contain.
#[derive(Debug, Clone, Default)]
pub struct KeywordTutorialIndex;

impl TutorialIndex for KeywordTutorialIndex {
    fn search(&self, tool: &ToolDescriptor, query: &str, k: usize) -> Result<Vec<TutorialHit>> {
        let Some(root) = tool.tutorials_root.as_deref() else {
            debug!(tool = %tool.name, "tool has no tutorials");
            return Ok(Vec::new());
        };
        if !root.is_dir() {
            warn!(tool = %tool.name, root = %root.display(), "tutorials root missing");
            return Ok(Vec::new());
        }
        let query_terms = terms(query);
        let mut hits = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walk {}", root.display()))?;
            if !entry.file_type().is_file() || !has_tutorial_extension(entry.path()) {
                continue;
            }
            let text = match fs::read_to_string(entry.path()) {
                Ok(text) => text,
                Err(e) => {
                    warn!(path = %entry.path().display(), err = %e, "skipping unreadable tutorial");
                    continue;
                }
            };
            let doc_terms = terms(&text);
            let overlap = query_terms.intersection(&doc_terms).count();
            let score = if query_terms.is_empty() {
                0.0
            } else {
                overlap as f64 / query_terms.len() as f64
            };
            hits.push(TutorialHit {
                title: title_of(&text, entry.path()),
                summary: summary_of(&text),
                path: entry.path().to_path_buf(),
                score,
            });
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
        hits.truncate(k);
        Ok(hits)
    }
}

fn has_tutorial_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// First markdown heading, or the file stem.
fn title_of(text: &str, path: &Path) -> String {
    text.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix('#').map(|rest| rest.trim_start_matches('#').trim()))
        .filter(|title| !title.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
}

/// First non-heading paragraph, capped at [`SUMMARY_CHARS`].
fn summary_of(text: &str) -> String {
    let paragraph = text
        .split("\n\n")
        .map(str::trim)
        .find(|block| !block.is_empty() && !block.starts_with('#'))
        .unwrap_or_default();
    let flat = paragraph.split_whitespace().collect::<Vec<_>>().join(" ");
    flat.chars().take(SUMMARY_CHARS).collect()
}
