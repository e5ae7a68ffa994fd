//! Data perception: summarize the input folder into the data prompt.
//!
//! Each file is summarized by a snippet the reader agent writes; the snippet
//! runs under the configured interpreter with a timeout. When no snippet is
//! produced or it fails, the file's leading text is used instead.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::agents::{Agent, AgentContext};
use crate::core::template::{TruncateMode, VariableMap, truncate};
use crate::io::artifacts::{write_state, write_state_json};
use crate::io::config::RunConfig;
use crate::io::process::{RunLimits, run_command};
use crate::io::signals::{CancelledError, is_cancelled_error};
use crate::prompts::PythonReaderPrompt;

const READER_OUTPUT_LIMIT: usize = 256 * 1024;

/// One summarized input file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileSummary {
    /// Relative to the input folder.
    pub path: PathBuf,
    pub size_bytes: u64,
    pub summary: String,
    /// True when the reader snippet produced the summary.
    pub from_reader: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPerception {
    pub data_prompt: String,
    pub files: Vec<FileSummary>,
}

pub struct PerceptionAgent {
    reader: Agent<PythonReaderPrompt>,
    python: String,
    max_files: usize,
    max_chars: usize,
    timeout: Duration,
    grace: Duration,
    ctx: AgentContext,
}

impl PerceptionAgent {
    pub fn new(cfg: &RunConfig, ctx: AgentContext) -> Result<Self> {
        Ok(Self {
            reader: Agent::new(PythonReaderPrompt::new(cfg)?, cfg, ctx.clone()),
            python: cfg.python.clone(),
            max_files: cfg.max_data_files,
            max_chars: cfg.max_chars_per_file,
            timeout: Duration::from_secs(cfg.reader_timeout_secs),
            grace: cfg.kill_grace(),
            ctx,
        })
    }

    #[instrument(skip_all, fields(input = %input_dir.display()))]
    pub fn run(&mut self, input_dir: &Path, states_dir: &Path) -> Result<DataPerception> {
        let files = list_data_files(input_dir, self.max_files)?;
        info!(files = files.len(), "summarizing input files");

        let mut summaries = Vec::with_capacity(files.len());
        for (index, rel) in files.iter().enumerate() {
            let file_states = states_dir.join("python_reader").join(index.to_string());
            summaries.push(self.summarize(input_dir, rel, &file_states)?);
        }

        let data_prompt = render_data_prompt(input_dir, &summaries);
        write_state(states_dir, "data_prompt.txt", &data_prompt);
        let perception = DataPerception {
            data_prompt,
            files: summaries,
        };
        write_state_json(states_dir, "data_files.json", &perception.files);
        Ok(perception)
    }

    fn summarize(&mut self, input_dir: &Path, rel: &Path, states_dir: &Path) -> Result<FileSummary> {
        let path = input_dir.join(rel);
        let size_bytes = fs::metadata(&path)
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        let vars = VariableMap::new()
            .with("file_path", path.to_string_lossy())
            .with("file_size_mb", format!("{:.2}", size_bytes as f64 / (1024.0 * 1024.0)))
            .with("max_chars", self.max_chars.to_string());
        let code = self.reader.call(&vars, states_dir)?;

        let from_snippet = if code.trim().is_empty() {
            None
        } else {
            match self.run_snippet(&code, &path, states_dir) {
                Ok(summary) => summary,
                Err(e) if is_cancelled_error(&e) => return Err(e),
                Err(e) => {
                    warn!(file = %rel.display(), err = %format!("{e:#}"), "reader snippet failed");
                    None
                }
            }
        };
        let (summary, from_reader) = match from_snippet {
            Some(summary) => (summary, true),
            None => (text_prefix(&path, self.max_chars)?, false),
        };
        debug!(file = %rel.display(), from_reader, "file summarized");
        Ok(FileSummary {
            path: rel.to_path_buf(),
            size_bytes,
            summary: truncate(&summary, TruncateMode::End, self.max_chars),
            from_reader,
        })
    }

    /// Run the reader snippet; `None` when it exits non-zero or prints nothing.
    fn run_snippet(&self, code: &str, data_path: &Path, states_dir: &Path) -> Result<Option<String>> {
        fs::create_dir_all(states_dir)
            .with_context(|| format!("create directory {}", states_dir.display()))?;
        let script = states_dir.join("reader.py");
        fs::write(&script, code).with_context(|| format!("write {}", script.display()))?;

        let mut cmd = Command::new(&self.python);
        cmd.arg(&script);
        if let Some(dir) = data_path.parent() {
            cmd.current_dir(dir);
        }
        let limits = RunLimits::new(self.timeout, READER_OUTPUT_LIMIT)
            .kill_grace(self.grace)
            .cancel(&self.ctx.cancel);
        let output = run_command(cmd, None, &limits)?;
        if output.cancelled {
            return Err(CancelledError.into());
        }
        let stdout = output.stdout_text();
        write_state(states_dir, "reader_stdout.txt", &stdout);
        if !output.success() {
            write_state(states_dir, "reader_stderr.txt", &output.stderr_text(self.timeout));
            return Ok(None);
        }
        let stdout = stdout.trim();
        Ok((!stdout.is_empty()).then(|| stdout.to_string()))
    }
}

/// Visible regular files under `input_dir`, relative and sorted, at most `max`.
pub fn list_data_files(input_dir: &Path, max: usize) -> Result<Vec<PathBuf>> {
    if !input_dir.is_dir() {
        return Err(anyhow!("input data folder {} does not exist", input_dir.display()));
    }
    let mut files = Vec::new();
    let walker = WalkDir::new(input_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()));
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", input_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if files.len() == max {
            warn!(max, "input folder has more files than max_data_files, ignoring the rest");
            break;
        }
        let rel = entry
            .path()
            .strip_prefix(input_dir)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        files.push(rel.to_path_buf());
    }
    Ok(files)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Leading text of a file, or a note when it is not text.
fn text_prefix(path: &Path, max_chars: usize) -> Result<String> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut buf = Vec::new();
    // Four bytes per char covers any UTF-8 prefix of `max_chars` characters.
    file.take((max_chars as u64 + 1) * 4)
        .read_to_end(&mut buf)
        .with_context(|| format!("read {}", path.display()))?;
    if buf.contains(&0) {
        return Ok("(binary file)".to_string());
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn render_data_prompt(input_dir: &Path, files: &[FileSummary]) -> String {
    let mut out = format!(
        "Absolute path to the input data folder: {}\n",
        input_dir.display()
    );
    if files.is_empty() {
        out.push_str("\nThe folder contains no files.\n");
        return out;
    }
    for file in files {
        out.push_str(&format!(
            "\n### {} ({:.2} MB)\n{}\n",
            file.path.display(),
            file.size_bytes as f64 / (1024.0 * 1024.0),
            file.summary.trim_end()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::tokens::TokenLedger;
    use crate::core::types::AgentRole;
    use crate::io::signals::CancelToken;
    use crate::test_support::{ScriptedChat, write_input_folder};

    fn agent(cfg: &RunConfig, chat: &ScriptedChat) -> PerceptionAgent {
        let ctx = AgentContext::new(Arc::new(chat.clone()), Arc::new(TokenLedger::new()), CancelToken::new());
        PerceptionAgent::new(cfg, ctx).expect("agent")
    }

    #[test]
    fn listing_skips_hidden_entries_and_respects_cap() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join(".cache")).expect("hidden dir");
        fs::write(temp.path().join(".cache/x.csv"), "x").expect("hidden file");
        fs::write(temp.path().join(".env"), "x").expect("dotfile");
        fs::create_dir_all(temp.path().join("sub")).expect("sub");
        fs::write(temp.path().join("b.csv"), "b").expect("b");
        fs::write(temp.path().join("a.csv"), "a").expect("a");
        fs::write(temp.path().join("sub/c.txt"), "c").expect("c");

        let all = list_data_files(temp.path(), 10).expect("list");
        assert_eq!(
            all,
            vec![PathBuf::from("a.csv"), PathBuf::from("b.csv"), PathBuf::from("sub/c.txt")]
        );
        assert_eq!(list_data_files(temp.path(), 2).expect("list").len(), 2);
        assert!(list_data_files(&temp.path().join("missing"), 10).is_err());
    }

    #[test]
    fn falls_back_to_text_prefix_without_snippet() {
        let temp = tempfile::tempdir().expect("tempdir");
        let input = write_input_folder(temp.path(), &[("train.csv", "id,label\n1,0\n2,1\n")]);
        let cfg = RunConfig {
            max_chars_per_file: 8,
            ..RunConfig::default()
        };
        let chat = ScriptedChat::new();
        let perception = agent(&cfg, &chat)
            .run(&input, &temp.path().join("states"))
            .expect("run");
        assert_eq!(perception.files.len(), 1);
        assert!(!perception.files[0].from_reader);
        assert!(perception.files[0].summary.starts_with("id,label"));
        assert!(perception.data_prompt.contains("### train.csv"));
        assert!(temp.path().join("states/data_prompt.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn reader_snippet_output_becomes_summary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let input = write_input_folder(temp.path(), &[("train.csv", "id,label\n1,0\n")]);
        let cfg = RunConfig {
            python: "sh".to_string(),
            ..RunConfig::default()
        };
        let chat = ScriptedChat::new().default_reply(AgentRole::PythonReader, "```python\necho 'rows: 1'\n```");
        let perception = agent(&cfg, &chat)
            .run(&input, &temp.path().join("states"))
            .expect("run");
        assert!(perception.files[0].from_reader);
        assert_eq!(perception.files[0].summary, "rows: 1");
        assert!(perception.data_prompt.contains("rows: 1"));
    }
}
