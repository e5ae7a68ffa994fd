//! Tool catalog: named libraries with prompt fragments and tutorial corpora.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

/// Raised when a tool name is not in the catalog. Fatal for the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownToolError(pub String);

impl fmt::Display for UnknownToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown tool {:?}", self.0)
    }
}

impl std::error::Error for UnknownToolError {}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PromptFragment {
    One(String),
    Many(Vec<String>),
}

impl PromptFragment {
    pub fn text(&self) -> String {
        match self {
            PromptFragment::One(text) => text.clone(),
            PromptFragment::Many(parts) => parts.join("\n"),
        }
    }
}

impl Default for PromptFragment {
    fn default() -> Self {
        PromptFragment::One(String::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub prompt_fragment: PromptFragment,
    pub tutorials_root: Option<PathBuf>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

/// Read-only lookup of tools by name.
pub trait ToolRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<&ToolDescriptor>;

    /// Names in catalog order.
    fn names(&self) -> Vec<String>;

    fn require(&self, name: &str) -> Result<&ToolDescriptor> {
        self.get(name)
            .ok_or_else(|| UnknownToolError(name.to_string()).into())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCatalog {
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
}

impl ToolCatalog {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self { tools }
    }

    /// Load `[[tools]]` entries from TOML. Relative `tutorials_root` paths are
    /// resolved against the catalog's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let mut catalog: ToolCatalog =
            toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        let base = path.parent().unwrap_or(Path::new("."));
        for tool in &mut catalog.tools {
            if let Some(root) = &tool.tutorials_root
                && root.is_relative()
            {
                tool.tutorials_root = Some(base.join(root));
            }
        }
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<()> {
        for (i, tool) in self.tools.iter().enumerate() {
            if tool.name.trim().is_empty() {
                return Err(anyhow!("tools[{i}]: name must be non-empty"));
            }
            if self.tools[..i].iter().any(|t| t.name == tool.name) {
                return Err(anyhow!("tools[{i}]: duplicate name {:?}", tool.name));
            }
        }
        Ok(())
    }
}

impl ToolRegistry for ToolCatalog {
    fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    fn names(&self) -> Vec<String> {
        self.tools.iter().map(|tool| tool.name.clone()).collect()
    }
}

/// Map a free-form name onto the closest catalog name.
///
/// Exact (case-insensitive) matches win, then containment, then the smallest
/// edit distance within a third of the name's length.
pub fn closest_name(candidate: &str, names: &[String]) -> Option<String> {
    let wanted = candidate.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }
    if let Some(exact) = names.iter().find(|n| n.to_lowercase() == wanted) {
        return Some(exact.clone());
    }
    if let Some(contained) = names.iter().find(|n| {
        let lower = n.to_lowercase();
        wanted.contains(&lower) || lower.contains(&wanted)
    }) {
        return Some(contained.clone());
    }
    let max_distance = (wanted.chars().count() / 3).max(2);
    names
        .iter()
        .map(|n| (n, levenshtein_distance(&wanted, &n.to_lowercase())))
        .filter(|(_, dist)| *dist <= max_distance)
        .min_by_key(|(_, dist)| *dist)
        .map(|(n, _)| n.clone())
}

fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        ["autogluon", "scikit-learn", "pytorch"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn levenshtein_matches_known_values() {
        assert_eq!(levenshtein_distance("test", "test"), 0);
        assert_eq!(levenshtein_distance("test", "tests"), 1);
        assert_eq!(levenshtein_distance("map", "mpa"), 2);
        assert_eq!(levenshtein_distance("hello", "world"), 4);
    }

    #[test]
    fn closest_name_prefers_exact_then_containment_then_distance() {
        assert_eq!(closest_name("PyTorch", &names()).as_deref(), Some("pytorch"));
        assert_eq!(closest_name("scikit-learn 1.4", &names()).as_deref(), Some("scikit-learn"));
        assert_eq!(closest_name("autogluonn", &names()).as_deref(), Some("autogluon"));
        assert_eq!(closest_name("tensorflow", &names()), None);
        assert_eq!(closest_name("  ", &names()), None);
    }

    #[test]
    fn catalog_loads_string_and_list_fragments() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tools.toml");
        fs::write(
            &path,
            r#"
[[tools]]
name = "autogluon"
version = "1.1"
prompt_fragment = ["Use TabularPredictor.", "Set a time limit."]
tutorials_root = "tutorials/autogluon"

[[tools]]
name = "pytorch"
prompt_fragment = "Write a training loop."
"#,
        )
        .expect("write");
        let catalog = ToolCatalog::load(&path).expect("load");
        assert_eq!(catalog.names(), vec!["autogluon", "pytorch"]);
        let ag = catalog.require("autogluon").expect("autogluon");
        assert_eq!(ag.prompt_fragment.text(), "Use TabularPredictor.\nSet a time limit.");
        assert_eq!(
            ag.tutorials_root.as_deref(),
            Some(temp.path().join("tutorials/autogluon").as_path())
        );
    }

    #[test]
    fn unknown_tool_is_a_typed_error() {
        let catalog = ToolCatalog::default();
        let err = catalog.require("xgboost").expect_err("unknown");
        assert_eq!(
            err.downcast_ref::<UnknownToolError>(),
            Some(&UnknownToolError("xgboost".to_string()))
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tools.toml");
        fs::write(&path, "[[tools]]\nname = \"a\"\n[[tools]]\nname = \"a\"\n").expect("write");
        assert!(ToolCatalog::load(&path).is_err());
    }
}
