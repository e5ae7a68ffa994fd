//! `{name}` template rendering with optional truncation.
//!
//! Placeholders are `{...}` segments whose contents contain none of `{`, `}`,
//! `<`, `>`. A placeholder may request truncation with the suffix
//! `_truncate_<start|mid|end>_<N>`. Rendering is a single pass: substituted
//! values are never scanned again, so values containing braces (python
//! f-strings, JSON) pass through untouched.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::warn;

use crate::core::variables::{canonical_name, is_registered};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}<>]+)\}").expect("placeholder regex"));
static TRUNCATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>.+)_truncate_(?P<mode>start|mid|end)_(?P<n>\d+)$")
        .expect("truncate regex")
});

const UNKNOWN_PREFIX: &str = "UNKNOWN_VARIABLE:";

/// Which part of an over-long value survives truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncateMode {
    /// Keep the tail.
    Start,
    /// Keep the head and the tail.
    Mid,
    /// Keep the head.
    End,
}

impl TruncateMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "start" => Some(Self::Start),
            "mid" => Some(Self::Mid),
            "end" => Some(Self::End),
            _ => None,
        }
    }
}

/// A parsed placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    /// Variable name as written (before alias resolution).
    pub name: String,
    pub truncate: Option<(TruncateMode, usize)>,
}

impl Placeholder {
    fn parse(token: &str) -> Self {
        if let Some(caps) = TRUNCATE_RE.captures(token)
            && let Some(mode) = TruncateMode::parse(&caps["mode"])
            && let Ok(n) = caps["n"].parse::<usize>()
            && n > 0
        {
            return Self {
                name: caps["name"].to_string(),
                truncate: Some((mode, n)),
            };
        }
        Self {
            name: token.to_string(),
            truncate: None,
        }
    }
}

/// Source of current variable values, keyed by canonical name.
pub trait VariableProvider {
    fn get(&self, name: &str) -> Option<String>;
}

/// Plain map of values, used for builder-local variables.
#[derive(Debug, Clone, Default)]
pub struct VariableMap {
    values: BTreeMap<String, String>,
}

impl VariableMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` under the canonical form of `name`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        let key = canonical_name(name).unwrap_or(name).to_string();
        self.values.insert(key, value.into());
        self
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }
}

impl VariableProvider for VariableMap {
    fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Overlay `top` on `base`: values in `top` win.
pub struct Layered<'a> {
    pub top: &'a dyn VariableProvider,
    pub base: &'a dyn VariableProvider,
}

impl<'a> Layered<'a> {
    pub fn new(top: &'a dyn VariableProvider, base: &'a dyn VariableProvider) -> Self {
        Self { top, base }
    }
}

impl VariableProvider for Layered<'_> {
    fn get(&self, name: &str) -> Option<String> {
        self.top.get(name).or_else(|| self.base.get(name))
    }
}

/// Names referenced by a template, split by registry membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateReport {
    pub referenced: Vec<String>,
    pub unknown: Vec<String>,
}

impl TemplateReport {
    pub fn is_valid(&self) -> bool {
        self.unknown.is_empty()
    }
}

/// Every placeholder in `template`, in order of appearance.
pub fn extract_placeholders(template: &str) -> Vec<Placeholder> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .filter(|caps| !caps[1].starts_with(UNKNOWN_PREFIX))
        .map(|caps| Placeholder::parse(&caps[1]))
        .collect()
}

/// Enumerate referenced names and report those missing from the registry.
pub fn validate_template(template: &str) -> TemplateReport {
    let mut report = TemplateReport::default();
    for placeholder in extract_placeholders(template) {
        if report.referenced.contains(&placeholder.name) {
            continue;
        }
        if !is_registered(&placeholder.name) {
            report.unknown.push(placeholder.name.clone());
        }
        report.referenced.push(placeholder.name);
    }
    report
}

/// Substitute every placeholder in `template` from `provider`.
///
/// Registered names without a current value render empty. Unregistered names
/// render as `{UNKNOWN_VARIABLE:name}`, which later renders leave untouched.
pub fn render(template: &str, provider: &dyn VariableProvider) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures<'_>| {
            let token = &caps[1];
            if token.starts_with(UNKNOWN_PREFIX) {
                return caps[0].to_string();
            }
            let placeholder = Placeholder::parse(token);
            let Some(canonical) = canonical_name(&placeholder.name) else {
                warn!(variable = %placeholder.name, "unknown template variable");
                return format!("{{{UNKNOWN_PREFIX}{}}}", placeholder.name);
            };
            let value = provider.get(canonical).unwrap_or_default();
            match placeholder.truncate {
                Some((mode, n)) => truncate(&value, mode, n),
                None => value,
            }
        })
        .into_owned()
}

/// Truncate `value` to `max_chars` characters, inserting a marker that states
/// how many characters were dropped. Values within budget are returned as-is.
pub fn truncate(value: &str, mode: TruncateMode, max_chars: usize) -> String {
    let total = value.chars().count();
    if total <= max_chars {
        return value.to_string();
    }
    match mode {
        TruncateMode::End => {
            let head: String = value.chars().take(max_chars).collect();
            format!("{head}\n{}", marker(total - max_chars))
        }
        TruncateMode::Start => {
            let tail: String = value.chars().skip(total - max_chars).collect();
            format!("{}\n{tail}", marker(total - max_chars))
        }
        TruncateMode::Mid => {
            let half = max_chars / 2;
            let head: String = value.chars().take(half).collect();
            let tail: String = value.chars().skip(total - half).collect();
            format!("{head}\n{}\n{tail}", marker(total - 2 * half))
        }
    }
}

fn marker(dropped: usize) -> String {
    format!("[... {dropped} characters truncated ...]")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> VariableMap {
        let mut map = VariableMap::new();
        for (name, value) in pairs {
            map.set(name, *value);
        }
        map
    }

    #[test]
    fn renders_known_variables_and_aliases() {
        let provider = vars(&[("task_description", "classify"), ("data_prompt", "a.csv")]);
        let out = render("Task: {task}\nData: {data_prompt}", &provider);
        assert_eq!(out, "Task: classify\nData: a.csv");
    }

    #[test]
    fn unknown_variable_renders_sentinel() {
        let out = render("x {mystery} y", &VariableMap::new());
        assert_eq!(out, "x {UNKNOWN_VARIABLE:mystery} y");
    }

    #[test]
    fn registered_variable_without_value_renders_empty() {
        let out = render("[{stdout}]", &VariableMap::new());
        assert_eq!(out, "[]");
    }

    #[test]
    fn end_truncation_keeps_head_and_reports_dropped() {
        let s: String = "abcdefghij".repeat(100);
        let provider = vars(&[("user_input", s.as_str())]);
        let out = render("{user_input_truncate_end_100}", &provider);
        assert!(out.starts_with(&s[..100]));
        assert!(out.contains("900"));
        assert!(!out.contains(&s[..101]));
    }

    #[test]
    fn start_truncation_keeps_tail() {
        let out = truncate("0123456789", TruncateMode::Start, 3);
        assert!(out.ends_with("789"));
        assert!(out.contains("7 characters"));
    }

    #[test]
    fn mid_truncation_keeps_both_ends() {
        let out = truncate("0123456789", TruncateMode::Mid, 4);
        assert!(out.starts_with("01\n"));
        assert!(out.ends_with("\n89"));
        assert!(out.contains("6 characters"));
    }

    #[test]
    fn truncation_within_budget_is_identity() {
        assert_eq!(truncate("short", TruncateMode::Mid, 5), "short");
        assert_eq!(truncate("short", TruncateMode::End, 50), "short");
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let out = truncate("ééééé", TruncateMode::End, 2);
        assert!(out.starts_with("éé\n"));
        assert!(out.contains("3 characters"));
    }

    #[test]
    fn values_with_braces_are_not_reexpanded() {
        let provider = vars(&[("python_code", "print(f\"{score}\")")]);
        let once = render("{python_code}", &provider);
        assert_eq!(once, "print(f\"{score}\")");
    }

    #[test]
    fn render_is_idempotent() {
        let provider = vars(&[("task_description", "regression"), ("stdout", "done")]);
        let template = "{task} {stdout_truncate_mid_10} {unknown_thing} <{not}> {data_prompt}";
        let once = render(template, &provider);
        let twice = render(&once, &provider);
        assert_eq!(once, twice);
    }

    #[test]
    fn no_registered_placeholder_survives_render() {
        let provider = vars(&[("user_input", "hi")]);
        let out = render("{user_input} {user_input_truncate_start_1} {tool_prompt}", &provider);
        let leftovers = extract_placeholders(&out);
        assert!(leftovers.iter().all(|p| !is_registered(&p.name)), "{leftovers:?}");
    }

    #[test]
    fn extraction_skips_segments_with_angle_brackets() {
        let found = extract_placeholders("{a<b} {ok} {x>y}");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "ok");
    }

    #[test]
    fn zero_length_truncation_is_not_a_truncation() {
        let placeholder = Placeholder::parse("stdout_truncate_end_0");
        assert_eq!(placeholder.truncate, None);
        assert_eq!(placeholder.name, "stdout_truncate_end_0");
    }

    #[test]
    fn validation_reports_unknown_names_once() {
        let report = validate_template("{task} {bogus} {bogus} {stdout_truncate_end_5}");
        assert_eq!(report.referenced, vec!["task", "bogus", "stdout"]);
        assert_eq!(report.unknown, vec!["bogus"]);
        assert!(!report.is_valid());
    }
}
