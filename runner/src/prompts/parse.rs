//! Reply-parsing helpers shared by the builders.

use std::sync::LazyLock;

use regex::Regex;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+-]*)[^\n]*\n(.*?)```").expect("fence regex")
});
static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\s*#>]*([A-Z][A-Z_ ]*[A-Z])\s*\**\s*:").expect("header regex")
});
static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-+]?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?").expect("number regex"));

/// Body of the first fenced block whose language is one of `langs`.
pub fn fenced_block(text: &str, langs: &[&str]) -> Option<String> {
    FENCE_RE
        .captures_iter(text)
        .find(|caps| langs.iter().any(|lang| caps[1].eq_ignore_ascii_case(lang)))
        .map(|caps| caps[2].trim_end().to_string())
}

/// Body of the first fenced block of any language.
pub fn any_fenced_block(text: &str) -> Option<String> {
    FENCE_RE
        .captures(text)
        .map(|caps| caps[2].trim_end().to_string())
}

/// Strip markdown emphasis and quoting around a line.
fn clean_line(line: &str) -> &str {
    line.trim().trim_start_matches(['#', '>', ' ']).trim_matches('*').trim()
}

/// Position of the line declaring `header` and the text after the colon.
fn find_header<'a>(lines: &[&'a str], header: &str) -> Option<(usize, &'a str)> {
    lines.iter().enumerate().find_map(|(i, &line)| {
        let cleaned = clean_line(line);
        let (name, rest) = cleaned.split_once(':')?;
        name.trim()
            .trim_matches('*')
            .eq_ignore_ascii_case(header)
            .then(|| (i, rest.trim_start_matches('*').trim()))
    })
}

/// Value on the same line as `header:`.
pub fn header_value(text: &str, header: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    find_header(&lines, header).map(|(_, rest)| rest.to_string())
}

/// Text from `header:` up to the next upper-case `HEADER:` line or the end.
pub fn section(text: &str, header: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let (start, first) = find_header(&lines, header)?;
    let mut body = vec![first];
    for line in &lines[start + 1..] {
        if HEADER_RE.is_match(line) {
            break;
        }
        body.push(*line);
    }
    Some(body.join("\n").trim().to_string())
}

/// Text after `header:` to the end of the reply.
pub fn tail_after(text: &str, header: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let (start, first) = find_header(&lines, header)?;
    let mut body = vec![first];
    body.extend(&lines[start + 1..]);
    Some(body.join("\n").trim().to_string())
}

/// First number in `text`, if any.
pub fn first_number(text: &str) -> Option<f64> {
    NUMBER_RE
        .find(text)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// True for replies that mean "nothing", like `None` or `N/A`.
pub fn is_none_marker(text: &str) -> bool {
    let t = text.trim().trim_matches(['*', '`', '"', '.']).to_ascii_lowercase();
    t.is_empty() || t == "none" || t == "n/a" || t == "null"
}
