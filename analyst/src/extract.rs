//! XML-ish tag extraction from reasoning-engine output.
//!
//! The engine marks structured sections of free text with `<plan>`,
//! `<think>` and `<solution>` tags. Matching is case-insensitive and
//! spans newlines; anything malformed simply yields no match.

use regex::Regex;

fn tag_regex(label: &str) -> Regex {
    // Labels come from a fixed internal set, so the pattern always compiles.
    Regex::new(&format!(
        r"(?is)<{label}>(.*?)</{label}>",
        label = regex::escape(label)
    ))
    .unwrap_or_else(|_| unreachable!("invalid tag label: {label}"))
}

/// First `<label>…</label>` body in `text`, trimmed, or `None`.
pub fn first(label: &str, text: &str) -> Option<String> {
    tag_regex(label)
        .captures(text)
        .map(|c| c[1].trim().to_string())
}

/// Every `<label>…</label>` body in `text`, in order of appearance.
pub fn all(label: &str, text: &str) -> Vec<String> {
    tag_regex(label)
        .captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .collect()
}

/// Whether `text` contains a `<solution>` opening marker. This is the
/// loop's sole termination signal, so it deliberately does not require
/// a well-formed closing tag.
pub fn contains_solution(text: &str) -> bool {
    text.to_lowercase().contains("<solution>")
}

/// Body of the first `<solution>` block. When the closing tag is
/// missing, everything after the opening marker is taken; when the
/// marker itself is absent, the whole text stands in for the solution.
pub fn solution(text: &str) -> String {
    if let Some(body) = first("solution", text) {
        return body;
    }
    let lower = text.to_lowercase();
    if let Some(pos) = lower.find("<solution>") {
        return text[pos + "<solution>".len()..].trim().to_string();
    }
    text.trim().to_string()
}
