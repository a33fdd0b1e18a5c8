//! Predicates for `ManagedProcess::wait_for_output`.

use crate::output::strip_ansi;
use regex::Regex;

pub fn ends_with(suffix: impl Into<String>) -> impl Fn(&str) -> bool + Clone + Send + Sync {
    let suffix = suffix.into();
    move |text: &str| text.ends_with(suffix.as_str())
}

/// Like `ends_with`, ignoring trailing whitespace on both sides. Useful for
/// prompts terminated by a newline or cursor padding.
pub fn ends_with_trimmed(suffix: impl Into<String>) -> impl Fn(&str) -> bool + Clone + Send + Sync {
    let suffix = suffix.into().trim_end().to_string();
    move |text: &str| text.trim_end().ends_with(suffix.as_str())
}

pub fn contains(needle: impl Into<String>) -> impl Fn(&str) -> bool + Clone + Send + Sync {
    let needle = needle.into();
    move |text: &str| text.contains(needle.as_str())
}

pub fn contains_all<I, S>(needles: I) -> impl Fn(&str) -> bool + Clone + Send + Sync
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let needles: Vec<String> = needles.into_iter().map(Into::into).collect();
    move |text: &str| needles.iter().all(|needle| text.contains(needle.as_str()))
}

pub fn regex(pattern: &str) -> Result<impl Fn(&str) -> bool + Clone + Send + Sync, regex::Error> {
    let compiled = Regex::new(pattern)?;
    Ok(move |text: &str| compiled.is_match(text))
}

/// Evaluates `predicate` against the text with ANSI escape sequences removed.
pub fn plain<P>(predicate: P) -> impl Fn(&str) -> bool
where
    P: Fn(&str) -> bool,
{
    move |text: &str| predicate(&strip_ansi(text))
}
