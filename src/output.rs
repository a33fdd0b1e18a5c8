use crate::process::{ProcessOutput, describe_exit};
use regex::Regex;
use reqwest::Url;
use std::sync::LazyLock;

static ANSI_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("Invalid ANSI escape regex")
});
static URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>()\[\]]+"#).expect("Invalid URL regex"));

pub fn strip_ansi(text: &str) -> String {
    ANSI_REGEX.replace_all(text, "").into_owned()
}

/// Renders a finished process for assertion messages.
pub fn format_output(output: &ProcessOutput) -> String {
    format!(
        "process {}\n--- stderr ---\n{}\n--- stdout ---\n{}",
        describe_exit(output.exit_code),
        strip_ansi(output.stderr.trim_end()),
        strip_ansi(output.stdout.trim_end())
    )
}

/// Returns the last http(s) URL in `text`, without trailing punctuation.
pub fn pick_url(text: &str) -> Option<String> {
    let plain = strip_ansi(text);
    URL_REGEX
        .find_iter(&plain)
        .last()
        .map(|found| {
            found
                .as_str()
                .trim_end_matches(['.', ',', ';', ':', '!', '?'])
                .to_string()
        })
        .filter(|url| Url::parse(url).is_ok())
}

pub fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    parsed.host_str().map(|host| host.to_ascii_lowercase())
}
