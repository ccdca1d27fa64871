//! Expectation validation: a `|`-separated OR-list of substring patterns
//! matched against captured execution output.
//!
//! For HTTP executions the content under test is `"{status}|{body}"`, so a
//! pattern can match either the numeric status or a body substring.

/// Whether the captured content satisfies the expectation. An empty
/// expectation always validates; a non-empty one succeeds if any pattern
/// appears as a substring.
pub fn validate(expect: &str, content: &str) -> bool {
    let patterns: Vec<&str> = expect
        .split('|')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if patterns.is_empty() {
        return true;
    }
    patterns.into_iter().any(|p| content.contains(p))
}

/// The content an HTTP execution is validated against.
pub fn http_content(status: u16, body: &str) -> String {
    format!("{status}|{body}")
}
