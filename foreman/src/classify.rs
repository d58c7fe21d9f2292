//! Signature tables for classifying external-tool output.
//!
//! The agent and reviewer are external executables that only communicate via
//! text, so provider throttling and fatal reviewer errors are detected by
//! scanning their output. The rules live here as explicit tables so they can
//! be unit-tested without spawning anything.

use std::sync::OnceLock;

use regex::{Regex, RegexSet};

const RATE_LIMIT_PATTERNS: &[&str] = &[
    r"(?i)rate[ _-]?limit",
    r"\b429\b",
    r"(?i)overloaded_error",
    r"(?i)resource_exhausted",
    r"(?i)quota (exceeded|exhausted)",
    r"(?i)too many requests",
];

const REVIEW_FATAL_RULES: &[(&str, &str)] = &[
    (
        r"(?i)authentication[ _]?(failed|error)|not logged in",
        "authentication failure",
    ),
    (
        r"(?i)unauthorized|invalid api key|permission denied \(api\)",
        "authorization failure",
    ),
    (
        r"(?i)connection (refused|reset|timed out)|could not resolve host",
        "connection failure",
    ),
    (
        r"(?i)command not found|no such file or directory",
        "reviewer executable unavailable",
    ),
];

fn rate_limit_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| RegexSet::new(RATE_LIMIT_PATTERNS).expect("valid rate-limit patterns"))
}

fn review_fatal_rules() -> &'static Vec<(Regex, &'static str)> {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        REVIEW_FATAL_RULES
            .iter()
            .map(|(pattern, label)| {
                (
                    Regex::new(pattern).expect("valid reviewer-fatal pattern"),
                    *label,
                )
            })
            .collect()
    })
}

/// True when the text carries a provider throttling signature.
///
/// A hit means the next retry should wait `rate_limit_pause` instead of the
/// flat `retry_delay`.
pub fn is_rate_limited(text: &str) -> bool {
    rate_limit_set().is_match(text)
}

/// Classify reviewer output that indicates the review subsystem cannot
/// function at all (misconfiguration, not a negative verdict).
///
/// Returns a short label for the matched failure class, or `None` when the
/// output looks like an ordinary review.
pub fn reviewer_fatal(text: &str) -> Option<&'static str> {
    review_fatal_rules()
        .iter()
        .find(|(re, _)| re.is_match(text))
        .map(|(_, label)| *label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_rate_limit_signatures() {
        assert!(is_rate_limited("Error: rate limit exceeded, retry later"));
        assert!(is_rate_limited("API error 429: too many requests"));
        assert!(is_rate_limited("{\"type\":\"overloaded_error\"}"));
        assert!(is_rate_limited("status: RESOURCE_EXHAUSTED"));
    }

    #[test]
    fn ordinary_failures_are_not_rate_limits() {
        assert!(!is_rate_limited("error: tests failed (exit code 1)"));
        assert!(!is_rate_limited("panicked at src/main.rs:42"));
        assert!(!is_rate_limited(""));
    }

    #[test]
    fn classifies_fatal_reviewer_output() {
        assert_eq!(
            reviewer_fatal("Error: authentication failed. Run login first."),
            Some("authentication failure")
        );
        assert_eq!(
            reviewer_fatal("Invalid API key provided"),
            Some("authorization failure")
        );
        assert_eq!(
            reviewer_fatal("curl: (7) Connection refused"),
            Some("connection failure")
        );
        assert_eq!(
            reviewer_fatal("sh: reviewer: command not found"),
            Some("reviewer executable unavailable")
        );
    }

    #[test]
    fn negative_verdicts_are_not_fatal() {
        assert_eq!(reviewer_fatal("RESULT: REVISE"), None);
        assert_eq!(
            reviewer_fatal("The change breaks the connection pool tests"),
            None
        );
    }
}
