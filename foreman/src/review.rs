//! Independent review pass over each iteration's changes.
//!
//! A second agent reads the diff and renders a SHIP or REVISE verdict via a
//! marker line in its output. Misconfiguration of the reviewer itself is a
//! distinct fatal error so it stops the run instead of silently skipping
//! every review.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::classify;
use crate::io::config::RunConfig;
use crate::io::git::DiffStats;
use crate::io::process::run_capture;

/// The review subsystem cannot function at all (bad credentials, missing
/// executable, no connectivity). Distinct from a REVISE verdict.
#[derive(Debug)]
pub struct ReviewFatalError {
    pub reason: String,
}

impl fmt::Display for ReviewFatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "review subsystem failure: {}", self.reason)
    }
}

impl std::error::Error for ReviewFatalError {}

/// Parsed reviewer verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewAssessment {
    Ship,
    /// Feedback text to fold into the next agent prompt.
    Revise(String),
    /// No verdict marker found; the review is treated as skipped.
    ParseFailure,
}

fn verdict_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^RESULT:\s*(SHIP|REVISE)\s*$").expect("valid verdict pattern"))
}

/// Parse the reviewer's output.
///
/// The verdict is the last `RESULT: SHIP|REVISE` line; everything before
/// that line is the feedback. Reviewers sometimes restate the expected
/// format before concluding, hence last-wins.
pub fn parse_verdict(text: &str) -> ReviewAssessment {
    let lines: Vec<&str> = text.lines().collect();
    let mut verdict = None;
    let mut marker_idx = 0usize;
    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = verdict_re().captures(line.trim_end()) {
            verdict = Some(caps.get(1).map(|m| m.as_str() == "SHIP").unwrap_or(false));
            marker_idx = idx;
        }
    }
    match verdict {
        Some(true) => ReviewAssessment::Ship,
        Some(false) => {
            let feedback = lines[..marker_idx].join("\n").trim().to_string();
            ReviewAssessment::Revise(feedback)
        }
        None => ReviewAssessment::ParseFailure,
    }
}

/// Everything the reviewer gets to see.
#[derive(Debug, Clone)]
pub struct ReviewInput {
    pub task_context: String,
    pub diff_stats: DiffStats,
    pub patch: String,
}

impl ReviewInput {
    /// Render the review prompt.
    pub fn prompt(&self) -> String {
        let mut out = String::new();
        out.push_str("You are reviewing changes produced by an automated coding agent.\n\n");
        out.push_str("## Task\n");
        out.push_str(&self.task_context);
        out.push_str("\n\n## Changed files\n");
        if self.diff_stats.files.is_empty() {
            out.push_str("(none)\n");
        } else {
            for file in &self.diff_stats.files {
                out.push_str("- ");
                out.push_str(file);
                out.push('\n');
            }
        }
        out.push_str(&format!(
            "\n{} files changed, {} insertions, {} deletions\n",
            self.diff_stats.files_changed, self.diff_stats.insertions, self.diff_stats.deletions
        ));
        out.push_str("\n## Patch\n");
        out.push_str(&self.patch);
        out.push_str(
            "\n\nAssess correctness, completeness, and safety. Conclude with exactly one \
             line: `RESULT: SHIP` if the changes are acceptable, or `RESULT: REVISE` \
             preceded by concrete feedback describing what must change.\n",
        );
        out
    }
}

/// Produces raw review text for a set of changes.
pub trait Reviewer {
    fn review(&self, input: &ReviewInput) -> Result<String>;
}

/// Review via an external CLI in non-interactive mode.
#[derive(Debug, Clone)]
pub struct CliReviewer {
    command: Vec<String>,
    model: String,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CliReviewer {
    pub fn new(config: &RunConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: config.review.command.clone(),
            model: config.review.model.clone(),
            workdir: workdir.into(),
            timeout: Duration::from_secs(config.review_timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

impl Reviewer for CliReviewer {
    #[instrument(skip_all, fields(model = %self.model))]
    fn review(&self, input: &ReviewInput) -> Result<String> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        cmd.args(["--model", &self.model]);
        cmd.current_dir(&self.workdir);

        let prompt = input.prompt();
        let output = match run_capture(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        ) {
            Ok(output) => output,
            Err(err) => {
                // A missing reviewer executable stops the run.
                if let Some(io_err) = err.root_cause().downcast_ref::<std::io::Error>()
                    && io_err.kind() == std::io::ErrorKind::NotFound
                {
                    return Err(ReviewFatalError {
                        reason: format!("reviewer executable not found: {}", self.command[0]),
                    }
                    .into());
                }
                return Err(err.context("run reviewer"));
            }
        };

        let combined = format!("{}\n{}", output.stdout, output.stderr);
        if let Some(label) = classify::reviewer_fatal(&combined) {
            return Err(ReviewFatalError {
                reason: label.to_string(),
            }
            .into());
        }
        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "reviewer timed out");
        } else if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "reviewer exited non-zero");
        }
        debug!(bytes = output.stdout.len(), "review output captured");
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ship_verdict() {
        assert_eq!(
            parse_verdict("Looks solid.\n\nRESULT: SHIP\n"),
            ReviewAssessment::Ship
        );
    }

    #[test]
    fn parses_revise_with_feedback() {
        let text = "The error path drops the lock file.\nAdd a cleanup guard.\n\nRESULT: REVISE\n";
        match parse_verdict(text) {
            ReviewAssessment::Revise(feedback) => {
                assert!(feedback.contains("cleanup guard"));
                assert!(!feedback.contains("RESULT"));
            }
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn last_marker_wins() {
        let text = "End with RESULT: SHIP or RESULT: REVISE on its own line.\n\
                    RESULT: REVISE\nreconsidering...\nRESULT: SHIP\n";
        assert_eq!(parse_verdict(text), ReviewAssessment::Ship);
    }

    #[test]
    fn marker_must_fill_the_line() {
        assert_eq!(
            parse_verdict("I would say RESULT: SHIP it\n"),
            ReviewAssessment::ParseFailure
        );
        assert_eq!(parse_verdict(""), ReviewAssessment::ParseFailure);
        assert_eq!(
            parse_verdict("No verdict here.\n"),
            ReviewAssessment::ParseFailure
        );
    }

    #[test]
    fn prompt_carries_diff_and_instructions() {
        let input = ReviewInput {
            task_context: "task-7: fix retry backoff".to_string(),
            diff_stats: DiffStats {
                files_changed: 1,
                insertions: 4,
                deletions: 1,
                files: vec!["src/retry.rs".to_string()],
            },
            patch: "diff --git a/src/retry.rs b/src/retry.rs\n".to_string(),
        };
        let prompt = input.prompt();
        assert!(prompt.contains("task-7"));
        assert!(prompt.contains("- src/retry.rs"));
        assert!(prompt.contains("RESULT: SHIP"));
        assert!(prompt.contains("RESULT: REVISE"));
    }

    #[test]
    fn missing_reviewer_executable_is_fatal() {
        let config = RunConfig {
            review: crate::io::config::ReviewConfig {
                command: vec!["foreman-no-such-reviewer".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let temp = tempfile::tempdir().expect("tempdir");
        let reviewer = CliReviewer::new(&config, temp.path());
        let input = ReviewInput {
            task_context: String::new(),
            diff_stats: DiffStats::default(),
            patch: String::new(),
        };
        let err = reviewer.review(&input).expect_err("should fail");
        assert!(err.downcast_ref::<ReviewFatalError>().is_some());
    }

    #[test]
    fn fatal_output_signature_is_fatal() {
        let config = RunConfig {
            review: crate::io::config::ReviewConfig {
                command: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "echo 'Error: authentication failed'".to_string(),
                ],
                ..Default::default()
            },
            ..Default::default()
        };
        let temp = tempfile::tempdir().expect("tempdir");
        let reviewer = CliReviewer::new(&config, temp.path());
        let input = ReviewInput {
            task_context: String::new(),
            diff_stats: DiffStats::default(),
            patch: String::new(),
        };
        let err = reviewer.review(&input).expect_err("should fail");
        let fatal = err.downcast_ref::<ReviewFatalError>().expect("fatal");
        assert_eq!(fatal.reason, "authentication failure");
    }
}
