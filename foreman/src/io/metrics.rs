//! Per-iteration metrics and artifact paths under a session directory.
//!
//! The metrics log is append-only, one JSON object per line; records are
//! never mutated after the iteration completes. The global history file
//! accumulates one terminal summary line per run across all sessions.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Final review outcome recorded for an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
    /// The reviewer returned SHIP.
    Shipped,
    /// The revise budget ran out; the last verdict was still REVISE.
    MaxRevisions,
    /// Review could not produce a verdict (parse failure or no-change
    /// short-circuit); the iteration proceeded without one.
    Skipped,
    /// Review was disabled for the run.
    Disabled,
}

impl ReviewOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewOutcome::Shipped => "shipped",
            ReviewOutcome::MaxRevisions => "max_revisions",
            ReviewOutcome::Skipped => "skipped",
            ReviewOutcome::Disabled => "disabled",
        }
    }
}

/// Immutable record of one completed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    /// Agent re-invocations consumed by REVISE verdicts.
    pub revision_rounds: u32,
    pub review: ReviewOutcome,
    /// Head revision after the iteration.
    pub revision: Option<String>,
}

/// Append-only metrics log (`<session>/metrics.jsonl`).
#[derive(Debug, Clone)]
pub struct MetricsLog {
    path: PathBuf,
}

impl MetricsLog {
    pub fn new(session_dir: &Path) -> Self {
        Self {
            path: session_dir.join("metrics.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &IterationRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create metrics dir {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(record).context("serialize iteration record")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open metrics log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append metrics log {}", self.path.display()))?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<IterationRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read metrics log {}", self.path.display()))?;
        let mut records = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: IterationRecord = serde_json::from_str(line).with_context(|| {
                format!("parse metrics line {} of {}", idx + 1, self.path.display())
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Artifact paths for one iteration attempt.
///
/// The first attempt uses `iter_NNN.*`; retries append an `_rK` suffix so
/// earlier attempts remain inspectable.
#[derive(Debug, Clone)]
pub struct IterationPaths {
    /// Raw line-delimited event stream from the agent.
    pub stream_path: PathBuf,
    /// Verbose text log (non-structured lines plus agent stderr).
    pub log_path: PathBuf,
    /// Derived token-usage extract.
    pub usage_path: PathBuf,
    /// Raw reviewer output for the iteration.
    pub review_path: PathBuf,
    /// Reviewer feedback folded into the next prompt.
    pub feedback_path: PathBuf,
}

impl IterationPaths {
    pub fn new(session_dir: &Path, iteration: u32, attempt: u32) -> Self {
        let stem = if attempt <= 1 {
            format!("iter_{iteration:03}")
        } else {
            format!("iter_{iteration:03}_r{attempt}")
        };
        Self {
            stream_path: session_dir.join(format!("{stem}.stream.jsonl")),
            log_path: session_dir.join(format!("{stem}.log")),
            usage_path: session_dir.join(format!("{stem}.usage.json")),
            review_path: session_dir.join(format!("iter_{iteration:03}.review.md")),
            feedback_path: session_dir.join(format!("iter_{iteration:03}.feedback.md")),
        }
    }
}

/// Append one terminal summary line to the global history file.
pub fn append_history(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create history dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open history {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("append history {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(iteration: u32) -> IterationRecord {
        IterationRecord {
            iteration,
            started_at: "2026-01-02T03:04:05Z".to_string(),
            ended_at: "2026-01-02T03:09:05Z".to_string(),
            duration_ms: 300_000,
            input_tokens: 1000,
            output_tokens: 2500,
            cost: 0.04,
            revision_rounds: 1,
            review: ReviewOutcome::Shipped,
            revision: Some("abc123".to_string()),
        }
    }

    #[test]
    fn append_then_read_preserves_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = MetricsLog::new(temp.path());

        log.append(&record(1)).expect("append 1");
        log.append(&record(2)).expect("append 2");

        let records = log.read_all().expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], record(1));
        assert_eq!(records[1].iteration, 2);
    }

    #[test]
    fn read_missing_log_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = MetricsLog::new(&temp.path().join("nope"));
        assert!(log.read_all().expect("read").is_empty());
    }

    #[test]
    fn iteration_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = IterationPaths::new(temp.path(), 3, 1);
        assert!(first.stream_path.ends_with("iter_003.stream.jsonl"));
        assert!(first.log_path.ends_with("iter_003.log"));
        assert!(first.usage_path.ends_with("iter_003.usage.json"));

        let retry = IterationPaths::new(temp.path(), 3, 2);
        assert!(retry.stream_path.ends_with("iter_003_r2.stream.jsonl"));
        // Review artifacts are per-iteration, not per-attempt.
        assert!(retry.review_path.ends_with("iter_003.review.md"));
    }

    #[test]
    fn history_lines_accumulate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("history.log");
        append_history(&path, "run one").expect("append");
        append_history(&path, "run two").expect("append");

        let contents = fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "run one\nrun two\n");
    }
}
