//! Issue-tracker adapter.
//!
//! Ready work is discovered by shelling out to the tracker CLI; the trait
//! seam keeps the loop testable with scripted sources.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::io::process::run_capture;

const TRACKER_TIMEOUT: Duration = Duration::from_secs(60);
const TRACKER_OUTPUT_LIMIT: usize = 1_000_000;

/// One work item from the tracker's ready queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRef {
    pub id: String,
    pub title: String,
}

/// Source of ready work for the loop.
pub trait IssueSource {
    /// Work items with no unmet dependencies, optionally scoped to an epic.
    fn ready(&self, epic: Option<&str>) -> Result<Vec<IssueRef>>;

    /// Items currently claimed/in progress, shown in status output.
    fn in_progress(&self) -> Result<Vec<IssueRef>>;

    /// Synchronize the tracker with its remote. Failures are advisory.
    fn sync(&self) -> Result<()>;
}

/// Tracker access via its CLI (e.g. `bd`).
#[derive(Debug, Clone)]
pub struct TrackerCli {
    command: Vec<String>,
    workdir: PathBuf,
}

impl TrackerCli {
    pub fn new(command: Vec<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            workdir: workdir.into(),
        }
    }

    fn build(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        cmd.args(args);
        cmd.current_dir(&self.workdir);
        cmd
    }

    #[instrument(skip_all, fields(args = args.join(" ")))]
    fn capture(&self, args: &[&str]) -> Result<String> {
        let output = run_capture(self.build(args), None, TRACKER_TIMEOUT, TRACKER_OUTPUT_LIMIT)
            .with_context(|| format!("run tracker {}", self.command.join(" ")))?;
        if output.timed_out {
            return Err(anyhow!("tracker command timed out: {}", args.join(" ")));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "tracker command failed ({}): {}",
                args.join(" "),
                output.stderr.trim()
            ));
        }
        Ok(output.stdout)
    }
}

impl IssueSource for TrackerCli {
    fn ready(&self, epic: Option<&str>) -> Result<Vec<IssueRef>> {
        let mut args = vec!["ready", "--json"];
        if let Some(epic) = epic {
            args.push("--parent");
            args.push(epic);
        }
        let out = self.capture(&args)?;
        let issues = parse_issue_list(&out)?;
        debug!(count = issues.len(), "ready work");
        Ok(issues)
    }

    fn in_progress(&self) -> Result<Vec<IssueRef>> {
        let out = self.capture(&["list", "--status", "in_progress", "--json"])?;
        parse_issue_list(&out)
    }

    fn sync(&self) -> Result<()> {
        if let Err(err) = self.capture(&["sync"]) {
            warn!(err = %err, "tracker sync failed");
            return Err(err);
        }
        Ok(())
    }
}

/// Parse tracker output into issue refs.
///
/// Preferred shape is a JSON array of objects with `id` and `title`; plain
/// text falls back to one issue per line with the first token as the id.
pub fn parse_issue_list(text: &str) -> Result<Vec<IssueRef>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        let values: Vec<Value> = serde_json::from_str(trimmed).context("parse tracker JSON")?;
        let mut issues = Vec::new();
        for value in values {
            let id = value
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("tracker issue missing id: {value}"))?;
            let title = value
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default();
            issues.push(IssueRef {
                id: id.to_string(),
                title: title.to_string(),
            });
        }
        return Ok(issues);
    }
    let mut issues = Vec::new();
    for line in trimmed.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (id, title) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        issues.push(IssueRef {
            id: id.to_string(),
            title: title.trim().to_string(),
        });
    }
    Ok(issues)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn parses_json_array() {
        let issues = parse_issue_list(
            r#"[{"id":"task-12","title":"Wire up retries"},{"id":"task-13","title":"Docs"}]"#,
        )
        .expect("parse");
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].id, "task-12");
        assert_eq!(issues[0].title, "Wire up retries");
    }

    #[test]
    fn parses_plain_text_lines() {
        let issues = parse_issue_list("task-1  First task\ntask-2  Second\n").expect("parse");
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[1].id, "task-2");
        assert_eq!(issues[1].title, "Second");
    }

    #[test]
    fn empty_output_is_empty_queue() {
        assert!(parse_issue_list("").expect("parse").is_empty());
        assert!(parse_issue_list("[]").expect("parse").is_empty());
        assert!(parse_issue_list("  \n").expect("parse").is_empty());
    }

    #[test]
    fn json_entry_without_id_errors() {
        assert!(parse_issue_list(r#"[{"title":"no id"}]"#).is_err());
    }

    fn tracker(dir: &Path) -> TrackerCli {
        TrackerCli::new(vec!["sh".to_string(), "tracker.sh".to_string()], dir)
    }

    #[test]
    fn ready_shells_out_and_parses() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            temp.path().join("tracker.sh"),
            r#"echo '[{"id":"task-1","title":"Do it"}]'"#,
        )
        .expect("write script");

        let issues = tracker(temp.path()).ready(None).expect("ready");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].id, "task-1");
    }

    #[test]
    fn failed_tracker_command_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("tracker.sh"), "echo boom >&2; exit 1")
            .expect("write script");

        let err = tracker(temp.path()).ready(None).expect_err("should fail");
        assert!(err.to_string().contains("boom"));
    }
}
