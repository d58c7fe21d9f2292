//! Git adapter for the orchestration loop.
//!
//! The loop only observes the repository (did the agent change anything, what
//! does the diff look like for review) and optionally pushes, so we keep a
//! small, explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Point-in-time view of the repository used to detect whether an agent
/// invocation produced new changes.
///
/// Equality of two snapshots means same HEAD and same dirty flag. A commit
/// followed by a full revert between snapshots would compare equal; that is
/// an accepted blind spot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionSnapshot {
    pub head: String,
    pub dirty: bool,
}

/// Shape of a diff between two revisions, for reports and review context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
    pub files: Vec<String>,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current HEAD short SHA (12 characters).
    pub fn head_revision(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--short=12", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// True when the worktree has uncommitted changes, untracked included.
    pub fn is_dirty(&self) -> Result<bool> {
        let out = self.run_capture(&["status", "--porcelain", "-uall"])?;
        Ok(!out.trim().is_empty())
    }

    /// Capture the state used for the no-new-changes check.
    pub fn snapshot(&self) -> Result<RevisionSnapshot> {
        Ok(RevisionSnapshot {
            head: self.head_revision()?,
            dirty: self.is_dirty()?,
        })
    }

    /// Summarize the committed diff between two revisions.
    #[instrument(skip_all, fields(from, to))]
    pub fn diff_stats(&self, from: &str, to: &str) -> Result<DiffStats> {
        let range = format!("{from}..{to}");
        let shortstat = self.run_capture(&["diff", "--shortstat", &range])?;
        let mut stats = parse_shortstat(&shortstat);
        let names = self.run_capture(&["diff", "--name-only", &range])?;
        stats.files = names
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        debug!(
            files = stats.files_changed,
            insertions = stats.insertions,
            deletions = stats.deletions,
            "diff stats"
        );
        Ok(stats)
    }

    /// Full patch text between two revisions, for the review prompt.
    pub fn diff_patch(&self, from: &str, to: &str) -> Result<String> {
        let range = format!("{from}..{to}");
        self.run_capture(&["diff", &range])
    }

    /// Patch text of uncommitted changes against a base revision.
    pub fn diff_worktree(&self, base: &str) -> Result<String> {
        self.run_capture(&["diff", base])
    }

    /// Log subjects between two revisions, newest first.
    pub fn log_subjects(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let range = format!("{from}..{to}");
        let out = self.run_capture(&["log", "--format=%s", &range])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    /// Push the current branch to its upstream.
    #[instrument(skip_all)]
    pub fn push(&self) -> Result<()> {
        debug!("pushing current branch");
        self.run_checked(&["push"])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(args = %args.join(" "), "git command failed");
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Parse `git diff --shortstat` output.
///
/// The line omits sections with zero counts, and is empty for an empty diff.
fn parse_shortstat(line: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for part in line.trim().split(',') {
        let part = part.trim();
        let Some(n) = part
            .split_whitespace()
            .next()
            .and_then(|tok| tok.parse::<u32>().ok())
        else {
            continue;
        };
        if part.contains("file") {
            stats.files_changed = n;
        } else if part.contains("insertion") {
            stats.insertions = n;
        } else if part.contains("deletion") {
            stats.deletions = n;
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn git_ok(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {args:?} failed");
    }

    fn init_repo() -> (tempfile::TempDir, Git) {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().to_path_buf();
        git_ok(&dir, &["init", "-q", "-b", "main"]);
        git_ok(&dir, &["config", "user.email", "test@example.com"]);
        git_ok(&dir, &["config", "user.name", "Test"]);
        fs::write(dir.join("README.md"), "hello\n").expect("write");
        git_ok(&dir, &["add", "-A"]);
        git_ok(&dir, &["commit", "-q", "-m", "init"]);
        let git = Git::new(dir);
        (temp, git)
    }

    #[test]
    fn snapshot_tracks_commits_and_dirt() {
        let (temp, git) = init_repo();
        let clean = git.snapshot().expect("snapshot");
        assert!(!clean.dirty);

        fs::write(temp.path().join("new.txt"), "x\n").expect("write");
        let dirty = git.snapshot().expect("snapshot");
        assert!(dirty.dirty);
        assert_eq!(clean.head, dirty.head);
        assert_ne!(clean, dirty);

        git_ok(temp.path(), &["add", "-A"]);
        git_ok(temp.path(), &["commit", "-q", "-m", "add file"]);
        let committed = git.snapshot().expect("snapshot");
        assert!(!committed.dirty);
        assert_ne!(clean.head, committed.head);
    }

    #[test]
    fn diff_stats_between_revisions() {
        let (temp, git) = init_repo();
        let before = git.head_revision().expect("head");

        fs::write(temp.path().join("a.txt"), "one\ntwo\n").expect("write");
        git_ok(temp.path(), &["add", "-A"]);
        git_ok(temp.path(), &["commit", "-q", "-m", "add a"]);
        let after = git.head_revision().expect("head");

        let stats = git.diff_stats(&before, &after).expect("diff stats");
        assert_eq!(stats.files_changed, 1);
        assert_eq!(stats.insertions, 2);
        assert_eq!(stats.files, vec!["a.txt".to_string()]);
    }

    #[test]
    fn parses_shortstat_variants() {
        assert_eq!(
            parse_shortstat(" 3 files changed, 10 insertions(+), 2 deletions(-)"),
            DiffStats {
                files_changed: 3,
                insertions: 10,
                deletions: 2,
                files: Vec::new(),
            }
        );
        assert_eq!(
            parse_shortstat(" 1 file changed, 5 deletions(-)"),
            DiffStats {
                files_changed: 1,
                insertions: 0,
                deletions: 5,
                files: Vec::new(),
            }
        );
        assert_eq!(parse_shortstat(""), DiffStats::default());
    }
}
