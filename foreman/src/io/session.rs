//! Session storage under the sessions root (`.foreman/sessions/`).
//!
//! Each session owns a directory keyed by its id, holding the state document
//! plus the per-iteration artifacts and metrics log. A `latest` pointer file
//! at the root is rewritten on every save. Sessions are never deleted
//! automatically.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Running,
    Paused,
    Failed,
    Interrupted,
    Complete,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Failed => "failed",
            SessionStatus::Interrupted => "interrupted",
            SessionStatus::Complete => "complete",
        }
    }
}

/// Running totals for review outcomes across a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewTally {
    pub passes: u32,
    pub revisions: u32,
    pub skipped: u32,
}

impl ReviewTally {
    pub fn absorb(&mut self, other: ReviewTally) {
        self.passes += other.passes;
        self.revisions += other.revisions;
        self.skipped += other.skipped;
    }
}

/// Persisted state of one orchestration run (`<session>/state.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub start_time: String,
    /// Completed iterations; stays in lockstep with the metrics log.
    pub iteration: u32,
    pub consecutive_failures: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: f64,
    pub status: SessionStatus,
    pub review: ReviewTally,
    /// Head revision after the most recent successful iteration.
    pub last_revision: Option<String>,
    pub last_updated: String,
}

impl Session {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Creates, persists, loads, and lists sessions under a sessions root.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn state_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join("state.json")
    }

    fn latest_path(&self) -> PathBuf {
        self.root.join("latest")
    }

    /// Allocate a fresh session: time+pid id, zeroed counters, directory and
    /// initial state written, `latest` pointer updated.
    pub fn create(&self) -> Result<Session> {
        let now = Utc::now();
        let base = format!("{}-{}", now.format("%Y%m%d-%H%M%S"), std::process::id());
        // Same-second collisions get a numeric suffix.
        let mut id = base.clone();
        let mut suffix = 1u32;
        while self.session_dir(&id).exists() {
            suffix += 1;
            id = format!("{base}-{suffix}");
        }
        let session = Session {
            id: id.clone(),
            start_time: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            iteration: 0,
            consecutive_failures: 0,
            input_tokens: 0,
            output_tokens: 0,
            total_cost: 0.0,
            status: SessionStatus::Initializing,
            review: ReviewTally::default(),
            last_revision: None,
            last_updated: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        fs::create_dir_all(self.session_dir(&id))
            .with_context(|| format!("create session dir {}", self.session_dir(&id).display()))?;
        self.save(&session)?;
        debug!(session_id = %id, "created session");
        Ok(session)
    }

    /// Idempotent full overwrite of the state document (atomic) plus the
    /// `latest` pointer.
    pub fn save(&self, session: &Session) -> Result<()> {
        let path = self.state_path(&session.id);
        debug!(path = %path.display(), iteration = session.iteration, "saving session");
        let mut buf = serde_json::to_string_pretty(session)?;
        buf.push('\n');
        write_atomic(&path, &buf)?;
        write_atomic(&self.latest_path(), &format!("{}\n", session.id))?;
        Ok(())
    }

    /// Persistence is a best-effort guarantee: failures are surfaced as a
    /// warning and the run continues in memory.
    pub fn save_best_effort(&self, session: &Session) {
        if let Err(err) = self.save(session) {
            warn!(session_id = %session.id, err = %err, "failed to persist session state");
        }
    }

    pub fn load(&self, id: &str) -> Result<Session> {
        let path = self.state_path(id);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("session '{id}' not found ({})", path.display()))?;
        let session: Session = serde_json::from_str(&contents)
            .with_context(|| format!("parse session state {}", path.display()))?;
        Ok(session)
    }

    pub fn load_latest(&self) -> Result<Session> {
        let pointer = self.latest_path();
        let id = fs::read_to_string(&pointer)
            .with_context(|| format!("no latest session ({})", pointer.display()))?;
        let id = id.trim();
        if id.is_empty() {
            return Err(anyhow!("latest pointer is empty ({})", pointer.display()));
        }
        self.load(id)
    }

    /// Enumerate session ids, newest first by state-document mtime.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<(String, SystemTime)> = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("read sessions root {}", self.root.display()))?
        {
            let entry = entry.context("read sessions root entry")?;
            let state = entry.path().join("state.json");
            if !state.is_file() {
                continue;
            }
            let modified = state
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((entry.file_name().to_string_lossy().into_owned(), modified));
        }
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        Ok(entries.into_iter().map(|(id, _)| id).collect())
    }
}

/// Current UTC timestamp in the session's on-disk format.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path().join("sessions"));
        (temp, store)
    }

    /// Round-trip of the state document is lossless for all fields.
    #[test]
    fn session_round_trips() {
        let (_temp, store) = store();
        let mut session = store.create().expect("create");
        session.iteration = 4;
        session.consecutive_failures = 1;
        session.input_tokens = 1200;
        session.output_tokens = 3400;
        session.total_cost = 0.75;
        session.status = SessionStatus::Running;
        session.review = ReviewTally {
            passes: 2,
            revisions: 3,
            skipped: 1,
        };
        session.last_revision = Some("abc123def456".to_string());
        store.save(&session).expect("save");

        let loaded = store.load(&session.id).expect("load");
        assert_eq!(loaded, session);
    }

    #[test]
    fn latest_pointer_follows_saves() {
        let (_temp, store) = store();
        let first = store.create().expect("create first");
        let second = store.create().expect("create second");
        assert_eq!(store.load_latest().expect("latest").id, second.id);

        store.save(&first).expect("re-save first");
        assert_eq!(store.load_latest().expect("latest").id, first.id);
    }

    #[test]
    fn load_missing_session_errors() {
        let (_temp, store) = store();
        let err = store.load("nope").expect_err("should fail");
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn list_enumerates_created_sessions() {
        let (_temp, store) = store();
        assert!(store.list().expect("empty list").is_empty());

        let a = store.create().expect("a");
        let b = store.create().expect("b");
        let ids = store.list().expect("list");
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id));
        assert!(ids.contains(&b.id));
    }

    #[test]
    fn save_best_effort_swallows_errors() {
        let (_temp, store) = store();
        let session = store.create().expect("create");
        // Point the store at an unwritable location; must not panic.
        let broken = SessionStore::new("/proc/foreman-nope");
        broken.save_best_effort(&session);
    }
}
