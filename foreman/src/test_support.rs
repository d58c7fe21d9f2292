//! Scripted fakes and fixtures for exercising the loop without real
//! subprocesses.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;

use anyhow::Result;

use crate::agent::{AgentRun, AgentRunner, UsageTotals};
use crate::io::git::Git;
use crate::io::issues::{IssueRef, IssueSource};
use crate::io::metrics::IterationPaths;
use crate::review::{ReviewFatalError, ReviewInput, Reviewer};

/// Temporary git repository with an initial commit.
pub struct TestWorkdir {
    dir: tempfile::TempDir,
    git: Git,
}

impl TestWorkdir {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().to_path_buf();
        git_ok(&path, &["init", "-q", "-b", "main"]);
        git_ok(&path, &["config", "user.email", "test@example.com"]);
        git_ok(&path, &["config", "user.name", "Test"]);
        std::fs::write(path.join("README.md"), "fixture\n").expect("write");
        git_ok(&path, &["add", "-A"]);
        git_ok(&path, &["commit", "-q", "-m", "init"]);
        let git = Git::new(&path);
        Self { dir, git }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Write a file and commit it, moving HEAD.
    pub fn commit_file(&self, name: &str, content: &str) {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).expect("write file");
        git_ok(self.dir.path(), &["add", "-A"]);
        git_ok(self.dir.path(), &["commit", "-q", "-m", name]);
    }
}

impl Default for TestWorkdir {
    fn default() -> Self {
        Self::new()
    }
}

fn git_ok(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("spawn git");
    assert!(status.success(), "git {args:?} failed");
}

/// One scripted agent invocation.
pub struct ScriptedRun {
    pub succeeded: bool,
    pub usage: UsageTotals,
    /// Written to the attempt's verbose log (drives retry classification).
    pub log: Option<String>,
    /// File committed to the workdir, simulating agent-made changes.
    pub commit: Option<(String, String)>,
}

impl ScriptedRun {
    pub fn success(commit: Option<(&str, &str)>) -> Self {
        Self {
            succeeded: true,
            usage: UsageTotals {
                input_tokens: 100,
                output_tokens: 200,
            },
            log: None,
            commit: commit.map(|(name, content)| (name.to_string(), content.to_string())),
        }
    }

    pub fn failure(log: &str) -> Self {
        Self {
            succeeded: false,
            usage: UsageTotals {
                input_tokens: 10,
                output_tokens: 0,
            },
            log: Some(log.to_string()),
            commit: None,
        }
    }
}

/// Agent fake replaying a fixed script of runs.
pub struct ScriptedAgent {
    workdir: PathBuf,
    runs: Mutex<VecDeque<ScriptedRun>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(workdir: impl Into<PathBuf>, runs: Vec<ScriptedRun>) -> Self {
        Self {
            workdir: workdir.into(),
            runs: Mutex::new(runs.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn assert_drained(&self) {
        assert!(
            self.runs.lock().expect("lock").is_empty(),
            "scripted agent runs left over"
        );
    }
}

impl AgentRunner for ScriptedAgent {
    fn run(&self, prompt: &str, paths: &IterationPaths) -> Result<AgentRun> {
        self.prompts
            .lock()
            .expect("lock")
            .push(prompt.to_string());
        let run = self
            .runs
            .lock()
            .expect("lock")
            .pop_front()
            .expect("scripted agent exhausted");
        if let Some(parent) = paths.log_path.parent() {
            std::fs::create_dir_all(parent).expect("create session dir");
        }
        std::fs::write(&paths.log_path, run.log.as_deref().unwrap_or("")).expect("write log");
        if let Some((name, content)) = &run.commit {
            let path = self.workdir.join(name);
            std::fs::write(&path, content).expect("write agent file");
            git_ok(&self.workdir, &["add", "-A"]);
            git_ok(&self.workdir, &["commit", "-q", "-m", name]);
        }
        Ok(AgentRun {
            usage: run.usage,
            succeeded: run.succeeded,
        })
    }
}

/// One scripted reviewer response.
pub enum ScriptedReview {
    Text(String),
    Fatal(String),
}

impl ScriptedReview {
    pub fn ship() -> Self {
        Self::Text("Looks good.\n\nRESULT: SHIP\n".to_string())
    }

    pub fn revise(feedback: &str) -> Self {
        Self::Text(format!("{feedback}\n\nRESULT: REVISE\n"))
    }

    pub fn garbled() -> Self {
        Self::Text("I could not assess this change.\n".to_string())
    }
}

/// Reviewer fake replaying a fixed script.
pub struct ScriptedReviewer {
    responses: Mutex<VecDeque<ScriptedReview>>,
}

impl ScriptedReviewer {
    pub fn new(responses: Vec<ScriptedReview>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    pub fn assert_drained(&self) {
        assert!(
            self.responses.lock().expect("lock").is_empty(),
            "scripted reviews left over"
        );
    }
}

impl Reviewer for ScriptedReviewer {
    fn review(&self, _input: &ReviewInput) -> Result<String> {
        match self
            .responses
            .lock()
            .expect("lock")
            .pop_front()
            .expect("scripted reviewer exhausted")
        {
            ScriptedReview::Text(text) => Ok(text),
            ScriptedReview::Fatal(reason) => Err(ReviewFatalError { reason }.into()),
        }
    }
}

/// Issue source replaying ready-queue batches; drained means empty queue.
pub struct ScriptedIssueSource {
    batches: Mutex<VecDeque<Vec<IssueRef>>>,
}

impl ScriptedIssueSource {
    pub fn new(batches: Vec<Vec<IssueRef>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
        }
    }

    pub fn single_task(count: usize) -> Self {
        let batches = (0..count)
            .map(|i| {
                vec![IssueRef {
                    id: format!("task-{}", i + 1),
                    title: format!("Scripted task {}", i + 1),
                }]
            })
            .collect();
        Self::new(batches)
    }
}

impl IssueSource for ScriptedIssueSource {
    fn ready(&self, _epic: Option<&str>) -> Result<Vec<IssueRef>> {
        Ok(self
            .batches
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_default())
    }

    fn in_progress(&self) -> Result<Vec<IssueRef>> {
        Ok(Vec::new())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
