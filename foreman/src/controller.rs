//! The orchestration loop: poll ready work, run the agent, review, record.
//!
//! All side effects go through the `LoopDeps` seams so the loop itself can
//! be driven by scripted fakes in tests. The loop never panics its way out;
//! every stop path lands in a terminal session status and a final save.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{AgentRunner, RetryPolicy, UsageTotals, run_with_retries};
use crate::io::config::{Mode, RunConfig};
use crate::io::git::{DiffStats, Git, RevisionSnapshot};
use crate::io::issues::{IssueRef, IssueSource};
use crate::io::metrics::{IterationPaths, IterationRecord, MetricsLog, ReviewOutcome, append_history};
use crate::io::session::{ReviewTally, Session, SessionStatus, SessionStore, now_rfc3339};
use crate::notify::{LifecycleEvent, Notifier};
use crate::report;
use crate::review::{ReviewAssessment, ReviewInput, Reviewer, parse_verdict};
use crate::signals::SignalState;

/// Marker file inside the session directory; its presence pauses the loop
/// between iterations.
pub const PAUSE_FILE: &str = "paused";

const PAUSE_POLL: Duration = Duration::from_secs(1);

/// External collaborators of the loop.
pub struct LoopDeps<'a> {
    pub agent: &'a dyn AgentRunner,
    pub reviewer: &'a dyn Reviewer,
    pub issues: &'a dyn IssueSource,
    pub git: &'a Git,
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Iteration budget reached, or the operator quit at the prompt.
    Complete,
    /// The ready queue drained with auto-stop enabled.
    NoReadyWork,
    /// Too many iteration failures in a row.
    Failed { consecutive_failures: u32 },
    Interrupted,
}

/// Terminal state of a run.
#[derive(Debug)]
pub struct LoopOutcome {
    pub stop: LoopStop,
    pub session: Session,
}

/// Operator's answer at the interactive prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirm {
    Continue,
    Skip,
    Stop,
}

/// Interpret one line of operator input at the pre-iteration prompt.
pub fn parse_confirm(input: &str) -> Confirm {
    match input.trim().to_ascii_lowercase().as_str() {
        "" | "y" | "yes" => Confirm::Continue,
        "s" | "skip" => Confirm::Skip,
        "n" | "no" | "q" | "quit" => Confirm::Stop,
        other => {
            warn!(input = %other, "unrecognized answer, continuing");
            Confirm::Continue
        }
    }
}

/// Build the agent prompt for one iteration.
pub fn build_prompt(config: &RunConfig, issues: &[IssueRef]) -> String {
    let mut out = String::new();
    match config.mode {
        Mode::Build => {
            out.push_str(
                "Pick the FIRST item from the ready work list below. Implement it \
                 completely: code, tests, and documentation. Commit your work with a \
                 clear message and mark the item closed in the tracker when done.\n",
            );
        }
        Mode::Plan => {
            out.push_str(
                "Pick the FIRST item from the ready work list below. Produce a detailed \
                 implementation plan and record it in the tracker. Do NOT modify source \
                 files.\n",
            );
        }
    }
    out.push_str("\nReady work:\n");
    for issue in issues {
        out.push_str(&format!("- {}: {}\n", issue.id, issue.title));
    }
    out.push_str("\nWork on exactly one item. Do not start a second one.\n");
    out
}

/// Build the follow-up prompt after a REVISE verdict.
pub fn revise_prompt(base: &str, feedback: &str) -> String {
    format!(
        "{base}\nAn independent review of your previous attempt requested changes. \
         Address ALL of the feedback below, then commit the fixes.\n\n\
         ## Review feedback\n{feedback}\n"
    )
}

struct IterationOutcome {
    succeeded: bool,
    interrupted: bool,
    usage: UsageTotals,
    revision_rounds: u32,
    review: ReviewOutcome,
    tally: ReviewTally,
    revision: Option<String>,
    started_at: String,
    ended_at: String,
    duration_ms: u64,
}

/// Drive the loop until a stop condition, persisting state as it goes.
///
/// Review-subsystem failures propagate as errors; everything else resolves
/// to a `LoopStop`.
#[instrument(skip_all, fields(session_id = %session.id))]
pub fn run_loop(
    config: &RunConfig,
    store: &SessionStore,
    mut session: Session,
    deps: &LoopDeps<'_>,
    signals: &SignalState,
    notifier: &Notifier,
) -> Result<LoopOutcome> {
    let session_dir = store.session_dir(&session.id);
    let metrics = MetricsLog::new(&session_dir);
    let policy = RetryPolicy::from_config(config);
    let delay = Duration::from_secs(config.iteration_delay_secs);

    session.status = SessionStatus::Running;
    session.last_updated = now_rfc3339();
    store.save_best_effort(&session);
    notifier.notify(
        LifecycleEvent::SessionStarted,
        &session,
        &format!("session {} started", session.id),
    );

    let mut completed_this_run = 0u32;
    let stop = loop {
        if signals.interrupted() {
            break LoopStop::Interrupted;
        }
        if !wait_while_paused(&session_dir, store, &mut session, signals) {
            break LoopStop::Interrupted;
        }
        if config.max_iterations > 0 && completed_this_run >= config.max_iterations {
            info!(iterations = completed_this_run, "iteration budget reached");
            break LoopStop::Complete;
        }

        if let Err(err) = deps.issues.sync() {
            warn!(err = %err, "tracker sync failed, continuing with local state");
        }
        let ready = match deps.issues.ready(config.epic.as_deref()) {
            Ok(ready) => ready,
            Err(err) => {
                error!(err = %err, "failed to query ready work");
                session.consecutive_failures += 1;
                store.save_best_effort(&session);
                if session.consecutive_failures >= config.consecutive_failure_limit {
                    break LoopStop::Failed {
                        consecutive_failures: session.consecutive_failures,
                    };
                }
                if !signals.sleep(delay) {
                    break LoopStop::Interrupted;
                }
                continue;
            }
        };
        if ready.is_empty() {
            if config.auto_stop_on_empty {
                info!("ready queue is empty");
                break LoopStop::NoReadyWork;
            }
            debug!("ready queue empty, waiting");
            if !signals.sleep(delay) {
                break LoopStop::Interrupted;
            }
            continue;
        }

        if config.interactive {
            match prompt_operator(session.iteration + 1, &ready) {
                Confirm::Continue => {}
                Confirm::Skip => {
                    if !signals.sleep(delay) {
                        break LoopStop::Interrupted;
                    }
                    continue;
                }
                Confirm::Stop => break LoopStop::Complete,
            }
        }

        let iteration = session.iteration + 1;
        info!(iteration, ready = ready.len(), "starting iteration");
        let outcome = match run_iteration(config, &session_dir, iteration, &ready, deps, signals, &policy) {
            Ok(outcome) => outcome,
            Err(err) => {
                if err.downcast_ref::<crate::review::ReviewFatalError>().is_some() {
                    session.status = SessionStatus::Failed;
                    session.last_updated = now_rfc3339();
                    store.save_best_effort(&session);
                    return Err(err);
                }
                error!(err = %format!("{err:#}"), "iteration errored");
                session.consecutive_failures += 1;
                store.save_best_effort(&session);
                if session.consecutive_failures >= config.consecutive_failure_limit {
                    break LoopStop::Failed {
                        consecutive_failures: session.consecutive_failures,
                    };
                }
                if !signals.sleep(delay) {
                    break LoopStop::Interrupted;
                }
                continue;
            }
        };

        session.input_tokens += outcome.usage.input_tokens;
        session.output_tokens += outcome.usage.output_tokens;
        session.total_cost += outcome.usage.cost(config);
        session.last_updated = now_rfc3339();

        if outcome.succeeded {
            session.consecutive_failures = 0;
            session.iteration += 1;
            completed_this_run += 1;
            session.review.absorb(outcome.tally);
            if outcome.revision.is_some() {
                session.last_revision = outcome.revision.clone();
            }

            let record = IterationRecord {
                iteration: session.iteration,
                started_at: outcome.started_at,
                ended_at: outcome.ended_at,
                duration_ms: outcome.duration_ms,
                input_tokens: outcome.usage.input_tokens,
                output_tokens: outcome.usage.output_tokens,
                cost: outcome.usage.cost(config),
                revision_rounds: outcome.revision_rounds,
                review: outcome.review,
                revision: outcome.revision,
            };
            if let Err(err) = metrics.append(&record) {
                warn!(err = %err, "failed to append metrics record");
            }
            // Persistence is best-effort; checkpoint boundaries just log
            // louder, because losing one of those costs resumability.
            let checkpoint = config.checkpoint_interval > 0
                && session.iteration % config.checkpoint_interval == 0;
            if let Err(err) = store.save(&session) {
                if checkpoint {
                    error!(err = %err, "checkpoint save failed, continuing in memory");
                } else {
                    warn!(err = %err, "failed to persist session state");
                }
            }

            if config.push_enabled {
                if let Err(err) = deps.git.push() {
                    warn!(err = %err, "push failed, continuing");
                }
            }
            notifier.notify(
                LifecycleEvent::IterationCompleted,
                &session,
                &format!(
                    "iteration {} complete ({})",
                    session.iteration,
                    record.review.as_str()
                ),
            );
        } else {
            session.consecutive_failures += 1;
            store.save_best_effort(&session);
            warn!(
                consecutive_failures = session.consecutive_failures,
                "iteration failed"
            );
            if session.consecutive_failures >= config.consecutive_failure_limit {
                break LoopStop::Failed {
                    consecutive_failures: session.consecutive_failures,
                };
            }
        }

        if outcome.interrupted || signals.interrupted() {
            break LoopStop::Interrupted;
        }
        if !signals.sleep(delay) {
            break LoopStop::Interrupted;
        }
    };

    session.status = match &stop {
        LoopStop::Complete | LoopStop::NoReadyWork => SessionStatus::Complete,
        LoopStop::Failed { .. } => SessionStatus::Failed,
        LoopStop::Interrupted => SessionStatus::Interrupted,
    };
    session.last_updated = now_rfc3339();
    store.save_best_effort(&session);

    let line = report::history_line(&session);
    if let Err(err) = append_history(&history_path(store), &line) {
        warn!(err = %err, "failed to append history");
    }
    notifier.notify(
        LifecycleEvent::SessionCompleted,
        &session,
        &format!("session {} {}", session.id, session.status.as_str()),
    );
    info!(stop = ?stop, iterations = session.iteration, "loop finished");
    Ok(LoopOutcome { stop, session })
}

/// `<state root>/history.log`, shared across sessions.
pub fn history_path(store: &SessionStore) -> PathBuf {
    store
        .root()
        .parent()
        .map(|p| p.join("history.log"))
        .unwrap_or_else(|| store.root().join("history.log"))
}

/// Block while the pause marker exists. Returns false on interrupt.
fn wait_while_paused(
    session_dir: &Path,
    store: &SessionStore,
    session: &mut Session,
    signals: &SignalState,
) -> bool {
    let marker = session_dir.join(PAUSE_FILE);
    let mut was_paused = false;
    while marker.exists() {
        if signals.interrupted() {
            return false;
        }
        if !was_paused {
            info!("pause marker present, waiting");
            was_paused = true;
            session.status = SessionStatus::Paused;
            session.last_updated = now_rfc3339();
            store.save_best_effort(session);
        }
        if !signals.sleep(PAUSE_POLL) {
            return false;
        }
    }
    if was_paused {
        info!("pause marker removed, resuming");
        session.status = SessionStatus::Running;
        session.last_updated = now_rfc3339();
        store.save_best_effort(session);
    }
    true
}

fn prompt_operator(iteration: u32, ready: &[IssueRef]) -> Confirm {
    eprintln!("next: iteration {iteration}, top of queue: {} ({})", ready[0].id, ready[0].title);
    eprint!("run it? [Y/n/s(kip)/q(uit)] ");
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return Confirm::Stop;
    }
    parse_confirm(&line)
}

fn run_iteration(
    config: &RunConfig,
    session_dir: &Path,
    iteration: u32,
    ready: &[IssueRef],
    deps: &LoopDeps<'_>,
    signals: &SignalState,
    policy: &RetryPolicy,
) -> Result<IterationOutcome> {
    let started_at = now_rfc3339();
    let start = Instant::now();
    let before = deps.git.snapshot().context("snapshot before iteration")?;
    let base_prompt = build_prompt(config, ready);

    let failed = |interrupted: bool, usage: UsageTotals, rounds: u32| IterationOutcome {
        succeeded: false,
        interrupted,
        usage,
        revision_rounds: rounds,
        review: ReviewOutcome::Skipped,
        tally: ReviewTally::default(),
        revision: None,
        started_at: started_at.clone(),
        ended_at: now_rfc3339(),
        duration_ms: start.elapsed().as_millis() as u64,
    };

    let first = run_with_retries(deps.agent, &base_prompt, session_dir, iteration, 1, policy, signals)?;
    let mut usage = first.usage;
    let mut attempt_cursor = first.attempts + 1;
    if !first.succeeded {
        return Ok(failed(first.interrupted, usage, 0));
    }

    let mut tally = ReviewTally::default();
    let mut rounds = 0u32;
    let review = if !config.review.enabled {
        ReviewOutcome::Disabled
    } else {
        let paths = IterationPaths::new(session_dir, iteration, 1);
        let mut last_snapshot = deps.git.snapshot().context("snapshot after agent")?;
        loop {
            let input = build_review_input(deps.git, &before, &last_snapshot, ready)?;
            let bar = report::spinner("reviewing changes");
            let result = deps.reviewer.review(&input);
            bar.finish_and_clear();
            let text = result?;
            append_review_text(&paths.review_path, rounds + 1, &text);

            match parse_verdict(&text) {
                ReviewAssessment::Ship => {
                    tally.passes += 1;
                    break ReviewOutcome::Shipped;
                }
                ReviewAssessment::ParseFailure => {
                    warn!(iteration, "review output had no verdict, skipping review");
                    tally.skipped += 1;
                    break ReviewOutcome::Skipped;
                }
                ReviewAssessment::Revise(feedback) => {
                    tally.revisions += 1;
                    if let Err(err) = std::fs::write(&paths.feedback_path, &feedback) {
                        warn!(err = %err, "failed to write feedback file");
                    }
                    if rounds >= config.review.max_revisions {
                        warn!(iteration, rounds, "revision budget exhausted");
                        break ReviewOutcome::MaxRevisions;
                    }
                    rounds += 1;
                    debug!(iteration, round = rounds, "re-running agent on feedback");
                    let prompt = revise_prompt(&base_prompt, &feedback);
                    let rerun = run_with_retries(
                        deps.agent,
                        &prompt,
                        session_dir,
                        iteration,
                        attempt_cursor,
                        policy,
                        signals,
                    )?;
                    usage.add(rerun.usage);
                    attempt_cursor += rerun.attempts;
                    if !rerun.succeeded {
                        return Ok(failed(rerun.interrupted, usage, rounds));
                    }
                    let snapshot = deps.git.snapshot().context("snapshot after revision")?;
                    if snapshot == last_snapshot {
                        warn!(iteration, round = rounds, "revision produced no changes");
                        tally.skipped += 1;
                        break ReviewOutcome::Skipped;
                    }
                    last_snapshot = snapshot;
                }
            }
        }
    };

    let head = deps.git.head_revision().context("head after iteration")?;
    Ok(IterationOutcome {
        succeeded: true,
        interrupted: false,
        usage,
        revision_rounds: rounds,
        review,
        tally,
        revision: Some(head),
        started_at,
        ended_at: now_rfc3339(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

fn build_review_input(
    git: &Git,
    before: &RevisionSnapshot,
    after: &RevisionSnapshot,
    ready: &[IssueRef],
) -> Result<ReviewInput> {
    let task_context = ready
        .iter()
        .map(|i| format!("{}: {}", i.id, i.title))
        .collect::<Vec<_>>()
        .join("\n");
    let (diff_stats, patch) = if after.head != before.head {
        (
            git.diff_stats(&before.head, &after.head)?,
            git.diff_patch(&before.head, &after.head)?,
        )
    } else if after.dirty {
        (DiffStats::default(), git.diff_worktree(&before.head)?)
    } else {
        (DiffStats::default(), String::new())
    };
    Ok(ReviewInput {
        task_context,
        diff_stats,
        patch,
    })
}

fn append_review_text(path: &Path, round: u32, text: &str) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "## round {round}\n\n{text}\n"));
    if let Err(err) = result {
        warn!(err = %err, "failed to write review file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_confirm_maps_answers() {
        assert_eq!(parse_confirm(""), Confirm::Continue);
        assert_eq!(parse_confirm("y\n"), Confirm::Continue);
        assert_eq!(parse_confirm("YES"), Confirm::Continue);
        assert_eq!(parse_confirm("s"), Confirm::Skip);
        assert_eq!(parse_confirm("q\n"), Confirm::Stop);
        assert_eq!(parse_confirm("no"), Confirm::Stop);
        assert_eq!(parse_confirm("banana"), Confirm::Continue);
    }

    #[test]
    fn build_prompt_varies_by_mode() {
        let issues = vec![IssueRef {
            id: "task-1".to_string(),
            title: "Add retries".to_string(),
        }];
        let mut config = RunConfig::default();
        let build = build_prompt(&config, &issues);
        assert!(build.contains("Implement it"));
        assert!(build.contains("- task-1: Add retries"));

        config.mode = Mode::Plan;
        let plan = build_prompt(&config, &issues);
        assert!(plan.contains("implementation plan"));
        assert!(plan.contains("Do NOT modify source files"));
    }

    #[test]
    fn revise_prompt_embeds_feedback() {
        let prompt = revise_prompt("base prompt", "fix the lock handling");
        assert!(prompt.starts_with("base prompt"));
        assert!(prompt.contains("## Review feedback\nfix the lock handling"));
    }

    #[test]
    fn history_path_sits_beside_sessions_root() {
        let store = SessionStore::new("/tmp/x/.foreman/sessions");
        assert_eq!(
            history_path(&store),
            PathBuf::from("/tmp/x/.foreman/history.log")
        );
    }
}
