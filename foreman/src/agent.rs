//! Coding-agent invocation: streaming, usage accounting, and retries.
//!
//! The agent is an external CLI emitting line-delimited JSON events. Every
//! raw line lands in the iteration's stream file as it arrives, assistant
//! text is echoed to the operator, and usage fields are summed tolerantly
//! from whatever events carry them.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::classify;
use crate::io::config::RunConfig;
use crate::io::metrics::IterationPaths;
use crate::io::process::{LineSink, run_streaming};
use crate::signals::SignalState;

/// Token totals accumulated across events, attempts, and revise rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageTotals {
    pub fn add(&mut self, other: UsageTotals) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    /// Derived cost in USD from the configured per-million-token rates.
    pub fn cost(&self, config: &RunConfig) -> f64 {
        let input = self.input_tokens as f64 * config.input_cost_per_mtok / 1_000_000.0;
        let output = self.output_tokens as f64 * config.output_cost_per_mtok / 1_000_000.0;
        input + output
    }
}

/// Result of a single agent invocation.
#[derive(Debug, Clone, Copy)]
pub struct AgentRun {
    pub usage: UsageTotals,
    pub succeeded: bool,
}

/// Runs the coding agent once, writing artifacts for the given attempt.
pub trait AgentRunner {
    fn run(&self, prompt: &str, paths: &IterationPaths) -> Result<AgentRun>;
}

/// Agent invocation via an external CLI in stream-json mode.
#[derive(Debug, Clone)]
pub struct CliAgentRunner {
    command: Vec<String>,
    model: String,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CliAgentRunner {
    pub fn new(config: &RunConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: config.agent.command.clone(),
            model: config.model.clone(),
            workdir: workdir.into(),
            timeout: Duration::from_secs(config.agent_timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

impl AgentRunner for CliAgentRunner {
    #[instrument(skip_all, fields(model = %self.model))]
    fn run(&self, prompt: &str, paths: &IterationPaths) -> Result<AgentRun> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        cmd.args(["--model", &self.model]);
        cmd.current_dir(&self.workdir);

        let sink = EventSink::open(paths)?;
        let (output, mut sink) = run_streaming(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
            sink,
        )
        .context("run coding agent")?;

        sink.append_stderr(&output.stderr)?;
        let usage = sink.finish(paths)?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "agent timed out");
        }
        let succeeded = output.status.success() && !output.timed_out;
        debug!(
            succeeded,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "agent run finished"
        );
        Ok(AgentRun { usage, succeeded })
    }
}

/// Line sink for the agent's stdout stream.
///
/// Raw lines go to the stream file (flushed per line so a crash leaves a
/// usable transcript), assistant text is echoed to the operator, and
/// anything that is not JSON lands in the verbose log.
struct EventSink {
    stream: File,
    log: File,
    usage: UsageTotals,
}

impl EventSink {
    fn open(paths: &IterationPaths) -> Result<Self> {
        Ok(Self {
            stream: create_file(&paths.stream_path)?,
            log: create_file(&paths.log_path)?,
            usage: UsageTotals::default(),
        })
    }

    fn append_stderr(&mut self, stderr: &str) -> Result<()> {
        if stderr.is_empty() {
            return Ok(());
        }
        writeln!(self.log, "--- stderr ---").context("write agent log")?;
        self.log
            .write_all(stderr.as_bytes())
            .context("write agent log")?;
        Ok(())
    }

    fn finish(self, paths: &IterationPaths) -> Result<UsageTotals> {
        let doc = serde_json::to_string_pretty(&self.usage).context("serialize usage")?;
        std::fs::write(&paths.usage_path, format!("{doc}\n"))
            .with_context(|| format!("write usage file {}", paths.usage_path.display()))?;
        Ok(self.usage)
    }
}

impl LineSink for EventSink {
    fn line(&mut self, line: &str) {
        // Best effort: a full disk should not kill the run mid-stream.
        if writeln!(self.stream, "{line}").and_then(|()| self.stream.flush()).is_err() {
            warn!("failed to append agent stream file");
        }
        match serde_json::from_str::<Value>(line) {
            Ok(event) => {
                if let Some(delta) = extract_usage(&event) {
                    self.usage.add(delta);
                }
                for text in extract_text(&event) {
                    println!("{text}");
                }
            }
            Err(_) => {
                if writeln!(self.log, "{line}").is_err() {
                    warn!("failed to append agent log file");
                }
            }
        }
    }
}

fn create_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("create {}", path.display()))
}

/// Pull a usage delta out of an event, wherever the provider put it.
///
/// Cache-related input counters are folded into input tokens.
pub fn extract_usage(event: &Value) -> Option<UsageTotals> {
    let usage = event
        .get("usage")
        .or_else(|| event.get("message").and_then(|m| m.get("usage")))?;
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
    let totals = UsageTotals {
        input_tokens: field("input_tokens")
            + field("cache_creation_input_tokens")
            + field("cache_read_input_tokens"),
        output_tokens: field("output_tokens"),
    };
    if totals == UsageTotals::default() {
        None
    } else {
        Some(totals)
    }
}

/// Assistant-visible text carried by an event.
pub fn extract_text(event: &Value) -> Vec<String> {
    let mut texts = Vec::new();
    if let Some(result) = event.get("result").and_then(Value::as_str) {
        texts.push(result.to_string());
    }
    let content = event
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| event.get("content"));
    if let Some(items) = content.and_then(Value::as_array) {
        for item in items {
            if let Some(text) = item.get("text").and_then(Value::as_str) {
                texts.push(text.to_string());
            }
        }
    }
    texts
}

/// Retry policy for failed agent invocations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub rate_limit_pause: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            rate_limit_pause: Duration::from_secs(config.rate_limit_pause_secs),
        }
    }
}

/// Outcome of an invocation after retries.
#[derive(Debug, Clone, Copy)]
pub struct AgentOutcome {
    /// Usage summed across every attempt, failed ones included.
    pub usage: UsageTotals,
    pub attempts: u32,
    pub succeeded: bool,
    pub interrupted: bool,
}

/// Wait before the next retry, based on what the failed attempt logged.
pub fn next_wait(log_text: &str, policy: &RetryPolicy) -> Duration {
    if classify::is_rate_limited(log_text) {
        policy.rate_limit_pause
    } else {
        policy.retry_delay
    }
}

/// Invoke the agent, retrying on failure up to the policy's budget.
///
/// Attempt numbering starts at `first_attempt` so revise rounds keep their
/// artifact files distinct from the initial round's.
#[instrument(skip_all, fields(iteration, first_attempt))]
pub fn run_with_retries(
    runner: &dyn AgentRunner,
    prompt: &str,
    session_dir: &Path,
    iteration: u32,
    first_attempt: u32,
    policy: &RetryPolicy,
    signals: &SignalState,
) -> Result<AgentOutcome> {
    let mut usage = UsageTotals::default();
    let mut attempts = 0u32;
    loop {
        let attempt = first_attempt + attempts;
        attempts += 1;
        let paths = IterationPaths::new(session_dir, iteration, attempt);
        let run = runner.run(prompt, &paths)?;
        usage.add(run.usage);
        if run.succeeded {
            return Ok(AgentOutcome {
                usage,
                attempts,
                succeeded: true,
                interrupted: false,
            });
        }
        if attempts > policy.max_retries {
            warn!(attempts, "agent attempts exhausted");
            return Ok(AgentOutcome {
                usage,
                attempts,
                succeeded: false,
                interrupted: false,
            });
        }
        let log_text = std::fs::read_to_string(&paths.log_path).unwrap_or_default();
        let wait = next_wait(&log_text, policy);
        warn!(
            attempt,
            wait_secs = wait.as_secs(),
            rate_limited = wait == policy.rate_limit_pause,
            "agent attempt failed, retrying"
        );
        if !signals.sleep(wait) {
            return Ok(AgentOutcome {
                usage,
                attempts,
                succeeded: false,
                interrupted: true,
            });
        }
    }
}
