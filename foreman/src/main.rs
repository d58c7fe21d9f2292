//! CLI entry point.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use foreman::controller::{LoopDeps, LoopStop, run_loop};
use foreman::io::config::{Mode, Overrides, RunConfig, load_config};
use foreman::io::git::Git;
use foreman::io::issues::{IssueSource, TrackerCli};
use foreman::io::metrics::MetricsLog;
use foreman::io::session::{Session, SessionStore};
use foreman::notify::Notifier;
use foreman::review::ReviewFatalError;
use foreman::signals::SignalState;
use foreman::{agent, exit_codes, logging, report, review};

#[derive(Parser)]
#[command(name = "foreman", version, about = "Agent build-loop orchestrator")]
struct Cli {
    /// Enable debug logging to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new session against the current repository.
    Run {
        /// Operating mode (defaults to the configured mode).
        #[arg(value_enum)]
        mode: Option<Mode>,

        #[command(flatten)]
        overrides: RunArgs,
    },
    /// Resume a previous session (latest by default).
    Resume {
        /// Session id; defaults to the most recently saved session.
        session_id: Option<String>,

        #[command(flatten)]
        overrides: RunArgs,
    },
    /// List sessions, newest first.
    List,
    /// Render the report for a session (latest by default).
    Report { session_id: Option<String> },
    /// Show the latest session's state and in-progress tracker items.
    Status,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Path to the config file (default: .foreman/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stop after N iterations (0 = unbounded).
    #[arg(short = 'n', long)]
    max_iterations: Option<u32>,

    /// Model for the coding agent.
    #[arg(long)]
    model: Option<String>,

    /// Seconds to wait between iterations.
    #[arg(long)]
    delay: Option<u64>,

    /// Confirm before each iteration.
    #[arg(long)]
    interactive: bool,

    /// Push after each successful iteration.
    #[arg(long, conflicts_with = "no_push")]
    push: bool,
    #[arg(long, hide = true)]
    no_push: bool,

    /// Desktop notifications at lifecycle points.
    #[arg(long, conflicts_with = "no_notify")]
    notify: bool,
    #[arg(long, hide = true)]
    no_notify: bool,

    /// Play a sound with desktop notifications.
    #[arg(long)]
    sound: bool,

    /// Run the review pass (on by default).
    #[arg(long, conflicts_with = "no_review")]
    review: bool,
    #[arg(long, hide = true)]
    no_review: bool,

    /// Model for the review agent.
    #[arg(long)]
    review_model: Option<String>,

    /// Agent re-invocations allowed per iteration on REVISE.
    #[arg(long)]
    max_revisions: Option<u32>,

    /// POST lifecycle events to this URL.
    #[arg(long)]
    webhook_url: Option<String>,

    /// Restrict ready work to children of this epic.
    #[arg(long)]
    epic: Option<String>,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        fn toggle(on: bool, off: bool) -> Option<bool> {
            match (on, off) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            }
        }
        Overrides {
            mode: None,
            max_iterations: self.max_iterations,
            model: self.model.clone(),
            iteration_delay_secs: self.delay,
            interactive: if self.interactive { Some(true) } else { None },
            push_enabled: toggle(self.push, self.no_push),
            notifications_enabled: toggle(self.notify, self.no_notify),
            notifications_sound: if self.sound { Some(true) } else { None },
            webhook_url: self.webhook_url.clone(),
            review_enabled: toggle(self.review, self.no_review),
            review_model: self.review_model.clone(),
            review_max_revisions: self.max_revisions,
            epic: self.epic.clone(),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            if err.downcast_ref::<ReviewFatalError>().is_some() {
                eprintln!("fatal: {err:#}");
            } else {
                eprintln!("{err:#}");
            }
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let workdir = std::env::current_dir().context("resolve working directory")?;
    let state_dir = workdir.join(".foreman");
    let store = SessionStore::new(state_dir.join("sessions"));

    match cli.command {
        Command::Run { mode, overrides } => {
            let mut config = load(&state_dir, &overrides)?;
            if let Some(mode) = mode {
                config.mode = mode;
            }
            let session = store.create()?;
            drive(&workdir, &config, &store, session)
        }
        Command::Resume {
            session_id,
            overrides,
        } => {
            let config = load(&state_dir, &overrides)?;
            let session = match session_id {
                Some(id) => store.load(&id)?,
                None => store.load_latest().context("no session to resume")?,
            };
            drive(&workdir, &config, &store, session)
        }
        Command::List => {
            for id in store.list()? {
                match store.load(&id) {
                    Ok(session) => println!("{}", report::history_line(&session)),
                    Err(_) => println!("{id} (unreadable)"),
                }
            }
            Ok(exit_codes::OK)
        }
        Command::Report { session_id } => {
            let session = match session_id {
                Some(id) => store.load(&id)?,
                None => store.load_latest().context("no sessions recorded")?,
            };
            let records = MetricsLog::new(&store.session_dir(&session.id)).read_all()?;
            print!("{}", report::render_report(&session, &records));
            Ok(exit_codes::OK)
        }
        Command::Status => {
            let session = store.load_latest().context("no sessions recorded")?;
            print!("{}", report::render_status(&session));
            let config = load_config(&state_dir.join("config.toml"))?;
            let tracker = TrackerCli::new(config.tracker.command.clone(), &workdir);
            match tracker.in_progress() {
                Ok(items) if !items.is_empty() => {
                    println!("in progress:");
                    for item in items {
                        println!("  {}: {}", item.id, item.title);
                    }
                }
                Ok(_) => {}
                Err(err) => eprintln!("tracker unavailable: {err:#}"),
            }
            Ok(exit_codes::OK)
        }
    }
}

fn load(state_dir: &std::path::Path, args: &RunArgs) -> Result<RunConfig> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| state_dir.join("config.toml"));
    let mut config = load_config(&path)?;
    config.apply(&args.overrides());
    config.validate()?;
    Ok(config)
}

fn drive(
    workdir: &std::path::Path,
    config: &RunConfig,
    store: &SessionStore,
    session: Session,
) -> Result<i32> {
    let signals = SignalState::new();
    signals.install()?;

    let git = Git::new(workdir);
    let agent_runner = agent::CliAgentRunner::new(config, workdir);
    let reviewer = review::CliReviewer::new(config, workdir);
    let tracker = TrackerCli::new(config.tracker.command.clone(), workdir);
    let deps = LoopDeps {
        agent: &agent_runner,
        reviewer: &reviewer,
        issues: &tracker,
        git: &git,
    };
    let notifier = Notifier::new(
        config.notifications.enabled,
        config.notifications.sound,
        config.webhook_url.clone(),
    );

    let outcome = run_loop(config, store, session, &deps, &signals, &notifier)?;
    eprintln!("{}", report::history_line(&outcome.session));
    Ok(match outcome.stop {
        LoopStop::Complete | LoopStop::NoReadyWork => exit_codes::OK,
        LoopStop::Failed { .. } => exit_codes::FAILED,
        LoopStop::Interrupted => exit_codes::INTERRUPTED,
    })
}
