//! Human-facing rendering: progress spinner, status lines, and the session
//! report.

use indicatif::{ProgressBar, ProgressStyle};

use crate::agent::UsageTotals;
use crate::io::metrics::IterationRecord;
use crate::io::session::Session;

/// Spinner shown while a subprocess is running.
///
/// Safe to keep ticking across subprocesses whose output is fully captured
/// (the reviewer); callers must `finish_and_clear` before spawning anything
/// that inherits or writes to the terminal (the streaming agent).
pub fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}").expect("valid spinner template"),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(std::time::Duration::from_millis(120));
    bar
}

/// One-line summary used for `status` and the global history log.
pub fn history_line(session: &Session) -> String {
    format!(
        "{} {} iterations={} tokens={} cost=${:.4} review={}p/{}r/{}s",
        session.id,
        session.status.as_str(),
        session.iteration,
        session.total_tokens(),
        session.total_cost,
        session.review.passes,
        session.review.revisions,
        session.review.skipped,
    )
}

/// Current-session status block for the `status` subcommand.
pub fn render_status(session: &Session) -> String {
    let mut out = String::new();
    out.push_str(&format!("session:    {}\n", session.id));
    out.push_str(&format!("status:     {}\n", session.status.as_str()));
    out.push_str(&format!("started:    {}\n", session.start_time));
    out.push_str(&format!("updated:    {}\n", session.last_updated));
    out.push_str(&format!("iterations: {}\n", session.iteration));
    out.push_str(&format!(
        "tokens:     {} in / {} out\n",
        session.input_tokens, session.output_tokens
    ));
    out.push_str(&format!("cost:       ${:.4}\n", session.total_cost));
    out.push_str(&format!(
        "review:     {} shipped, {} revisions, {} skipped\n",
        session.review.passes, session.review.revisions, session.review.skipped
    ));
    if let Some(rev) = &session.last_revision {
        out.push_str(&format!("revision:   {rev}\n"));
    }
    if session.consecutive_failures > 0 {
        out.push_str(&format!(
            "failures:   {} consecutive\n",
            session.consecutive_failures
        ));
    }
    out
}

/// Full markdown report for a session.
pub fn render_report(session: &Session, records: &[IterationRecord]) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Session {}\n\n", session.id));
    out.push_str(&format!(
        "- status: {}\n- started: {}\n- iterations: {}\n",
        session.status.as_str(),
        session.start_time,
        session.iteration
    ));
    let totals = UsageTotals {
        input_tokens: session.input_tokens,
        output_tokens: session.output_tokens,
    };
    out.push_str(&format!(
        "- tokens: {} in / {} out ({} total)\n",
        totals.input_tokens,
        totals.output_tokens,
        totals.input_tokens + totals.output_tokens
    ));
    out.push_str(&format!("- cost: ${:.4}\n", session.total_cost));
    out.push_str(&format!(
        "- review: {} shipped, {} revisions, {} skipped\n",
        session.review.passes, session.review.revisions, session.review.skipped
    ));

    if records.is_empty() {
        out.push_str("\nNo completed iterations.\n");
        return out;
    }

    out.push_str("\n| # | duration | tokens (in/out) | cost | rounds | review | revision |\n");
    out.push_str("|---|----------|-----------------|------|--------|--------|----------|\n");
    for record in records {
        out.push_str(&format!(
            "| {} | {} | {}/{} | ${:.4} | {} | {} | {} |\n",
            record.iteration,
            format_duration_ms(record.duration_ms),
            record.input_tokens,
            record.output_tokens,
            record.cost,
            record.revision_rounds,
            record.review.as_str(),
            record.revision.as_deref().unwrap_or("-"),
        ));
    }
    out
}

fn format_duration_ms(ms: u64) -> String {
    let secs = ms / 1000;
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
