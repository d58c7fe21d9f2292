//! Lifecycle notifications: desktop popups and an optional webhook.
//!
//! Both channels are strictly fire-and-forget; a broken notifier must never
//! stall or fail the loop.

use std::process::Command;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::io::session::Session;

/// Loop lifecycle points that produce notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    SessionStarted,
    IterationCompleted,
    SessionCompleted,
}

impl LifecycleEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleEvent::SessionStarted => "session_started",
            LifecycleEvent::IterationCompleted => "iteration_completed",
            LifecycleEvent::SessionCompleted => "session_completed",
        }
    }
}

/// Dispatches lifecycle events to the configured channels.
#[derive(Debug, Clone)]
pub struct Notifier {
    desktop_enabled: bool,
    sound: bool,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(desktop_enabled: bool, sound: bool, webhook_url: Option<String>) -> Self {
        Self {
            desktop_enabled,
            sound,
            webhook_url,
        }
    }

    /// Emit one event on every configured channel.
    pub fn notify(&self, event: LifecycleEvent, session: &Session, message: &str) {
        if self.desktop_enabled {
            self.desktop(message);
        }
        if let Some(url) = &self.webhook_url {
            post_webhook(url.clone(), event_payload(event, session, message));
        }
    }

    #[cfg(target_os = "macos")]
    fn desktop(&self, message: &str) {
        let sound = if self.sound {
            " sound name \"Glass\""
        } else {
            ""
        };
        let script = format!(
            "display notification {} with title \"foreman\"{sound}",
            applescript_quote(message)
        );
        spawn_silent(Command::new("osascript").args(["-e", &script]));
    }

    #[cfg(not(target_os = "macos"))]
    fn desktop(&self, message: &str) {
        let _ = self.sound;
        spawn_silent(Command::new("notify-send").args(["foreman", message]));
    }
}

#[cfg(target_os = "macos")]
fn applescript_quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

fn spawn_silent(cmd: &mut Command) {
    let result = cmd
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    match result {
        Ok(_) => debug!("desktop notification dispatched"),
        Err(err) => debug!(err = %err, "desktop notification unavailable"),
    }
}

/// Build the webhook payload for an event.
pub fn event_payload(event: LifecycleEvent, session: &Session, message: &str) -> Value {
    json!({
        "event": event.as_str(),
        "session_id": session.id,
        "status": session.status.as_str(),
        "iteration": session.iteration,
        "input_tokens": session.input_tokens,
        "output_tokens": session.output_tokens,
        "total_cost": session.total_cost,
        "message": message,
    })
}

/// POST the payload on a detached thread with a short timeout.
fn post_webhook(url: String, payload: Value) {
    std::thread::spawn(move || {
        let client = match reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                warn!(err = %err, "webhook client build failed");
                return;
            }
        };
        match client.post(&url).json(&payload).send() {
            Ok(response) if response.status().is_success() => {
                debug!(url = %url, "webhook delivered");
            }
            Ok(response) => {
                warn!(url = %url, status = %response.status(), "webhook rejected");
            }
            Err(err) => {
                warn!(url = %url, err = %err, "webhook delivery failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::session::{ReviewTally, SessionStatus};

    fn session() -> Session {
        Session {
            id: "20260102-030405-1".to_string(),
            start_time: "2026-01-02T03:04:05Z".to_string(),
            iteration: 3,
            consecutive_failures: 0,
            input_tokens: 100,
            output_tokens: 200,
            total_cost: 0.01,
            status: SessionStatus::Running,
            review: ReviewTally::default(),
            last_revision: None,
            last_updated: "2026-01-02T03:10:00Z".to_string(),
        }
    }

    #[test]
    fn payload_carries_session_summary() {
        let payload = event_payload(
            LifecycleEvent::IterationCompleted,
            &session(),
            "iteration 3 complete",
        );
        assert_eq!(payload["event"], "iteration_completed");
        assert_eq!(payload["session_id"], "20260102-030405-1");
        assert_eq!(payload["iteration"], 3);
        assert_eq!(payload["status"], "running");
        assert_eq!(payload["message"], "iteration 3 complete");
    }

    #[test]
    fn disabled_notifier_is_inert() {
        let notifier = Notifier::new(false, false, None);
        notifier.notify(LifecycleEvent::SessionStarted, &session(), "started");
    }
}
