//! Interrupt handling.
//!
//! The first Ctrl-C requests a graceful stop at the next safe point; the
//! second exits immediately. Long waits poll the flag in short slices so an
//! interrupt cuts a pause short instead of sleeping through it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::exit_codes;

const POLL_SLICE: Duration = Duration::from_millis(200);

/// Shared interrupt flag, cloneable across threads.
#[derive(Debug, Clone, Default)]
pub struct SignalState {
    interrupted: Arc<AtomicBool>,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the Ctrl-C handler. Call once per process.
    pub fn install(&self) -> Result<()> {
        let flag = Arc::clone(&self.interrupted);
        ctrlc::set_handler(move || {
            if flag.swap(true, Ordering::SeqCst) {
                eprintln!("second interrupt, exiting now");
                std::process::exit(exit_codes::INTERRUPTED);
            }
            eprintln!("interrupt received, stopping after the current step (Ctrl-C again to force)");
        })
        .context("install interrupt handler")
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Set the flag directly, for tests.
    pub fn trigger(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Sleep for `duration`, waking early on interrupt.
    ///
    /// Returns `false` when the sleep was cut short.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.interrupted() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }
}
