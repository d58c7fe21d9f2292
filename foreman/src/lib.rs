//! Build-loop orchestrator for an LLM coding agent.
//!
//! Drives an external coding agent through an issue tracker's ready-work
//! queue: each iteration picks the top ready item, runs the agent, reviews
//! the resulting diff, and records metrics. The architecture enforces a
//! strict separation:
//!
//! - **[`io`]**: Side-effecting adapters (config, session state, git,
//!   subprocesses, tracker). Isolated to enable scripted fakes in tests.
//! - Orchestration modules ([`controller`], [`agent`], [`review`]) coordinate
//!   the adapters into the iteration loop.
//!
//! Pure helpers (verdict parsing, output classification, report rendering)
//! live in [`review`], [`classify`], and [`report`] and are testable without
//! spawning anything.

pub mod agent;
pub mod classify;
pub mod controller;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod notify;
pub mod report;
pub mod review;
pub mod signals;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
