//! Side-effecting adapters: filesystem state, git, subprocesses, tracker.

pub mod config;
pub mod git;
pub mod issues;
pub mod metrics;
pub mod process;
pub mod session;
