//! Stable exit codes for foreman CLI commands.

/// Run completed cleanly (including auto-stop on an empty ready queue).
pub const OK: i32 = 0;
/// Invalid configuration, missing session, or fatal review/tooling error.
pub const INVALID: i32 = 1;
/// The run aborted after reaching the consecutive-failure limit.
pub const FAILED: i32 = 2;
/// The run was interrupted by the operator.
pub const INTERRUPTED: i32 = 130;
