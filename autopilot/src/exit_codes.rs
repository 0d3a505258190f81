//! Stable exit codes for autopilot CLI commands.

/// Command succeeded; for `run`, every issue completed.
pub const OK: i32 = 0;
/// Command failed due to invalid layout/config/input or other errors.
pub const INVALID: i32 = 1;
/// `autopilot run` finished, but some issues failed, were skipped or stayed deferred.
pub const FAILURES: i32 = 2;
/// `autopilot run` was cancelled before the batch finished.
pub const CANCELLED: i32 = 3;
