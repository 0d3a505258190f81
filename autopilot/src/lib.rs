//! Dependency-aware batch orchestration of external coding agents.
//!
//! A batch of issues is ordered by dependency and difficulty, then driven one
//! at a time through a configurable pipeline of agent stages. The crate keeps
//! a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (queue ordering, dependency
//!   gating, error classification, backoff, pool keys). No I/O.
//! - **[`io`]**: Side-effecting adapters (process execution, git, config,
//!   persisted loop state, issue loading, notifications, event log).
//! - **[`agent`]**: Worker transports behind one handle trait, the
//!   retry/fallback decorator and the per-run pool.
//!
//! [`pipeline`] runs schema-validated units in order for one issue and
//! [`scheduler`] drives the whole batch.

pub mod agent;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
