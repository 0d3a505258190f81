//! Operator diagnostics on stderr.
//!
//! Tracing output is filtered by `RUST_LOG` and goes nowhere but stderr. The
//! record of what a batch did lives in the per-run event log
//! (`.autopilot/runs/<run-id>/events.jsonl`, see [`crate::io::event_log`]),
//! which is written regardless of the filter. Worker output for each stage is
//! teed to `<stage>.stream` files beside it.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset or unparsable.
const DEFAULT_FILTER: &str = "warn";

/// Install the stderr subscriber. Later calls keep the first subscriber.
///
/// ```bash
/// RUST_LOG=autopilot::scheduler=debug autopilot run --issues issues.json
/// ```
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(filter_from_env())
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
