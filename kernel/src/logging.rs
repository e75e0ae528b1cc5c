//! Diagnostic tracing for kernel developers.
//!
//! Tracing goes to stderr only and is filtered by `RUST_LOG`. It is separate
//! from the run record: `run_state.json`, per-attempt logs and envelopes under
//! the run root are written regardless of the filter.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_DIRECTIVE: &str = "warn";

/// Installs the global subscriber. `RUST_LOG` wins; otherwise `warn`.
///
/// ```bash
/// RUST_LOG=kernel=debug kernel run --graph graph.json --run-root runs/r1
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let stderr_layer = fmt::layer().compact().with_writer(std::io::stderr);
    // Ignored when a subscriber is already installed (tests, embedding).
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .try_init();
}
