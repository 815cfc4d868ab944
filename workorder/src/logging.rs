//! Development-time tracing for debugging the engine.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of the engine's product output.
//!
//! - **Run artifacts (`io/artifacts`)**: Summaries and per-attempt logs under
//!   the configured artifacts dir. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset; `verbose` raises
/// the default to `workorder=info`.
///
/// # Example
/// ```bash
/// RUST_LOG=workorder=debug workorder run orders/*.json
/// ```
pub fn init(verbose: bool) {
    let default = if verbose { "warn,workorder=info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
