use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use toolflow_core::config::DebugConfig;

/// `RUST_LOG` wins; otherwise the `[debug]` section's level and targets.
/// Logs go to stderr so stdout stays machine-readable.
pub(crate) fn initialize_tracing(debug: &DebugConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(debug.filter_directives()));

    let init_result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::CLOSE)
        .try_init();

    if let Err(err) = init_result {
        eprintln!("warning: tracing already initialized: {err}");
    }
}
