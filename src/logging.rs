use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. Filtering follows `RUST_LOG`,
/// defaulting to `info`. Safe to call more than once; later calls are no-ops,
/// which keeps test binaries happy.
pub fn init() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.with_target(false)
		.try_init();
}
