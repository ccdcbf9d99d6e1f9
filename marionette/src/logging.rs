use crate::config::LogConfig;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT_LOG: Once = Once::new();

/// Install the global subscriber once. `RUST_LOG` wins over the configured
/// level; thread names are on since ranks of the in-process backend are threads.
pub fn initialize(config: &LogConfig) {
    INIT_LOG.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

        // a subscriber installed by the embedding program takes precedence
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
