use crate::settings;
use anyhow::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Logs go to stderr, so results printed to stdout stay parseable.
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(settings: &settings::Logging) -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&settings.level))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(settings.ansi)
        .try_init()
        .map_err(Error::msg)?;

    debug!(level = %settings.level, "logging initialized");
    Ok(())
}

#[cfg(test)]
pub fn init_for_tests() {
    use std::sync::Once;

    static INIT: Once = Once::new();

    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("lookup_pipeline=debug"))
            .with_test_writer()
            .init();
    });
}
