//! Logging setup. Output goes to stderr so report tables on stdout stay
//! machine-readable.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Directive applying `level` to this crate and `warn` to everything else.
fn directive(level: &str) -> String {
    format!("warn,cluster_backup={}", level.trim().to_ascii_lowercase())
}

/// Build the filter: `RUST_LOG` wins, then the configured level.
pub fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive(level)))
        .unwrap_or_else(|_| EnvFilter::new(directive("info")))
}

pub fn init(level: &str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(filter_for(level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()?;

    Ok(())
}
