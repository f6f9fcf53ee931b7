//! Logging setup.
//!
//! All output goes through `tracing` and is written to **stderr**, leaving
//! stdout to whatever renders plans.
//!
//! # Environment Variables
//!
//! - `LINODE_PROVIDER_LOG`: log filter for this crate's consumers
//!   (e.g. `debug`, `linode_provider_core=debug`)
//! - `RUST_LOG`: used when `LINODE_PROVIDER_LOG` is unset
//!
//! # Examples
//!
//! ```bash
//! # Show lifecycle transitions and remote calls
//! LINODE_PROVIDER_LOG=linode_provider_core=debug my-tool apply
//!
//! # Only warnings and errors
//! RUST_LOG=warn my-tool plan
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Preferred filter variable.
pub const LOG_ENV: &str = "LINODE_PROVIDER_LOG";

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn stderr_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
}

/// Initialize the default logging subscriber at `info`.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    init_logging_with_default("info");
}

/// Initialize logging, using `default_level` when neither
/// `LINODE_PROVIDER_LOG` nor `RUST_LOG` is set.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging_with_default(default_level: &str) {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(stderr_layer())
        .init();
}

/// Try to initialize logging, returning `false` if a subscriber is already
/// set.
pub fn try_init_logging() -> bool {
    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(stderr_layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    // The global subscriber can only be set once per process, so only
    // filter parsing is tested here.

    use super::*;

    #[test]
    fn test_env_filter_parsing() {
        assert!(EnvFilter::try_new("info").is_ok());
        assert!(EnvFilter::try_new("linode_provider_core=debug").is_ok());
        assert!(EnvFilter::try_new("warn,linode_provider_core::executor=debug").is_ok());
    }

    #[test]
    fn test_try_init_twice() {
        let first = try_init_logging();
        assert!(!try_init_logging() || !first);
    }
}
