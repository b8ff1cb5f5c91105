//! Structured logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over configuration file
//! settings.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the logging subsystem. Call once, from a binary.
///
/// Logs go to stderr so response bodies can be written to stdout.
pub fn init(config: &LoggingConfig) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    let registry = tracing_subscriber::registry().with(filter);
    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_thread_names(true),
            )
            .init(),
        (LogFormat::Pretty, false) => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_thread_names(true)
                    .without_time(),
            )
            .init(),
        (LogFormat::Compact, true) => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .compact()
                    .with_thread_names(true),
            )
            .init(),
        (LogFormat::Compact, false) => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .compact()
                    .with_thread_names(true)
                    .without_time(),
            )
            .init(),
        (LogFormat::Json, true) => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .with_thread_names(true),
            )
            .init(),
        (LogFormat::Json, false) => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .with_thread_names(true)
                    .without_time(),
            )
            .init(),
    }
}
