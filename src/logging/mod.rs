/*!
 * Logging Module
 * Subscriber setup: console plus daily rolling files
 */
pub mod middleware;

use std::io;
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Writer guards; buffered lines are flushed when these drop.
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

/// Log level used when `LOG_LEVEL` is unset.
pub fn default_level(is_production: bool) -> &'static str {
    if is_production {
        "info"
    } else {
        "debug"
    }
}

/// Filter directive for this crate and the HTTP stack.
pub fn filter_directive(level: &str) -> String {
    format!("roomy_backend={},tower_http=debug,axum=debug", level)
}

/// Initialize the logging system. Keep the returned guards alive for the
/// lifetime of the program.
pub fn init() -> LogGuards {
    let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
    let is_production = environment == "production";

    std::fs::create_dir_all("logs").ok();

    let (file_writer, file_guard) = non_blocking(rolling::daily("logs", "app.log"));
    let (error_writer, error_guard) = non_blocking(rolling::daily("logs", "error.log"));
    let (console_writer, console_guard) = non_blocking(io::stdout());

    let log_level = std::env::var("LOG_LEVEL")
        .unwrap_or_else(|_| default_level(is_production).to_string());

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(&log_level)));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if is_production {
        let file_layer = fmt::layer()
            .json()
            .with_writer(file_writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);

        let error_layer = fmt::layer()
            .json()
            .with_writer(error_writer)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(tracing_subscriber::filter::LevelFilter::ERROR);

        let console_layer = fmt::layer()
            .json()
            .with_writer(console_writer)
            .with_target(false);

        subscriber
            .with(file_layer)
            .with(error_layer)
            .with(console_layer)
            .init();
    } else {
        let file_layer = fmt::layer()
            .with_writer(file_writer)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false);

        // Errors always get their own file, JSON in every environment.
        let error_layer = fmt::layer()
            .json()
            .with_writer(error_writer)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(tracing_subscriber::filter::LevelFilter::ERROR);

        let console_layer = fmt::layer()
            .with_writer(console_writer)
            .with_target(true)
            .pretty();

        subscriber
            .with(file_layer)
            .with(error_layer)
            .with(console_layer)
            .init();
    }

    tracing::info!(level = %log_level, "Logging initialized for {} environment", environment);

    LogGuards {
        _guards: vec![file_guard, error_guard, console_guard],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_level_by_environment() {
        assert_eq!(default_level(true), "info");
        assert_eq!(default_level(false), "debug");
    }

    #[test]
    fn test_filter_directive_targets_crate() {
        let directive = filter_directive("warn");
        assert!(directive.starts_with("roomy_backend=warn"));
        assert!(EnvFilter::try_new(&directive).is_ok());
    }
}
