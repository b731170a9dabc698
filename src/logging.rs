//! Structured logging bootstrap shared by all three binaries. Every
//! component logs through `tracing` spans/events; the upstream prototype's
//! scattered `println!`/`eprintln!` calls are promoted to leveled, filterable
//! output here.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::CommonConfig;

/// Initializes the global tracing subscriber per `CommonConfig::log_level`
/// and `CommonConfig::log_output`. When logging to a file, the returned
/// `WorkerGuard` must be kept alive for the lifetime of the process (it
/// flushes the non-blocking writer on drop).
pub fn init(component: &str, config: &CommonConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_output == "stdout" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
        None
    } else {
        let file_appender = tracing_appender::rolling::daily(&config.log_output, component);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .with_ansi(false)
            .init();
        Some(guard)
    }
}
