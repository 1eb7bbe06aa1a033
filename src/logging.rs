use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes console + rolling JSON file logging for one pipeline process.
///
/// Each process (`serve`, `worker`, ...) writes to its own `logs/<service>.log`
/// so the ingestion edge and the sink workers can be tailed separately. The
/// returned guard flushes the file writer when dropped; hold it for the life
/// of the process.
pub fn init_logging(service: &str) -> WorkerGuard {
    // Ensure logs directory exists
    let _ = fs::create_dir_all("logs");

    let file_appender = tracing_appender::rolling::daily("logs", format!("{service}.log"));
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);

    let console_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stdout);

    // Respect RUST_LOG if set; otherwise info for our crate
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("leaderboard_pipeline=info,warn"));

    // try_init so tests and repeated calls do not panic on an installed subscriber
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    guard
}
