//!
//! src/logging.rs  Andrew Belles  Oct 2nd, 2025
//!
//! Initializes logger. Logs go to stderr so that `search` and `show`
//! can print results on stdout
//!
//!

use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};
use tracing_error::ErrorLayer;
use tracing_appender::non_blocking;

use crate::config::{LogFormat, LoggingConfig};
use crate::errors::IngestError;

/// Flushes buffered log lines when dropped, keep alive for all of main
pub struct LoggingGuard(tracing_appender::non_blocking::WorkerGuard);

pub fn init_logging(cfg: &LoggingConfig) -> Result<LoggingGuard, IngestError> {
    let (writer, guard) = non_blocking(std::io::stderr());
    let filter = std::env::var("RUST_LOG")
        .ok()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new(cfg.filter_directives.clone()));

    let time = fmt::time::UtcTime::rfc_3339();
    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match cfg.format {
        LogFormat::Json => fmt::layer()
            .with_writer(writer)
            .with_timer(time)
            .with_target(cfg.include_target)
            .with_file(cfg.include_file_line)
            .with_line_number(cfg.include_file_line)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_timer(time)
            .with_ansi(cfg.with_ansi)
            .with_target(cfg.include_target)
            .with_file(cfg.include_file_line)
            .with_line_number(cfg.include_file_line)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .with(ErrorLayer::default())
        .try_init()
        .map_err(|e| IngestError::Config(format!("logger already set: {e}")))?;

    Ok( LoggingGuard(guard) )
}
