use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggerConfig;

/// Initialize the global tracing subscriber from the logger config.
///
/// Returns the non-blocking writer guard; the orchestrator holds it until
/// shutdown so buffered lines are flushed on exit. A second call (tests,
/// embedded use) leaves the existing subscriber in place.
pub fn init(cfg: &LoggerConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    let (writer, guard, ansi) = match cfg.output.as_str() {
        "stdout" => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            (writer, guard, true)
        }
        "stderr" => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            (writer, guard, true)
        }
        path => {
            let path = Path::new(path);
            let dir = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            let prefix = path
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("octopus.log");
            let appender = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix(prefix)
                .max_log_files(cfg.retention_days.max(1))
                .build(dir)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (writer, guard, false)
        }
    };

    let registry = tracing_subscriber::registry().with(filter);
    let initialized = if cfg.format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_file(cfg.add_source)
                    .with_line_number(cfg.add_source),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_file(cfg.add_source)
                    .with_line_number(cfg.add_source),
            )
            .try_init()
    };

    match initialized {
        Ok(()) => Ok(Some(guard)),
        Err(_) => Ok(None),
    }
}
