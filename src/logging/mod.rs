//! Logging setup for the relay
//!
//! Coloured console output with optional daily-rolling file output.

use std::path::Path;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default log file when file output is enabled without a path
const DEFAULT_LOG_FILE: &str = "logs/tcp-relay.log";

/// ANSI color codes for log levels
#[derive(Debug, Clone)]
struct LogTheme {
    trace: &'static str,
    debug: &'static str,
    info: &'static str,
    warn: &'static str,
    error: &'static str,
}

impl Default for LogTheme {
    fn default() -> Self {
        Self {
            trace: "\x1b[37m", // White
            debug: "\x1b[36m", // Cyan
            info: "\x1b[32m",  // Green
            warn: "\x1b[33m",  // Yellow
            error: "\x1b[31m", // Red
        }
    }
}

/// Initialize logging with the given configuration
///
/// `RUST_LOG` directives are honoured on top of `log_level`.
pub fn init_logging(
    log_level: &str,
    log_to_file: bool,
    log_file_path: Option<&str>,
) -> anyhow::Result<()> {
    let level = parse_log_level(log_level)?;

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .event_format(LogFormatter {
            theme: Some(LogTheme::default()),
        });

    let file_layer = if log_to_file {
        let path = Path::new(log_file_path.unwrap_or(DEFAULT_LOG_FILE));
        let directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("Log file path has no file name: {}", path.display()))?;
        let file_appender = RollingFileAppender::new(Rotation::DAILY, directory, file_name);
        Some(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .event_format(LogFormatter { theme: None }),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}

/// Log formatter with optional level colours
struct LogFormatter {
    theme: Option<LogTheme>,
}

impl<S, N> fmt::FormatEvent<S, N> for LogFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();

        let now = std::time::SystemTime::now();
        let datetime: chrono::DateTime<chrono::Utc> = now.into();
        write!(writer, "[{}] ", datetime.format("%Y-%m-%d %H:%M:%S%.3f UTC"))?;

        match &self.theme {
            Some(theme) => {
                let level_color = match *metadata.level() {
                    Level::TRACE => theme.trace,
                    Level::DEBUG => theme.debug,
                    Level::INFO => theme.info,
                    Level::WARN => theme.warn,
                    Level::ERROR => theme.error,
                };
                write!(writer, "{}{:<5}\x1b[0m ", level_color, metadata.level())?;
            }
            None => write!(writer, "{:<5} ", metadata.level())?,
        }

        write!(writer, "{}: ", metadata.target())?;

        // Connection spans, outermost first
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<fmt::FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}}", fields)?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_uppercase().as_str() {
        "TRACE" => Ok(Level::TRACE),
        "DEBUG" => Ok(Level::DEBUG),
        "INFO" => Ok(Level::INFO),
        "WARN" => Ok(Level::WARN),
        "ERROR" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {}", level)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level_is_case_insensitive() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
    }

    #[test]
    fn test_parse_log_level_rejects_unknown() {
        let err = parse_log_level("verbose").unwrap_err();
        assert!(err.to_string().contains("verbose"));
    }
}
