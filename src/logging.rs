//! Logging initialization and configuration.

use anyhow::Result;
use tracing_subscriber::fmt::time::{ChronoLocal, ChronoUtc, FormatTime};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::{log_dir_path, AppConfig, LogConfig};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Timestamp source selected by `log.timestampFormat`.
enum Timer {
    Local(ChronoLocal),
    Utc(ChronoUtc),
    Custom(String),
}

impl FormatTime for Timer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        match self {
            Timer::Local(t) => t.format_time(w),
            Timer::Utc(t) => t.format_time(w),
            Timer::Custom(format) => write!(w, "{}", chrono::Local::now().format(format)),
        }
    }
}

fn create_timer(log: &LogConfig) -> Result<Timer> {
    match log.timestamp_format.to_lowercase().as_str() {
        "rfc3339" => Ok(Timer::Utc(ChronoUtc::rfc_3339())),
        "utc" => Ok(Timer::Utc(ChronoUtc::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))),
        "custom" => {
            let format_str = log.custom_timestamp_format.as_ref().ok_or_else(|| {
                anyhow::anyhow!("customTimestampFormat is required when timestampFormat is 'custom'")
            })?;
            Ok(Timer::Custom(format_str.clone()))
        }
        _ => Ok(Timer::Local(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))), // "local" or default
    }
}

fn build_layer<W>(log: &LogConfig, writer: W, ansi: bool) -> Result<BoxedLayer>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let base = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_timer(create_timer(log)?)
        .with_level(log.show_level)
        .with_target(log.show_target)
        .with_thread_names(log.show_thread_names)
        .with_thread_ids(log.show_thread_ids)
        .with_file(log.show_file)
        .with_line_number(log.show_file);

    Ok(match log.format.to_lowercase().as_str() {
        "json" => base.json().boxed(),
        "compact" => base.compact().boxed(),
        "pretty" => base.pretty().boxed(),
        _ => base.boxed(),
    })
}

/// `sandbot=<level>` plus any module overrides.
fn filter_directives(log: &LogConfig) -> Result<String> {
    let level = parse_log_level(&log.level)?;
    let mut filter_str = format!("sandbot={}", level);
    let mut modules: Vec<_> = log.module_levels.iter().collect();
    modules.sort();
    for (module, module_level) in modules {
        if let Ok(parsed_level) = parse_log_level(module_level) {
            filter_str.push_str(&format!(",{}={}", module, parsed_level));
        }
    }
    Ok(filter_str)
}

/// Initialize the logging system based on configuration: a daily rolling
/// file under the log directory plus stdout, in the configured format.
pub fn init_logging(cfg: &AppConfig) -> Result<()> {
    let log = &cfg.log;
    let directives = filter_directives(log)?;

    let log_dir = log_dir_path(cfg);
    std::fs::create_dir_all(&log_dir)?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    // sandbot.yyyy-MM-dd.log or sandbot.yyyy-MM-dd.json
    let log_file_suffix = match log.format.to_lowercase().as_str() {
        "json" => "json",
        _ => "log",
    };
    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("sandbot")
        .filename_suffix(log_file_suffix)
        .build(&log_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create rolling file appender: {}", e))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let layers: Vec<BoxedLayer> = vec![
        build_layer(log, non_blocking, false)?,
        build_layer(log, std::io::stdout, true)?,
    ];
    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install subscriber: {}", e))?;

    // The writer thread must outlive main.
    std::mem::forget(guard);

    tracing::info!(
        level = %log.level,
        format = %log.format,
        timestamp_format = %log.timestamp_format,
        dir = %log_dir.display(),
        "Logging initialized"
    );
    Ok(())
}

/// Parse log level string to a filter directive level.
fn parse_log_level(level_str: &str) -> Result<&'static str> {
    match level_str.to_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" => Ok("warn"),
        "error" => Ok("error"),
        _ => anyhow::bail!("Invalid log level: {}", level_str),
    }
}

/// Initialize simple logging for commands that don't load config.
pub fn init_simple_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "sandbot=info".into()),
        )
        .try_init();
}
