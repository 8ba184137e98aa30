use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";

pub struct LoggingHandle {
    pub run_id: String,
    pub log_path: PathBuf,
    pub guard: WorkerGuard,
}

/// Log to `<log_dir>/<file_name>`. JSON by default, `MEGATRADE_LOG_FORMAT=pretty`
/// for human-readable output.
pub fn init_logging(log_dir: &Path, file_name: &str) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(file_name);

    if std::env::var("MEGATRADE_TRUNCATE_LOG_ON_START").as_deref() == Ok("1") {
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)?;
    }

    let filter_source = filter_directive(
        std::env::var("MEGATRADE_LOG_FILTER").ok(),
        std::env::var("RUST_LOG").ok(),
    );
    let filter = EnvFilter::try_new(&filter_source).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let format = std::env::var("MEGATRADE_LOG_FORMAT").unwrap_or_else(|_| "json".into());

    let registry = tracing_subscriber::registry().with(filter);
    if format.eq_ignore_ascii_case("pretty") {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()?;
    }

    let run_id = std::env::var("MEGATRADE_RUN_ID").unwrap_or_else(|_| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("pid-{}-{}", std::process::id(), now)
    });

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %run_id,
        log_path = %log_path.display(),
        format = %format,
        filter = %filter_source,
    );

    Ok(LoggingHandle {
        run_id,
        log_path,
        guard,
    })
}

/// `MEGATRADE_LOG_FILTER` > `RUST_LOG` > built-in default. Blank values are skipped.
fn filter_directive(explicit: Option<String>, rust_log: Option<String>) -> String {
    explicit
        .into_iter()
        .chain(rust_log)
        .find(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}
