//! AN-050: Dual-output logging.
//!
//! JSON lines go to `<log_dir>/ancile.jsonl` through a non-blocking writer;
//! a compact human layer goes to stderr. `RUST_LOG` overrides both filters.
//! The stderr layer defaults to `warn` so command output stays readable,
//! the file layer to `info`.

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// File name of the JSON log inside the log directory.
pub const LOG_FILE: &str = "ancile.jsonl";

/// Keep alive for the life of the program; dropping it flushes the file.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
    path: Option<PathBuf>,
}

impl LoggingGuard {
    /// Where the JSON log is written, if the file could be set up.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Build the subscriber without installing it.
pub fn build(log_dir: &Path) -> (impl tracing::Subscriber + Send + Sync + 'static, LoggingGuard) {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .compact()
        .with_filter(filter("warn"));

    let (file_layer, guard, path) = match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_level(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_filter(filter("info"));
            (Some(layer), Some(guard), Some(log_dir.join(LOG_FILE)))
        }
        Err(e) => {
            eprintln!("[logging] cannot create {}: {}", log_dir.display(), e);
            (None, None, None)
        }
    };

    let subscriber = tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer);
    (
        subscriber,
        LoggingGuard {
            _file_guard: guard,
            path,
        },
    )
}

/// Install the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init(log_dir: &Path) -> LoggingGuard {
    let (subscriber, guard) = build(log_dir);
    if subscriber.try_init().is_ok() {
        tracing::debug!(log_dir = %log_dir.display(), "logging initialized");
    }
    guard
}
