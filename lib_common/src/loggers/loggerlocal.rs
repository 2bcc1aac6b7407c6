use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use glob::glob;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How many rolled log files to keep per application, current one included.
pub const KEEP_LOG_FILES: usize = 7;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInstalled(String),
}

/// # Init Logging
///
/// Installs the process-wide `tracing` subscriber:
///
/// - an `EnvFilter` built from `RUST_LOG` if set, otherwise from `level`,
/// - a console layer with targets and ANSI colours,
/// - a JSON layer writing to `<log_dir>/<app_name>.log.<date>`, rolled daily
///   through a non-blocking writer.
///
/// Old rolled files beyond [`KEEP_LOG_FILES`] are removed first. The returned
/// guard flushes the file writer on drop; keep it alive for the life of the
/// process.
pub fn init_logging(app_name: &str, log_dir: &Path, level: &str) -> Result<WorkerGuard, LoggerError> {
    let (env_filter, file_layer_writer, guard) = prepare(app_name, log_dir, level)?;

    let console_layer = fmt::layer().with_target(true).with_ansi(true);
    let file_layer = fmt::layer().with_ansi(false).with_writer(file_layer_writer).json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggerError::AlreadyInstalled(e.to_string()))?;

    tracing::info!(app = app_name, log_dir = %log_dir.display(), "logging initialised");
    Ok(guard)
}

fn prepare(
    app_name: &str,
    log_dir: &Path,
    level: &str,
) -> Result<(EnvFilter, tracing_appender::non_blocking::NonBlocking, WorkerGuard), LoggerError> {
    let env_filter = build_filter(level)?;

    fs::create_dir_all(log_dir).map_err(|source| LoggerError::CreateDir {
        path: log_dir.to_path_buf(),
        source,
    })?;
    rotate_logs(app_name, log_dir, KEEP_LOG_FILES);

    let file_appender = rolling::daily(log_dir, format!("{app_name}.log"));
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    Ok((env_filter, writer, guard))
}

/// `RUST_LOG` wins over the configured level.
pub fn build_filter(level: &str) -> Result<EnvFilter, LoggerError> {
    EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(level).map_err(|e| LoggerError::Filter {
            filter: level.to_string(),
            reason: e.to_string(),
        })
    })
}

/// Deletes all but the `keep` newest log files of `app_name` in `log_dir`.
///
/// Rolled files are named `<app_name>.log.YYYY-MM-DD`, so sorting by file name
/// sorts by age. Returns the files that were removed.
pub fn rotate_logs(app_name: &str, log_dir: &Path, keep: usize) -> Vec<PathBuf> {
    let pattern = format!("{}/{}.log.*", log_dir.display(), app_name);
    let mut log_files: Vec<PathBuf> = match glob(&pattern) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            eprintln!("Invalid log rotation pattern {pattern}: {e}");
            return Vec::new();
        }
    };

    // Newest first.
    log_files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut removed = Vec::new();
    for old_file in log_files.into_iter().skip(keep) {
        match fs::remove_file(&old_file) {
            Ok(()) => removed.push(old_file),
            Err(e) => eprintln!("Error deleting old log file {}: {}", old_file.display(), e),
        }
    }
    removed
}
