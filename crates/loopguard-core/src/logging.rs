//! Structured logging setup.
//!
//! Mirrors the teacher's tracing-subscriber wiring: a pretty writer for
//! interactive use, a JSON writer for machine consumption, and an optional
//! file sink layered alongside stderr. RUST_LOG always wins over
//! [`LogConfig::level`] when present.
//!
//! Never log raw `L_loop`/`L_ex`/CI values here — only derived indicators
//! (`m_db`, `nc1`, `sc1`, `mq`) belong in log lines. Raw LREG fields are for
//! [`crate::lreg::Lreg::derive`] output and the enclave's own audit trail,
//! never for the ambient logger.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogFormat;

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Errors from setting up logging.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to create log directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("failed to open log file: {0}")]
    OpenFile(#[source] std::io::Error),
    #[error("failed to set file permissions: {0}")]
    SetPermissions(#[source] std::io::Error),
    #[error("global subscriber already set")]
    AlreadyInitialized,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level filter, used when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Optional path to additionally write logs to.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), LogError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(LogError::CreateDir)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), LogError> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, perms).map_err(LogError::SetPermissions)
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), LogError> {
    Ok(())
}

/// Initialize the global tracing subscriber from `config`.
///
/// Safe to call at most once per process; a second call returns
/// [`LogError::AlreadyInitialized`] rather than panicking.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Err(LogError::AlreadyInitialized);
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let stderr_layer: Box<dyn Layer<_> + Send + Sync> = match config.format {
        LogFormat::Pretty => fmt::layer().with_writer(std::io::stderr).boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    };

    let file_layer = match &config.file {
        Some(path) => {
            ensure_parent_dir(path)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(LogError::OpenFile)?;
            set_file_permissions(path)?;
            let layer: Box<dyn Layer<_> + Send + Sync> = match config.format {
                LogFormat::Pretty => fmt::layer().with_ansi(false).with_writer(file).boxed(),
                LogFormat::Json => fmt::layer().json().with_writer(file).boxed(),
            };
            Some(layer)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| LogError::AlreadyInitialized)
}

/// Whether [`init_logging`] has already run in this process.
pub fn is_logging_initialized() -> bool {
    LOGGING_INITIALIZED.load(Ordering::SeqCst)
}

/// Enter a span carrying the identifiers that correlate log lines across a
/// single verification run: `run_id`, the current `window_counter`, and the
/// active `profile_id`.
#[macro_export]
macro_rules! loopguard_span {
    ($run_id:expr, $window_counter:expr, $profile_id:expr) => {
        tracing::info_span!(
            "loopguard_run",
            run_id = %$run_id,
            window_counter = $window_counter,
            profile_id = ?$profile_id,
        )
    };
}
