use std::fs::File;
use std::path::Path;

use thiserror::Error;
use tracing::metadata::LevelFilter;
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("init logging error: `{0}`")]
    TryInitError(String),

    #[error("error opening log file: `{0}`")]
    LogFile(#[from] std::io::Error),
}

pub struct Logging;

impl Logging {
    /// Installs the global subscriber, writing to stderr. Level defaults to
    /// INFO and is overridable through `RUST_LOG`.
    pub fn try_init() -> Result<(), LoggingError> {
        tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_env_filter(Self::env_filter())
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|_| {
                LoggingError::TryInitError("unable to set global logging subscriber".to_string())
            })
    }

    /// Same subscriber, appending to `path`. Used once the daemon has
    /// detached from its terminal.
    pub fn try_init_with_file(path: &Path) -> Result<(), LoggingError> {
        let file: File = File::options().create(true).append(true).open(path)?;
        tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_env_filter(Self::env_filter())
            .with_ansi(false)
            .with_writer(std::sync::Arc::new(file))
            .try_init()
            .map_err(|_| {
                LoggingError::TryInitError("unable to set global logging subscriber".to_string())
            })
    }

    fn env_filter() -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
    }
}
