use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error reading config: `{0}`")]
    Io(#[from] std::io::Error),

    #[error("error parsing config: `{0}`")]
    Yaml(#[from] serde_yaml::Error),

    #[error("program name allows only [A-Za-z0-9_], 1..64 bytes: `{0}`")]
    InvalidProgramName(String),

    #[error("program `{0}` is declared twice")]
    DuplicateProgram(String),

    #[error("program `{0}`: empty command")]
    EmptyCommand(String),

    #[error("program `{0}`: unterminated quote in command")]
    UnterminatedQuote(String),

    #[error("program `{name}`: executable not found: `{word}`")]
    ExecutableNotFound { name: String, word: String },

    #[error("program `{name}`: workingdir is not a directory: `{dir}`")]
    InvalidWorkingDir { name: String, dir: PathBuf },

    #[error("program `{name}`: unknown stopsignal `{signal}`")]
    InvalidStopSignal { name: String, signal: String },

    #[error("program `{name}`: invalid autorestart value `{value}`")]
    InvalidAutoRestart { name: String, value: String },

    #[error("program `{name}`: invalid umask `{value}`")]
    InvalidUmask { name: String, value: String },

    #[error("program `{0}`: numprocs must be >= 1")]
    InvalidNumProcs(String),

    #[error("program `{0}`: stoptime must be >= 1")]
    InvalidStopTime(String),
}
