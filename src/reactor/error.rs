use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("control socket setup failed: `{0}`")]
    Socket(#[source] std::io::Error),

    #[error("poll failed: `{0}`")]
    Poll(#[source] nix::Error),

    #[error("process table lock poisoned")]
    TablePoisoned,

    #[error("session transport failed: `{0}`")]
    Transport(#[source] std::io::Error),
}

/// Client-facing protocol diagnostics. These are reported to the issuing
/// session and never mutate state.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ControlError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("usage: {0}")]
    BadArity(&'static str),

    #[error("no such process: {0}")]
    NoSuchProcess(String),
}
