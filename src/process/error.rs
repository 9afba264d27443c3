use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("spawn failed: `{0}`")]
    SpawnFailed(#[source] std::io::Error),

    #[error("pipe creation failed: `{0}`")]
    PipeFailed(#[source] nix::Error),

    #[error("process already stopped")]
    AlreadyStopped,

    #[error("signal delivery failed: `{0}`")]
    SignalFailed(#[source] nix::Error),

    #[error("wait failed: `{0}`")]
    WaitFailed(#[source] nix::Error),

    #[error("io error: `{0}`")]
    Io(#[from] std::io::Error),

    #[error("error opening output sink: `{0}`")]
    SinkFailed(#[source] std::io::Error),
}
