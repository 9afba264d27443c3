use std::fs::File;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

use super::{ManagedProcess, PipeKind, ProcessError};
use crate::config::ProgramConfig;

const SINK_MODE: u32 = 0o644;

/// The `numprocs` replicas of one program plus the two log sinks they
/// share. Dropping the group closes the sinks once the last replica is
/// gone.
pub struct ProcessGroup {
    config: Arc<ProgramConfig>,
    replicas: Vec<ManagedProcess>,
}

impl ProcessGroup {
    /// Builds the group in its unspawned form: every replica in Waiting,
    /// sinks opened (create + truncate) or pointed at /dev/null.
    pub fn new(config: ProgramConfig) -> Result<Self, ProcessError> {
        let config = Arc::new(config);
        let stdout_sink = Arc::new(open_sink(config.stdout_path.as_deref())?);
        let stderr_sink = Arc::new(open_sink(config.stderr_path.as_deref())?);
        let replicas = (0..config.numprocs)
            .map(|_| {
                ManagedProcess::new(
                    Arc::clone(&config),
                    Arc::clone(&stdout_sink),
                    Arc::clone(&stderr_sink),
                )
            })
            .collect();
        Ok(Self { config, replicas })
    }

    pub fn config(&self) -> &ProgramConfig {
        &self.config
    }

    pub fn replicas(&self) -> &[ManagedProcess] {
        &self.replicas
    }

    pub fn replicas_mut(&mut self) -> &mut [ManagedProcess] {
        &mut self.replicas
    }

    /// Resolves a pipe read end back to its owning replica, used by the
    /// reactor when a child pipe turns readable.
    pub fn find_by_fd(&mut self, fd: RawFd) -> Option<(&mut ManagedProcess, PipeKind)> {
        self.replicas
            .iter_mut()
            .find_map(|replica| replica.owns_fd(fd).map(|kind| (replica, kind)))
    }
}

fn open_sink(path: Option<&Path>) -> Result<File, ProcessError> {
    let result = match path {
        Some(path) => File::options()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(SINK_MODE)
            .open(path),
        None => File::options().write(true).open("/dev/null"),
    };
    result.map_err(ProcessError::SinkFailed)
}
