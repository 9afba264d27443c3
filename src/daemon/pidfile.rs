use std::fs::File;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};

use super::DaemonError;

/// The daemon's pid file: exclusively locked for the whole lifetime, so a
/// second instance fails fast, and unlinked again on clean exit. The lock
/// dies with the fd, the file with this struct.
#[derive(Debug)]
pub struct PidFile {
    _file: File,
    path: PathBuf,
}

impl PidFile {
    pub fn acquire(path: &Path) -> Result<Self, DaemonError> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|err| match err {
            nix::errno::Errno::EWOULDBLOCK => DaemonError::AlreadyRunning(path.to_path_buf()),
            other => DaemonError::Nix(other),
        })?;
        file.set_len(0)?;
        let mut writer: &File = &file;
        writeln!(writer, "{}", std::process::id())?;
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
