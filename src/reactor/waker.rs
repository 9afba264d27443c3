use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use nix::fcntl::OFlag;
use nix::unistd::pipe2;

/// The self-pipe. The supervisor writes one byte after mutating the
/// poll set so the reactor re-snapshots; the reactor drains whatever
/// accumulated. Both ends are non-blocking: a full pipe just means the
/// wake-up is already pending.
pub struct WakePipe {
    reader: File,
    waker: Waker,
}

#[derive(Clone)]
pub struct Waker(Arc<File>);

impl WakePipe {
    pub fn new() -> Result<Self, nix::Error> {
        let (reader, writer) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        Ok(Self {
            reader: File::from(reader),
            waker: Waker(Arc::new(File::from(writer))),
        })
    }

    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    pub fn fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    pub fn drain(&self) {
        let mut buffer = [0u8; 64];
        let mut reader: &File = &self.reader;
        while matches!(reader.read(&mut buffer), Ok(n) if n > 0) {}
    }
}

impl Waker {
    pub fn wake(&self) {
        let mut writer: &File = &self.0;
        // EAGAIN means the reactor has a wake-up queued already
        let _ = writer.write(b"!");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_then_drain() {
        let pipe = WakePipe::new().unwrap();
        let waker = pipe.waker();

        waker.wake();
        waker.wake();

        let mut buffer = [0u8; 8];
        let mut reader: &File = &pipe.reader;
        assert_eq!(reader.read(&mut buffer).unwrap(), 2);

        // drained pipe reads would-block rather than hanging
        pipe.drain();
    }
}
