use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use nix::poll::PollFlags;

/// Role of a descriptor in the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    Listener,
    ClientSession,
    ChildPipe,
    WakeUp,
}

#[derive(Debug, Clone, Copy)]
pub struct PollEntry {
    pub fd: RawFd,
    pub events: PollFlags,
    pub kind: FdKind,
}

/// The descriptors the reactor watches. The supervisor thread adds and
/// removes child-pipe entries while the reactor polls a snapshot, so the
/// set carries its own lock (M2), taken only inside these methods and
/// never across a poll.
#[derive(Clone, Default)]
pub struct PollSet(Arc<Mutex<Vec<PollEntry>>>);

impl PollSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, fd: RawFd, events: PollFlags, kind: FdKind) {
        let mut entries = self.lock();
        entries.push(PollEntry { fd, events, kind });
    }

    /// Unknown fds are ignored: a replica that never spawned has nothing
    /// registered.
    pub fn remove(&self, fd: RawFd) {
        let mut entries = self.lock();
        entries.retain(|entry| entry.fd != fd);
    }

    pub fn snapshot(&self) -> Vec<PollEntry> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PollEntry>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_detached_from_the_live_set() {
        let set = PollSet::new();
        set.add(3, PollFlags::POLLIN, FdKind::Listener);
        set.add(4, PollFlags::POLLIN, FdKind::WakeUp);

        let snapshot = set.snapshot();
        set.add(5, PollFlags::POLLIN, FdKind::ChildPipe);
        set.remove(3);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].fd, 3);
        assert_eq!(snapshot[0].kind, FdKind::Listener);

        let current = set.snapshot();
        assert_eq!(current.len(), 2);
        assert_eq!(current[0].fd, 4);
        assert_eq!(current[1].fd, 5);
    }

    #[test]
    fn removing_an_unknown_fd_is_a_noop() {
        let set = PollSet::new();
        set.add(7, PollFlags::POLLIN, FdKind::ChildPipe);
        set.remove(99);
        assert_eq!(set.snapshot().len(), 1);
    }
}
