pub mod dispatcher;
pub mod error;
pub mod pollset;
pub mod session;
pub mod waker;

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Mutex};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, info, warn};

use crate::context::ShutdownContext;
use crate::process::table::ProcessTable;
use crate::reload::Reconfigurer;
use crate::signal;

use dispatcher::CommandDispatcher;
use error::ReactorError;
use pollset::{FdKind, PollEntry, PollSet};
use session::ControlSession;
use waker::WakePipe;

const SOCKET_MODE: u32 = 0o666;
const SESSION_WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// The event loop on the main thread. Owns the listening socket, every
/// client session and the wake pipe's read end; child pipes are owned by
/// their replicas and only borrowed here, by fd, for the fan-out.
pub struct Reactor {
    listener: UnixListener,
    socket_path: PathBuf,
    sessions: HashMap<RawFd, ControlSession>,
    poll_set: PollSet,
    table: Arc<Mutex<ProcessTable>>,
    dispatcher: CommandDispatcher,
    wake_pipe: WakePipe,
    ctx: ShutdownContext,
    supervisor_done: Arc<AtomicBool>,
    reconfigurer: Reconfigurer,
}

impl Reactor {
    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        socket_path: &Path,
        poll_set: PollSet,
        table: Arc<Mutex<ProcessTable>>,
        wake_pipe: WakePipe,
        ctx: ShutdownContext,
        supervisor_done: Arc<AtomicBool>,
        reconfigurer: Reconfigurer,
    ) -> Result<Self, ReactorError> {
        // a stale socket from an unclean exit would make bind fail
        if socket_path.exists() {
            let _ = fs::remove_file(socket_path);
        }
        let listener = UnixListener::bind(socket_path).map_err(ReactorError::Socket)?;
        fs::set_permissions(socket_path, fs::Permissions::from_mode(SOCKET_MODE))
            .map_err(ReactorError::Socket)?;
        listener.set_nonblocking(true).map_err(ReactorError::Socket)?;

        poll_set.add(listener.as_raw_fd(), PollFlags::POLLIN, FdKind::Listener);
        poll_set.add(wake_pipe.fd(), PollFlags::POLLIN, FdKind::WakeUp);

        let dispatcher = CommandDispatcher::new(Arc::clone(&table), ctx.clone());
        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            sessions: HashMap::new(),
            poll_set,
            table,
            dispatcher,
            wake_pipe,
            ctx,
            supervisor_done,
            reconfigurer,
        })
    }

    pub fn run(&mut self) -> Result<(), ReactorError> {
        info!(socket = %self.socket_path.display(), "control channel ready");
        loop {
            let snapshot = self.poll_set.snapshot();
            let ready = self.poll(&snapshot)?;
            for (entry, revents) in ready {
                match entry.kind {
                    FdKind::Listener => self.accept_clients()?,
                    FdKind::ClientSession => self.handle_session(entry.fd, revents)?,
                    FdKind::ChildPipe => self.handle_child_pipe(entry.fd)?,
                    FdKind::WakeUp => self.wake_pipe.drain(),
                }
            }

            if signal::take_shutdown_request() {
                info!("termination signal received");
                self.ctx.cancel();
            }
            if signal::take_reload_request() {
                self.reconfigure()?;
            }
            if self.ctx.is_cancelled() && self.supervisor_done.load(Relaxed) {
                break;
            }
        }

        info!("control channel closing");
        self.sessions.clear();
        let _ = fs::remove_file(&self.socket_path);
        Ok(())
    }

    /// Blocks in poll(2) on the snapshot. An interrupted wait is a benign
    /// retry (the latched flags get checked by the caller); anything else
    /// is fatal.
    fn poll(
        &self,
        snapshot: &[PollEntry],
    ) -> Result<Vec<(PollEntry, PollFlags)>, ReactorError> {
        let mut fds: Vec<PollFd> = snapshot
            .iter()
            .map(|entry| {
                // fds in the snapshot stay open at least until the owning
                // structure is mutated again, which happens after poll
                PollFd::new(unsafe { BorrowedFd::borrow_raw(entry.fd) }, entry.events)
            })
            .collect();
        match poll(&mut fds, PollTimeout::NONE) {
            Err(nix::errno::Errno::EINTR) => Ok(Vec::new()),
            Err(err) => Err(ReactorError::Poll(err)),
            Ok(_) => Ok(snapshot
                .iter()
                .zip(&fds)
                .filter_map(|(entry, fd)| {
                    fd.revents()
                        .filter(|revents| !revents.is_empty())
                        .map(|revents| (*entry, revents))
                })
                .collect()),
        }
    }

    fn accept_clients(&mut self) -> Result<(), ReactorError> {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    // a stalled attached client must not wedge the loop
                    // while it holds the table lock during fan-out
                    let _ = stream.set_write_timeout(Some(SESSION_WRITE_TIMEOUT));
                    let session = ControlSession::new(stream);
                    let fd = session.id();
                    info!(session = fd, "client connected");
                    self.poll_set
                        .add(fd, PollFlags::POLLIN, FdKind::ClientSession);
                    self.sessions.insert(fd, session);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => {
                    warn!("accept failed: {err}");
                    return Ok(());
                }
            }
        }
    }

    fn handle_session(&mut self, fd: RawFd, revents: PollFlags) -> Result<(), ReactorError> {
        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
            self.disconnect(fd);
            return Ok(());
        }
        if !revents.contains(PollFlags::POLLIN) {
            return Ok(());
        }
        let Some(session) = self.sessions.get_mut(&fd) else {
            return Ok(());
        };
        let lines = match session.read_commands() {
            Ok(Some(lines)) => lines,
            Ok(None) => {
                self.disconnect(fd);
                return Ok(());
            }
            Err(err) => {
                debug!(session = fd, "read failed: {err}");
                self.disconnect(fd);
                return Ok(());
            }
        };
        for line in lines {
            let Some(session) = self.sessions.get_mut(&fd) else {
                break;
            };
            match self.dispatcher.dispatch(&line, session) {
                Ok(()) => {}
                Err(ReactorError::Transport(err)) => {
                    debug!(session = fd, "write failed: {err}");
                    self.disconnect(fd);
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn handle_child_pipe(&mut self, fd: RawFd) -> Result<(), ReactorError> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| ReactorError::TablePoisoned)?;
        let Some((replica, kind)) = table.find_by_fd(fd) else {
            // unregistered between snapshot and now
            return Ok(());
        };
        // EOF is left for the supervisor: it unregisters and closes the
        // pipes on the Stopped transition
        if let Err(err) = replica.forward_output(kind) {
            debug!(fd, "output forward failed: {err}");
        }
        Ok(())
    }

    fn disconnect(&mut self, fd: RawFd) {
        info!(session = fd, "client disconnected");
        self.poll_set.remove(fd);
        self.sessions.remove(&fd);
        if let Ok(mut table) = self.table.lock() {
            table.detach_session(fd);
        }
    }

    /// Runs the reconfiguration and only then acknowledges every session
    /// whose `reload` has been waiting on it.
    fn reconfigure(&mut self) -> Result<(), ReactorError> {
        let reply = match self.reconfigurer.run() {
            Ok(summary) => format!(
                "reload successful (kept {}, new {}, removed {})",
                summary.kept, summary.added, summary.removed
            ),
            Err(err) => {
                error!("reload failed: {err}");
                format!("reload failed: {err}")
            }
        };

        let mut broken: Vec<RawFd> = Vec::new();
        for (fd, session) in self.sessions.iter_mut() {
            if !session.reload_pending {
                continue;
            }
            session.reload_pending = false;
            if session.send(&reply).is_err() {
                broken.push(*fd);
            }
        }
        for fd in broken {
            self.disconnect(fd);
        }
        Ok(())
    }
}
