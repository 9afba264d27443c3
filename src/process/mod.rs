mod error;
pub mod group;
pub mod state;
pub mod table;

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::{umask, Mode};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{pipe2, Pid};
use tracing::{debug, warn};

pub use error::ProcessError;

use crate::config::{AutoRestart, ProgramConfig};
use crate::reactor::session::SessionHandle;
use state::{PendingCommand, ProcessState, ProcessStatus};

const OUTPUT_BUFFER_SIZE: usize = 4096;

/// Which of the two child pipes an fd belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    Stdout,
    Stderr,
}

/// One OS child of a program group: owns the pid, the parent side of the
/// stdout/stderr pipes, and every lifecycle field the supervisor ticks on.
pub struct ManagedProcess {
    config: Arc<ProgramConfig>,
    pid: Option<Pid>,
    start_ts: Option<Instant>,
    stop_ts: Option<Instant>,
    num_retries: u32,
    state: ProcessState,
    previous_state: ProcessState,
    pending: PendingCommand,
    status: ProcessStatus,
    stdout_pipe: Option<File>,
    stderr_pipe: Option<File>,
    stdout_sink: Arc<File>,
    stderr_sink: Arc<File>,
    attached: Vec<SessionHandle>,
}

impl ManagedProcess {
    pub fn new(config: Arc<ProgramConfig>, stdout_sink: Arc<File>, stderr_sink: Arc<File>) -> Self {
        Self {
            config,
            pid: None,
            start_ts: None,
            stop_ts: None,
            num_retries: 0,
            state: ProcessState::Waiting,
            previous_state: ProcessState::Waiting,
            pending: PendingCommand::None,
            status: ProcessStatus::default(),
            stdout_pipe: None,
            stderr_pipe: None,
            stdout_sink,
            stderr_sink,
            attached: Vec::new(),
        }
    }

    /// Creates fresh stdout/stderr pipes and forks the child. The parent
    /// keeps the read ends; the write ends travel into the child as its
    /// stdout/stderr and are closed here when `Command` goes out of scope.
    /// The child chdirs, applies the umask and the extended environment,
    /// then execs; any failure along that chain surfaces as `SpawnFailed`.
    pub fn spawn(&mut self) -> Result<(), ProcessError> {
        let (stdout_r, stdout_w) = pipe2(OFlag::O_CLOEXEC).map_err(ProcessError::PipeFailed)?;
        let (stderr_r, stderr_w) = pipe2(OFlag::O_CLOEXEC).map_err(ProcessError::PipeFailed)?;
        // only the parent-side read ends go non-blocking; the write ends
        // become the child's stdout/stderr and must keep pipe semantics
        for fd in [&stdout_r, &stderr_r] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
                .map_err(ProcessError::PipeFailed)?;
        }

        let config = &self.config;
        let mut command = Command::new(&config.exec_path);
        command.arg0(&config.argv[0]);
        command.args(&config.argv[1..]);
        command.envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &config.workingdir {
            command.current_dir(dir);
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::from(stdout_w));
        command.stderr(Stdio::from(stderr_w));

        let mask = Mode::from_bits_truncate(config.umask as nix::libc::mode_t);
        unsafe {
            command.pre_exec(move || {
                umask(mask);
                Ok(())
            });
        }

        let child = command.spawn().map_err(ProcessError::SpawnFailed)?;
        self.pid = Some(Pid::from_raw(child.id() as i32));
        self.start_ts = Some(Instant::now());
        // a fresh child never carries the previous cycle's kill flag
        self.status = ProcessStatus {
            running: true,
            killed: false,
            exitstatus: None,
        };
        self.stdout_pipe = Some(File::from(stdout_r));
        self.stderr_pipe = Some(File::from(stderr_r));
        Ok(())
    }

    /// Delivers the graceful stop signal and records the moment, starting
    /// the `stoptime` grace period.
    pub fn signal_stop(&mut self, signal: Signal) -> Result<(), ProcessError> {
        let pid = self.pid.ok_or(ProcessError::AlreadyStopped)?;
        kill(pid, signal).map_err(ProcessError::SignalFailed)?;
        self.stop_ts = Some(Instant::now());
        Ok(())
    }

    pub fn kill_hard(&mut self) -> Result<(), ProcessError> {
        let pid = self.pid.ok_or(ProcessError::AlreadyStopped)?;
        kill(pid, Signal::SIGKILL).map_err(ProcessError::SignalFailed)?;
        self.status.killed = true;
        Ok(())
    }

    /// Non-blocking reap. On exit the pid is cleared here and only here,
    /// keeping `pid = none` equivalent to `status.running = false`.
    pub fn poll_status(&mut self) -> Result<(), ProcessError> {
        let Some(pid) = self.pid else {
            self.status.running = false;
            return Ok(());
        };
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                self.status.running = true;
                Ok(())
            }
            Ok(WaitStatus::Exited(_, code)) => {
                self.status.running = false;
                self.status.exitstatus = Some(code as u8);
                self.pid = None;
                Ok(())
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                debug!(program = %self.config.name, signal = %signal, "child terminated by signal");
                self.status.running = false;
                self.status.exitstatus = None;
                self.pid = None;
                Ok(())
            }
            // job-control stops and ptrace events leave the child alive
            Ok(_) => Ok(()),
            Err(nix::errno::Errno::ECHILD) => {
                self.status.running = false;
                self.pid = None;
                Ok(())
            }
            Err(err) => Err(ProcessError::WaitFailed(err)),
        }
    }

    /// Drains up to one buffer from the given pipe into the group sink and
    /// every attached session. Returns the number of bytes moved; zero
    /// means EOF.
    pub fn forward_output(&mut self, kind: PipeKind) -> Result<usize, ProcessError> {
        let (pipe, sink) = match kind {
            PipeKind::Stdout => (&self.stdout_pipe, &self.stdout_sink),
            PipeKind::Stderr => (&self.stderr_pipe, &self.stderr_sink),
        };
        let Some(pipe) = pipe else {
            return Ok(0);
        };

        let mut buffer = [0u8; OUTPUT_BUFFER_SIZE];
        let mut reader: &File = pipe;
        let read = match reader.read(&mut buffer) {
            Ok(n) => n,
            // nothing buffered right now; EOF detection is the
            // supervisor's business, not ours
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            return Ok(0);
        }

        sink.as_ref().write_all(&buffer[..read])?;
        self.attached.retain(|session| {
            session.write(&buffer[..read]).map_or_else(
                |err| {
                    warn!(program = %self.config.name, "dropping broken attachment: {err}");
                    false
                },
                |_| true,
            )
        });
        Ok(read)
    }

    pub fn expected_exit(&self) -> bool {
        match self.status.exitstatus {
            Some(code) => self.config.exitcodes.contains(&code),
            None => false,
        }
    }

    pub fn needs_autorestart(&self) -> bool {
        match self.config.autorestart {
            AutoRestart::True => true,
            AutoRestart::False => false,
            AutoRestart::Unexpected => !self.expected_exit(),
        }
    }

    pub fn config(&self) -> &Arc<ProgramConfig> {
        &self.config
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn previous_state(&self) -> ProcessState {
        self.previous_state
    }

    /// Commits a tick: the current state becomes the previous one.
    pub fn advance(&mut self, next: ProcessState) {
        self.previous_state = self.state;
        self.state = next;
    }

    pub fn pending(&self) -> PendingCommand {
        self.pending
    }

    pub fn post_command(&mut self, command: PendingCommand) {
        self.pending = command;
    }

    pub fn clear_pending(&mut self) {
        self.pending = PendingCommand::None;
    }

    pub fn num_retries(&self) -> u32 {
        self.num_retries
    }

    pub fn bump_retries(&mut self) {
        self.num_retries += 1;
    }

    pub fn reset_retries(&mut self) {
        self.num_retries = 0;
    }

    /// Seconds since the last spawn.
    pub fn runtime_secs(&self) -> u64 {
        self.start_ts.map_or(0, |ts| ts.elapsed().as_secs())
    }

    /// Seconds since the stop signal was delivered.
    pub fn stop_elapsed_secs(&self) -> u64 {
        self.stop_ts.map_or(0, |ts| ts.elapsed().as_secs())
    }

    pub fn pipe_fd(&self, kind: PipeKind) -> Option<RawFd> {
        match kind {
            PipeKind::Stdout => self.stdout_pipe.as_ref().map(|f| f.as_raw_fd()),
            PipeKind::Stderr => self.stderr_pipe.as_ref().map(|f| f.as_raw_fd()),
        }
    }

    /// Hands back both pipe read ends, closing them when dropped by the
    /// caller after unregistering.
    pub fn take_pipes(&mut self) -> Vec<File> {
        self.stdout_pipe
            .take()
            .into_iter()
            .chain(self.stderr_pipe.take())
            .collect()
    }

    pub fn owns_fd(&self, fd: RawFd) -> Option<PipeKind> {
        if self.pipe_fd(PipeKind::Stdout) == Some(fd) {
            return Some(PipeKind::Stdout);
        }
        if self.pipe_fd(PipeKind::Stderr) == Some(fd) {
            return Some(PipeKind::Stderr);
        }
        None
    }

    pub fn attach(&mut self, session: SessionHandle) {
        if !self.attached.iter().any(|s| s.id() == session.id()) {
            self.attached.push(session);
        }
    }

    pub fn detach(&mut self, session_id: RawFd) {
        self.attached.retain(|s| s.id() != session_id);
    }

    /// Abort marker: the start cycle burned through its whole retry budget.
    pub fn aborted(&self) -> bool {
        self.num_retries > self.config.startretries
    }
}
