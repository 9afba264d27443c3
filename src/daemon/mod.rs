mod pidfile;

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use nix::unistd::{chdir, dup2, fork, setsid, ForkResult};
use thiserror::Error;
use tracing::{error, info};

use crate::config::{ConfigError, ConfigLoader, YamlFileLoader};
use crate::context::ShutdownContext;
use crate::logging::Logging;
use crate::process::group::ProcessGroup;
use crate::process::table::ProcessTable;
use crate::process::ProcessError;
use crate::reactor::error::ReactorError;
use crate::reactor::pollset::PollSet;
use crate::reactor::waker::WakePipe;
use crate::reactor::Reactor;
use crate::reload::Reconfigurer;
use crate::signal;
use crate::supervisor::Supervisor;

pub use pidfile::PidFile;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/taskmasterd.sock";
pub const DEFAULT_PID_PATH: &str = "/tmp/taskmasterd.pid";

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error("io error: `{0}`")]
    Io(#[from] std::io::Error),

    #[error("system error: `{0}`")]
    Nix(#[from] nix::Error),

    #[error("already running (pid file `{0}` is locked)")]
    AlreadyRunning(PathBuf),
}

pub struct DaemonOptions {
    pub config_path: PathBuf,
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub log_path: Option<PathBuf>,
    pub foreground: bool,
}

/// Assembles and runs the whole daemon: configuration, the process table,
/// the supervisor worker and the reactor loop. Returns once a `quit` or a
/// termination signal has drained every child.
pub struct Daemon {
    options: DaemonOptions,
}

impl Daemon {
    pub fn new(options: DaemonOptions) -> Self {
        Self { options }
    }

    pub fn start(self) -> Result<(), DaemonError> {
        // validate the configuration while stderr is still attached
        let config = YamlFileLoader::new(&self.options.config_path).load()?;

        if !self.options.foreground {
            daemonize()?;
        }
        self.init_logging();

        let _pid_file = PidFile::acquire(&self.options.pid_path)?;
        signal::install_daemon_handlers()?;

        let mut table = ProcessTable::new();
        for program in config.programs {
            info!(program = %program.name, numprocs = program.numprocs, "program configured");
            table.insert(ProcessGroup::new(program)?);
        }
        let table = Arc::new(Mutex::new(table));

        let poll_set = PollSet::new();
        let wake_pipe = WakePipe::new()?;
        let ctx = ShutdownContext::new();

        let supervisor = Supervisor::new(
            Arc::clone(&table),
            poll_set.clone(),
            wake_pipe.waker(),
            ctx.clone(),
        );
        let supervisor_done = supervisor.done_flag();

        let reconfigurer = Reconfigurer::new(
            Box::new(YamlFileLoader::new(&self.options.config_path)),
            Arc::clone(&table),
            poll_set.clone(),
        );

        let mut reactor = Reactor::bind(
            &self.options.socket_path,
            poll_set,
            table,
            wake_pipe,
            ctx.clone(),
            supervisor_done,
            reconfigurer,
        )?;

        let supervisor_handle = supervisor.spawn_thread()?;
        let result = reactor.run();

        // make sure the worker unblocks even on a reactor failure
        ctx.cancel();
        if supervisor_handle.join().is_err() {
            error!("supervisor thread panicked");
        }

        info!("daemon exiting");
        result.map_err(Into::into)
    }

    /// `try_init` fails when a subscriber is already installed; the daemon
    /// keeps running without one.
    fn init_logging(&self) {
        let result = match (&self.options.log_path, self.options.foreground) {
            (Some(path), _) => Logging::try_init_with_file(path),
            (None, true) => Logging::try_init(),
            (None, false) => {
                let fallback = self.options.pid_path.with_extension("log");
                Logging::try_init_with_file(&fallback)
            }
        };
        if let Err(err) = result {
            eprintln!("logging disabled: {err}");
        }
    }
}

/// Classic double fork: detach from the controlling terminal, become a
/// session leader, drop into `/` and point stdio at /dev/null.
fn daemonize() -> Result<(), DaemonError> {
    if let ForkResult::Parent { .. } = unsafe { fork()? } {
        std::process::exit(0);
    }
    setsid()?;
    if let ForkResult::Parent { .. } = unsafe { fork()? } {
        std::process::exit(0);
    }
    chdir("/")?;
    let devnull = File::options().read(true).write(true).open("/dev/null")?;
    for fd in 0..=2 {
        dup2(devnull.as_raw_fd(), fd)?;
    }
    Ok(())
}
