use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::StopSignal;
use crate::context::ShutdownContext;
use crate::process::state::{next_state, PendingCommand, ProcessState, TickView};
use crate::process::table::ProcessTable;
use crate::process::{ManagedProcess, PipeKind};
use crate::reactor::pollset::{FdKind, PollSet};
use crate::reactor::waker::Waker;

use nix::poll::PollFlags;

const TICK_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("process table lock poisoned")]
    TablePoisoned,
}

/// The worker thread. Each tick takes the table lock (M1), walks every
/// replica, performs the per-state side effects and then commits the pure
/// transition. Registration of freshly opened pipes goes through the poll
/// set (M2, taken under M1 — that order is fixed crate-wide) followed by
/// a wake-up poke so the reactor picks them up.
pub struct Supervisor {
    table: Arc<Mutex<ProcessTable>>,
    poll_set: PollSet,
    waker: Waker,
    ctx: ShutdownContext,
    done: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(
        table: Arc<Mutex<ProcessTable>>,
        poll_set: PollSet,
        waker: Waker,
        ctx: ShutdownContext,
    ) -> Self {
        Self {
            table,
            poll_set,
            waker,
            ctx,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag the reactor checks to know the graceful-shutdown walk has
    /// drained every replica.
    pub fn done_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.done)
    }

    pub fn spawn_thread(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("supervisor".to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        info!("supervisor worker started");
        loop {
            if self.ctx.is_cancelled() {
                break;
            }
            match self.tick(false) {
                Ok(_) => {}
                Err(err) => {
                    error!("supervisor tick failed: {err}");
                    self.ctx.cancel();
                    break;
                }
            }
            self.ctx.wait(TICK_INTERVAL);
        }

        self.shutdown_walk();
        self.done.store(true, Relaxed);
        self.waker.wake();
        info!("supervisor worker finished");
    }

    /// Graceful shutdown: post Stop everywhere, then keep ticking with the
    /// Stopped state pinned until every replica has drained. Exiting
    /// replicas still get their full `stoptime` grace before the KILL.
    fn shutdown_walk(&self) {
        info!("shutting down all programs");
        {
            let Ok(mut table) = self.table.lock() else {
                error!("process table lock poisoned during shutdown");
                return;
            };
            for replica in table.replicas_mut() {
                replica.post_command(PendingCommand::Stop);
            }
        }
        loop {
            match self.tick(true) {
                Ok(true) => break,
                Ok(false) => thread::sleep(TICK_INTERVAL),
                Err(err) => {
                    error!("shutdown walk failed: {err}");
                    return;
                }
            }
        }
    }

    /// One pass over every replica. Returns whether all of them ended the
    /// tick in Stopped.
    fn tick(&self, shutting_down: bool) -> Result<bool, SupervisorError> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| SupervisorError::TablePoisoned)?;
        let mut all_stopped = true;
        for replica in table.replicas_mut() {
            self.tick_replica(replica, shutting_down);
            if replica.state() != ProcessState::Stopped {
                all_stopped = false;
            }
        }
        Ok(all_stopped)
    }

    fn tick_replica(&self, replica: &mut ManagedProcess, shutting_down: bool) {
        let config = Arc::clone(replica.config());
        let first_tick = replica.state() != replica.previous_state();

        // Step A: the per-state action. The only place with syscalls and
        // poll-set mutations.
        match replica.state() {
            ProcessState::Waiting => {}
            ProcessState::Starting => {
                if first_tick {
                    if matches!(
                        replica.pending(),
                        PendingCommand::Start | PendingCommand::Restart
                    ) {
                        replica.clear_pending();
                        replica.reset_retries();
                    }
                    match replica.spawn() {
                        Ok(()) => {
                            info!(
                                program = %config.name,
                                pid = replica.pid().map(|p| p.as_raw()),
                                attempt = replica.num_retries() + 1,
                                "spawned"
                            );
                            self.register_pipes(replica);
                            self.waker.wake();
                        }
                        Err(err) => {
                            warn!(program = %config.name, "spawn failed: {err}");
                            replica.bump_retries();
                        }
                    }
                } else if config.starttime > 0 {
                    self.poll_replica(replica);
                    if !replica.status().running {
                        replica.bump_retries();
                        warn!(
                            program = %config.name,
                            retries = replica.num_retries(),
                            "exited before starttime"
                        );
                    }
                }
            }
            ProcessState::Running => self.poll_replica(replica),
            ProcessState::Exiting => {
                if first_tick {
                    let StopSignal(stop_signal) = config.stopsignal;
                    info!(program = %config.name, signal = %stop_signal, "stopping");
                    if let Err(err) = replica.signal_stop(stop_signal) {
                        debug!(program = %config.name, "stop signal skipped: {err}");
                    }
                } else {
                    self.poll_replica(replica);
                    let status = replica.status();
                    if status.running
                        && !status.killed
                        && replica.stop_elapsed_secs() >= config.stoptime
                    {
                        warn!(program = %config.name, "grace period expired, killing");
                        if let Err(err) = replica.kill_hard() {
                            warn!(program = %config.name, "kill failed: {err}");
                        }
                    }
                }
            }
            ProcessState::Stopped => {
                if first_tick {
                    for pipe in replica.take_pipes() {
                        self.poll_set.remove(pipe.as_raw_fd());
                    }
                    self.waker.wake();
                    if replica.pending() != PendingCommand::Restart {
                        replica.clear_pending();
                    }
                    info!(
                        program = %config.name,
                        exitstatus = replica.status().exitstatus,
                        killed = replica.status().killed,
                        aborted = replica.aborted(),
                        "stopped"
                    );
                }
            }
        }

        // Step B: the pure transition over what the action step observed.
        let status = replica.status();
        let next = next_state(&TickView {
            state: replica.state(),
            previous_state: replica.previous_state(),
            running: status.running,
            pending: replica.pending(),
            autostart: config.autostart,
            starttime_zero: config.starttime == 0,
            started_long_enough: replica.runtime_secs() >= config.starttime,
            wants_autorestart: replica.needs_autorestart(),
            retries_left: replica.num_retries() <= config.startretries,
            shutting_down,
        });
        if next != replica.state() {
            debug!(program = %config.name, from = %replica.state(), to = %next, "transition");
        }
        replica.advance(next);
    }

    fn poll_replica(&self, replica: &mut ManagedProcess) {
        if let Err(err) = replica.poll_status() {
            warn!(program = %replica.config().name, "waitpid failed: {err}");
        }
    }

    fn register_pipes(&self, replica: &ManagedProcess) {
        for kind in [PipeKind::Stdout, PipeKind::Stderr] {
            if let Some(fd) = replica.pipe_fd(kind) {
                self.poll_set.add(fd, PollFlags::POLLIN, FdKind::ChildPipe);
            }
        }
    }
}
