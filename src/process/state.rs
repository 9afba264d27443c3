use std::fmt;

/// Lifecycle states of one managed replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Waiting,
    Starting,
    Running,
    Exiting,
    Stopped,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Waiting => "Waiting",
            ProcessState::Starting => "Starting",
            ProcessState::Running => "Running",
            ProcessState::Exiting => "Exiting",
            ProcessState::Stopped => "Stopped",
        };
        write!(f, "{name}")
    }
}

/// Operator command posted to a replica, consumed by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingCommand {
    #[default]
    None,
    Start,
    Stop,
    Restart,
}

/// Last observed child status, updated by `poll_status()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessStatus {
    pub running: bool,
    pub killed: bool,
    pub exitstatus: Option<u8>,
}

/// Everything the transition step is allowed to look at. Building this view
/// is the supervisor's job; evaluating it is pure, so the whole table below
/// is testable without an OS.
#[derive(Debug, Clone, Copy)]
pub struct TickView {
    pub state: ProcessState,
    pub previous_state: ProcessState,
    pub running: bool,
    pub pending: PendingCommand,
    pub autostart: bool,
    pub starttime_zero: bool,
    /// runtime since the last spawn has reached `starttime`
    pub started_long_enough: bool,
    pub wants_autorestart: bool,
    /// `num_retries <= startretries`
    pub retries_left: bool,
    /// graceful shutdown in progress: Waiting is forced into Exiting and
    /// nothing may leave Stopped
    pub shutting_down: bool,
}

/// The transition table. Holds no locks, performs no syscalls.
pub fn next_state(v: &TickView) -> ProcessState {
    use PendingCommand::{Restart, Start, Stop};
    use ProcessState::*;

    match v.state {
        Waiting => {
            if v.shutting_down {
                // the shutdown walk drives every live state through
                // Exiting; with no pid the stop signal is a no-op and the
                // next tick observes !running
                Exiting
            } else if !v.autostart {
                Stopped
            } else {
                Starting
            }
        }
        // a dead child wins over everything else: Running must only ever
        // hold replicas with a live pid, so a failed spawn falls straight
        // through to Stopped and the retry accounting
        Starting => {
            if !v.running {
                Stopped
            } else if v.starttime_zero || v.started_long_enough {
                Running
            } else if matches!(v.pending, Stop | Restart) {
                Exiting
            } else {
                Starting
            }
        }
        Running => {
            if !v.running {
                Stopped
            } else if matches!(v.pending, Stop | Restart) {
                Exiting
            } else {
                Running
            }
        }
        Exiting => {
            if !v.running {
                Stopped
            } else {
                Exiting
            }
        }
        Stopped => {
            if v.shutting_down {
                Stopped
            } else if matches!(v.pending, Start | Restart) {
                Starting
            } else if v.previous_state == Running && v.wants_autorestart {
                Starting
            } else if v.previous_state == Starting && v.retries_left {
                Starting
            } else {
                Stopped
            }
        }
    }
}
