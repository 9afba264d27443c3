use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};

use nix::sys::wait::waitpid;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigError, ConfigLoader, ProgramConfig};
use crate::process::group::ProcessGroup;
use crate::process::table::ProcessTable;
use crate::process::ProcessError;
use crate::reactor::pollset::PollSet;

#[derive(Error, Debug)]
pub enum ReloadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("process table lock poisoned")]
    TablePoisoned,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ReloadSummary {
    pub kept: usize,
    pub added: usize,
    pub removed: usize,
}

/// Applies an operator-requested reload: re-parse the configuration, keep
/// every group whose config is unchanged field by field (pid continuity),
/// build the rest fresh, and swap the table in one motion under its lock.
/// Any failure before the swap leaves the live table exactly as it was.
pub struct Reconfigurer {
    loader: Box<dyn ConfigLoader + Send>,
    table: Arc<Mutex<ProcessTable>>,
    poll_set: PollSet,
}

impl Reconfigurer {
    pub fn new(
        loader: Box<dyn ConfigLoader + Send>,
        table: Arc<Mutex<ProcessTable>>,
        poll_set: PollSet,
    ) -> Self {
        Self {
            loader,
            table,
            poll_set,
        }
    }

    pub fn run(&self) -> Result<ReloadSummary, ReloadError> {
        let config = self.loader.load()?;

        let mut table = self.table.lock().map_err(|_| ReloadError::TablePoisoned)?;

        // fallible phase: decide keep-or-rebuild without touching the
        // live table, so an error here aborts with nothing half-applied
        let mut kept_names: Vec<String> = Vec::new();
        let mut new_groups: Vec<ProcessGroup> = Vec::new();
        for program in config.programs {
            if is_unchanged(&table, &program) {
                kept_names.push(program.name.to_string());
            } else {
                new_groups.push(ProcessGroup::new(program)?);
            }
        }

        // infallible phase: move, insert, stop the leftovers, swap
        let mut candidate = ProcessTable::new();
        let kept = kept_names.len();
        let added = new_groups.len();
        for name in kept_names {
            if let Some(live) = table.take(&name) {
                candidate.insert(live);
            }
        }
        for group in new_groups {
            candidate.insert(group);
        }

        let stale: Vec<String> = table.names().cloned().collect();
        let removed = stale.len();
        for name in stale {
            if let Some(mut group) = table.take(&name) {
                self.stop_group(&mut group);
            }
        }

        *table = candidate;
        let summary = ReloadSummary {
            kept,
            added,
            removed,
        };
        info!(
            kept = summary.kept,
            added = summary.added,
            removed = summary.removed,
            "reload applied"
        );
        Ok(summary)
    }

    /// A stale group is no longer walked by the supervisor, so its
    /// replicas are killed and reaped right here rather than left as
    /// zombies.
    fn stop_group(&self, group: &mut ProcessGroup) {
        let name = group.config().name.to_string();
        for replica in group.replicas_mut() {
            for pipe in replica.take_pipes() {
                self.poll_set.remove(pipe.as_raw_fd());
            }
            let Some(pid) = replica.pid() else {
                continue;
            };
            if let Err(err) = replica.kill_hard() {
                warn!(program = %name, "kill during reload failed: {err}");
                continue;
            }
            if let Err(err) = waitpid(pid, None) {
                warn!(program = %name, "reap during reload failed: {err}");
            }
        }
        info!(program = %name, "group removed by reload");
    }
}

fn is_unchanged(table: &ProcessTable, program: &ProgramConfig) -> bool {
    table
        .iter()
        .find(|(name, _)| name.as_str() == &*program.name)
        .map(|(_, group)| group.config() == program)
        .unwrap_or(false)
}
