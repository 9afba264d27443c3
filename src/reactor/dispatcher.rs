use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use tracing::info;

use super::error::{ControlError, ReactorError};
use super::session::ControlSession;
use crate::context::ShutdownContext;
use crate::process::state::{PendingCommand, ProcessState};
use crate::process::table::ProcessTable;
use crate::process::ManagedProcess;
use crate::signal;

/// A parsed control command. `Help` never reaches the daemon in practice
/// (the client renders it locally) and is ignored if it does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Start(String),
    Stop(String),
    Restart(String),
    Reload,
    Quit,
    Attach(String),
    Detach(String),
    Help,
}

impl Command {
    /// Parses one command line. Empty lines parse to `None`.
    pub fn parse(line: &str) -> Result<Option<Command>, ControlError> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();

        let no_args = |command: Command, usage| {
            if args.is_empty() {
                Ok(Some(command))
            } else {
                Err(ControlError::BadArity(usage))
            }
        };
        let one_arg = |make: fn(String) -> Command, usage| {
            if args.len() == 1 {
                Ok(Some(make(args[0].to_string())))
            } else {
                Err(ControlError::BadArity(usage))
            }
        };

        match command {
            "status" => no_args(Command::Status, "status"),
            "reload" => no_args(Command::Reload, "reload"),
            "quit" | "exit" => no_args(Command::Quit, "quit"),
            "help" => no_args(Command::Help, "help"),
            "start" => one_arg(Command::Start, "start <name>"),
            "stop" => one_arg(Command::Stop, "stop <name>"),
            "restart" => one_arg(Command::Restart, "restart <name>"),
            "attach" => one_arg(Command::Attach, "attach <name>"),
            "detach" => one_arg(Command::Detach, "detach <name>"),
            unknown => Err(ControlError::UnknownCommand(unknown.to_string())),
        }
    }
}

/// Routes parsed commands to their handlers. The issuing session travels
/// as an argument so handlers can answer (and `attach` can capture a
/// write handle) without the dispatcher holding per-client state.
pub struct CommandDispatcher {
    table: Arc<Mutex<ProcessTable>>,
    ctx: ShutdownContext,
}

impl CommandDispatcher {
    pub fn new(table: Arc<Mutex<ProcessTable>>, ctx: ShutdownContext) -> Self {
        Self { table, ctx }
    }

    pub fn dispatch(
        &self,
        line: &str,
        session: &mut ControlSession,
    ) -> Result<(), ReactorError> {
        let command = match Command::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(()),
            Err(err) => {
                return session
                    .send(&err.to_string())
                    .map_err(ReactorError::Transport)
            }
        };

        let reply = match command {
            Command::Status => self.status()?,
            Command::Start(name) => self.post(&name, PendingCommand::Start)?,
            Command::Stop(name) => self.post(&name, PendingCommand::Stop)?,
            Command::Restart(name) => self.post(&name, PendingCommand::Restart)?,
            Command::Attach(name) => self.attach(&name, session)?,
            Command::Detach(name) => self.detach(&name, session)?,
            Command::Reload => {
                info!(session = session.id(), "reload requested");
                session.reload_pending = true;
                signal::request_reload();
                // acknowledged by the reactor once the reconfiguration ran
                return Ok(());
            }
            Command::Quit => {
                info!(session = session.id(), "shutdown requested");
                self.ctx.cancel();
                "Bye".to_string()
            }
            Command::Help => return Ok(()),
        };
        session.send(&reply).map_err(ReactorError::Transport)
    }

    /// Human-readable snapshot of every group and replica.
    fn status(&self) -> Result<String, ReactorError> {
        let table = self.lock_table()?;
        let mut out = String::new();
        for (name, group) in table.iter() {
            let _ = writeln!(out, "{name}:");
            for replica in group.replicas() {
                let _ = writeln!(out, "  {}", render_replica(replica));
            }
        }
        if out.is_empty() {
            out.push_str("no programs configured");
        }
        Ok(out)
    }

    fn post(&self, name: &str, command: PendingCommand) -> Result<String, ReactorError> {
        let mut table = self.lock_table()?;
        let Some(group) = table.get_mut(name) else {
            return Ok(ControlError::NoSuchProcess(name.to_string()).to_string());
        };
        for replica in group.replicas_mut() {
            replica.post_command(command);
        }
        let verb = match command {
            PendingCommand::Start => "start",
            PendingCommand::Stop => "stop",
            PendingCommand::Restart => "restart",
            PendingCommand::None => unreachable!("never posted"),
        };
        info!(program = name, command = verb, "command posted");
        Ok(format!("{name}: {verb} requested"))
    }

    fn attach(
        &self,
        name: &str,
        session: &ControlSession,
    ) -> Result<String, ReactorError> {
        let mut table = self.lock_table()?;
        let Some(group) = table.get_mut(name) else {
            return Ok(ControlError::NoSuchProcess(name.to_string()).to_string());
        };
        for replica in group.replicas_mut() {
            replica.attach(session.handle());
        }
        info!(program = name, session = session.id(), "session attached");
        Ok(format!("attached: {name}"))
    }

    fn detach(
        &self,
        name: &str,
        session: &ControlSession,
    ) -> Result<String, ReactorError> {
        let mut table = self.lock_table()?;
        let Some(group) = table.get_mut(name) else {
            return Ok(ControlError::NoSuchProcess(name.to_string()).to_string());
        };
        for replica in group.replicas_mut() {
            replica.detach(session.id());
        }
        info!(program = name, session = session.id(), "session detached");
        Ok(format!("detached: {name}"))
    }

    fn lock_table(&self) -> Result<std::sync::MutexGuard<'_, ProcessTable>, ReactorError> {
        self.table.lock().map_err(|_| ReactorError::TablePoisoned)
    }
}

fn render_replica(replica: &ManagedProcess) -> String {
    let pid = replica
        .pid()
        .map_or_else(|| "-".to_string(), |pid| pid.as_raw().to_string());
    let mut line = format!("({pid}) - ({})", replica.state());
    if replica.state() == ProcessState::Stopped {
        let status = replica.status();
        if status.exitstatus.is_some() && !replica.expected_exit() {
            line.push_str(" - exited unexpectedly");
        }
        if status.killed {
            line.push_str(" - killed");
        }
        if replica.aborted() {
            line.push_str(" - aborted");
        }
    }
    line
}
