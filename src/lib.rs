//! A supervisor daemon for a configurable set of child programs.
//!
//! `taskmasterd` keeps every configured program's replicas in their wanted
//! state through a two-thread design: a poll(2) reactor on the main thread
//! owns the control socket and the child output pipes, while a supervisor
//! worker ticks each replica's state machine under the shared process
//! table lock. `taskmasterctl` talks to the daemon over a local stream
//! socket.

pub use crate::daemon::{Daemon, DaemonOptions};

pub mod client;
pub mod config;
pub mod context;
pub mod daemon;
pub mod logging;
pub mod process;
pub mod reactor;
pub mod reload;
pub mod signal;
pub mod supervisor;
