use std::path::PathBuf;

use clap::Parser;

use taskmaster::daemon::{Daemon, DaemonOptions, DEFAULT_PID_PATH, DEFAULT_SOCKET_PATH};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)] // Read from `Cargo.toml`
struct Cli {
    /// Path to the program configuration file
    #[arg(short, long, default_value = "/etc/taskmaster/config.yaml")]
    config: PathBuf,

    /// Path of the control socket
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Path of the pid file
    #[arg(long, default_value = DEFAULT_PID_PATH)]
    pid_file: PathBuf,

    /// Append the daemon log here instead of the default location
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Stay in the foreground instead of daemonizing
    #[arg(short = 'n', long)]
    foreground: bool,
}

fn main() {
    let cli = Cli::parse();
    let daemon = Daemon::new(DaemonOptions {
        config_path: cli.config,
        socket_path: cli.socket,
        pid_path: cli.pid_file,
        log_path: cli.log_file,
        foreground: cli.foreground,
    });
    if let Err(err) = daemon.start() {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
