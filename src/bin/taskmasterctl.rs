use std::path::PathBuf;

use clap::Parser;

use taskmaster::client::ControlClient;
use taskmaster::daemon::DEFAULT_SOCKET_PATH;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)] // Read from `Cargo.toml`
struct Cli {
    /// Path of the daemon's control socket
    #[arg(short, long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Run a single command and exit instead of opening the prompt
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), taskmaster::client::ClientError> {
    let mut client = ControlClient::connect(&cli.socket)?;
    if cli.command.is_empty() {
        client.run_interactive()
    } else {
        let response = client.one_shot(&cli.command.join(" "))?;
        print!("{response}");
        Ok(())
    }
}
