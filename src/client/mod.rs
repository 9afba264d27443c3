use std::io::{BufRead, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::time::Duration;

use thiserror::Error;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);
const ATTACH_POLL_TIMEOUT: Duration = Duration::from_millis(200);

const PROMPT: &str = "taskmaster> ";
const HELP_TEXT: &str = "\
available commands:
  status             list every program and replica
  start <name>       start a program's replicas
  stop <name>        stop them gracefully
  restart <name>     stop then start
  reload             re-read the configuration
  attach <name>      stream a program's output (Ctrl-C detaches)
  detach <name>      stop streaming
  quit | exit        shut the daemon down
  help               this text";

/// SIGINT while attached; latched by the handler, consumed by the
/// streaming loop.
static DETACH_REQUESTED: AtomicBool = AtomicBool::new(false);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("cannot connect to `{path}`: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("io error: `{0}`")]
    Io(#[from] std::io::Error),

    #[error("server closed the connection")]
    ServerClosed,
}

/// The `taskmasterctl` side of the control channel: one stream, one
/// command per line, responses printed as they come.
#[derive(Debug)]
pub struct ControlClient {
    stream: UnixStream,
}

impl ControlClient {
    pub fn connect(path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path).map_err(|source| ClientError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { stream })
    }

    /// Sends one command and returns its full response. Used by the
    /// one-shot invocation (`taskmasterctl status`).
    pub fn one_shot(&mut self, line: &str) -> Result<String, ClientError> {
        self.send_line(line)?;
        self.read_response()
    }

    /// The interactive prompt. `help` never leaves the client; `attach`
    /// switches into the streaming loop until SIGINT.
    pub fn run_interactive(&mut self) -> Result<(), ClientError> {
        // the handler only latches the flag; a Ctrl-C outside an attach
        // is consumed and forgotten at the next prompt
        let _ = ctrlc::set_handler(|| DETACH_REQUESTED.store(true, Relaxed));

        let stdin = std::io::stdin();
        let mut input = String::new();
        loop {
            DETACH_REQUESTED.store(false, Relaxed);
            print!("{PROMPT}");
            std::io::stdout().flush()?;

            input.clear();
            if stdin.lock().read_line(&mut input)? == 0 {
                break;
            }
            let line = input.trim();
            if line.is_empty() {
                continue;
            }
            if line == "help" {
                println!("{HELP_TEXT}");
                continue;
            }

            self.send_line(line)?;
            match self.read_response() {
                Ok(response) => print!("{response}"),
                Err(ClientError::ServerClosed) => {
                    println!("connection closed");
                    break;
                }
                Err(err) => return Err(err),
            }

            if line == "quit" || line == "exit" {
                break;
            }
            if let Some(name) = line.strip_prefix("attach ") {
                self.stream_attached(name.trim())?;
            }
        }
        Ok(())
    }

    fn send_line(&mut self, line: &str) -> Result<(), ClientError> {
        self.stream.write_all(line.as_bytes())?;
        self.stream.write_all(b"\n")?;
        Ok(())
    }

    /// One response: a first chunk within a generous timeout, then
    /// whatever trails right behind it. The protocol has no frame marker,
    /// so quiescence is the boundary.
    fn read_response(&mut self) -> Result<String, ClientError> {
        let mut response = Vec::new();
        let mut chunk = [0u8; 65536];

        self.stream.set_read_timeout(Some(RESPONSE_TIMEOUT))?;
        match self.stream.read(&mut chunk) {
            Ok(0) => return Err(ClientError::ServerClosed),
            Ok(n) => response.extend_from_slice(&chunk[..n]),
            Err(err) => return Err(err.into()),
        }

        self.stream.set_read_timeout(Some(DRAIN_TIMEOUT))?;
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&chunk[..n]),
                Err(err) if would_block(&err) => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(String::from_utf8_lossy(&response).to_string())
    }

    /// Prints mirrored output until SIGINT, then detaches and returns to
    /// the prompt. The program itself keeps running.
    fn stream_attached(&mut self, name: &str) -> Result<(), ClientError> {
        DETACH_REQUESTED.store(false, Relaxed);
        self.stream.set_read_timeout(Some(ATTACH_POLL_TIMEOUT))?;

        let mut chunk = [0u8; 4096];
        loop {
            if DETACH_REQUESTED.swap(false, Relaxed) {
                self.send_line(&format!("detach {name}"))?;
                // drain the detach acknowledgement and any last output
                let _ = self.read_response();
                println!();
                return Ok(());
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(ClientError::ServerClosed),
                Ok(n) => {
                    std::io::stdout().write_all(&chunk[..n])?;
                    std::io::stdout().flush()?;
                }
                Err(err) if would_block(&err) => continue,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn would_block(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixListener;
    use std::thread;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn connect_failure_names_the_socket() {
        let err = ControlClient::connect(Path::new("/no/such/socket.sock")).unwrap_err();
        assert!(err.to_string().contains("/no/such/socket.sock"));
    }

    #[test]
    fn one_shot_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ctl.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"status\n");
            stream.write_all(b"no programs configured\n").unwrap();
        });

        let mut client = ControlClient::connect(&path).unwrap();
        let response = client.one_shot("status").unwrap();
        assert_eq!(response, "no programs configured\n");
        server.join().unwrap();
    }

    #[test]
    fn one_shot_detects_a_closed_server() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ctl.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let mut client = ControlClient::connect(&path).unwrap();
        match client.one_shot("status") {
            Err(ClientError::ServerClosed) => {}
            // the write may also observe the close first
            Err(ClientError::Io(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        server.join().unwrap();
    }
}
