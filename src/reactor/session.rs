use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

const SESSION_BUFFER_SIZE: usize = 4096;

/// Shareable write half of a session, held by replicas a client attached
/// to. Writes happen only on the reactor thread; the lock exists so the
/// handle can live inside the process table.
#[derive(Clone)]
pub struct SessionHandle {
    id: RawFd,
    stream: Arc<Mutex<UnixStream>>,
}

impl SessionHandle {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            id: stream.as_raw_fd(),
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    pub fn id(&self) -> RawFd {
        self.id
    }

    pub fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut stream = match self.stream.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        stream.write_all(bytes)
    }
}

/// One connected control client: line framing on the way in, raw byte
/// responses on the way out, plus the deferred-reload marker.
pub struct ControlSession {
    handle: SessionHandle,
    buffer: Vec<u8>,
    pub reload_pending: bool,
}

impl ControlSession {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            handle: SessionHandle::new(stream),
            buffer: Vec::new(),
            reload_pending: false,
        }
    }

    pub fn id(&self) -> RawFd {
        self.handle.id()
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Reads once from the socket and returns every complete command line
    /// received so far; a partial line stays buffered. `Ok(None)` means
    /// the peer closed its end.
    pub fn read_commands(&mut self) -> std::io::Result<Option<Vec<String>>> {
        let mut chunk = [0u8; SESSION_BUFFER_SIZE];
        let read = {
            let mut stream = match self.handle.stream.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            stream.read(&mut chunk)?
        };
        if read == 0 {
            return Ok(None);
        }
        self.buffer.extend_from_slice(&chunk[..read]);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..pos]).trim().to_string());
        }
        Ok(Some(lines))
    }

    pub fn send(&self, response: &str) -> std::io::Result<()> {
        self.handle.write(response.as_bytes())?;
        if !response.ends_with('\n') {
            self.handle.write(b"\n")?;
        }
        Ok(())
    }
}
