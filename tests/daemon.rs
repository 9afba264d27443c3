//! End-to-end scenarios: a full daemon (reactor + supervisor) running in
//! this process against a scratch socket, driven through the control
//! channel exactly like `taskmasterctl` would.
//!
//! The reload latch is process-wide (it doubles as the SIGHUP flag), so
//! only one daemon may run at a time: every test is `#[serial]`.

use std::fs;
use std::io::Read;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread::{self, sleep, JoinHandle};
use std::time::{Duration, Instant};

use serial_test::serial;
use tempfile::TempDir;

use taskmaster::client::ControlClient;
use taskmaster::daemon::DaemonError;
use taskmaster::{Daemon, DaemonOptions};

struct DaemonFixture {
    dir: TempDir,
    handle: Option<JoinHandle<Result<(), DaemonError>>>,
}

impl DaemonFixture {
    fn start(config_yaml: &str) -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("config.yaml"), config_yaml).unwrap();

        let options = DaemonOptions {
            config_path: dir.path().join("config.yaml"),
            socket_path: dir.path().join("taskmasterd.sock"),
            pid_path: dir.path().join("taskmasterd.pid"),
            log_path: Some(dir.path().join("taskmasterd.log")),
            foreground: true,
        };
        let handle = thread::spawn(move || Daemon::new(options).start());

        let fixture = Self {
            dir,
            handle: Some(handle),
        };
        fixture.wait_for(|| fixture.socket_path().exists());
        fixture
    }

    fn socket_path(&self) -> PathBuf {
        self.dir.path().join("taskmasterd.sock")
    }

    fn config_path(&self) -> PathBuf {
        self.dir.path().join("config.yaml")
    }

    fn client(&self) -> ControlClient {
        ControlClient::connect(&self.socket_path()).unwrap()
    }

    fn wait_for(&self, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition never became true");
            sleep(Duration::from_millis(25));
        }
    }

    /// Polls `status` until the predicate accepts the output.
    fn wait_for_status(&self, mut accept: impl FnMut(&str) -> bool) -> String {
        let mut client = self.client();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = client.one_shot("status").unwrap();
            if accept(&status) {
                return status;
            }
            assert!(
                Instant::now() < deadline,
                "status never matched; last:\n{status}"
            );
            sleep(Duration::from_millis(50));
        }
    }

    fn quit(mut self) {
        let reply = self.client().one_shot("quit").unwrap();
        assert_eq!(reply.trim(), "Bye");
        let result = self.handle.take().unwrap().join().unwrap();
        result.unwrap();
        assert!(!self.socket_path().exists());
        assert!(!self.dir.path().join("taskmasterd.pid").exists());
    }
}

/// Pids rendered for one group's section of a `status` response.
fn section_pids(status: &str, group: &str) -> Vec<String> {
    let mut pids = Vec::new();
    let mut in_section = false;
    for line in status.lines() {
        if line == format!("{group}:") {
            in_section = true;
            continue;
        }
        if !line.starts_with("  ") {
            in_section = false;
            continue;
        }
        if in_section {
            let pid = line
                .trim_start()
                .trim_start_matches('(')
                .split(')')
                .next()
                .unwrap()
                .to_string();
            pids.push(pid);
        }
    }
    pids
}

#[test]
#[serial]
fn happy_path_two_replicas_reach_running() {
    let daemon = DaemonFixture::start(
        r#"
process:
  web:
    cmd: "/bin/sleep 3600"
    numprocs: 2
    autostart: true
    starttime: 1
    autorestart: true
"#,
    );

    let status = daemon.wait_for_status(|s| s.matches("(Running)").count() == 2);
    let pids = section_pids(&status, "web");
    assert_eq!(pids.len(), 2);
    for pid in pids {
        assert!(pid.parse::<u32>().is_ok(), "expected a pid, got `{pid}`");
    }

    daemon.quit();
}

#[test]
#[serial]
fn flapping_start_ends_aborted() {
    let daemon = DaemonFixture::start(
        r#"
process:
  flap:
    cmd: "/bin/false"
    starttime: 1
    startretries: 3
"#,
    );

    let status =
        daemon.wait_for_status(|s| s.contains("(Stopped)") && s.contains("aborted"));
    assert!(status.contains("exited unexpectedly"));

    daemon.quit();
}

#[test]
#[serial]
fn graceful_stop_escalates_to_kill() {
    let daemon = DaemonFixture::start(
        r#"
process:
  stubborn:
    cmd: "/bin/sh -c 'trap \"\" INT; exec sleep 3600'"
    stopsignal: INT
    stoptime: 2
"#,
    );
    daemon.wait_for_status(|s| s.contains("(Running)"));

    let reply = daemon.client().one_shot("stop stubborn").unwrap();
    assert_eq!(reply.trim(), "stubborn: stop requested");

    let started = Instant::now();
    let status = daemon.wait_for_status(|s| s.contains("(Stopped)"));
    let elapsed = started.elapsed();

    assert!(status.contains("killed"), "expected a kill: {status}");
    // the stop signal is ignored, so the whole stoptime grace must pass
    assert!(elapsed >= Duration::from_secs(2), "killed too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(6), "killed too late: {elapsed:?}");

    daemon.quit();
}

#[test]
#[serial]
fn stop_and_start_round_trip() {
    let daemon = DaemonFixture::start(
        r#"
process:
  web:
    cmd: "/bin/sleep 3600"
"#,
    );
    daemon.wait_for_status(|s| s.contains("(Running)"));

    daemon.client().one_shot("stop web").unwrap();
    daemon.wait_for_status(|s| s.contains("(Stopped)"));

    daemon.client().one_shot("start web").unwrap();
    daemon.wait_for_status(|s| s.contains("(Running)"));

    daemon.quit();
}

#[test]
#[serial]
fn restart_changes_the_pid() {
    let daemon = DaemonFixture::start(
        r#"
process:
  web:
    cmd: "/bin/sleep 3600"
"#,
    );
    let status = daemon.wait_for_status(|s| s.contains("(Running)"));
    let old_pid = section_pids(&status, "web")[0].clone();

    daemon.client().one_shot("restart web").unwrap();
    let status = daemon.wait_for_status(|s| {
        s.contains("(Running)") && section_pids(s, "web")[0] != old_pid
    });
    assert_ne!(section_pids(&status, "web")[0], old_pid);

    daemon.quit();
}

#[test]
#[serial]
fn reload_preserves_unchanged_programs() {
    let daemon = DaemonFixture::start(
        r#"
process:
  alpha:
    cmd: "/bin/sleep 3600"
  beta:
    cmd: "/bin/sleep 3600"
"#,
    );
    let status = daemon.wait_for_status(|s| s.matches("(Running)").count() == 2);
    let alpha_pid = section_pids(&status, "alpha")[0].clone();
    let beta_pid = section_pids(&status, "beta")[0].clone();

    // beta's command changes, alpha stays bit-identical
    fs::write(
        daemon.config_path(),
        r#"
process:
  alpha:
    cmd: "/bin/sleep 3600"
  beta:
    cmd: "/bin/sleep 1800"
"#,
    )
    .unwrap();

    let ack = daemon.client().one_shot("reload").unwrap();
    assert_eq!(ack.trim(), "reload successful (kept 1, new 1, removed 0)");

    let status = daemon.wait_for_status(|s| {
        s.matches("(Running)").count() == 2 && section_pids(s, "beta")[0] != beta_pid
    });
    assert_eq!(section_pids(&status, "alpha")[0], alpha_pid);

    daemon.quit();
}

#[test]
#[serial]
fn reload_with_a_broken_config_preserves_the_table() {
    let daemon = DaemonFixture::start(
        r#"
process:
  web:
    cmd: "/bin/sleep 3600"
"#,
    );
    let status = daemon.wait_for_status(|s| s.contains("(Running)"));
    let pid = section_pids(&status, "web")[0].clone();

    fs::write(daemon.config_path(), "process:\n  web:\n    nope: true\n").unwrap();

    let ack = daemon.client().one_shot("reload").unwrap();
    assert!(ack.starts_with("reload failed:"), "got `{ack}`");

    let status = daemon.client().one_shot("status").unwrap();
    assert_eq!(section_pids(&status, "web")[0], pid);

    daemon.quit();
}

#[test]
#[serial]
fn attach_streams_output_until_detach() {
    let daemon = DaemonFixture::start(
        r#"
process:
  echoer:
    cmd: "/bin/sh -c 'while true; do echo hello; sleep 1; done'"
"#,
    );
    daemon.wait_for_status(|s| s.contains("(Running)"));

    let mut stream = UnixStream::connect(daemon.socket_path()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(1)))
        .unwrap();
    stream.write_all(b"attach echoer\n").unwrap();

    let mut collected = String::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut chunk = [0u8; 1024];
    while !collected.contains("hello") {
        assert!(Instant::now() < deadline, "no output arrived: {collected}");
        if let Ok(n) = stream.read(&mut chunk) {
            collected.push_str(&String::from_utf8_lossy(&chunk[..n]));
        }
    }
    assert!(collected.contains("attached: echoer"));

    stream.write_all(b"detach echoer\n").unwrap();
    // drain what was in flight before the detach took effect
    loop {
        match stream.read(&mut chunk) {
            Ok(n) if n > 0 => continue,
            _ => break,
        }
    }
    // after the drain the program keeps running but nothing arrives here
    sleep(Duration::from_millis(1500));
    match stream.read(&mut chunk) {
        Ok(n) => assert_eq!(n, 0, "output kept flowing after detach"),
        Err(err) => assert!(
            matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            "unexpected read error: {err}"
        ),
    }

    let status = daemon.client().one_shot("status").unwrap();
    assert!(status.contains("(Running)"));

    daemon.quit();
}

#[test]
#[serial]
fn protocol_diagnostics() {
    let daemon = DaemonFixture::start(
        r#"
process:
  web:
    cmd: "/bin/sleep 3600"
"#,
    );

    let mut client = daemon.client();
    assert_eq!(
        client.one_shot("frobnicate").unwrap().trim(),
        "unknown command: frobnicate"
    );
    assert_eq!(
        client.one_shot("start").unwrap().trim(),
        "usage: start <name>"
    );
    assert_eq!(
        client.one_shot("start ghost").unwrap().trim(),
        "no such process: ghost"
    );

    daemon.quit();
}

#[test]
#[serial]
fn unexpected_exit_restarts_once() {
    // exits 2 (not in exitcodes) the first run, 0 once the marker exists
    let marker_dir = TempDir::new().unwrap();
    let marker = marker_dir.path().join("ran_once");
    let config = format!(
        r#"
process:
  once:
    cmd: "/bin/sh -c 'if [ -e {marker} ]; then exit 0; else touch {marker}; exit 2; fi'"
    autorestart: unexpected
"#,
        marker = marker.display()
    );
    let daemon = DaemonFixture::start(&config);

    daemon.wait_for_status(|s| s.contains("(Stopped)") && !s.contains("aborted"));
    // settle: after the expected exit of the restarted run, no third run
    sleep(Duration::from_millis(500));
    let status = daemon.client().one_shot("status").unwrap();
    assert!(status.contains("(Stopped)"));
    assert!(!status.contains("exited unexpectedly"), "got: {status}");
    assert!(marker.exists());

    daemon.quit();
}

#[test]
#[serial]
fn bad_config_fails_startup() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("config.yaml"), "process:\n  bad name:\n    cmd: x\n").unwrap();

    let result = Daemon::new(DaemonOptions {
        config_path: dir.path().join("config.yaml"),
        socket_path: dir.path().join("sock"),
        pid_path: dir.path().join("pid"),
        log_path: None,
        foreground: true,
    })
    .start();
    assert!(matches!(result, Err(DaemonError::Config(_))));
}
