use std::sync::atomic::{AtomicBool, Ordering::Relaxed};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_reload_signal(_: nix::libc::c_int) {
    RELOAD_REQUESTED.store(true, Relaxed);
}

extern "C" fn handle_shutdown_signal(_: nix::libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Relaxed);
}

/// Installs the daemon's handlers: SIGHUP latches a reload, SIGTERM and
/// SIGINT latch a shutdown, SIGPIPE is ignored so a vanished client is an
/// io error rather than a death sentence. Handlers only set flags; real
/// work happens in the event loop. SA_RESTART is deliberately absent so a
/// signal interrupts the poll.
pub fn install_daemon_handlers() -> Result<(), nix::Error> {
    let reload = SigAction::new(
        SigHandler::Handler(handle_reload_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let shutdown = SigAction::new(
        SigHandler::Handler(handle_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGHUP, &reload)?;
        sigaction(Signal::SIGTERM, &shutdown)?;
        sigaction(Signal::SIGINT, &shutdown)?;
        sigaction(Signal::SIGPIPE, &ignore)?;
    }
    Ok(())
}

/// Latches a reload exactly as SIGHUP would; used by the `reload` command.
pub fn request_reload() {
    RELOAD_REQUESTED.store(true, Relaxed);
}

/// Consumes the reload latch.
pub fn take_reload_request() -> bool {
    RELOAD_REQUESTED.swap(false, Relaxed)
}

/// Consumes the shutdown latch.
pub fn take_shutdown_request() -> bool {
    SHUTDOWN_REQUESTED.swap(false, Relaxed)
}
