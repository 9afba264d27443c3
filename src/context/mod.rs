use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Cancellation signal shared by the reactor, the supervisor worker and the
/// signal handlers. Cloning hands out another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownContext(Arc<(Mutex<bool>, Condvar)>);

impl ShutdownContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cancellation flag and notifies every thread blocked in
    /// [`ShutdownContext::wait`].
    pub fn cancel(&self) {
        let (lck, cvar) = &*self.0;
        let mut cancelled = match lck.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lck, _) = &*self.0;
        match lck.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Blocks until cancelled or until `timeout` elapses. Returns whether
    /// the context was cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lck, cvar) = &*self.0;
        let guard = match lck.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match cvar.wait_timeout_while(guard, timeout, |cancelled| !*cancelled) {
            Ok((cancelled, _)) => *cancelled,
            Err(poisoned) => *poisoned.into_inner().0,
        }
    }
}
