//! Signal-driven shutdown.
//!
//! SIGINT and SIGTERM set a shared flag; the handler does nothing else. The
//! accept loop checks the flag on every iteration. If the kernel delivers the
//! signal to the control thread its poll wait is cut short; otherwise the
//! flag is seen within one poll interval.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Flag the process signal handler writes to.
static SIGNAL_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_signal(_sig: libc::c_int) {
    if let Some(flag) = SIGNAL_FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// One-shot cancellation flag shared between the signal handler, the accept
/// loop and anything else that wants to stop the server.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// A signal that only fires through [`trigger`](Self::trigger).
    pub fn new() -> Self {
        Self::default()
    }

    /// Route SIGINT and SIGTERM to the process-wide shutdown flag.
    ///
    /// Repeated calls return handles to the same flag.
    pub fn install() -> io::Result<Self> {
        let flag = Arc::clone(SIGNAL_FLAG.get_or_init(|| Arc::new(AtomicBool::new(false))));

        for sig in [libc::SIGINT, libc::SIGTERM] {
            let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            // SAFETY: `on_signal` only performs an atomic store, which is
            // async-signal-safe.
            if unsafe { libc::signal(sig, handler) } == libc::SIG_ERR {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(Self { flag })
    }

    /// Request shutdown. Returns `true` only for the call that set the flag.
    pub fn trigger(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_is_idempotent() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        assert!(!signal.is_triggered());

        assert!(clone.trigger());
        assert!(!signal.trigger());
        assert!(signal.is_triggered());
    }

    #[test]
    fn test_independent_signals() {
        let a = ShutdownSignal::new();
        let b = ShutdownSignal::new();
        a.trigger();
        assert!(!b.is_triggered());
    }

    #[test]
    fn test_sigterm_sets_flag() {
        let signal = ShutdownSignal::install().unwrap();
        let again = ShutdownSignal::install().unwrap();
        assert!(!signal.is_triggered());

        // SAFETY: raising a signal whose handler was just installed.
        assert_eq!(unsafe { libc::raise(libc::SIGTERM) }, 0);

        assert!(signal.is_triggered());
        assert!(again.is_triggered());
    }
}
