//! Shell-side signal watching
//!
//! In raw mode the kernel never turns Ctrl+C/Ctrl+Z into signals; the REPL
//! sees the bytes and asks the job manager to deliver them. This watcher
//! covers the remaining cases: SIGCHLD nudging the event loop, and fatal
//! signals to the shell itself, where the terminal is restored best-effort
//! before shutdown.

use crate::terminal;
use anyhow::Result;
use signal_hook::consts::{SIGCHLD, SIGHUP, SIGINT, SIGTERM, SIGTSTP, SIGTTIN, SIGTTOU};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

/// The last signal delivered to the shell itself (0 if none)
static SIGNAL_NUMBER: AtomicI32 = AtomicI32::new(0);

/// Watcher state shared between the main thread and the signal thread
#[derive(Clone)]
pub struct SignalWatcher {
    shutdown_flag: Arc<AtomicBool>,
    sigchld_flag: Arc<AtomicBool>,
}

impl SignalWatcher {
    pub fn new() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            sigchld_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install the watcher thread. Fatal signals restore the terminal
    /// before the shutdown flag is raised so the user never lands on a
    /// broken prompt.
    pub fn setup(&self) -> Result<()> {
        let mut signals =
            Signals::new([SIGINT, SIGTERM, SIGHUP, SIGCHLD, SIGTSTP, SIGTTIN, SIGTTOU])?;
        let shutdown_flag = Arc::clone(&self.shutdown_flag);
        let sigchld_flag = Arc::clone(&self.sigchld_flag);

        thread::spawn(move || {
            for sig in signals.forever() {
                match sig {
                    SIGTERM | SIGHUP => {
                        SIGNAL_NUMBER.store(sig, Ordering::SeqCst);
                        terminal::emergency_restore();
                        shutdown_flag.store(true, Ordering::SeqCst);
                    }
                    SIGINT => {
                        SIGNAL_NUMBER.store(sig, Ordering::SeqCst);
                    }
                    SIGCHLD => {
                        // A child changed state; the event loop should run
                        sigchld_flag.store(true, Ordering::SeqCst);
                    }
                    SIGTSTP | SIGTTIN | SIGTTOU => {
                        // Job-control signals aimed at the shell are ignored;
                        // the manager mediates them explicitly
                        SIGNAL_NUMBER.store(sig, Ordering::SeqCst);
                    }
                    _ => {}
                }
            }
        });

        Ok(())
    }

    /// Check if shutdown was requested
    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    /// Check if SIGCHLD was received since the last clear
    pub fn sigchld_received(&self) -> bool {
        self.sigchld_flag.load(Ordering::SeqCst)
    }

    /// Clear the SIGCHLD flag
    pub fn clear_sigchld(&self) {
        self.sigchld_flag.store(false, Ordering::SeqCst);
    }

    /// Get the signal number last delivered to the shell
    pub fn signal_number(&self) -> i32 {
        SIGNAL_NUMBER.load(Ordering::SeqCst)
    }

    /// Reset the watcher state
    pub fn reset(&self) {
        SIGNAL_NUMBER.store(0, Ordering::SeqCst);
        self.shutdown_flag.store(false, Ordering::SeqCst);
        self.sigchld_flag.store(false, Ordering::SeqCst);
    }

    /// Shell exit code for the received signal (128 + signal number)
    pub fn exit_code(&self) -> i32 {
        match self.signal_number() {
            0 => 0,
            n => 128 + n,
        }
    }
}

impl Default for SignalWatcher {
    fn default() -> Self {
        Self::new()
    }
}
