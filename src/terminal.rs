//! Terminal control: foreground process groups and termios modes
//!
//! The controlling terminal is a single mutable global; exactly one process
//! group owns it at a time. The job manager is the sole arbiter and goes
//! through this module for every handoff. Mode snapshots are opaque to
//! callers and restored verbatim.

use anyhow::{anyhow, Result};
use nix::libc;
use nix::unistd::{getpgrp, Pid};
use std::os::unix::io::RawFd;
use std::sync::Mutex;

/// Opaque snapshot of terminal modes.
#[derive(Clone, Copy)]
pub struct TerminalModes(libc::termios);

impl TerminalModes {
    /// Capture the current modes of a terminal descriptor.
    pub fn capture(fd: RawFd) -> Result<Self> {
        let mut modes = unsafe { std::mem::zeroed::<libc::termios>() };
        if unsafe { libc::tcgetattr(fd, &mut modes) } != 0 {
            return Err(anyhow!("tcgetattr failed"));
        }
        Ok(Self(modes))
    }

    /// Apply this snapshot after pending output has drained.
    pub fn restore(&self, fd: RawFd) -> Result<()> {
        if unsafe { libc::tcsetattr(fd, libc::TCSADRAIN, &self.0) } != 0 {
            return Err(anyhow!("tcsetattr failed"));
        }
        Ok(())
    }

    /// Derive the raw-mode variant: no canonical line mode, no echo, no
    /// signal generation, no XON/XOFF, no CR to LF translation. Minimum
    /// read one byte, no inter-byte timeout.
    pub fn raw(&self) -> Self {
        let mut raw = self.0;
        raw.c_lflag &= !(libc::ICANON | libc::ECHO | libc::ISIG);
        raw.c_iflag &= !(libc::IXON | libc::ICRNL);
        raw.c_cc[libc::VMIN] = 1;
        raw.c_cc[libc::VTIME] = 0;
        Self(raw)
    }

    /// Apply immediately, flushing pending input. Used when entering raw
    /// mode so stale line-buffered input does not leak through.
    pub fn apply_flush(&self, fd: RawFd) -> Result<()> {
        if unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &self.0) } != 0 {
            return Err(anyhow!("tcsetattr failed"));
        }
        Ok(())
    }
}

/// Modes to restore if the shell dies on a fatal-signal path. Set at
/// raw-mode entry, cleared at exit.
static EMERGENCY_RESTORE: Mutex<Option<(RawFd, TerminalModes)>> = Mutex::new(None);

/// Arm the best-effort restoration hook.
pub fn arm_emergency_restore(fd: RawFd, modes: TerminalModes) {
    *EMERGENCY_RESTORE.lock().unwrap() = Some((fd, modes));
}

/// Disarm the hook after a clean raw-mode exit.
pub fn disarm_emergency_restore() {
    *EMERGENCY_RESTORE.lock().unwrap() = None;
}

/// Restore the terminal from the armed snapshot, if any. Called from the
/// signal watcher thread when the shell itself is going down.
pub fn emergency_restore() {
    if let Ok(guard) = EMERGENCY_RESTORE.lock() {
        if let Some((fd, modes)) = *guard {
            let _ = modes.restore(fd);
        }
    }
}

/// Scope guard restoring captured modes on every exit path.
pub struct RawModeGuard {
    fd: RawFd,
    saved: TerminalModes,
}

impl RawModeGuard {
    pub fn new(fd: RawFd, saved: TerminalModes) -> Self {
        Self { fd, saved }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = self.saved.restore(self.fd);
        disarm_emergency_restore();
    }
}

/// Terminal control for managing foreground process groups
#[derive(Clone)]
pub struct TerminalControl {
    shell_pgid: Pid,
    terminal_fd: RawFd,
    is_interactive: bool,
}

impl TerminalControl {
    /// Probe the controlling terminal. Prefers /dev/tty, falls back to
    /// stdin; non-interactive when neither answers termios queries.
    pub fn new() -> Self {
        let terminal_fd = Self::open_tty().unwrap_or(libc::STDIN_FILENO);
        let shell_pgid = getpgrp();

        let is_interactive = unsafe { libc::isatty(terminal_fd) } == 1
            && TerminalModes::capture(terminal_fd).is_ok();

        Self {
            shell_pgid,
            terminal_fd,
            is_interactive,
        }
    }

    fn open_tty() -> Option<RawFd> {
        let path = std::ffi::CString::new("/dev/tty").ok()?;
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
        if fd >= 0 {
            Some(fd)
        } else {
            None
        }
    }

    fn tcsetpgrp_raw(fd: RawFd, pgid: i32) -> Result<()> {
        if unsafe { libc::tcsetpgrp(fd, pgid) } != 0 {
            Err(anyhow!("tcsetpgrp failed"))
        } else {
            Ok(())
        }
    }

    fn tcgetpgrp_raw(fd: RawFd) -> Result<i32> {
        let pgid = unsafe { libc::tcgetpgrp(fd) };
        if pgid < 0 {
            Err(anyhow!("tcgetpgrp failed"))
        } else {
            Ok(pgid)
        }
    }

    /// Check if the shell is running interactively with terminal control
    pub fn is_interactive(&self) -> bool {
        self.is_interactive
    }

    pub fn fd(&self) -> RawFd {
        self.terminal_fd
    }

    pub fn shell_pgid(&self) -> Pid {
        self.shell_pgid
    }

    /// Give terminal control to the specified process group
    pub fn give_terminal_to(&self, pgid: Pid) -> Result<()> {
        if !self.is_interactive {
            return Ok(()); // Not interactive, nothing to do
        }
        Self::tcsetpgrp_raw(self.terminal_fd, pgid.as_raw())
            .map_err(|e| anyhow!("failed to give terminal to group {}: {}", pgid, e))
    }

    /// Reclaim terminal control for the shell
    pub fn reclaim_terminal(&self) -> Result<()> {
        if !self.is_interactive {
            return Ok(());
        }
        Self::tcsetpgrp_raw(self.terminal_fd, self.shell_pgid.as_raw())
            .map_err(|e| anyhow!("failed to reclaim terminal: {}", e))
    }

    /// Get the current foreground process group
    pub fn foreground_pgid(&self) -> Result<Pid> {
        Self::tcgetpgrp_raw(self.terminal_fd).map(Pid::from_raw)
    }

    /// Snapshot the terminal's current modes. None when non-interactive.
    pub fn save_modes(&self) -> Option<TerminalModes> {
        if !self.is_interactive {
            return None;
        }
        TerminalModes::capture(self.terminal_fd).ok()
    }

    /// Restore a snapshot. No-op when non-interactive.
    pub fn restore_modes(&self, modes: &TerminalModes) -> Result<()> {
        if !self.is_interactive {
            return Ok(());
        }
        modes.restore(self.terminal_fd)
    }
}

impl Default for TerminalControl {
    fn default() -> Self {
        Self::new()
    }
}
