//! Process spawning and race-free exit notification
//!
//! The spawner forks, wires the child's descriptors 0..5 to the six
//! channels, and execs. The parent side keeps a pidfd where the kernel
//! offers one, so exit notification survives pid reuse; otherwise it falls
//! back to the plain pid and the manager's waitpid sweep.

use crate::error::{Error, Result};
use crate::stream::StreamController;
use crate::terminal::TerminalControl;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{self, ForkResult, Pid};
use std::ffi::CString;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::PathBuf;

/// Exit code a child reports when exec fails.
pub const EXEC_FAILURE_CODE: i32 = 127;

/// Spawn configuration for a single job.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Program to execute, resolved against PATH.
    pub command: String,
    /// Arguments, not including the program name.
    pub args: Vec<String>,
    /// Working directory for the child; inherits the parent's when unset.
    pub working_dir: Option<PathBuf>,
    /// Explicit environment; inherits the parent's when unset.
    pub env: Option<Vec<(String, String)>>,
    /// Start in the background (no terminal handoff).
    pub background: bool,
    /// Put the child in its own process group.
    pub new_process_group: bool,
}

impl SpawnOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: None,
            background: false,
            new_process_group: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    /// The command line as the user wrote it, for job listings.
    pub fn command_line(&self) -> String {
        let mut line = self.command.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Process reference supporting polled exit notification, signal delivery
/// and idempotent close. Race-free when the kernel hands out a pidfd.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pid,
    pidfd: Option<OwnedFd>,
}

impl ProcessHandle {
    /// Wrap a freshly forked child, acquiring a pidfd when available.
    pub fn open(pid: Pid) -> Self {
        Self {
            pid,
            pidfd: pidfd_open(pid),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Descriptor that becomes readable when the process exits, if the
    /// host granted one.
    pub fn exit_fd(&self) -> Option<BorrowedFd<'_>> {
        self.pidfd.as_ref().map(|fd| fd.as_fd())
    }

    pub fn has_exit_fd(&self) -> bool {
        self.pidfd.is_some()
    }

    /// Deliver a signal to the process.
    pub fn deliver(&self, sig: Signal) -> Result<()> {
        signal::kill(self.pid, sig).map_err(|e| Error::SpawnFailed {
            command: format!("kill {}", self.pid),
            source: e,
        })
    }

    /// Release the exit-notification descriptor. Idempotent.
    pub fn close(&mut self) {
        self.pidfd.take();
    }
}

#[cfg(target_os = "linux")]
fn pidfd_open(pid: Pid) -> Option<OwnedFd> {
    let fd = unsafe { nix::libc::syscall(nix::libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if fd >= 0 {
        Some(unsafe { OwnedFd::from_raw_fd(fd as i32) })
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
fn pidfd_open(_pid: Pid) -> Option<OwnedFd> {
    None
}

/// Fork and exec a child wired to the controller's six channels.
///
/// The controller must already hold created pipes. On return the parent
/// side is fully set up: child endpoints closed, drainers started,
/// foreground mode applied, and for foreground jobs the terminal handed to
/// the child's process group.
pub fn spawn_child(
    options: &SpawnOptions,
    streams: &mut StreamController,
    terminal: &TerminalControl,
) -> Result<ProcessHandle> {
    let spawn_err = |source| Error::SpawnFailed {
        command: options.command.clone(),
        source,
    };

    // Prepare exec arguments before forking; allocating in the child
    // between fork and exec is off-limits.
    let program = CString::new(options.command.as_str()).map_err(|_| spawn_err(nix::Error::EINVAL))?;
    let mut argv = vec![program.clone()];
    for arg in &options.args {
        argv.push(CString::new(arg.as_str()).map_err(|_| spawn_err(nix::Error::EINVAL))?);
    }
    let envp: Option<Vec<CString>> = match &options.env {
        Some(vars) => {
            let mut out = Vec::with_capacity(vars.len());
            for (k, v) in vars {
                out.push(
                    CString::new(format!("{}={}", k, v))
                        .map_err(|_| spawn_err(nix::Error::EINVAL))?,
                );
            }
            Some(out)
        }
        None => None,
    };
    let workdir = match &options.working_dir {
        Some(dir) => Some(
            CString::new(dir.to_string_lossy().as_bytes())
                .map_err(|_| spawn_err(nix::Error::EINVAL))?,
        ),
        None => None,
    };

    match unsafe { unistd::fork() }.map_err(spawn_err)? {
        ForkResult::Child => child_after_fork(
            options,
            streams,
            terminal,
            &program,
            &argv,
            envp.as_deref(),
            workdir.as_deref(),
        ),
        ForkResult::Parent { child } => {
            let handle = ProcessHandle::open(child);

            streams.setup_parent();
            streams.set_foreground_mode(!options.background);
            streams.start_draining();

            if !options.background {
                // Mirror the child's own tcsetpgrp; whichever runs first wins
                // the race identically.
                let _ = terminal.give_terminal_to(child);
            }

            Ok(handle)
        }
    }
}

/// Child-side setup between fork and exec. Never returns; exits 127 when
/// exec fails and 126 when channel setup fails.
fn child_after_fork(
    options: &SpawnOptions,
    streams: &mut StreamController,
    terminal: &TerminalControl,
    program: &CString,
    argv: &[CString],
    envp: Option<&[CString]>,
    workdir: Option<&std::ffi::CStr>,
) -> ! {
    if options.new_process_group {
        let _ = unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0));
    }

    if !options.background && terminal.is_interactive() {
        let _ = terminal.give_terminal_to(unistd::getpid());
    }

    // Terminal-generated signals go back to their default dispositions;
    // the shell's own handlers must not leak into the child.
    for sig in [
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGTSTP,
        Signal::SIGTTIN,
        Signal::SIGTTOU,
        Signal::SIGCHLD,
    ] {
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }

    if streams.setup_child().is_err() {
        unsafe { nix::libc::_exit(126) };
    }

    if let Some(dir) = workdir {
        if unsafe { nix::libc::chdir(dir.as_ptr()) } != 0 {
            unsafe { nix::libc::_exit(EXEC_FAILURE_CODE) };
        }
    }

    let _ = match envp {
        Some(env) => unistd::execvpe(program, argv, env),
        None => unistd::execvp(program, argv),
    };

    unsafe { nix::libc::_exit(EXEC_FAILURE_CODE) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_options_builder() {
        let opts = SpawnOptions::new("/bin/echo")
            .arg("hello")
            .arg("world")
            .background(true);
        assert_eq!(opts.command, "/bin/echo");
        assert_eq!(opts.args, vec!["hello", "world"]);
        assert!(opts.background);
        assert_eq!(opts.command_line(), "/bin/echo hello world");
    }

    #[test]
    fn test_process_handle_close_idempotent() {
        // Our own pid is as good as any for handle bookkeeping
        let mut handle = ProcessHandle::open(unistd::getpid());
        handle.close();
        assert!(!handle.has_exit_fd());
        handle.close();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pidfd_available_for_live_process() {
        let handle = ProcessHandle::open(unistd::getpid());
        assert!(handle.has_exit_fd());
    }
}
