//! Job lifecycle state machine
//!
//! A pure transition table with no side effects. The job manager consults
//! it and applies terminal handoff, signal delivery and drainer
//! finalization only on valid results.

use crate::error::{Error, Result};
use std::fmt;

/// Job states. NONE is initial; TERMINATED is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[repr(u8)]
pub enum JobState {
    None = 0,
    /// Owns the terminal, receives input
    Foreground,
    /// Runs asynchronously, output buffered
    Background,
    /// Suspended, waiting for resume
    Stopped,
    /// Exited, ready for cleanup
    Terminated,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::None,
        JobState::Foreground,
        JobState::Background,
        JobState::Stopped,
        JobState::Terminated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::None => "None",
            JobState::Foreground => "Foreground",
            JobState::Background => "Background",
            JobState::Stopped => "Stopped",
            JobState::Terminated => "Terminated",
        }
    }

    pub(crate) fn from_u8(value: u8) -> JobState {
        match value {
            1 => JobState::Foreground,
            2 => JobState::Background,
            3 => JobState::Stopped,
            4 => JobState::Terminated,
            _ => JobState::None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events feeding the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobEvent {
    /// New foreground process
    Spawn,
    /// New background process
    SpawnBg,
    /// User interrupt forwarded by the shell
    CtrlC,
    /// User suspend forwarded by the shell
    CtrlZ,
    /// `fg` builtin
    FgCmd,
    /// `bg` builtin
    BgCmd,
    /// Process exited
    ChildExit,
    /// Process stopped by signal
    ChildStop,
    /// Background process tried to read the terminal
    TtyRead,
    /// Advisory timeout; never changes state
    Timeout,
    /// Unrecoverable error; forces termination
    Error,
}

impl JobEvent {
    pub const ALL: [JobEvent; 11] = [
        JobEvent::Spawn,
        JobEvent::SpawnBg,
        JobEvent::CtrlC,
        JobEvent::CtrlZ,
        JobEvent::FgCmd,
        JobEvent::BgCmd,
        JobEvent::ChildExit,
        JobEvent::ChildStop,
        JobEvent::TtyRead,
        JobEvent::Timeout,
        JobEvent::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobEvent::Spawn => "Spawn",
            JobEvent::SpawnBg => "SpawnBg",
            JobEvent::CtrlC => "CtrlC",
            JobEvent::CtrlZ => "CtrlZ",
            JobEvent::FgCmd => "FgCmd",
            JobEvent::BgCmd => "BgCmd",
            JobEvent::ChildExit => "ChildExit",
            JobEvent::ChildStop => "ChildStop",
            JobEvent::TtyRead => "TtyRead",
            JobEvent::Timeout => "Timeout",
            JobEvent::Error => "Error",
        }
    }
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute the next state for a (state, event) pair.
///
/// Total and deterministic: every invalid pair returns
/// [`Error::InvalidTransition`] and leaves the caller's state untouched.
pub fn transition(current: JobState, event: JobEvent) -> Result<JobState> {
    let invalid = || {
        Err(Error::InvalidTransition {
            state: current,
            event,
        })
    };

    // TERMINATED accepts nothing, not even the advisory timeout
    if current == JobState::Terminated {
        return invalid();
    }

    match event {
        // Advisory only
        JobEvent::Timeout => return Ok(current),
        // Forces termination from any live state
        JobEvent::Error => return Ok(JobState::Terminated),
        _ => {}
    }

    match current {
        JobState::None => match event {
            JobEvent::Spawn => Ok(JobState::Foreground),
            JobEvent::SpawnBg => Ok(JobState::Background),
            _ => invalid(),
        },

        JobState::Foreground => match event {
            JobEvent::CtrlZ => Ok(JobState::Stopped),
            JobEvent::CtrlC => Ok(JobState::Terminated),
            JobEvent::ChildExit => Ok(JobState::Terminated),
            JobEvent::ChildStop => Ok(JobState::Stopped),
            _ => invalid(),
        },

        JobState::Background => match event {
            JobEvent::FgCmd => Ok(JobState::Foreground),
            // Resume if stopped; no-op while running
            JobEvent::BgCmd => Ok(JobState::Background),
            JobEvent::ChildExit => Ok(JobState::Terminated),
            JobEvent::ChildStop => Ok(JobState::Stopped),
            // Kernel stops the reader with SIGTTIN
            JobEvent::TtyRead => Ok(JobState::Stopped),
            _ => invalid(),
        },

        JobState::Stopped => match event {
            JobEvent::FgCmd => Ok(JobState::Foreground),
            JobEvent::BgCmd => Ok(JobState::Background),
            JobEvent::CtrlC => Ok(JobState::Terminated),
            // A stopped process can still be killed outright
            JobEvent::ChildExit => Ok(JobState::Terminated),
            _ => invalid(),
        },

        JobState::Terminated => invalid(),
    }
}

/// Check a transition without executing it.
pub fn can_transition(current: JobState, event: JobEvent) -> bool {
    transition(current, event).is_ok()
}

/// Every event the given state accepts.
pub fn valid_events(state: JobState) -> Vec<JobEvent> {
    JobEvent::ALL
        .into_iter()
        .filter(|&event| can_transition(state, event))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_from_none() {
        assert_eq!(
            transition(JobState::None, JobEvent::Spawn).unwrap(),
            JobState::Foreground
        );
        assert_eq!(
            transition(JobState::None, JobEvent::SpawnBg).unwrap(),
            JobState::Background
        );
    }

    #[test]
    fn test_terminated_rejects_everything() {
        for event in JobEvent::ALL {
            assert!(transition(JobState::Terminated, event).is_err());
        }
    }

    #[test]
    fn test_error_terminates_live_states() {
        for state in [
            JobState::None,
            JobState::Foreground,
            JobState::Background,
            JobState::Stopped,
        ] {
            assert_eq!(
                transition(state, JobEvent::Error).unwrap(),
                JobState::Terminated
            );
        }
    }

    #[test]
    fn test_timeout_is_advisory() {
        for state in [
            JobState::None,
            JobState::Foreground,
            JobState::Background,
            JobState::Stopped,
        ] {
            assert_eq!(transition(state, JobEvent::Timeout).unwrap(), state);
        }
    }

    #[test]
    fn test_determinism() {
        for state in JobState::ALL {
            for event in JobEvent::ALL {
                let a = transition(state, event).ok();
                let b = transition(state, event).ok();
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn test_valid_events_for_none() {
        let events = valid_events(JobState::None);
        assert!(events.contains(&JobEvent::Spawn));
        assert!(events.contains(&JobEvent::SpawnBg));
        assert!(!events.contains(&JobEvent::FgCmd));
    }
}
