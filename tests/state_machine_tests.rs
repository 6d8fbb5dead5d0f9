//! Exhaustive verification of the job state machine

use hexsh::jobs::state::{can_transition, transition, valid_events, JobEvent, JobState};

/// Expected outcome for every (state, event) pair. None means invalid.
fn expected(state: JobState, event: JobEvent) -> Option<JobState> {
    use JobEvent as E;
    use JobState as S;

    // Terminal state accepts nothing
    if state == S::Terminated {
        return None;
    }
    // Advisory timeout never transitions; error always terminates
    match event {
        E::Timeout => return Some(state),
        E::Error => return Some(S::Terminated),
        _ => {}
    }

    match (state, event) {
        (S::None, E::Spawn) => Some(S::Foreground),
        (S::None, E::SpawnBg) => Some(S::Background),

        (S::Foreground, E::CtrlZ) => Some(S::Stopped),
        (S::Foreground, E::CtrlC) => Some(S::Terminated),
        (S::Foreground, E::ChildExit) => Some(S::Terminated),
        (S::Foreground, E::ChildStop) => Some(S::Stopped),

        (S::Background, E::FgCmd) => Some(S::Foreground),
        (S::Background, E::BgCmd) => Some(S::Background),
        (S::Background, E::ChildExit) => Some(S::Terminated),
        (S::Background, E::ChildStop) => Some(S::Stopped),
        (S::Background, E::TtyRead) => Some(S::Stopped),

        (S::Stopped, E::FgCmd) => Some(S::Foreground),
        (S::Stopped, E::BgCmd) => Some(S::Background),
        (S::Stopped, E::CtrlC) => Some(S::Terminated),
        (S::Stopped, E::ChildExit) => Some(S::Terminated),

        _ => None,
    }
}

#[test]
fn test_every_pair_matches_the_table() {
    for state in JobState::ALL {
        for event in JobEvent::ALL {
            let got = transition(state, event).ok();
            let want = expected(state, event);
            assert_eq!(
                got, want,
                "transition({}, {}) returned {:?}, expected {:?}",
                state, event, got, want
            );
            assert_eq!(can_transition(state, event), want.is_some());
        }
    }
}

#[test]
fn test_machine_is_total() {
    // Every pair yields either a state or an explicit invalid result;
    // nothing panics
    for state in JobState::ALL {
        for event in JobEvent::ALL {
            let _ = transition(state, event);
        }
    }
}

#[test]
fn test_valid_events_match_table() {
    for state in JobState::ALL {
        let events = valid_events(state);
        for event in JobEvent::ALL {
            assert_eq!(events.contains(&event), expected(state, event).is_some());
        }
    }
}

#[test]
fn test_invalid_transition_reports_pair() {
    let err = transition(JobState::Terminated, JobEvent::Spawn).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("Terminated"));
    assert!(msg.contains("Spawn"));
}
