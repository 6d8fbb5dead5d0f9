//! Job lifecycle against real processes

use hexsh::config::EngineConfig;
use hexsh::jobs::state::JobState;
use hexsh::jobs::{ExitKind, JobManager};
use hexsh::process::SpawnOptions;
use hexsh::Error;
use std::sync::{Arc, Mutex};

fn manager() -> JobManager {
    JobManager::new(EngineConfig::default())
}

fn spawn_bg(manager: &JobManager, command: &str, args: &[&str]) -> u32 {
    let options = SpawnOptions::new(command)
        .args(args.iter().copied())
        .background(true);
    let id = manager.spawn(&options);
    assert!(id > 0, "spawn failed: {}", command);
    id
}

#[test]
fn test_background_job_registered() {
    let manager = manager();
    let id = spawn_bg(&manager, "/bin/sleep", &["5"]);

    let jobs = manager.list_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, id);
    assert_eq!(jobs[0].state, JobState::Background);
    assert!(jobs[0].command.contains("sleep"));

    manager.terminate(id, true).unwrap();
    manager.wait(id, 5000).unwrap();
}

#[test]
fn test_job_ids_are_monotonic() {
    let manager = manager();
    let first = spawn_bg(&manager, "/bin/sleep", &["5"]);
    let second = spawn_bg(&manager, "/bin/sleep", &["5"]);
    assert!(second > first);

    for id in [first, second] {
        manager.terminate(id, true).unwrap();
        manager.wait(id, 5000).unwrap();
    }
}

#[test]
fn test_normal_exit_code_propagates() {
    let manager = manager();
    let options = SpawnOptions::new("/bin/sh")
        .args(["-c", "exit 3"])
        .background(true);
    let id = manager.spawn(&options);
    assert!(id > 0);

    assert_eq!(manager.wait(id, 5000).unwrap(), Some(3));
    assert_eq!(manager.job_state(id).unwrap(), JobState::Terminated);
    assert_eq!(
        manager.with_job(id, |j| j.exit_kind).unwrap(),
        ExitKind::Exited
    );
}

#[test]
fn test_signaled_exit_reports_128_plus_signal() {
    let manager = manager();
    let id = spawn_bg(&manager, "/bin/sleep", &["30"]);

    manager.terminate(id, true).unwrap(); // SIGKILL = 9
    assert_eq!(manager.wait(id, 5000).unwrap(), Some(128 + 9));
    assert_eq!(
        manager.with_job(id, |j| j.exit_kind).unwrap(),
        ExitKind::Signaled
    );
    assert_eq!(manager.with_job(id, |j| j.term_signal).unwrap(), Some(9));
}

#[test]
fn test_exec_failure_exits_127() {
    let manager = manager();
    let id = spawn_bg(&manager, "/nonexistent-binary-for-hexsh-tests", &[]);
    assert_eq!(manager.wait(id, 5000).unwrap(), Some(127));
}

#[test]
fn test_wait_timeout_returns_none() {
    let manager = manager();
    let id = spawn_bg(&manager, "/bin/sleep", &["30"]);

    assert_eq!(manager.wait(id, 300).unwrap(), None);
    assert_eq!(manager.job_state(id).unwrap(), JobState::Background);

    manager.terminate(id, true).unwrap();
    manager.wait(id, 5000).unwrap();
}

#[test]
fn test_cleanup_removes_terminated_only() {
    let manager = manager();
    let done = spawn_bg(&manager, "/bin/true", &[]);
    let live = spawn_bg(&manager, "/bin/sleep", &["30"]);

    manager.wait(done, 5000).unwrap();
    manager.cleanup_terminated();

    assert!(matches!(
        manager.job_state(done),
        Err(Error::NoSuchJob(_))
    ));
    assert!(manager.job_state(live).is_ok());

    manager.terminate(live, true).unwrap();
    manager.wait(live, 5000).unwrap();
}

#[test]
fn test_foreground_rejected_after_termination() {
    let manager = manager();
    let id = spawn_bg(&manager, "/bin/true", &[]);
    manager.wait(id, 5000).unwrap();

    assert!(matches!(
        manager.foreground(id),
        Err(Error::InvalidTransition { .. })
    ));
    // The failed call leaves state untouched
    assert_eq!(manager.job_state(id).unwrap(), JobState::Terminated);
}

#[test]
fn test_status_callbacks_fire_in_order() {
    let manager = manager();
    let seen: Arc<Mutex<Vec<(u32, JobState, JobState)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.on_status_change(move |id, old, new| {
        sink.lock().unwrap().push((id, old, new));
    });

    let id = spawn_bg(&manager, "/bin/true", &[]);
    manager.wait(id, 5000).unwrap();

    let events = seen.lock().unwrap();
    assert_eq!(events[0], (id, JobState::None, JobState::Background));
    assert_eq!(
        events[1],
        (id, JobState::Background, JobState::Terminated)
    );
}

#[test]
fn test_stop_and_background_resume() {
    let manager = manager();
    let id = spawn_bg(&manager, "/bin/sleep", &["30"]);

    manager.stop(id).unwrap();
    // The stop lands asynchronously through the event loop
    let mut state = JobState::Background;
    for _ in 0..50 {
        manager.process_events(100);
        state = manager.job_state(id).unwrap();
        if state == JobState::Stopped {
            break;
        }
    }
    assert_eq!(state, JobState::Stopped);
    assert!(manager.with_job(id, |j| j.stop_signal).unwrap().is_some());

    // bg resumes it without taking the terminal
    manager.background(id).unwrap();
    assert_eq!(manager.job_state(id).unwrap(), JobState::Background);

    manager.terminate(id, true).unwrap();
    manager.wait(id, 5000).unwrap();
}

#[test]
fn test_active_jobs_excludes_terminated() {
    let manager = manager();
    let done = spawn_bg(&manager, "/bin/true", &[]);
    let live = spawn_bg(&manager, "/bin/sleep", &["30"]);

    manager.wait(done, 5000).unwrap();
    let active = manager.active_jobs();
    assert!(!active.contains(&done));
    assert!(active.contains(&live));

    manager.terminate(live, true).unwrap();
    manager.wait(live, 5000).unwrap();
}

#[test]
fn test_notification_flag_tracks_state_changes() {
    let manager = manager();
    let id = spawn_bg(&manager, "/bin/true", &[]);

    assert!(manager.with_job(id, |j| j.needs_notification()).unwrap());
    manager.with_job(id, |j| j.acknowledge()).unwrap();
    assert!(!manager.with_job(id, |j| j.needs_notification()).unwrap());

    manager.wait(id, 5000).unwrap();
    // Termination re-arms the flag
    assert!(manager.with_job(id, |j| j.needs_notification()).unwrap());
}
