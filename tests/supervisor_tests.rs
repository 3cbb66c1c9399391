
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use benchfleet::jobs::RollingLog;
use benchfleet::supervisor::{LaunchSpec, ProcessSupervisor, Readiness, StopOutcome};
use test_harness::process_alive;

fn sh(script: &str, log: &Arc<RollingLog>) -> LaunchSpec {
    LaunchSpec::new("/bin/sh", log.clone()).with_arguments(vec!["-c".into(), script.into()])
}

fn supervisor() -> ProcessSupervisor {
    ProcessSupervisor::new(Duration::from_millis(300))
}

#[tokio::test]
async fn test_marker_sets_ready() {
    let log = Arc::new(RollingLog::new(100));
    let spec = sh("echo one; echo 'xx Application started xx'; exec sleep 30", &log)
        .ready_on(Readiness::Marker("Application started".into()));

    let mut handle = supervisor().start(spec).await.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(5), handle.wait_ready())
        .await
        .unwrap();
    assert!(status.ready);
    assert!(!status.exited);
    assert_eq!(log.get(0), vec!["one", "xx Application started xx"]);

    assert_eq!(supervisor().stop(handle).await, StopOutcome::Graceful);
}

#[tokio::test]
async fn test_exit_without_marker_is_not_ready() {
    let log = Arc::new(RollingLog::new(100));
    let spec = sh("echo nope; exit 2", &log).ready_on(Readiness::Marker("ready".into()));

    let mut handle = supervisor().start(spec).await.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(5), handle.wait_ready())
        .await
        .unwrap();
    assert!(!status.ready);
    assert!(status.exited);
    assert_eq!(status.exit_code, Some(2));
    assert_eq!(log.last_line().as_deref(), Some("nope"));

    assert_eq!(supervisor().stop(handle).await, StopOutcome::AlreadyExited);
}

#[tokio::test]
async fn test_stderr_is_captured() {
    let log = Arc::new(RollingLog::new(100));
    let mut handle = supervisor().start(sh("echo oops >&2", &log)).await.unwrap();
    handle.wait_exit().await;
    assert_eq!(log.get(0), vec!["oops"]);
}

#[tokio::test]
async fn test_environment_and_working_dir() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(RollingLog::new(100));
    let mut env = BTreeMap::new();
    env.insert("BENCH_VALUE".to_string(), "42".to_string());

    let spec = sh("echo $BENCH_VALUE; pwd", &log)
        .with_environment(env)
        .in_dir(dir.path());
    let mut handle = supervisor().start(spec).await.unwrap();
    handle.wait_exit().await;

    let lines = log.get(0);
    assert_eq!(lines[0], "42");
    let cwd = std::fs::canonicalize(&lines[1]).unwrap();
    assert_eq!(cwd, std::fs::canonicalize(dir.path()).unwrap());
}

#[tokio::test]
async fn test_stop_kills_interrupt_ignoring_process_group() {
    let log = Arc::new(RollingLog::new(100));
    let spec = sh("trap '' INT; sleep 30 & echo $!; wait", &log);

    let handle = supervisor().start(spec).await.unwrap();
    let pid = handle.pid();
    let child_pid: u32 = loop {
        if let Some(line) = log.last_line() {
            break line.parse().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert!(handle.status().ready);

    assert_eq!(supervisor().stop(handle).await, StopOutcome::Killed);
    assert!(!process_alive(pid));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!process_alive(child_pid));
}

#[tokio::test]
async fn test_stop_after_exit_kills_forked_children() {
    let log = Arc::new(RollingLog::new(100));
    let spec = sh("sleep 30 >/dev/null 2>&1 & echo $!; exit 2", &log);

    let mut handle = supervisor().start(spec).await.unwrap();
    let status = handle.wait_exit().await;
    assert_eq!(status.exit_code, Some(2));
    let child_pid: u32 = log.get(0)[0].parse().unwrap();
    assert!(process_alive(child_pid));

    assert_eq!(supervisor().stop(handle).await, StopOutcome::AlreadyExited);
    test_harness::assert_eventually(
        || async { !process_alive(child_pid) },
        Duration::from_secs(5),
        "forked child should be killed with its group",
    )
    .await;
}

#[tokio::test]
async fn test_dropping_handle_kills_process() {
    let log = Arc::new(RollingLog::new(10));
    let handle = supervisor().start(sh("exec sleep 30", &log)).await.unwrap();
    let pid = handle.pid();
    drop(handle);

    test_harness::assert_eventually(
        || async { !process_alive(pid) },
        Duration::from_secs(5),
        "process should be killed when its handle is dropped",
    )
    .await;
}

#[tokio::test]
async fn test_workdir_removed_with_handle() {
    let workdir = tempfile::tempdir().unwrap();
    let path = workdir.path().to_path_buf();
    let log = Arc::new(RollingLog::new(10));

    let mut handle = supervisor().start(sh("exec sleep 30", &log)).await.unwrap();
    handle.attach_workdir(workdir);
    assert_eq!(handle.working_dir(), Some(path.as_path()));

    supervisor().stop(handle).await;
    assert!(!path.exists());
}

#[tokio::test]
async fn test_missing_program_is_launch_error() {
    let log = Arc::new(RollingLog::new(10));
    let result = supervisor()
        .start(LaunchSpec::new("/nonexistent/benchfleet-app", log))
        .await;
    assert!(matches!(
        result,
        Err(benchfleet::error::FleetError::Launch(_))
    ));
}

#[tokio::test]
async fn test_output_beyond_capacity_is_discarded() {
    let log = Arc::new(RollingLog::new(10));
    let mut handle = supervisor().start(sh("seq 1 25", &log)).await.unwrap();
    handle.wait_exit().await;

    assert_eq!(log.len(), 10);
    assert_eq!(log.discarded(), 15);
    assert_eq!(log.last_line().as_deref(), Some("25"));
    assert_eq!(log.get(0)[0], "16");
}
