
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use benchfleet::agent::ServerAgent;
use benchfleet::config::LifecycleConfig;
use benchfleet::error::{FleetError, Result};
use benchfleet::jobs::{ServerJob, ServerState};
use benchfleet::supervisor::SourceResolver;
use test_harness::{
    assert_eventually, process_alive, shell_job, test_config, test_lifecycle, TestServer,
    READY_SCRIPT, SILENT_SCRIPT,
};

const STATE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_job_runs_after_marker_and_is_removed_on_delete() {
    let mut server = TestServer::start(test_config(test_lifecycle()));

    let job = server.repository.create(shell_job(READY_SCRIPT)).await.unwrap();
    assert_eq!(job.state, ServerState::Waiting);

    assert!(server.wait_for_state(job.id, ServerState::Running, STATE_TIMEOUT).await);
    let running = server.repository.find(job.id).await.unwrap();
    assert_eq!(
        running.url.as_deref(),
        Some("http://bench-host:5000/plaintext")
    );
    let pid = running.process_id.expect("running job has a pid");
    assert!(process_alive(pid));
    assert!(running.output.get(0).iter().any(|l| l == "booting"));

    server.repository.mark_deleting(job.id).await.unwrap();
    assert!(server.wait_for_removal(job.id, STATE_TIMEOUT).await);
    assert!(!process_alive(pid));

    server.shutdown().await;
}

#[tokio::test]
async fn test_process_killed_before_marker_fails() {
    let server = TestServer::start(test_config(test_lifecycle()));

    let job = server
        .repository
        .create(shell_job("echo warming up; sleep 0.2; exit 3"))
        .await
        .unwrap();

    assert!(server.wait_for_state(job.id, ServerState::Failed, STATE_TIMEOUT).await);
    let failed = server.repository.find(job.id).await.unwrap();
    let error = failed.error.unwrap();
    assert!(error.contains("before becoming ready"), "{error}");
    assert!(error.contains("code 3"), "{error}");
    assert!(error.contains("warming up"), "{error}");
}

#[tokio::test]
async fn test_job_without_marker_stays_starting() {
    let server = TestServer::start(test_config(test_lifecycle()));

    let job = server.repository.create(shell_job(SILENT_SCRIPT)).await.unwrap();
    assert!(server.wait_for_state(job.id, ServerState::Starting, STATE_TIMEOUT).await);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        server.repository.find(job.id).await.unwrap().state,
        ServerState::Starting
    );

    server.repository.mark_deleting(job.id).await.unwrap();
    assert!(server.wait_for_removal(job.id, STATE_TIMEOUT).await);
}

#[tokio::test]
async fn test_unexpected_exit_while_running_fails() {
    let server = TestServer::start(test_config(test_lifecycle()));

    let job = server
        .repository
        .create(shell_job("echo 'Application started'; sleep 0.3; echo crashed; exit 9"))
        .await
        .unwrap();

    assert!(server.wait_for_state(job.id, ServerState::Running, STATE_TIMEOUT).await);
    assert!(server.wait_for_state(job.id, ServerState::Failed, STATE_TIMEOUT).await);

    let failed = server.repository.find(job.id).await.unwrap();
    let error = failed.error.unwrap();
    assert!(error.contains("exited unexpectedly with code 9"), "{error}");
    assert!(error.ends_with("crashed"), "{error}");
}

#[tokio::test]
async fn test_unsupported_scenario() {
    let server = TestServer::start(test_config(test_lifecycle()));

    let mut description = shell_job(READY_SCRIPT);
    description.scenario = "quic-echo".into();
    let job = server.repository.create(description).await.unwrap();

    assert!(server.wait_for_state(job.id, ServerState::NotSupported, STATE_TIMEOUT).await);
    let job = server.repository.find(job.id).await.unwrap();
    assert!(job.process_id.is_none());
    assert!(job.error.unwrap().contains("quic-echo"));
}

#[tokio::test]
async fn test_silent_driver_job_is_reclaimed() {
    let lifecycle = benchfleet::config::LifecycleConfig {
        liveness_timeout_ms: 300,
        ..test_lifecycle()
    };
    let server = TestServer::start(test_config(lifecycle));

    let job = server.repository.create(shell_job(READY_SCRIPT)).await.unwrap();
    assert!(server.wait_for_state(job.id, ServerState::Running, STATE_TIMEOUT).await);
    let pid = server.repository.find(job.id).await.unwrap().process_id.unwrap();

    assert!(server.wait_for_removal(job.id, STATE_TIMEOUT).await);
    assert!(!process_alive(pid));
}

#[tokio::test]
async fn test_touched_job_survives_liveness_timeout() {
    let lifecycle = benchfleet::config::LifecycleConfig {
        liveness_timeout_ms: 300,
        ..test_lifecycle()
    };
    let server = TestServer::start(test_config(lifecycle));

    let job = server.repository.create(shell_job(READY_SCRIPT)).await.unwrap();
    assert!(server.wait_for_state(job.id, ServerState::Running, STATE_TIMEOUT).await);

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.repository.touch(job.id).await.unwrap();
    }
    assert_eq!(
        server.repository.find(job.id).await.unwrap().state,
        ServerState::Running
    );

    server.repository.mark_deleting(job.id).await.unwrap();
    assert!(server.wait_for_removal(job.id, STATE_TIMEOUT).await);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let server = TestServer::start(test_config(test_lifecycle()));

    let job = server.repository.create(shell_job(READY_SCRIPT)).await.unwrap();
    assert!(server.wait_for_state(job.id, ServerState::Running, STATE_TIMEOUT).await);

    assert!(server.repository.mark_deleting(job.id).await.unwrap());
    let _ = server.repository.mark_deleting(job.id).await;
    assert!(server.wait_for_removal(job.id, STATE_TIMEOUT).await);
    assert!(matches!(
        server.repository.mark_deleting(job.id).await,
        Err(FleetError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn test_interrupt_ignoring_process_is_killed() {
    let server = TestServer::start(test_config(test_lifecycle()));

    let job = server
        .repository
        .create(shell_job(
            "trap '' INT; echo 'Application started'; while true; do sleep 0.05; done",
        ))
        .await
        .unwrap();
    assert!(server.wait_for_state(job.id, ServerState::Running, STATE_TIMEOUT).await);
    let pid = server.repository.find(job.id).await.unwrap().process_id.unwrap();

    server.repository.mark_deleting(job.id).await.unwrap();
    assert!(server.wait_for_removal(job.id, STATE_TIMEOUT).await);
    assert!(!process_alive(pid));
}

#[tokio::test]
async fn test_attachments_are_written_to_working_directory() {
    let server = TestServer::start(test_config(test_lifecycle()));

    let description = shell_job("cat settings.json; echo; echo 'Application started'; exec sleep 30")
        .with_attachment("settings.json", "{\"threads\":4}");
    let job = server.repository.create(description).await.unwrap();

    assert!(server.wait_for_state(job.id, ServerState::Running, STATE_TIMEOUT).await);
    let running = server.repository.find(job.id).await.unwrap();
    assert_eq!(running.output.get(0)[0], "{\"threads\":4}");

    server.repository.mark_deleting(job.id).await.unwrap();
    assert!(server.wait_for_removal(job.id, STATE_TIMEOUT).await);
}

#[tokio::test]
async fn test_invalid_attachment_fails_job() {
    let server = TestServer::start(test_config(test_lifecycle()));

    let description = shell_job(READY_SCRIPT).with_attachment("../outside", "x");
    let job = server.repository.create(description).await.unwrap();

    assert!(server.wait_for_state(job.id, ServerState::Failed, STATE_TIMEOUT).await);
    let error = server.repository.find(job.id).await.unwrap().error.unwrap();
    assert!(error.contains("Attachment"), "{error}");
}

#[tokio::test]
async fn test_build_failure_fails_job_with_build_log() {
    let server = TestServer::start(test_config(test_lifecycle()));

    let mut description = shell_job(READY_SCRIPT);
    description.source.build_command = Some("echo 'error CS1002'; exit 1".into());
    let job = server.repository.create(description).await.unwrap();

    assert!(server.wait_for_state(job.id, ServerState::Failed, STATE_TIMEOUT).await);
    let failed = server.repository.find(job.id).await.unwrap();
    assert!(failed.error.unwrap().starts_with("Build failed"));
    assert!(failed.build_log.get(0).iter().any(|l| l == "error CS1002"));
    assert!(failed.process_id.is_none());
}

#[tokio::test]
async fn test_trace_collection() {
    let server = TestServer::start(test_config(test_lifecycle()));

    let job = server.repository.create(shell_job(READY_SCRIPT)).await.unwrap();
    assert!(server.wait_for_state(job.id, ServerState::Running, STATE_TIMEOUT).await);

    server
        .repository
        .transition(job.id, ServerState::TraceCollecting)
        .await
        .unwrap();
    assert!(server.wait_for_state(job.id, ServerState::TraceCollected, STATE_TIMEOUT).await);

    let collected = server.repository.find(job.id).await.unwrap();
    let path = collected.trace_path.unwrap();
    let trace: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(trace["jobId"], job.id);
    assert!(collected.process_id.is_some_and(process_alive));

    server.repository.mark_deleting(job.id).await.unwrap();
    assert!(server.wait_for_removal(job.id, STATE_TIMEOUT).await);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_counters_are_sampled_while_running() {
    let server = TestServer::start(test_config(test_lifecycle()));

    let job = server.repository.create(shell_job(READY_SCRIPT)).await.unwrap();
    assert!(server.wait_for_state(job.id, ServerState::Running, STATE_TIMEOUT).await);

    let repository = server.repository.clone();
    assert_eventually(
        || async {
            repository
                .find(job.id)
                .await
                .is_some_and(|job| job.server_counters.len() >= 2)
        },
        STATE_TIMEOUT,
        "expected at least two counter samples",
    )
    .await;
}

#[tokio::test]
async fn test_counter_samples_are_capped() {
    let lifecycle = LifecycleConfig {
        counter_interval_ms: 10,
        max_counter_samples: 3,
        ..test_lifecycle()
    };
    let server = TestServer::start(test_config(lifecycle));

    let job = server.repository.create(shell_job(READY_SCRIPT)).await.unwrap();
    assert!(server.wait_for_state(job.id, ServerState::Running, STATE_TIMEOUT).await);

    let repository = server.repository.clone();
    assert_eventually(
        || async {
            repository
                .find(job.id)
                .await
                .is_some_and(|job| job.server_counters.len() == 3)
        },
        STATE_TIMEOUT,
        "expected the sample buffer to fill",
    )
    .await;

    let first = repository.find(job.id).await.unwrap().server_counters[0].timestamp;
    assert_eventually(
        || async {
            repository
                .find(job.id)
                .await
                .is_some_and(|job| job.server_counters[0].timestamp > first)
        },
        STATE_TIMEOUT,
        "expected the oldest sample to be dropped",
    )
    .await;
    assert_eq!(repository.find(job.id).await.unwrap().server_counters.len(), 3);
}

#[tokio::test]
async fn test_failed_job_descendants_are_killed() {
    let server = TestServer::start(test_config(test_lifecycle()));

    let job = server
        .repository
        .create(shell_job(
            "sleep 30 >/dev/null 2>&1 & echo $!; echo 'Application started'; sleep 0.3; exit 2",
        ))
        .await
        .unwrap();
    assert!(server.wait_for_state(job.id, ServerState::Failed, STATE_TIMEOUT).await);

    let failed = server.repository.find(job.id).await.unwrap();
    let descendant: u32 = failed.output.get(0)[0].parse().unwrap();
    assert_eventually(
        || async { !process_alive(descendant) },
        STATE_TIMEOUT,
        "forked child should not outlive its failed job",
    )
    .await;

    server.repository.mark_deleting(job.id).await.unwrap();
    assert!(server.wait_for_removal(job.id, STATE_TIMEOUT).await);
}

#[tokio::test]
async fn test_update_cannot_start_unowned_job() {
    let server = TestServer::start(test_config(test_lifecycle()));

    let first = server.repository.create(shell_job(READY_SCRIPT)).await.unwrap();
    assert!(server.wait_for_state(first.id, ServerState::Running, STATE_TIMEOUT).await);

    let second = server.repository.create(shell_job(READY_SCRIPT)).await.unwrap();
    let mut replacement = shell_job(READY_SCRIPT);
    replacement.id = second.id;
    replacement.state = ServerState::Starting;
    let updated = server.repository.update(replacement).await.unwrap();
    assert_eq!(updated.state, ServerState::Waiting);

    server.repository.mark_deleting(first.id).await.unwrap();
    assert!(server.wait_for_removal(first.id, STATE_TIMEOUT).await);
    assert!(server.wait_for_state(second.id, ServerState::Running, STATE_TIMEOUT).await);

    server.repository.mark_deleting(second.id).await.unwrap();
    assert!(server.wait_for_removal(second.id, STATE_TIMEOUT).await);
}

#[tokio::test]
async fn test_jobs_run_one_at_a_time_in_id_order() {
    let server = TestServer::start(test_config(test_lifecycle()));

    let first = server.repository.create(shell_job(READY_SCRIPT)).await.unwrap();
    let second = server.repository.create(shell_job(READY_SCRIPT)).await.unwrap();

    assert!(server.wait_for_state(first.id, ServerState::Running, STATE_TIMEOUT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        server.repository.find(second.id).await.unwrap().state,
        ServerState::Waiting
    );

    server.repository.mark_deleting(first.id).await.unwrap();
    assert!(server.wait_for_state(second.id, ServerState::Running, STATE_TIMEOUT).await);
}

#[tokio::test]
async fn test_session_jobs_are_preferred() {
    let server = TestServer::start(test_config(test_lifecycle()));

    let first = server
        .repository
        .create(shell_job(READY_SCRIPT).with_session("alpha"))
        .await
        .unwrap();
    assert!(server.wait_for_state(first.id, ServerState::Running, STATE_TIMEOUT).await);

    let other = server
        .repository
        .create(shell_job(READY_SCRIPT).with_session("beta"))
        .await
        .unwrap();
    let same = server
        .repository
        .create(shell_job(READY_SCRIPT).with_session("alpha"))
        .await
        .unwrap();

    server.repository.mark_deleting(first.id).await.unwrap();
    assert!(server.wait_for_state(same.id, ServerState::Running, STATE_TIMEOUT).await);
    assert_eq!(
        server.repository.find(other.id).await.unwrap().state,
        ServerState::Waiting
    );
}

#[tokio::test]
async fn test_shutdown_stops_owned_process() {
    let mut server = TestServer::start(test_config(test_lifecycle()));

    let job = server.repository.create(shell_job(READY_SCRIPT)).await.unwrap();
    assert!(server.wait_for_state(job.id, ServerState::Running, STATE_TIMEOUT).await);
    let pid = server.repository.find(job.id).await.unwrap().process_id.unwrap();

    server.shutdown().await;
    assert!(!process_alive(pid));
}

/// Resolver whose build never finishes.
struct HangingResolver;

#[async_trait]
impl SourceResolver for HangingResolver {
    async fn resolve(&self, _job: &ServerJob) -> Result<std::path::PathBuf> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(FleetError::Build("unreachable".into()))
    }
}

#[tokio::test]
async fn test_delete_during_build_cancels_launch() {
    let agent = ServerAgent::new(test_config(test_lifecycle()))
        .with_resolver(Arc::new(HangingResolver));
    let server = TestServer::start_agent(agent);

    let job = server.repository.create(shell_job(READY_SCRIPT)).await.unwrap();
    assert!(server.wait_for_state(job.id, ServerState::Starting, STATE_TIMEOUT).await);

    let before = Utc::now();
    server.repository.mark_deleting(job.id).await.unwrap();
    assert!(server.wait_for_removal(job.id, STATE_TIMEOUT).await);
    assert!(Utc::now() - before < chrono::Duration::seconds(2));
}
