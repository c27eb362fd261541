//! Lifecycle tests: submit, kill, resubmit and monitoring against a
//! scripted backend.

mod test_harness;

use std::time::Duration;

use gantry::credentials::CredentialRequirement;
use gantry::job::{Fqid, JobStatus};
use gantry::GantryError;
use test_harness::{assert_eventually, scripted_spec, SubmitMode, TestEnv};

async fn wait_idle(env: &TestEnv, ids: &[u64]) {
    assert_eventually(
        || async {
            for id in ids {
                if env.session.registry.is_busy(*id).await {
                    return false;
                }
            }
            true
        },
        Duration::from_secs(5),
        "Backend calls should finish",
    )
    .await;
}

#[tokio::test]
async fn test_hundred_jobs_complete_after_one_cycle() {
    let env = TestEnv::new().await;
    let registry = &env.session.registry;

    let mut ids = Vec::new();
    for _ in 0..100 {
        ids.push(env.create(0).await);
    }
    let mut handles = Vec::new();
    for id in &ids {
        handles.push(registry.submit(*id).await.unwrap());
    }
    for handle in handles {
        assert_eq!(handle.wait().await.unwrap(), JobStatus::Submitted);
    }
    wait_idle(&env, &ids).await;

    env.backend.report_all(JobStatus::Completed);
    let report = env.session.monitor.run_cycle().await;
    assert_eq!(report.polled, 100);
    assert_eq!(report.applied, 100);
    assert_eq!(report.rejected, 0);
    assert!(report.errors.is_empty(), "errors: {:?}", report.errors);

    for id in &ids {
        assert_eq!(env.status(*id).await, JobStatus::Completed);
        assert_eq!(env.stored_status(*id).await, JobStatus::Completed);
    }
    assert_eq!(env.backend.submits(), 100);
    assert_eq!(env.backend.polls(), 1);
}

#[tokio::test]
async fn test_submit_records_remote_ids() {
    let env = TestEnv::new().await;
    let id = env.create(2).await;

    let handle = env.session.registry.submit(id).await.unwrap();
    assert_eq!(handle.wait().await.unwrap(), JobStatus::Submitted);

    let job = env.session.registry.reload(id).await.unwrap();
    assert_eq!(job.status(), JobStatus::Submitted);
    for (index, sub) in job.subjobs().iter().enumerate() {
        let expected = format!("remote-{}", Fqid::sub(id, index));
        assert_eq!(sub.remote_id(), Some(expected.as_str()));
    }
}

#[tokio::test]
async fn test_submit_timeout_leaves_job_submitting_until_polled() {
    let env = TestEnv::new().await;
    let id = env.create(0).await;
    env.backend.set_submit_mode(SubmitMode::Hang);

    let handle = env.session.registry.submit(id).await.unwrap();
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, GantryError::Timeout { .. }), "got {err}");
    assert_eq!(env.status(id).await, JobStatus::Submitting);
    assert_eq!(env.stored_status(id).await, JobStatus::Submitting);
    wait_idle(&env, &[id]).await;

    env.backend.report_all(JobStatus::Completed);
    let report = env.session.monitor.run_cycle().await;
    assert_eq!(report.rejected, 0);
    assert_eq!(report.applied, 2);
    assert_eq!(env.status(id).await, JobStatus::Completed);

    // The skipped state is filled in on the way.
    let job = env.session.registry.get(id).await.unwrap();
    assert!(job.status_time(JobStatus::Submitted).is_some());
}

#[tokio::test]
async fn test_concurrent_resubmit_has_one_winner() {
    let env = TestEnv::new().await;
    let registry = env.session.registry.clone();
    let id = env.create(0).await;

    registry.submit(id).await.unwrap().wait().await.unwrap();
    registry
        .apply_monitoring_result(Fqid::master(id), JobStatus::Failed)
        .await
        .unwrap();
    assert_eq!(env.status(id).await, JobStatus::Failed);
    wait_idle(&env, &[id]).await;

    env.backend.set_submit_delay(Duration::from_millis(100));
    let (first, second) = tokio::join!(registry.resubmit(id), registry.resubmit(id));

    let (winner, loser) = match (first, second) {
        (Ok(handle), Err(e)) | (Err(e), Ok(handle)) => (handle, e),
        (Ok(_), Ok(_)) => panic!("both resubmits were accepted"),
        (Err(a), Err(b)) => panic!("both resubmits failed: {a}, {b}"),
    };
    assert!(matches!(loser, GantryError::IllegalTransition { .. }));
    assert_eq!(winner.wait().await.unwrap(), JobStatus::Submitted);
    assert_eq!(env.backend.submits(), 2);
    assert_eq!(env.stored_status(id).await, JobStatus::Submitted);
}

#[tokio::test]
async fn test_failed_submit_rolls_back_to_new() {
    let env = TestEnv::new().await;
    let mut events = env.session.registry.subscribe();
    let id = env.create(0).await;
    env.backend.set_submit_mode(SubmitMode::Fail);

    let handle = env.session.registry.submit(id).await.unwrap();
    assert!(matches!(
        handle.wait().await,
        Err(GantryError::Backend { .. })
    ));
    assert_eq!(env.status(id).await, JobStatus::New);
    assert_eq!(env.stored_status(id).await, JobStatus::New);

    let submitting = events.recv().await.unwrap();
    assert_eq!(submitting.to, JobStatus::Submitting);
    let rollback = events.recv().await.unwrap();
    assert_eq!(rollback.from, JobStatus::Submitting);
    assert_eq!(rollback.to, JobStatus::New);

    // The job can be submitted again once the backend accepts it.
    env.backend.set_submit_mode(SubmitMode::Succeed);
    wait_idle(&env, &[id]).await;
    let handle = env.session.registry.submit(id).await.unwrap();
    assert_eq!(handle.wait().await.unwrap(), JobStatus::Submitted);
}

#[tokio::test]
async fn test_missing_credential_never_reaches_backend() {
    let env = TestEnv::new().await;
    let proxy = CredentialRequirement::new("grid-proxy").with_vo("atlas");
    let job = env
        .session
        .registry
        .create(scripted_spec(0).with_credential(proxy.clone()))
        .await
        .unwrap();

    let err = env.session.registry.submit(job.id).await.unwrap_err();
    assert!(matches!(err, GantryError::Credential { .. }), "got {err}");
    assert_eq!(env.backend.submits(), 0);
    assert_eq!(env.status(job.id).await, JobStatus::New);

    env.gate.grant(proxy).await;
    let handle = env.session.registry.submit(job.id).await.unwrap();
    assert_eq!(handle.wait().await.unwrap(), JobStatus::Submitted);
    assert_eq!(env.backend.submits(), 1);
}

#[tokio::test]
async fn test_resubmit_refused_when_backend_lacks_support() {
    let env = TestEnv::new().await;
    let id = env.create(0).await;
    env.session
        .registry
        .force_status(Fqid::master(id), JobStatus::Failed, "setup")
        .await
        .unwrap();
    env.backend.set_supports_resubmit(false);

    let err = env.session.registry.resubmit(id).await.unwrap_err();
    assert!(matches!(err, GantryError::Backend { .. }), "got {err}");
    assert_eq!(env.backend.submits(), 0);
    assert_eq!(env.status(id).await, JobStatus::Failed);
}

#[tokio::test]
async fn test_kill_moves_job_to_killed() {
    let env = TestEnv::new().await;
    let id = env.create(0).await;
    env.session.registry.submit(id).await.unwrap().wait().await.unwrap();
    wait_idle(&env, &[id]).await;

    let handle = env.session.registry.kill(id).await.unwrap();
    assert_eq!(handle.wait().await.unwrap(), JobStatus::Killed);
    assert_eq!(env.backend.kills(), 1);
    assert_eq!(env.stored_status(id).await, JobStatus::Killed);

    // Nothing left to kill.
    assert!(matches!(
        env.session.registry.kill(id).await,
        Err(GantryError::IllegalTransition { .. })
    ));
}

#[tokio::test]
async fn test_resubmit_only_touches_failed_subjobs() {
    let env = TestEnv::new().await;
    let registry = env.session.registry.clone();
    let id = env.create(3).await;
    registry.submit(id).await.unwrap().wait().await.unwrap();
    wait_idle(&env, &[id]).await;

    env.backend.report(Fqid::sub(id, 0), JobStatus::Completed);
    env.backend.report(Fqid::sub(id, 1), JobStatus::Failed);
    env.backend.report(Fqid::sub(id, 2), JobStatus::Completed);
    env.session.monitor.run_cycle().await;
    assert_eq!(env.status(id).await, JobStatus::Failed);

    let handle = registry.resubmit(id).await.unwrap();
    assert_eq!(handle.wait().await.unwrap(), JobStatus::Submitted);

    let job = registry.get(id).await.unwrap();
    let statuses: Vec<JobStatus> = job.subjobs().iter().map(|s| s.status()).collect();
    assert_eq!(
        statuses,
        vec![
            JobStatus::Completed,
            JobStatus::Submitted,
            JobStatus::Completed
        ]
    );
}

#[tokio::test]
async fn test_remove_kills_active_job_first() {
    let env = TestEnv::new().await;
    let id = env.create(0).await;
    env.session.registry.submit(id).await.unwrap().wait().await.unwrap();
    wait_idle(&env, &[id]).await;

    env.session.registry.remove(id, false).await.unwrap();
    assert_eq!(env.backend.kills(), 1);
    assert!(env.session.registry.peek_index(id).await.is_none());
    assert!(matches!(
        env.session.repository.load_one(id).await,
        Err(GantryError::JobNotFound(_))
    ));
}
