//! End-to-end tests running real commands through the local backend.

mod test_harness;

use std::time::Duration;

use gantry::backend::local::{LocalBackend, BACKEND_NAME, KILLED_FILE};
use gantry::config::{GantryConfig, SandboxConfig};
use gantry::job::{ApplicationRef, BackendRef, Fqid, JobId, JobSpec, JobStatus};
use gantry::session::Session;
use tempfile::TempDir;
use test_harness::wait_for;

async fn local_session() -> (TempDir, Session) {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::open(GantryConfig::new(dir.path())).await.unwrap();
    (dir, session)
}

fn backend(dir: &TempDir) -> LocalBackend {
    LocalBackend::new(dir.path().join("workspace"), SandboxConfig::default())
}

async fn run(session: &Session, command: &str, subjobs: usize) -> JobId {
    let spec = JobSpec::new(ApplicationRef::executable(command), BackendRef::new(BACKEND_NAME))
        .with_subjobs(subjobs);
    let id = session.registry.create(spec).await.unwrap().id;
    let status = session
        .registry
        .submit(id)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Submitted);
    id
}

/// Poll until the job reaches `expected` or the timeout runs out.
async fn settle(session: &Session, id: JobId, expected: JobStatus) -> bool {
    wait_for(
        || async {
            session.monitor.run_cycle().await;
            session.registry.get(id).await.unwrap().status() == expected
        },
        Duration::from_secs(10),
        Duration::from_millis(100),
    )
    .await
}

#[tokio::test]
async fn test_command_completes_with_output() {
    let (dir, session) = local_session().await;
    let id = run(&session, "echo hello", 0).await;

    assert!(settle(&session, id, JobStatus::Completed).await);
    let output = backend(&dir).output(Fqid::master(id)).await.unwrap();
    assert_eq!(output.as_deref(), Some("hello\n"));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_failing_command_is_failed() {
    let (_dir, session) = local_session().await;
    let id = run(&session, "exit 3", 0).await;

    assert!(settle(&session, id, JobStatus::Failed).await);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_subjobs_each_run_in_own_workspace() {
    let (dir, session) = local_session().await;
    let id = run(&session, "pwd", 2).await;

    assert!(settle(&session, id, JobStatus::Completed).await);
    let local = backend(&dir);
    for n in 0..2 {
        let fqid = Fqid::sub(id, n);
        let output = local.output(fqid).await.unwrap().unwrap();
        assert!(
            output.trim_end().ends_with(&fqid.to_string()),
            "subjob {fqid} ran in {output}"
        );
    }
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_killed_command_stops() {
    let (dir, session) = local_session().await;
    let id = run(&session, "sleep 30", 0).await;

    let status = session
        .registry
        .kill(id)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Killed);

    let workspace = backend(&dir).workspace(Fqid::master(id));
    assert!(workspace.join(KILLED_FILE).exists());

    // Killed is final; later polls leave it alone.
    session.monitor.run_cycle().await;
    assert_eq!(
        session.registry.get(id).await.unwrap().status(),
        JobStatus::Killed
    );
    session.close().await.unwrap();
}
