//! Races between user operations and the monitoring engine.

mod test_harness;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gantry::job::JobStatus;
use gantry::registry::{TransitionEvent, TransitionHook};
use gantry::GantryError;
use test_harness::{assert_eventually, scripted_spec, TestEnv};

#[derive(Default)]
struct CountingHook {
    calls: AtomicUsize,
}

#[async_trait]
impl TransitionHook for CountingHook {
    async fn on_terminal(&self, _event: &TransitionEvent) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_kill_racing_monitor_has_single_outcome() {
    let env = TestEnv::new().await;
    let registry = env.session.registry.clone();
    let hook = Arc::new(CountingHook::default());
    registry.add_hook(hook.clone()).await;

    let mut ids = Vec::new();
    for _ in 0..20 {
        let id = env.create(0).await;
        registry.submit(id).await.unwrap().wait().await.unwrap();
        ids.push(id);
    }
    assert_eventually(
        || async {
            for id in &ids {
                if registry.is_busy(*id).await {
                    return false;
                }
            }
            true
        },
        Duration::from_secs(5),
        "Submissions should finish",
    )
    .await;

    let mut events = registry.subscribe();
    env.backend.report_all(JobStatus::Completed);

    let monitor = env.session.monitor.clone();
    let cycle = tokio::spawn(async move { monitor.run_cycle().await });
    let mut kills = Vec::new();
    for id in ids.clone() {
        let registry = registry.clone();
        kills.push(tokio::spawn(async move {
            match registry.kill(id).await {
                Ok(handle) => handle.wait().await,
                Err(e) => Err(e),
            }
        }));
    }

    for kill in kills {
        match kill.await.unwrap() {
            Ok(status) => assert_eq!(status, JobStatus::Killed),
            Err(GantryError::IllegalTransition { .. }) => {}
            Err(e) => panic!("unexpected kill error: {e}"),
        }
    }
    cycle.await.unwrap();

    // Jobs skipped by the racing cycle because a kill was in flight are
    // already terminal; a second cycle has nothing to poll.
    let report = env.session.monitor.run_cycle().await;
    assert_eq!(report.polled, 0);

    let mut terminal: BTreeMap<u64, usize> = BTreeMap::new();
    while let Ok(event) = events.try_recv() {
        if matches!(event.to, JobStatus::Completed | JobStatus::Killed) {
            *terminal.entry(event.fqid.id).or_default() += 1;
        }
    }

    for id in &ids {
        let in_memory = env.status(*id).await;
        assert!(
            matches!(in_memory, JobStatus::Completed | JobStatus::Killed),
            "job {id} ended as {in_memory}"
        );
        assert_eq!(in_memory, env.stored_status(*id).await);
        assert_eq!(terminal.get(id), Some(&1), "job {id} terminal events");
    }
    assert_eq!(hook.calls.load(Ordering::SeqCst), ids.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_get_unique_ids() {
    let env = TestEnv::new().await;
    let registry = env.session.registry.clone();

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(
            async move { registry.create(scripted_spec(1)).await },
        ));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        let job = task.await.unwrap().unwrap();
        assert!(ids.insert(job.id), "id {} assigned twice", job.id);
    }
    assert_eq!(registry.len().await, 50);
    assert_eq!(registry.refresh_index().await.unwrap(), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operations_on_one_job_are_serialized() {
    let env = TestEnv::new().await;
    let registry = env.session.registry.clone();
    let id = env.create(0).await;

    let mut tasks = Vec::new();
    for n in 0..10 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            registry
                .modify(id, move |job| {
                    job.set_metadata(format!("k{n}"), n.to_string());
                    Ok(())
                })
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let stored = env.session.repository.load_one(id).await.unwrap();
    assert_eq!(stored.metadata().len(), 10);
    assert_eq!(registry.get(id).await.unwrap(), stored);
}
