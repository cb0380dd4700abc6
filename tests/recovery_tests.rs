
use std::sync::Arc;

use batchq::driver::TaskState;
use batchq::scheduler::JobState;
use batchq::store::{RedbStore, Store};
use tempfile::TempDir;
use test_harness::{offer, test_scheduler_config, Harness, OWNER};

/// Confirm every live task: STARTING tasks report RUNNING, then all report
/// FINISHED with exit code 0.
async fn finish_running(h: &Harness) {
    let running: Vec<(u64, JobState, String)> = h
        .scheduler
        .queue()
        .read()
        .await
        .running_jobs()
        .into_iter()
        .map(|j| (j.id, j.state, j.task_id.clone().unwrap()))
        .collect();

    for (_, state, task_id) in running {
        if state == JobState::Starting {
            h.status(&task_id, TaskState::Running, None).await.unwrap();
        }
        h.status(&task_id, TaskState::Finished, Some(0)).await.unwrap();
    }
}

#[tokio::test]
async fn test_64_jobs_survive_restart_and_all_finish() {
    let h = Harness::new();
    let mut ids = Vec::new();
    for i in 0..64 {
        ids.push(h.submit(&format!("echo {}", i)).await.id);
        assert_eq!(h.counts_total().await, i + 1);
    }

    // Launch 16, confirm them running, finish half.
    let launched = h
        .scheduler
        .resource_offers(vec![offer("o-0", 16, 16 * 128)])
        .await
        .unwrap();
    assert_eq!(launched, 16);
    assert_eq!(h.counts_total().await, 64);

    for id in &ids[..16] {
        let task_id = h.task_id(*id).await;
        h.status(&task_id, TaskState::Running, None).await.unwrap();
    }
    for id in &ids[..8] {
        let task_id = h.task_id(*id).await;
        h.status(&task_id, TaskState::Finished, Some(0)).await.unwrap();
    }
    // Two more launched but never confirmed before the crash.
    h.scheduler
        .resource_offers(vec![offer("o-1", 2, 256)])
        .await
        .unwrap();
    assert_eq!(h.counts_total().await, 64);

    // Crash: a new queue is rebuilt from the store.
    let h = h.restart();
    let counts = h.scheduler.queue().read().await.counts();
    assert_eq!(counts.queued + counts.running + counts.finished, 64);
    assert_eq!(counts.finished, 8);
    assert_eq!(counts.running, 10);
    assert_eq!(counts.queued, 46);

    h.attach();
    assert_eq!(h.scheduler.reconcile().await.unwrap(), 10);
    assert_eq!(h.driver.reconciles().last().unwrap().len(), 10);

    // Drive everything to completion.
    let mut round = 2;
    loop {
        finish_running(&h).await;
        assert_eq!(h.counts_total().await, 64);

        let counts = h.scheduler.queue().read().await.counts();
        if counts.queued == 0 && counts.running == 0 {
            break;
        }
        h.scheduler
            .resource_offers(vec![offer(&format!("o-{}", round), 16, 16 * 128)])
            .await
            .unwrap();
        round += 1;
        assert!(round < 20, "jobs did not drain");
    }

    for id in ids {
        let job = h.job(id).await;
        assert_eq!(job.state, JobState::Finished, "job {}", id);
        assert_eq!(job.result, Some(0), "job {}", id);
    }
    assert_eq!(h.driver.launched_jobs().len(), 64);
}

#[tokio::test]
async fn test_tasks_lost_across_restart_are_run_again() {
    let h = Harness::with_config(test_scheduler_config().with_lost_task_retries(1));
    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(h.submit(&format!("echo {}", i)).await.id);
    }
    h.scheduler
        .resource_offers(vec![offer("o-0", 4, 4 * 128)])
        .await
        .unwrap();
    for id in &ids[..2] {
        let task_id = h.task_id(*id).await;
        h.status(&task_id, TaskState::Running, None).await.unwrap();
    }
    let lost: Vec<String> = {
        let queue = h.scheduler.queue().read().await;
        queue
            .running_jobs()
            .into_iter()
            .filter_map(|j| j.task_id.clone())
            .collect()
    };
    assert_eq!(lost.len(), 4);

    // The resource manager forgot every task while the scheduler was down.
    let h = h.restart();
    h.attach();
    assert_eq!(h.scheduler.reconcile().await.unwrap(), 4);
    for task_id in &lost {
        h.status(task_id, TaskState::Lost, None).await.unwrap();
    }
    let counts = h.scheduler.queue().read().await.counts();
    assert_eq!(counts.queued, 6);
    assert_eq!(counts.running, 0);

    let launched = h
        .scheduler
        .resource_offers(vec![offer("o-1", 6, 6 * 128)])
        .await
        .unwrap();
    assert_eq!(launched, 6);
    finish_running(&h).await;

    for id in ids {
        let job = h.job(id).await;
        assert_eq!(job.state, JobState::Finished, "job {}", id);
        assert_eq!(job.result, Some(0), "job {}", id);
    }
    assert_eq!(h.driver.launched_jobs().len(), 10);
}

#[tokio::test]
async fn test_ids_continue_after_restart() {
    let h = Harness::new();
    let first = h.submit("one").await.id;
    let second = h.submit("two").await.id;

    let h = h.restart();
    h.attach();
    let third = h.submit("three").await.id;
    assert!(first < second && second < third);
}

#[tokio::test]
async fn test_interrupted_kill_is_resumed_after_restart() {
    let h = Harness::new();
    let (id, task_id) = h.start_job("sleep 60", "o1").await;

    // Crash right after the kill was marked, before the driver heard about it.
    h.scheduler
        .queue()
        .write()
        .await
        .cancel(id, "cancelled by alice")
        .unwrap();
    assert!(h.driver.kills().is_empty());

    let h = h.restart();
    assert_eq!(h.scheduler.queue().read().await.pending_kills().len(), 1);
    h.attach();

    assert_eq!(h.scheduler.resume_pending_kills().await.unwrap(), 1);
    assert_eq!(h.driver.kills(), vec![task_id]);

    let job = h.job(id).await;
    assert_eq!(job.state, JobState::Killed);
    assert_eq!(job.reason.as_deref(), Some("cancelled by alice"));
    assert!(h.scheduler.queue().read().await.pending_kills().is_empty());
}

#[tokio::test]
async fn test_nothing_to_resume_or_reconcile_on_clean_start() {
    let h = Harness::new();
    assert_eq!(h.scheduler.resume_pending_kills().await.unwrap(), 0);
    assert_eq!(h.scheduler.reconcile().await.unwrap(), 0);
    assert!(h.driver.reconciles().is_empty());
}

#[tokio::test]
async fn test_redb_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.redb");

    let (queued, started, finished) = {
        let store: Arc<dyn Store> = Arc::new(RedbStore::open(&path).unwrap());
        let h = Harness::with_store(store);
        let (finished, finished_task) = h.start_job("true", "o1").await;
        h.status(&finished_task, TaskState::Finished, Some(0))
            .await
            .unwrap();
        let (started, _) = h.start_job("sleep 60", "o2").await;
        let queued = h.submit("later").await.id;
        (queued, started, finished)
    };

    let store: Arc<dyn Store> = Arc::new(RedbStore::open(&path).unwrap());
    let h = Harness::with_store(store);
    assert_eq!(h.state(queued).await, JobState::Queued);
    assert_eq!(h.state(started).await, JobState::Started);
    assert_eq!(h.state(finished).await, JobState::Finished);
    assert_eq!(h.job(finished).await.result, Some(0));

    let next = h.submit("after reopen").await.id;
    assert!(next > queued);

    let list = h.service.list(OWNER, 0).await.unwrap();
    assert_eq!(list.len(), 4);
}
