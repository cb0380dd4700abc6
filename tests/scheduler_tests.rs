
use batchq::driver::{DriverEvent, TaskState, TaskStatus};
use batchq::error::SchedulerError;
use batchq::scheduler::{Job, JobState, Resources};
use test_harness::{offer, test_scheduler_config, Harness, KillMode, LaunchMode, APP, OWNER};

#[tokio::test]
async fn test_oversized_job_is_rejected_and_never_queued() {
    let h = Harness::new();
    let err = h
        .service
        .schedule(OWNER, Job::new(APP, "true", Resources::new(64, 128)))
        .await
        .unwrap_err();

    assert!(matches!(err, SchedulerError::Validation(_)));
    assert_eq!(h.counts_total().await, 0);
    assert!(h.driver.launches().is_empty());
}

#[tokio::test]
async fn test_offer_launches_queued_jobs_in_id_order() {
    let h = Harness::new();
    let j1 = h.submit("echo 1").await;
    let j2 = h.submit("echo 2").await;
    let j3 = h.submit("echo 3").await;
    assert_eq!(j1.state, JobState::Queued);

    let launched = h
        .scheduler
        .resource_offers(vec![offer("o1", 2, 256)])
        .await
        .unwrap();

    assert_eq!(launched, 2);
    assert_eq!(h.driver.launched_jobs(), vec![j1.id, j2.id]);
    assert_eq!(h.state(j1.id).await, JobState::Starting);
    assert_eq!(h.state(j2.id).await, JobState::Starting);
    assert_eq!(h.state(j3.id).await, JobState::Queued);

    let (offer_id, spec) = &h.driver.launches()[0];
    assert_eq!(offer_id, "o1");
    assert_eq!(spec.command, "echo 1");
    assert_eq!(h.job(j1.id).await.task_id.as_deref(), Some(spec.task_id.as_str()));
}

#[tokio::test]
async fn test_large_job_skipped_smaller_job_placed() {
    let h = Harness::new();
    let big = h.submit_sized("big", Resources::new(4, 1024)).await;
    let small = h.submit("small").await;

    h.scheduler
        .resource_offers(vec![offer("o1", 2, 512)])
        .await
        .unwrap();

    assert_eq!(h.driver.launched_jobs(), vec![small.id]);
    assert_eq!(h.state(big.id).await, JobState::Queued);
}

#[tokio::test]
async fn test_partially_used_offer_remainder_is_declined() {
    let h = Harness::new();
    h.submit("only").await;

    h.scheduler
        .resource_offers(vec![offer("o1", 4, 4096)])
        .await
        .unwrap();

    assert_eq!(h.driver.declines(), vec!["o1".to_string()]);
    assert_eq!(h.scheduler.stocked_offers().await, 0);
}

#[tokio::test]
async fn test_unused_offer_is_stocked_and_used_on_submit() {
    let h = Harness::new();
    h.scheduler
        .resource_offers(vec![offer("o1", 2, 256)])
        .await
        .unwrap();
    assert_eq!(h.scheduler.stocked_offers().await, 1);
    assert!(h.driver.declines().is_empty());

    let job = h.submit("now").await;

    assert_eq!(job.state, JobState::Starting);
    assert_eq!(h.driver.launched_jobs(), vec![job.id]);
    assert_eq!(h.driver.launches()[0].0, "o1");
    assert_eq!(h.driver.declines(), vec!["o1".to_string()]);
    assert_eq!(h.scheduler.stocked_offers().await, 0);
}

#[tokio::test]
async fn test_stocked_offer_too_small_leaves_job_queued() {
    let h = Harness::new();
    h.scheduler
        .resource_offers(vec![offer("o1", 1, 64)])
        .await
        .unwrap();

    let job = h.submit("needs more").await;

    assert_eq!(job.state, JobState::Queued);
    assert!(h.driver.launches().is_empty());
    assert_eq!(h.scheduler.stocked_offers().await, 1);
}

#[tokio::test]
async fn test_offer_stock_is_bounded() {
    let h = Harness::new();
    let offers = (0..6).map(|i| offer(&format!("o{}", i), 1, 64)).collect();
    h.scheduler.resource_offers(offers).await.unwrap();

    // Capacity 4: the two oldest are declined.
    assert_eq!(h.scheduler.stocked_offers().await, 4);
    assert_eq!(h.driver.declines(), vec!["o0".to_string(), "o1".to_string()]);
}

#[tokio::test]
async fn test_rescinded_offer_is_not_used() {
    let h = Harness::new();
    h.scheduler
        .resource_offers(vec![offer("o1", 2, 256)])
        .await
        .unwrap();
    assert!(h.scheduler.offer_rescinded("o1".to_string()).await.unwrap());
    assert!(!h.scheduler.offer_rescinded("o1".to_string()).await.unwrap());

    let job = h.submit("late").await;
    assert_eq!(job.state, JobState::Queued);
    assert!(h.driver.launches().is_empty());
}

#[tokio::test]
async fn test_rejected_launch_leaves_job_queued() {
    let h = Harness::new();
    let job = h.submit("true").await;
    h.driver.set_launch_mode(LaunchMode::Reject);

    let launched = h
        .scheduler
        .resource_offers(vec![offer("o1", 1, 128)])
        .await
        .unwrap();

    assert_eq!(launched, 0);
    let job = h.job(job.id).await;
    assert_eq!(job.state, JobState::Queued);
    assert!(job.task_id.is_none());
}

#[tokio::test]
async fn test_failed_launch_leaves_job_queued() {
    let h = Harness::new();
    let job = h.submit("true").await;
    h.driver.set_launch_mode(LaunchMode::Fail);

    h.scheduler
        .resource_offers(vec![offer("o1", 1, 128)])
        .await
        .unwrap();
    assert_eq!(h.state(job.id).await, JobState::Queued);

    // The next offer picks it up once the driver recovers.
    h.driver.set_launch_mode(LaunchMode::Accept);
    h.scheduler
        .resource_offers(vec![offer("o2", 1, 128)])
        .await
        .unwrap();
    assert_eq!(h.state(job.id).await, JobState::Starting);
}

#[tokio::test]
async fn test_launch_timeout_leaves_job_queued() {
    let h = Harness::new();
    let job = h.submit("true").await;
    h.driver.set_launch_mode(LaunchMode::Hang);

    let launched = h
        .scheduler
        .resource_offers(vec![offer("o1", 1, 128)])
        .await
        .unwrap();

    assert_eq!(launched, 0);
    assert_eq!(h.state(job.id).await, JobState::Queued);
}

#[tokio::test]
async fn test_offers_without_driver_fail_closed() {
    let h = Harness::new();
    h.submit("true").await;
    h.scheduler.detach_driver().await;

    let err = h
        .scheduler
        .resource_offers(vec![offer("o1", 1, 128)])
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::DriverUnavailable(_)));
}

#[tokio::test]
async fn test_status_updates_drive_job_to_finished() {
    let h = Harness::new();
    let (id, task_id) = h.start_job("true", "o1").await;
    let job = h.job(id).await;
    assert!(job.started.is_some());

    h.status(&task_id, TaskState::Finished, Some(0)).await.unwrap();

    let job = h.job(id).await;
    assert_eq!(job.state, JobState::Finished);
    assert_eq!(job.result, Some(0));
    assert!(job.task_id.is_none());
}

#[tokio::test]
async fn test_running_status_records_sandbox_url() {
    let h = Harness::new();
    let job = h.submit("true").await;
    h.scheduler
        .resource_offers(vec![offer("o1", 1, 128)])
        .await
        .unwrap();
    let task_id = h.task_id(job.id).await;

    h.scheduler
        .status_update(
            TaskStatus::new(&task_id, TaskState::Running).with_sandbox_url("http://agent/sandbox"),
        )
        .await
        .unwrap();

    assert_eq!(h.job(job.id).await.url.as_deref(), Some("http://agent/sandbox"));
}

#[tokio::test]
async fn test_failed_and_lost_tasks_record_result_codes() {
    let h = Harness::new();
    let (failed, failed_task) = h.start_job("exit 3", "o1").await;
    let (lost, lost_task) = h.start_job("sleep 10", "o2").await;

    h.status(&failed_task, TaskState::Failed, Some(3)).await.unwrap();
    h.status(&lost_task, TaskState::Lost, None).await.unwrap();

    let failed = h.job(failed).await;
    assert_eq!(failed.state, JobState::Finished);
    assert_eq!(failed.result, Some(3));

    let lost = h.job(lost).await;
    assert_eq!(lost.state, JobState::Finished);
    assert_eq!(lost.result, Some(-1));
}

#[tokio::test]
async fn test_lost_task_is_requeued_and_relaunched() {
    let h = Harness::with_config(test_scheduler_config().with_lost_task_retries(3));
    let (id, task_id) = h.start_job("sleep 10", "o1").await;

    h.status(&task_id, TaskState::Lost, None).await.unwrap();

    let job = h.job(id).await;
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.attempts, 1);
    assert!(job.task_id.is_none());
    assert!(job.reason.unwrap().contains("TASK_LOST"));

    // A late update for the old task no longer matches anything.
    h.status(&task_id, TaskState::Finished, Some(0)).await.unwrap();
    assert_eq!(h.state(id).await, JobState::Queued);

    h.scheduler
        .resource_offers(vec![offer("o2", 1, 128)])
        .await
        .unwrap();
    let new_task = h.task_id(id).await;
    assert_ne!(new_task, task_id);
    h.status(&new_task, TaskState::Running, None).await.unwrap();
    h.status(&new_task, TaskState::Finished, Some(0)).await.unwrap();

    let job = h.job(id).await;
    assert_eq!(job.state, JobState::Finished);
    assert_eq!(job.result, Some(0));
}

#[tokio::test]
async fn test_lost_task_requeues_stop_when_budget_used() {
    let h = Harness::with_config(test_scheduler_config().with_lost_task_retries(1));
    let (id, task_id) = h.start_job("sleep 10", "o1").await;
    h.status(&task_id, TaskState::Lost, None).await.unwrap();
    assert_eq!(h.state(id).await, JobState::Queued);

    h.scheduler
        .resource_offers(vec![offer("o2", 1, 128)])
        .await
        .unwrap();
    let task_id = h.task_id(id).await;
    h.status(&task_id, TaskState::Lost, None).await.unwrap();

    let job = h.job(id).await;
    assert_eq!(job.state, JobState::Finished);
    assert_eq!(job.result, Some(-1));
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_failed_task_retries_within_job_budget() {
    let h = Harness::new();
    let mut job = Job::new(APP, "flaky", Resources::new(1, 128));
    job.retry = 1;
    let job = h.service.schedule(OWNER, job).await.unwrap();

    for (round, offer_id) in ["o1", "o2"].into_iter().enumerate() {
        h.scheduler
            .resource_offers(vec![offer(offer_id, 1, 128)])
            .await
            .unwrap();
        let task_id = h.task_id(job.id).await;
        h.status(&task_id, TaskState::Running, None).await.unwrap();
        h.status(&task_id, TaskState::Failed, Some(2)).await.unwrap();

        let state = h.state(job.id).await;
        if round == 0 {
            assert_eq!(state, JobState::Queued);
        } else {
            assert_eq!(state, JobState::Finished);
        }
    }
    assert_eq!(h.job(job.id).await.result, Some(2));
    assert_eq!(h.driver.launched_jobs(), vec![job.id, job.id]);
}

#[tokio::test]
async fn test_lost_task_with_pending_kill_is_not_requeued() {
    let h = Harness::with_config(test_scheduler_config().with_lost_task_retries(3));
    let (id, task_id) = h.start_job("sleep 60", "o1").await;
    h.scheduler
        .queue()
        .write()
        .await
        .cancel(id, "cancelled by alice")
        .unwrap();

    h.status(&task_id, TaskState::Lost, None).await.unwrap();

    let job = h.job(id).await;
    assert_eq!(job.state, JobState::Finished);
    assert_eq!(job.result, Some(-1));
}

#[tokio::test]
async fn test_fragmented_stock_is_declined_for_large_job() {
    let h = Harness::new();
    h.scheduler
        .resource_offers(vec![offer("o1", 1, 256), offer("o2", 1, 256)])
        .await
        .unwrap();
    assert_eq!(h.scheduler.stocked_offers().await, 2);

    let big = h.submit_sized("big", Resources::new(2, 512)).await;

    // Neither fragment holds it, both together do: hand them back.
    assert_eq!(big.state, JobState::Queued);
    assert_eq!(h.scheduler.stocked_offers().await, 0);
    assert_eq!(h.driver.declines(), vec!["o1".to_string(), "o2".to_string()]);

    h.scheduler
        .resource_offers(vec![offer("o3", 2, 512)])
        .await
        .unwrap();
    assert_eq!(h.state(big.id).await, JobState::Starting);
}

#[tokio::test]
async fn test_arriving_fragment_merges_with_stock_for_queued_job() {
    let h = Harness::new();
    let big = h.submit_sized("big", Resources::new(2, 512)).await;

    h.scheduler
        .resource_offers(vec![offer("o1", 1, 256)])
        .await
        .unwrap();
    assert_eq!(h.scheduler.stocked_offers().await, 1);
    assert!(h.driver.declines().is_empty());

    h.scheduler
        .resource_offers(vec![offer("o2", 1, 256)])
        .await
        .unwrap();
    assert_eq!(h.scheduler.stocked_offers().await, 0);
    assert_eq!(h.driver.declines(), vec!["o1".to_string(), "o2".to_string()]);
    assert_eq!(h.state(big.id).await, JobState::Queued);
}

#[tokio::test]
async fn test_fragments_from_other_agents_are_kept() {
    let h = Harness::new();
    let big = h.submit_sized("big", Resources::new(2, 512)).await;

    let mut elsewhere = offer("o1", 1, 256);
    elsewhere.agent_id = "agent-2".to_string();
    h.scheduler
        .resource_offers(vec![elsewhere, offer("o2", 1, 256)])
        .await
        .unwrap();

    assert_eq!(h.scheduler.stocked_offers().await, 2);
    assert!(h.driver.declines().is_empty());
    assert_eq!(h.state(big.id).await, JobState::Queued);
}

#[tokio::test]
async fn test_status_for_unknown_task_is_discarded() {
    let h = Harness::new();
    h.status("batchq-99-deadbeef", TaskState::Finished, Some(0))
        .await
        .unwrap();
    assert_eq!(h.counts_total().await, 0);
}

#[tokio::test]
async fn test_duplicate_running_update_is_out_of_order() {
    let h = Harness::new();
    let (id, task_id) = h.start_job("true", "o1").await;

    let err = h.status(&task_id, TaskState::Running, None).await.unwrap_err();
    assert!(matches!(err, SchedulerError::CallbackOutOfOrder { job_id, .. } if job_id == id));
    assert_eq!(h.state(id).await, JobState::Started);

    // Through the event entry point the same update is only logged.
    h.scheduler
        .handle_event(DriverEvent::StatusUpdate(TaskStatus::new(&task_id, TaskState::Running)))
        .await;
    assert_eq!(h.state(id).await, JobState::Started);
}

#[tokio::test]
async fn test_unrequested_kill_status_records_killed() {
    let h = Harness::new();
    let (id, task_id) = h.start_job("sleep 60", "o1").await;

    h.scheduler
        .status_update(
            TaskStatus::new(&task_id, TaskState::Killed)
                .with_result(137)
                .with_message("agent shutting down"),
        )
        .await
        .unwrap();

    let job = h.job(id).await;
    assert_eq!(job.state, JobState::Killed);
    assert_eq!(job.result, Some(137));
    assert_eq!(job.reason.as_deref(), Some("agent shutting down"));
}

#[tokio::test]
async fn test_cancel_queued_job_never_contacts_driver() {
    let h = Harness::new();
    let job = h.submit("sleep 60").await;

    assert!(h.service.cancel(OWNER, job.id).await.unwrap());

    assert_eq!(h.state(job.id).await, JobState::Killed);
    assert!(h.driver.kills().is_empty());
    let list = h.service.list(OWNER, 0).await.unwrap();
    assert!(list.running.is_empty());
    assert_eq!(list.finished.len(), 1);

    // Offers arriving later do not resurrect it.
    h.scheduler
        .resource_offers(vec![offer("o1", 4, 1024)])
        .await
        .unwrap();
    assert!(h.driver.launches().is_empty());
    assert_eq!(h.state(job.id).await, JobState::Killed);
}

#[tokio::test]
async fn test_cancel_started_job_kills_task_and_ignores_stray_finish() {
    let h = Harness::new();
    let (id, task_id) = h.start_job("sleep 60", "o1").await;

    assert!(h.service.cancel(OWNER, id).await.unwrap());
    assert_eq!(h.driver.kills(), vec![task_id.clone()]);
    assert_eq!(h.state(id).await, JobState::Killed);

    h.status(&task_id, TaskState::Finished, Some(0)).await.unwrap();

    let job = h.job(id).await;
    assert_eq!(job.state, JobState::Killed);
    assert_eq!(job.result, None);
    assert_eq!(job.task_id.as_deref(), Some(task_id.as_str()));
}

#[tokio::test]
async fn test_cancel_twice_second_is_noop() {
    let h = Harness::new();
    let (id, _) = h.start_job("sleep 60", "o1").await;

    assert!(h.service.cancel(OWNER, id).await.unwrap());
    assert!(!h.service.cancel(OWNER, id).await.unwrap());
    assert_eq!(h.driver.kills().len(), 1);
}

#[tokio::test]
async fn test_cancel_without_driver_fails_closed() {
    let h = Harness::new();
    let (id, _) = h.start_job("sleep 60", "o1").await;
    h.scheduler.detach_driver().await;

    let err = h.service.cancel(OWNER, id).await.unwrap_err();
    assert!(matches!(err, SchedulerError::DriverUnavailable(_)));

    let job = h.job(id).await;
    assert_eq!(job.state, JobState::Started);
    assert!(job.kill_requested.is_none());
}

#[tokio::test]
async fn test_cancel_queued_job_works_without_driver() {
    let h = Harness::new();
    let job = h.submit("sleep 60").await;
    h.scheduler.detach_driver().await;

    assert!(h.service.cancel(OWNER, job.id).await.unwrap());
    assert_eq!(h.state(job.id).await, JobState::Killed);
}

#[tokio::test]
async fn test_kill_of_task_unknown_to_driver_is_race_lost() {
    let h = Harness::new();
    let (id, _) = h.start_job("sleep 60", "o1").await;
    h.driver.set_kill_mode(KillMode::UnknownTask);

    let err = h.scheduler.cancel(id, "stop".to_string()).await.unwrap_err();
    assert!(matches!(err, SchedulerError::RaceLost(r) if r == id));

    // The service reports it as "nothing dispatched", not as a failure.
    assert!(!h.service.cancel(OWNER, id).await.unwrap());

    let job = h.job(id).await;
    assert_eq!(job.state, JobState::Started);
    assert!(job.kill_requested.is_none());
}

#[tokio::test]
async fn test_failed_kill_leaves_job_running() {
    let h = Harness::new();
    let (id, _) = h.start_job("sleep 60", "o1").await;

    for mode in [KillMode::Fail, KillMode::Hang] {
        h.driver.set_kill_mode(mode);
        let err = h.service.cancel(OWNER, id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DriverUnavailable(_)), "{:?}", mode);

        let job = h.job(id).await;
        assert_eq!(job.state, JobState::Started);
        assert!(job.kill_requested.is_none());
    }
}

#[tokio::test]
async fn test_cancel_of_other_owners_job_is_not_found() {
    let h = Harness::new();
    let job = h.submit("sleep 60").await;

    let err = h.service.cancel("mallory", job.id).await.unwrap_err();
    assert!(matches!(err, SchedulerError::NotFound(_)));
    assert_eq!(h.state(job.id).await, JobState::Queued);
}
