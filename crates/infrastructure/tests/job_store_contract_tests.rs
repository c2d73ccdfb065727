//! 内存存储与持久化存储共同遵守的作业存储契约

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use scheduler_core::config::DatabaseConfig;
use scheduler_core::SchedulerError;
use scheduler_domain::{
    CreateJobConflictAction, JobData, JobExecutionDetails, JobSpec, JobState, JobStore,
    PeriodicTrigger, SaveOutcome,
};
use scheduler_infrastructure::{
    connect_job_store_dao, MemoryJobStore, PersistentJobStore, PersistentJobStoreOptions,
};
use uuid::Uuid;

fn spec(name: &str) -> JobSpec {
    JobSpec::new(
        name,
        format!("{name} 作业"),
        "test",
        PeriodicTrigger::daily(Utc::now()).into(),
    )
    .unwrap()
}

async fn sqlite_store() -> Arc<dyn JobStore> {
    let config = DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        ..DatabaseConfig::default()
    };
    let dao = connect_job_store_dao(&config).await.unwrap();
    Arc::new(PersistentJobStore::new(
        dao,
        PersistentJobStoreOptions {
            scheduler_expiration_time: Duration::from_secs(120),
            polling_interval: Duration::from_millis(200),
        },
    ))
}

async fn stores() -> Vec<(&'static str, Arc<dyn JobStore>)> {
    vec![
        ("memory", Arc::new(MemoryJobStore::new()) as Arc<dyn JobStore>),
        ("sqlite", sqlite_store().await),
    ]
}

#[tokio::test]
async fn test_create_job_conflict_actions() {
    for (kind, store) in stores().await {
        let created_at = Utc::now();
        assert!(store
            .create_job(&spec("a"), None, created_at, CreateJobConflictAction::Throw)
            .await
            .unwrap());

        let ignored = store
            .create_job(&spec("a"), None, created_at, CreateJobConflictAction::Ignore)
            .await
            .unwrap();
        assert!(!ignored, "{kind}");

        let err = store
            .create_job(&spec("a"), None, created_at, CreateJobConflictAction::Throw)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::JobAlreadyExists { .. }), "{kind}");

        let job = store.get_job_details("a").await.unwrap().unwrap();
        assert_eq!(job.job_state, JobState::Pending, "{kind}");
        assert_eq!(job.version, 0, "{kind}");
        assert!(job.last_job_execution_details.is_none(), "{kind}");
    }
}

#[tokio::test]
async fn test_create_job_update_overwrites_and_resets() {
    for (kind, store) in stores().await {
        store
            .create_job(&spec("a"), None, Utc::now(), CreateJobConflictAction::Throw)
            .await
            .unwrap();

        let mut job = store.get_job_details("a").await.unwrap().unwrap();
        job.job_state = JobState::Scheduled;
        job.next_trigger_fire_time = Some(Utc::now() + ChronoDuration::hours(1));
        assert!(store.save_job_details(&mut job).await.unwrap().is_saved());

        let mut replacement = spec("a");
        replacement.description = "新描述".to_string();
        let data = JobData::new().with("k", serde_json::json!("v"));
        assert!(store
            .create_job(&replacement, Some(&data), Utc::now(), CreateJobConflictAction::Update)
            .await
            .unwrap());

        let updated = store.get_job_details("a").await.unwrap().unwrap();
        assert_eq!(updated.job_spec.description, "新描述", "{kind}");
        assert_eq!(updated.job_data, Some(data), "{kind}");
        assert_eq!(updated.job_state, JobState::Pending, "{kind}");
        assert_eq!(updated.next_trigger_fire_time, None, "{kind}");
        assert_eq!(updated.version, job.version + 1, "{kind}");
    }
}

#[tokio::test]
async fn test_update_job_renames_and_rejects_taken_names() {
    for (kind, store) in stores().await {
        for name in ["a", "b"] {
            store
                .create_job(&spec(name), None, Utc::now(), CreateJobConflictAction::Throw)
                .await
                .unwrap();
        }

        let err = store.update_job("a", &spec("b")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::JobAlreadyExists { .. }), "{kind}");

        let err = store.update_job("missing", &spec("z")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::JobNotFound { .. }), "{kind}");

        store.update_job("a", &spec("c")).await.unwrap();
        assert_eq!(store.get_job_names().await.unwrap(), vec!["b", "c"], "{kind}");
        let renamed = store.get_job_details("c").await.unwrap().unwrap();
        assert_eq!(renamed.job_state, JobState::Pending, "{kind}");
        assert_eq!(renamed.version, 1, "{kind}");
    }
}

#[tokio::test]
async fn test_delete_job_and_sorted_names() {
    for (kind, store) in stores().await {
        for name in ["delta", "alpha", "charlie"] {
            store
                .create_job(&spec(name), None, Utc::now(), CreateJobConflictAction::Throw)
                .await
                .unwrap();
        }
        assert_eq!(
            store.get_job_names().await.unwrap(),
            vec!["alpha", "charlie", "delta"],
            "{kind}"
        );

        assert!(store.delete_job("charlie").await.unwrap(), "{kind}");
        assert!(!store.delete_job("charlie").await.unwrap(), "{kind}");
        assert!(store.get_job_details("charlie").await.unwrap().is_none(), "{kind}");
    }
}

#[tokio::test]
async fn test_concurrent_saves_with_same_version() {
    for (kind, store) in stores().await {
        store
            .create_job(&spec("race"), None, Utc::now(), CreateJobConflictAction::Throw)
            .await
            .unwrap();
        let original = store.get_job_details("race").await.unwrap().unwrap();

        let mut first = original.clone();
        first.job_state = JobState::Scheduled;
        let mut second = original.clone();
        second.job_state = JobState::Stopped;

        let (a, b) = tokio::join!(
            store.save_job_details(&mut first),
            store.save_job_details(&mut second)
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        let saved = outcomes.iter().filter(|o| o.is_saved()).count();
        assert_eq!(saved, 1, "{kind}");
        assert!(outcomes.contains(&SaveOutcome::ConcurrentlyModified), "{kind}");

        let stored = store.get_job_details("race").await.unwrap().unwrap();
        assert_eq!(stored.version, original.version + 1, "{kind}");
        let winner = if outcomes[0].is_saved() { &first } else { &second };
        assert_eq!(stored.job_state, winner.job_state, "{kind}");
        assert_eq!(winner.version, stored.version, "{kind}");
    }
}

#[tokio::test]
async fn test_save_after_delete_is_concurrent_modification() {
    for (kind, store) in stores().await {
        store
            .create_job(&spec("gone"), None, Utc::now(), CreateJobConflictAction::Throw)
            .await
            .unwrap();
        let mut job = store.get_job_details("gone").await.unwrap().unwrap();
        store.delete_job("gone").await.unwrap();

        let outcome = store.save_job_details(&mut job).await.unwrap();
        assert_eq!(outcome, SaveOutcome::ConcurrentlyModified, "{kind}");
    }
}

#[tokio::test]
async fn test_watcher_returns_pending_job_immediately() {
    for (kind, store) in stores().await {
        store
            .create_job(&spec("a"), None, Utc::now(), CreateJobConflictAction::Throw)
            .await
            .unwrap();
        let watcher = store.create_job_watcher(Uuid::new_v4()).unwrap();

        let job = tokio::time::timeout(Duration::from_secs(5), watcher.get_next_job_to_process())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(job.name(), "a", "{kind}");
        assert_eq!(job.job_state, JobState::Pending, "{kind}");
    }
}

#[tokio::test]
async fn test_watcher_wakes_on_new_job() {
    for (kind, store) in stores().await {
        let watcher = store.create_job_watcher(Uuid::new_v4()).unwrap();
        let waiting = tokio::spawn({
            let watcher = Arc::clone(&watcher);
            async move { watcher.get_next_job_to_process().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished(), "{kind}");

        store
            .create_job(&spec("late"), None, Utc::now(), CreateJobConflictAction::Throw)
            .await
            .unwrap();

        let job = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(job.name(), "late", "{kind}");
    }
}

#[tokio::test]
async fn test_watcher_claims_job_when_fire_time_arrives() {
    for (kind, store) in stores().await {
        store
            .create_job(&spec("soon"), None, Utc::now(), CreateJobConflictAction::Throw)
            .await
            .unwrap();
        let mut job = store.get_job_details("soon").await.unwrap().unwrap();
        job.job_state = JobState::Scheduled;
        job.next_trigger_fire_time = Some(Utc::now() + ChronoDuration::milliseconds(300));
        assert!(store.save_job_details(&mut job).await.unwrap().is_saved());

        let watcher = store.create_job_watcher(Uuid::new_v4()).unwrap();
        let claimed = tokio::time::timeout(Duration::from_secs(5), watcher.get_next_job_to_process())
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(claimed.job_state, JobState::Triggered, "{kind}");
        assert_eq!(claimed.version, job.version + 1, "{kind}");
    }
}

#[tokio::test]
async fn test_watcher_dispose_unblocks_wait() {
    for (kind, store) in stores().await {
        let watcher = store.create_job_watcher(Uuid::new_v4()).unwrap();
        let waiting = tokio::spawn({
            let watcher = Arc::clone(&watcher);
            async move { watcher.get_next_job_to_process().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        watcher.dispose();

        let result = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(result.is_none(), "{kind}");
    }
}

#[tokio::test]
async fn test_store_dispose_fails_pending_wait_and_later_calls() {
    for (kind, store) in stores().await {
        let watcher = store.create_job_watcher(Uuid::new_v4()).unwrap();
        let waiting = tokio::spawn({
            let watcher = Arc::clone(&watcher);
            async move { watcher.get_next_job_to_process().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.dispose();
        store.dispose();

        let err = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.is_disposed(), "{kind}");
        assert!(store.get_job_names().await.unwrap_err().is_disposed(), "{kind}");
    }
}

#[tokio::test]
async fn test_unregistered_scheduler_jobs_become_orphaned() {
    for (kind, store) in stores().await {
        let owner = Uuid::new_v4();
        store.register_scheduler(owner, "owner").await.unwrap();
        store
            .create_job(&spec("long"), None, Utc::now(), CreateJobConflictAction::Throw)
            .await
            .unwrap();

        let mut job = store.get_job_details("long").await.unwrap().unwrap();
        job.job_state = JobState::Running;
        job.last_job_execution_details = Some(JobExecutionDetails::new(owner, Utc::now()));
        assert!(store.save_job_details(&mut job).await.unwrap().is_saved());

        store.unregister_scheduler(owner).await.unwrap();

        let watcher = store.create_job_watcher(Uuid::new_v4()).unwrap();
        let orphan = tokio::time::timeout(Duration::from_secs(5), watcher.get_next_job_to_process())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(orphan.name(), "long", "{kind}");
        assert_eq!(orphan.job_state, JobState::Orphaned, "{kind}");
    }
}
