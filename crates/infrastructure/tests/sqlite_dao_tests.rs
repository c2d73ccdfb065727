//! SQLite 数据访问层：失效检测、认领与心跳

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use scheduler_domain::{
    CreateJobConflictAction, JobExecutionDetails, JobSpec, JobState, JobStore, PeriodicTrigger,
};
use scheduler_infrastructure::{
    JobStoreDao, PersistentJobStore, PersistentJobStoreOptions, SqliteJobStoreDao,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tempfile::TempDir;
use uuid::Uuid;

const EXPIRATION: Duration = Duration::from_secs(120);

async fn file_dao() -> (TempDir, Arc<SqliteJobStoreDao>) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("scheduler.db").display());
    let options = SqliteConnectOptions::from_str(&url)
        .unwrap()
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .unwrap();

    let dao = Arc::new(SqliteJobStoreDao::new(pool));
    dao.ensure_schema().await.unwrap();
    dao.ensure_schema().await.unwrap();
    (dir, dao)
}

fn spec(name: &str) -> JobSpec {
    JobSpec::new(name, "", "test", PeriodicTrigger::daily(Utc::now()).into()).unwrap()
}

async fn mark_running(dao: &SqliteJobStoreDao, name: &str, scheduler_guid: Uuid) {
    dao.create_job(&spec(name), None, Utc::now(), CreateJobConflictAction::Throw)
        .await
        .unwrap();
    let mut job = dao.get_job_details(name).await.unwrap().unwrap();
    job.job_state = JobState::Running;
    job.last_job_execution_details = Some(JobExecutionDetails::new(scheduler_guid, Utc::now()));
    assert!(dao.save_job_details(&job).await.unwrap().is_saved());
}

#[tokio::test]
async fn test_running_job_of_expired_scheduler_is_orphaned() {
    let (_dir, dao) = file_dao().await;
    let owner = Uuid::new_v4();
    let now = Utc::now();
    dao.register_scheduler(owner, "stale", now - ChronoDuration::minutes(10))
        .await
        .unwrap();
    mark_running(&dao, "long", owner).await;

    let next = dao
        .get_next_job_to_process(Uuid::new_v4(), now, EXPIRATION)
        .await
        .unwrap();

    let job = next.job.unwrap();
    assert_eq!(job.name(), "long");
    assert_eq!(job.job_state, JobState::Orphaned);
    assert_eq!(job.version, 2);
    assert_eq!(job.last_job_execution_details.unwrap().scheduler_guid, owner);
}

#[tokio::test]
async fn test_running_job_of_live_scheduler_is_left_alone() {
    let (_dir, dao) = file_dao().await;
    let owner = Uuid::new_v4();
    let now = Utc::now();
    dao.register_scheduler(owner, "alive", now).await.unwrap();
    mark_running(&dao, "long", owner).await;

    let next = dao
        .get_next_job_to_process(Uuid::new_v4(), now, EXPIRATION)
        .await
        .unwrap();
    assert!(next.job.is_none());
    assert!(next.next_fire_time.is_none());

    let job = dao.get_job_details("long").await.unwrap().unwrap();
    assert_eq!(job.job_state, JobState::Running);
}

#[tokio::test]
async fn test_due_jobs_are_claimed_and_future_ones_hinted() {
    let (_dir, dao) = file_dao().await;
    let now = Utc::now();
    let future = now + ChronoDuration::minutes(3);

    for (name, fire_time) in [("due", now - ChronoDuration::seconds(1)), ("later", future)] {
        dao.create_job(&spec(name), None, now, CreateJobConflictAction::Throw)
            .await
            .unwrap();
        let mut job = dao.get_job_details(name).await.unwrap().unwrap();
        job.job_state = JobState::Scheduled;
        job.next_trigger_fire_time = Some(fire_time);
        assert!(dao.save_job_details(&job).await.unwrap().is_saved());
    }

    let next = dao
        .get_next_job_to_process(Uuid::new_v4(), now, EXPIRATION)
        .await
        .unwrap();
    let claimed = next.job.unwrap();
    assert_eq!(claimed.name(), "due");
    assert_eq!(claimed.job_state, JobState::Triggered);
    assert_eq!(
        next.next_fire_time.map(|t| t.timestamp_millis()),
        Some(future.timestamp_millis())
    );
}

#[tokio::test]
async fn test_stale_version_save_is_rejected() {
    let (_dir, dao) = file_dao().await;
    dao.create_job(&spec("a"), None, Utc::now(), CreateJobConflictAction::Throw)
        .await
        .unwrap();
    let stale = dao.get_job_details("a").await.unwrap().unwrap();

    assert!(dao.save_job_details(&stale).await.unwrap().is_saved());
    assert!(!dao.save_job_details(&stale).await.unwrap().is_saved());
    assert_eq!(dao.get_job_details("a").await.unwrap().unwrap().version, 1);
}

async fn stored_state(dao: &SqliteJobStoreDao, name: &str) -> (String, Option<i64>, i64) {
    sqlx::query_as("SELECT job_state, next_trigger_fire_time_ms, version FROM jobs WHERE job_name = $1")
        .bind(name)
        .fetch_one(dao.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_undecodable_jobs_are_stopped_instead_of_blocking_others() {
    let (_dir, dao) = file_dao().await;
    for name in ["a-bad", "b-good", "c-unknown"] {
        dao.create_job(&spec(name), None, Utc::now(), CreateJobConflictAction::Throw)
            .await
            .unwrap();
    }
    sqlx::query("UPDATE jobs SET trigger_object = $1, next_trigger_fire_time_ms = 1 WHERE job_name = 'a-bad'")
        .bind(br#"{"type":"cron","expression":"* * * * *"}"#.to_vec())
        .execute(dao.pool())
        .await
        .unwrap();
    sqlx::query("UPDATE jobs SET job_state = 'PAUSED' WHERE job_name = 'c-unknown'")
        .execute(dao.pool())
        .await
        .unwrap();

    let next = dao
        .get_next_job_to_process(Uuid::new_v4(), Utc::now(), EXPIRATION)
        .await
        .unwrap();
    let job = next.job.unwrap();
    assert_eq!(job.name(), "b-good");
    assert_eq!(job.job_state, JobState::Pending);

    assert_eq!(stored_state(&dao, "a-bad").await, ("STOPPED".to_string(), None, 1));
    assert_eq!(stored_state(&dao, "c-unknown").await, ("STOPPED".to_string(), None, 1));
    assert_eq!(
        dao.get_job_details("c-unknown").await.unwrap().unwrap().job_state,
        JobState::Stopped
    );
    assert_eq!(dao.get_job_names().await.unwrap(), vec!["a-bad", "b-good", "c-unknown"]);
}

#[tokio::test]
async fn test_heartbeat_keeps_scheduler_alive_until_store_disposed() {
    let (_dir, dao) = file_dao().await;
    let expiration = Duration::from_millis(600);
    let store = PersistentJobStore::new(
        dao.clone(),
        PersistentJobStoreOptions {
            scheduler_expiration_time: expiration,
            polling_interval: Duration::from_millis(100),
        },
    );

    let owner = Uuid::new_v4();
    store.register_scheduler(owner, "node-a").await.unwrap();
    mark_running(&dao, "long", owner).await;

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let next = dao
        .get_next_job_to_process(Uuid::new_v4(), Utc::now(), expiration)
        .await
        .unwrap();
    assert!(next.job.is_none(), "心跳仍在刷新时作业不应失效");

    store.dispose();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let next = dao
        .get_next_job_to_process(Uuid::new_v4(), Utc::now(), expiration)
        .await
        .unwrap();
    assert_eq!(next.job.unwrap().job_state, JobState::Orphaned);
}
