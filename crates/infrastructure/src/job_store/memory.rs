//! 进程内作业存储

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    CreateJobConflictAction, JobData, JobDetails, JobSpec, JobState, JobStore, JobWatcher,
    SaveOutcome,
};

use super::base::{JobSource, PollOutcome, PollingJobWatcher, StoreSignal};
use crate::observability::JobEventLogger;

#[derive(Default)]
struct Tables {
    jobs: BTreeMap<String, JobDetails>,
    schedulers: HashMap<Uuid, String>,
}

struct MemoryState {
    tables: Mutex<Tables>,
    signal: StoreSignal,
}

/// 单进程作业存储
///
/// 所有作业保存在一张受互斥锁保护的表中，读写都以克隆交换，调用方拿到的
/// 作业详情与存储内部的记录互不影响。
#[derive(Clone)]
pub struct MemoryJobStore {
    state: Arc<MemoryState>,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MemoryState {
                tables: Mutex::new(Tables::default()),
                signal: StoreSignal::new(),
            }),
        }
    }

    fn ensure_not_disposed(&self) -> SchedulerResult<()> {
        self.state.signal.ensure_not_disposed("MemoryJobStore")
    }
}

#[async_trait]
impl JobSource for MemoryState {
    async fn poll_next_job(&self, _scheduler_guid: Uuid) -> SchedulerResult<PollOutcome> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        let mut next_fire_time: Option<DateTime<Utc>> = None;

        for job in tables.jobs.values_mut() {
            if job.job_state.needs_attention() {
                return Ok(PollOutcome::Ready(job.clone()));
            }

            if job.job_state != JobState::Scheduled {
                continue;
            }

            if let Some(fire_time) = job.next_trigger_fire_time {
                if fire_time <= now {
                    job.job_state = JobState::Triggered;
                    job.version += 1;
                    return Ok(PollOutcome::Ready(job.clone()));
                }
                next_fire_time = Some(next_fire_time.map_or(fire_time, |t| t.min(fire_time)));
            }
        }

        Ok(PollOutcome::Idle(next_fire_time))
    }

    fn signal(&self) -> &StoreSignal {
        &self.signal
    }

    fn max_wait(&self) -> Option<Duration> {
        None
    }

    fn name(&self) -> &'static str {
        "MemoryJobStore"
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn register_scheduler(&self, scheduler_guid: Uuid, scheduler_name: &str) -> SchedulerResult<()> {
        self.ensure_not_disposed()?;
        let mut tables = self.state.tables.lock().await;
        tables
            .schedulers
            .insert(scheduler_guid, scheduler_name.to_string());
        JobEventLogger::log_scheduler_registered(scheduler_guid, scheduler_name);
        Ok(())
    }

    async fn unregister_scheduler(&self, scheduler_guid: Uuid) -> SchedulerResult<()> {
        self.ensure_not_disposed()?;
        let mut tables = self.state.tables.lock().await;
        tables.schedulers.remove(&scheduler_guid);

        let mut orphaned = 0usize;
        for job in tables.jobs.values_mut() {
            if job.is_running_on(scheduler_guid) {
                job.job_state = JobState::Orphaned;
                job.version += 1;
                orphaned += 1;
                JobEventLogger::log_job_orphaned(job.name(), scheduler_guid);
            }
        }
        drop(tables);

        JobEventLogger::log_scheduler_unregistered(scheduler_guid);
        if orphaned > 0 {
            self.state.signal.notify_changed();
        }
        Ok(())
    }

    fn create_job_watcher(&self, scheduler_guid: Uuid) -> SchedulerResult<Arc<dyn JobWatcher>> {
        self.ensure_not_disposed()?;
        Ok(Arc::new(PollingJobWatcher::new(
            Arc::clone(&self.state),
            scheduler_guid,
        )))
    }

    async fn get_job_details(&self, job_name: &str) -> SchedulerResult<Option<JobDetails>> {
        self.ensure_not_disposed()?;
        let tables = self.state.tables.lock().await;
        Ok(tables.jobs.get(job_name).cloned())
    }

    async fn save_job_details(&self, job_details: &mut JobDetails) -> SchedulerResult<SaveOutcome> {
        self.ensure_not_disposed()?;
        let mut tables = self.state.tables.lock().await;

        let Some(stored) = tables.jobs.get_mut(job_details.name()) else {
            debug!(job_name = job_details.name(), "保存时作业已被删除");
            return Ok(SaveOutcome::ConcurrentlyModified);
        };

        if stored.version != job_details.version {
            debug!(
                job_name = job_details.name(),
                expected_version = job_details.version,
                actual_version = stored.version,
                "作业版本不匹配"
            );
            return Ok(SaveOutcome::ConcurrentlyModified);
        }

        job_details.version += 1;
        *stored = job_details.clone();
        drop(tables);

        self.state.signal.notify_changed();
        Ok(SaveOutcome::Saved)
    }

    async fn create_job(
        &self,
        job_spec: &JobSpec,
        job_data: Option<&JobData>,
        creation_time: DateTime<Utc>,
        conflict_action: CreateJobConflictAction,
    ) -> SchedulerResult<bool> {
        self.ensure_not_disposed()?;
        job_spec.validate()?;
        let mut tables = self.state.tables.lock().await;

        if let Some(existing) = tables.jobs.get_mut(&job_spec.name) {
            match conflict_action {
                CreateJobConflictAction::Ignore => return Ok(false),
                CreateJobConflictAction::Throw => {
                    return Err(SchedulerError::JobAlreadyExists {
                        name: job_spec.name.clone(),
                    })
                }
                CreateJobConflictAction::Update => {
                    existing.job_spec = job_spec.clone();
                    existing.job_data = job_data.cloned();
                    existing.job_state = JobState::Pending;
                    existing.clear_trigger_schedule();
                    existing.version += 1;
                }
            }
        } else {
            let details = JobDetails::new(job_spec.clone(), job_data.cloned(), creation_time);
            tables.jobs.insert(job_spec.name.clone(), details);
        }
        drop(tables);

        JobEventLogger::log_job_created(&job_spec.name, &job_spec.job_key, conflict_action);
        self.state.signal.notify_changed();
        Ok(true)
    }

    async fn update_job(&self, existing_job_name: &str, job_spec: &JobSpec) -> SchedulerResult<()> {
        self.ensure_not_disposed()?;
        job_spec.validate()?;
        let mut tables = self.state.tables.lock().await;

        if existing_job_name != job_spec.name && tables.jobs.contains_key(&job_spec.name) {
            return Err(SchedulerError::JobAlreadyExists {
                name: job_spec.name.clone(),
            });
        }

        let mut details = tables
            .jobs
            .remove(existing_job_name)
            .ok_or_else(|| SchedulerError::JobNotFound {
                name: existing_job_name.to_string(),
            })?;

        details.job_spec = job_spec.clone();
        details.job_state = JobState::Pending;
        details.clear_trigger_schedule();
        details.version += 1;
        tables.jobs.insert(job_spec.name.clone(), details);
        drop(tables);

        JobEventLogger::log_job_updated(existing_job_name, &job_spec.name);
        self.state.signal.notify_changed();
        Ok(())
    }

    async fn delete_job(&self, job_name: &str) -> SchedulerResult<bool> {
        self.ensure_not_disposed()?;
        let removed = self.state.tables.lock().await.jobs.remove(job_name).is_some();

        if removed {
            JobEventLogger::log_job_deleted(job_name);
            self.state.signal.notify_changed();
        }
        Ok(removed)
    }

    async fn get_job_names(&self) -> SchedulerResult<Vec<String>> {
        self.ensure_not_disposed()?;
        let tables = self.state.tables.lock().await;
        Ok(tables.jobs.keys().cloned().collect())
    }

    fn dispose(&self) {
        if self.state.signal.dispose() {
            debug!("内存作业存储已释放");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use scheduler_domain::{JobExecutionDetails, PeriodicTrigger};

    fn spec(name: &str) -> JobSpec {
        JobSpec::new(
            name,
            "测试作业",
            "test",
            PeriodicTrigger::one_shot(Utc::now()).into(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_poll_claims_due_scheduled_job() {
        let store = MemoryJobStore::new();
        store
            .create_job(&spec("a"), None, Utc::now(), CreateJobConflictAction::Throw)
            .await
            .unwrap();

        let mut job = store.get_job_details("a").await.unwrap().unwrap();
        job.job_state = JobState::Scheduled;
        job.next_trigger_fire_time = Some(Utc::now() - ChronoDuration::seconds(1));
        assert!(store.save_job_details(&mut job).await.unwrap().is_saved());

        match store.state.poll_next_job(Uuid::new_v4()).await.unwrap() {
            PollOutcome::Ready(claimed) => {
                assert_eq!(claimed.job_state, JobState::Triggered);
                assert_eq!(claimed.version, job.version + 1);
            }
            PollOutcome::Idle(_) => panic!("应当认领到期作业"),
        }
    }

    #[tokio::test]
    async fn test_poll_reports_earliest_future_fire_time() {
        let store = MemoryJobStore::new();
        let soon = Utc::now() + ChronoDuration::minutes(5);
        let later = Utc::now() + ChronoDuration::minutes(10);

        for (name, fire_time) in [("a", later), ("b", soon)] {
            store
                .create_job(&spec(name), None, Utc::now(), CreateJobConflictAction::Throw)
                .await
                .unwrap();
            let mut job = store.get_job_details(name).await.unwrap().unwrap();
            job.job_state = JobState::Scheduled;
            job.next_trigger_fire_time = Some(fire_time);
            assert!(store.save_job_details(&mut job).await.unwrap().is_saved());
        }

        match store.state.poll_next_job(Uuid::new_v4()).await.unwrap() {
            PollOutcome::Idle(next) => assert_eq!(next, Some(soon)),
            PollOutcome::Ready(job) => panic!("不应返回作业: {}", job.name()),
        }
    }

    #[tokio::test]
    async fn test_unregister_orphans_running_jobs() {
        let store = MemoryJobStore::new();
        let guid = Uuid::new_v4();
        store.register_scheduler(guid, "node-a").await.unwrap();
        store
            .create_job(&spec("a"), None, Utc::now(), CreateJobConflictAction::Throw)
            .await
            .unwrap();

        let mut job = store.get_job_details("a").await.unwrap().unwrap();
        job.job_state = JobState::Running;
        job.last_job_execution_details = Some(JobExecutionDetails::new(guid, Utc::now()));
        assert!(store.save_job_details(&mut job).await.unwrap().is_saved());

        store.unregister_scheduler(guid).await.unwrap();

        let job = store.get_job_details("a").await.unwrap().unwrap();
        assert_eq!(job.job_state, JobState::Orphaned);
    }

    #[tokio::test]
    async fn test_operations_fail_after_dispose() {
        let store = MemoryJobStore::new();
        store.dispose();
        store.dispose();

        let err = store.get_job_names().await.unwrap_err();
        assert!(err.is_disposed());
        assert!(store.create_job_watcher(Uuid::new_v4()).is_err());
    }
}
