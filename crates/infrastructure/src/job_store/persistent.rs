//! 基于数据库的持久化作业存储，支持多个调度器实例组成集群

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use scheduler_core::config::JobStoreConfig;
use scheduler_core::SchedulerResult;
use scheduler_domain::{
    CreateJobConflictAction, JobData, JobDetails, JobSpec, JobStore, JobWatcher, SaveOutcome,
};

use super::base::{JobSource, PollOutcome, PollingJobWatcher, StoreSignal};
use crate::database::JobStoreDao;
use crate::observability::JobEventLogger;

/// 持久化存储参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentJobStoreOptions {
    /// 超过该时间未刷新心跳的调度器视为失效
    pub scheduler_expiration_time: Duration,
    /// 观察器两次查询数据库之间的最长间隔
    pub polling_interval: Duration,
}

impl Default for PersistentJobStoreOptions {
    fn default() -> Self {
        Self {
            scheduler_expiration_time: Duration::from_secs(120),
            polling_interval: Duration::from_secs(15),
        }
    }
}

impl From<&JobStoreConfig> for PersistentJobStoreOptions {
    fn from(config: &JobStoreConfig) -> Self {
        Self {
            scheduler_expiration_time: config.scheduler_expiration_time(),
            polling_interval: config.polling_interval(),
        }
    }
}

impl PersistentJobStoreOptions {
    /// 心跳刷新周期为过期时间的三分之一
    pub fn heartbeat_interval(&self) -> Duration {
        (self.scheduler_expiration_time / 3).max(Duration::from_millis(1))
    }
}

struct Heartbeat {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn cancel(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

struct PersistentState {
    dao: Arc<dyn JobStoreDao>,
    options: PersistentJobStoreOptions,
    signal: StoreSignal,
    heartbeats: Mutex<HashMap<Uuid, Heartbeat>>,
}

impl PersistentState {
    fn take_heartbeat(&self, scheduler_guid: Uuid) -> Option<Heartbeat> {
        self.heartbeats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&scheduler_guid)
    }
}

/// 持久化作业存储
///
/// 集群成员之间只通过数据库中的行版本号和心跳时间戳协调。
#[derive(Clone)]
pub struct PersistentJobStore {
    state: Arc<PersistentState>,
}

impl PersistentJobStore {
    pub fn new(dao: Arc<dyn JobStoreDao>, options: PersistentJobStoreOptions) -> Self {
        Self {
            state: Arc::new(PersistentState {
                dao,
                options,
                signal: StoreSignal::new(),
                heartbeats: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn options(&self) -> PersistentJobStoreOptions {
        self.state.options
    }

    fn ensure_not_disposed(&self) -> SchedulerResult<()> {
        self.state.signal.ensure_not_disposed("PersistentJobStore")
    }

    fn spawn_heartbeat(&self, scheduler_guid: Uuid, scheduler_name: String) -> Heartbeat {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let dao = Arc::clone(&self.state.dao);
        let period = self.state.options.heartbeat_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 注册时已经写过一次心跳
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        match dao.register_scheduler(scheduler_guid, &scheduler_name, now).await {
                            Ok(()) => JobEventLogger::log_scheduler_heartbeat(scheduler_guid, now),
                            Err(e) => warn!(scheduler_guid = %scheduler_guid, "刷新调度器心跳失败: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(scheduler_guid = %scheduler_guid, "心跳任务已停止");
                        break;
                    }
                }
            }
        });

        Heartbeat { shutdown_tx, handle }
    }
}

#[async_trait]
impl JobSource for PersistentState {
    async fn poll_next_job(&self, scheduler_guid: Uuid) -> SchedulerResult<PollOutcome> {
        let next = self
            .dao
            .get_next_job_to_process(scheduler_guid, Utc::now(), self.options.scheduler_expiration_time)
            .await?;

        Ok(match next.job {
            Some(job) => PollOutcome::Ready(job),
            None => PollOutcome::Idle(next.next_fire_time),
        })
    }

    fn signal(&self) -> &StoreSignal {
        &self.signal
    }

    fn max_wait(&self) -> Option<Duration> {
        Some(self.options.polling_interval)
    }

    fn name(&self) -> &'static str {
        "PersistentJobStore"
    }
}

#[async_trait]
impl JobStore for PersistentJobStore {
    async fn register_scheduler(&self, scheduler_guid: Uuid, scheduler_name: &str) -> SchedulerResult<()> {
        self.ensure_not_disposed()?;
        self.state
            .dao
            .register_scheduler(scheduler_guid, scheduler_name, Utc::now())
            .await?;

        let heartbeat = self.spawn_heartbeat(scheduler_guid, scheduler_name.to_string());
        let previous = self
            .state
            .heartbeats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scheduler_guid, heartbeat);
        if let Some(previous) = previous {
            previous.cancel();
        }

        JobEventLogger::log_scheduler_registered(scheduler_guid, scheduler_name);
        Ok(())
    }

    async fn unregister_scheduler(&self, scheduler_guid: Uuid) -> SchedulerResult<()> {
        self.ensure_not_disposed()?;
        if let Some(heartbeat) = self.state.take_heartbeat(scheduler_guid) {
            heartbeat.cancel();
            if let Err(e) = heartbeat.handle.await {
                warn!(scheduler_guid = %scheduler_guid, "等待心跳任务结束失败: {}", e);
            }
        }

        self.state.dao.unregister_scheduler(scheduler_guid).await?;
        JobEventLogger::log_scheduler_unregistered(scheduler_guid);
        self.state.signal.notify_changed();
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
        self.state.dao.get_job_details(job_name).await
    }

    async fn save_job_details(&self, job_details: &mut JobDetails) -> SchedulerResult<SaveOutcome> {
        self.ensure_not_disposed()?;
        let outcome = self.state.dao.save_job_details(job_details).await?;

        match outcome {
            SaveOutcome::Saved => {
                job_details.version += 1;
                self.state.signal.notify_changed();
            }
            SaveOutcome::ConcurrentlyModified => {
                JobEventLogger::log_concurrent_modification(job_details.name(), "save_job_details");
            }
        }
        Ok(outcome)
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

        let written = self
            .state
            .dao
            .create_job(job_spec, job_data, creation_time, conflict_action)
            .await?;
        if written {
            JobEventLogger::log_job_created(&job_spec.name, &job_spec.job_key, conflict_action);
            self.state.signal.notify_changed();
        }
        Ok(written)
    }

    async fn update_job(&self, existing_job_name: &str, job_spec: &JobSpec) -> SchedulerResult<()> {
        self.ensure_not_disposed()?;
        job_spec.validate()?;

        self.state.dao.update_job(existing_job_name, job_spec).await?;
        JobEventLogger::log_job_updated(existing_job_name, &job_spec.name);
        self.state.signal.notify_changed();
        Ok(())
    }

    async fn delete_job(&self, job_name: &str) -> SchedulerResult<bool> {
        self.ensure_not_disposed()?;
        let deleted = self.state.dao.delete_job(job_name).await?;
        if deleted {
            JobEventLogger::log_job_deleted(job_name);
            self.state.signal.notify_changed();
        }
        Ok(deleted)
    }

    async fn get_job_names(&self) -> SchedulerResult<Vec<String>> {
        self.ensure_not_disposed()?;
        self.state.dao.get_job_names().await
    }

    fn dispose(&self) {
        if !self.state.signal.dispose() {
            return;
        }

        let heartbeats: Vec<Heartbeat> = self
            .state
            .heartbeats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, heartbeat)| heartbeat)
            .collect();
        for heartbeat in &heartbeats {
            heartbeat.cancel();
            heartbeat.handle.abort();
        }
        debug!(cancelled_heartbeats = heartbeats.len(), "持久化作业存储已释放");
    }
}

impl Drop for PersistentState {
    fn drop(&mut self) {
        let heartbeats = self.heartbeats.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, heartbeat) in heartbeats.drain() {
            heartbeat.handle.abort();
        }
    }
}
