//! 持久化作业存储的数据访问层

pub mod manager;
pub mod mapping;
pub mod postgres;
pub mod sqlite;
mod statements;

pub use manager::{connect_job_store_dao, DatabaseType};
pub use postgres::PostgresJobStoreDao;
pub use sqlite::SqliteJobStoreDao;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use scheduler_core::SchedulerResult;
use scheduler_domain::{CreateJobConflictAction, JobData, JobDetails, JobSpec, SaveOutcome};

/// 一次轮询的结果
#[derive(Debug, Clone, Default)]
pub struct NextJob {
    /// 需要处理的作业
    pub job: Option<JobDetails>,
    /// 所有已调度作业中最早的下次触发时间，用于决定等待时长
    pub next_fire_time: Option<DateTime<Utc>>,
}

/// 作业存储数据访问接口
///
/// 所有协调都通过行版本号和心跳时间戳完成，多个进程可以共享同一个数据库。
#[async_trait]
pub trait JobStoreDao: Send + Sync {
    /// 创建表结构，可重复调用
    async fn ensure_schema(&self) -> SchedulerResult<()>;

    /// 写入或刷新调度器心跳
    async fn register_scheduler(
        &self,
        scheduler_guid: Uuid,
        scheduler_name: &str,
        last_seen: DateTime<Utc>,
    ) -> SchedulerResult<()>;

    async fn unregister_scheduler(&self, scheduler_guid: Uuid) -> SchedulerResult<()>;

    async fn create_job(
        &self,
        job_spec: &JobSpec,
        job_data: Option<&JobData>,
        creation_time: DateTime<Utc>,
        conflict_action: CreateJobConflictAction,
    ) -> SchedulerResult<bool>;

    async fn update_job(&self, existing_job_name: &str, job_spec: &JobSpec) -> SchedulerResult<()>;

    async fn delete_job(&self, job_name: &str) -> SchedulerResult<bool>;

    async fn get_job_details(&self, job_name: &str) -> SchedulerResult<Option<JobDetails>>;

    /// 按版本号保存，成功时存储中的版本号加一，调用方的记录保持不变
    async fn save_job_details(&self, job_details: &JobDetails) -> SchedulerResult<SaveOutcome>;

    async fn get_job_names(&self) -> SchedulerResult<Vec<String>>;

    /// 依次执行失效检测、认领到期作业、挑选一个待处理作业并计算等待提示
    async fn get_next_job_to_process(
        &self,
        scheduler_guid: Uuid,
        time_basis: DateTime<Utc>,
        scheduler_expiration_time: Duration,
    ) -> SchedulerResult<NextJob>;
}
