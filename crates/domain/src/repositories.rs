//! 作业存储抽象
//!
//! 定义调度器依赖的持久化接口，具体实现位于基础设施层

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entities::{JobData, JobDetails, JobSpec};
use crate::value_objects::{CreateJobConflictAction, SaveOutcome};
use scheduler_core::SchedulerResult;

/// 作业存储
///
/// 同一个存储可以被多个调度器实例共享，实例之间通过 `version` 乐观并发控制协调。
#[async_trait]
pub trait JobStore: Send + Sync {
    /// 登记调度器实例，持久化存储会为其维持心跳
    async fn register_scheduler(&self, scheduler_guid: Uuid, scheduler_name: &str) -> SchedulerResult<()>;

    /// 注销调度器实例，其名下运行中的作业随后会被视为失效
    async fn unregister_scheduler(&self, scheduler_guid: Uuid) -> SchedulerResult<()>;

    /// 为指定调度器创建作业观察器
    fn create_job_watcher(&self, scheduler_guid: Uuid) -> SchedulerResult<Arc<dyn JobWatcher>>;

    async fn get_job_details(&self, job_name: &str) -> SchedulerResult<Option<JobDetails>>;

    /// 按版本号保存作业详情
    ///
    /// 保存成功后 `job_details.version` 会被更新为存储中的新版本。
    async fn save_job_details(&self, job_details: &mut JobDetails) -> SchedulerResult<SaveOutcome>;

    /// 创建作业，返回是否真正写入了存储
    async fn create_job(
        &self,
        job_spec: &JobSpec,
        job_data: Option<&JobData>,
        creation_time: DateTime<Utc>,
        conflict_action: CreateJobConflictAction,
    ) -> SchedulerResult<bool>;

    /// 替换已有作业的定义，允许改名；作业回到待调度状态
    async fn update_job(&self, existing_job_name: &str, job_spec: &JobSpec) -> SchedulerResult<()>;

    async fn delete_job(&self, job_name: &str) -> SchedulerResult<bool>;

    /// 按名称排序的全部作业名
    async fn get_job_names(&self) -> SchedulerResult<Vec<String>>;

    /// 释放存储，唤醒所有等待中的观察器
    fn dispose(&self);
}

/// 作业观察器
#[async_trait]
pub trait JobWatcher: Send + Sync {
    /// 等待下一个需要处理的作业
    ///
    /// 返回 `None` 表示观察器已经释放，调度循环应当退出。
    async fn get_next_job_to_process(&self) -> SchedulerResult<Option<JobDetails>>;

    fn dispose(&self);
}
