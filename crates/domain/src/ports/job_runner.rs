use async_trait::async_trait;
use uuid::Uuid;

use crate::entities::{JobData, JobSpec};
use scheduler_core::SchedulerResult;

/// 单次作业执行的上下文
///
/// 执行器可以修改 `job_data`，调度器会在执行结束后把它写回存储。
#[derive(Debug, Clone)]
pub struct JobExecutionContext {
    pub scheduler_guid: Uuid,
    pub job_spec: JobSpec,
    pub job_data: Option<JobData>,
    pub span: tracing::Span,
}

impl JobExecutionContext {
    pub fn new(scheduler_guid: Uuid, job_spec: JobSpec, job_data: Option<JobData>) -> Self {
        let span = tracing::info_span!(
            "job_execution",
            job_name = %job_spec.name,
            job_key = %job_spec.job_key,
            scheduler_guid = %scheduler_guid,
        );
        Self {
            scheduler_guid,
            job_spec,
            job_data,
            span,
        }
    }

    /// 取出作业数据，不存在时创建空数据
    pub fn job_data_mut(&mut self) -> &mut JobData {
        self.job_data.get_or_insert_with(JobData::new)
    }
}

/// 作业执行器
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// 执行作业，返回执行是否成功
    ///
    /// 返回 `Err` 与返回 `Ok(false)` 一样被视为执行失败。
    async fn execute(&self, context: &mut JobExecutionContext) -> SchedulerResult<bool>;
}
