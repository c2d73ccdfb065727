//! 按作业键分派执行的作业执行器

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn, Instrument};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{JobExecutionContext, JobRunner};

/// 用户作业逻辑
#[async_trait]
pub trait Job: Send + Sync {
    /// 执行作业，返回是否成功；可以修改上下文中的作业数据
    async fn execute(&self, context: &mut JobExecutionContext) -> SchedulerResult<bool>;
}

/// 作业键到作业实现的注册表
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<dyn Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册作业实现，同名键会被替换
    pub async fn register(&self, job_key: impl Into<String>, job: Arc<dyn Job>) {
        let job_key = job_key.into();
        let mut jobs = self.jobs.write().await;
        if jobs.insert(job_key.clone(), job).is_some() {
            warn!("作业实现 '{}' 已被替换", job_key);
        } else {
            info!("注册作业实现: {}", job_key);
        }
    }

    pub async fn unregister(&self, job_key: &str) -> bool {
        self.jobs.write().await.remove(job_key).is_some()
    }

    pub async fn get(&self, job_key: &str) -> Option<Arc<dyn Job>> {
        self.jobs.read().await.get(job_key).cloned()
    }

    pub async fn job_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.jobs.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// 通过注册表查找作业实现并执行
pub struct DefaultJobRunner {
    registry: Arc<JobRegistry>,
}

impl DefaultJobRunner {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }
}

#[async_trait]
impl JobRunner for DefaultJobRunner {
    async fn execute(&self, context: &mut JobExecutionContext) -> SchedulerResult<bool> {
        let job_key = context.job_spec.job_key.clone();
        let job = self.registry.get(&job_key).await.ok_or_else(|| {
            SchedulerError::JobExecution(format!("未注册的作业键: {job_key}"))
        })?;

        let span = context.span.clone();
        job.execute(context).instrument(span).await
    }
}

/// 内置作业：把作业数据写入日志，并累计执行次数
pub struct LogJob;

impl LogJob {
    pub const JOB_KEY: &'static str = "log";
    pub const RUN_COUNT_KEY: &'static str = "run_count";
}

#[async_trait]
impl Job for LogJob {
    async fn execute(&self, context: &mut JobExecutionContext) -> SchedulerResult<bool> {
        let data = context.job_data_mut();
        let run_count = data
            .get(Self::RUN_COUNT_KEY)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            + 1;
        data.set(Self::RUN_COUNT_KEY, serde_json::json!(run_count));

        info!(
            job.name = %context.job_spec.name,
            job.run_count = run_count,
            job.data = ?context.job_data,
            "{}",
            context.job_spec.description
        );
        Ok(true)
    }
}
