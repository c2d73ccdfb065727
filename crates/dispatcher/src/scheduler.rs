//! 调度器：驱动触发器状态机、执行作业并把结果写回作业存储

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use scheduler_core::config::SchedulerConfig;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    CreateJobConflictAction, JobData, JobDetails, JobExecutionContext, JobExecutionDetails,
    JobRunner, JobSpec, JobState, JobStore, JobWatcher, SaveOutcome, TriggerPolicy,
    TriggerScheduleAction, TriggerScheduleCondition,
};
use scheduler_infrastructure::{JobEventLogger, SchedulerMetrics};

const ORPHANED_STATUS: &str = "作业执行期间所属调度器已失效";
const SUCCEEDED_STATUS: &str = "Succeeded";

/// 调度器实例参数
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub name: String,
    pub guid: Uuid,
    /// 作业存储出错后的等待时间
    pub error_recovery_delay: Duration,
    /// 停止时等待执行中作业结束的上限
    pub shutdown_timeout: Duration,
}

impl SchedulerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guid: Uuid::new_v4(),
            error_recovery_delay: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_guid(mut self, guid: Uuid) -> Self {
        self.guid = guid;
        self
    }

    pub fn with_error_recovery_delay(mut self, delay: Duration) -> Self {
        self.error_recovery_delay = delay;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl From<&SchedulerConfig> for SchedulerOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self::new(config.name.clone()).with_error_recovery_delay(config.error_recovery_delay())
    }
}

#[derive(Default)]
struct Lifecycle {
    watcher: Option<Arc<dyn JobWatcher>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    loop_handle: Option<JoinHandle<()>>,
}

struct SchedulerInner {
    options: SchedulerOptions,
    job_store: Arc<dyn JobStore>,
    job_runner: Arc<dyn JobRunner>,
    metrics: SchedulerMetrics,
    running_jobs: AtomicUsize,
    jobs_drained: Notify,
    is_running: AtomicBool,
    disposed: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

/// 默认调度器
///
/// 每个实例拥有一个后台轮询循环，作业在各自的任务中并发执行，
/// 长时间运行的作业不会阻塞循环处理其他作业。
#[derive(Clone)]
pub struct DefaultScheduler {
    inner: Arc<SchedulerInner>,
}

impl DefaultScheduler {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        job_runner: Arc<dyn JobRunner>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                options,
                job_store,
                job_runner,
                metrics: SchedulerMetrics,
                running_jobs: AtomicUsize::new(0),
                jobs_drained: Notify::new(),
                is_running: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    pub fn guid(&self) -> Uuid {
        self.inner.options.guid
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::SeqCst)
    }

    /// 正在执行的作业数
    pub fn running_job_count(&self) -> usize {
        self.inner.running_jobs.load(Ordering::SeqCst)
    }

    fn ensure_not_disposed(&self) -> SchedulerResult<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(SchedulerError::disposed("DefaultScheduler"));
        }
        Ok(())
    }

    /// 注册调度器实例并启动轮询循环，重复调用无副作用
    pub async fn start(&self) -> SchedulerResult<()> {
        self.ensure_not_disposed()?;
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let options = &self.inner.options;
        self.inner
            .job_store
            .register_scheduler(options.guid, &options.name)
            .await?;
        let watcher = self.inner.job_store.create_job_watcher(options.guid)?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let span = tracing::info_span!("scheduler", name = %options.name, guid = %options.guid);
        let handle = tokio::spawn(
            Arc::clone(&self.inner)
                .run(Arc::clone(&watcher), shutdown_rx)
                .instrument(span),
        );

        lifecycle.watcher = Some(watcher);
        lifecycle.shutdown_tx = Some(shutdown_tx);
        lifecycle.loop_handle = Some(handle);
        self.inner.is_running.store(true, Ordering::SeqCst);

        info!("调度器 {} ({}) 已启动", options.name, options.guid);
        Ok(())
    }

    /// 停止轮询循环并注销实例
    ///
    /// 返回后不会再分派新的作业。已经开始执行的作业在 `shutdown_timeout`
    /// 内完成并写回结果后才注销实例，超时的作业留给其他实例按失效处理。
    pub async fn stop(&self) -> SchedulerResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if !self.is_running() {
            return Ok(());
        }
        self.inner.is_running.store(false, Ordering::SeqCst);

        if let Some(watcher) = lifecycle.watcher.take() {
            watcher.dispose();
        }
        if let Some(shutdown_tx) = lifecycle.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = lifecycle.loop_handle.take() {
            if let Err(e) = handle.await {
                error!("调度循环异常退出: {}", e);
            }
        }

        let options = &self.inner.options;
        if !self.inner.wait_for_running_jobs(options.shutdown_timeout).await {
            warn!(
                "等待执行中的作业超时，仍有 {} 个作业未结束",
                self.running_job_count()
            );
        }

        match self.inner.job_store.unregister_scheduler(options.guid).await {
            Ok(()) => {}
            Err(e) if e.is_disposed() => debug!("作业存储已释放，跳过注销"),
            Err(e) => return Err(e),
        }

        info!("调度器 {} ({}) 已停止", options.name, options.guid);
        Ok(())
    }

    /// 停止并释放调度器，可重复调用
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.stop().await {
            warn!("释放调度器时停止失败: {}", e);
        }
    }

    pub async fn create_job(
        &self,
        job_spec: &JobSpec,
        job_data: Option<&JobData>,
        creation_time: DateTime<Utc>,
        conflict_action: CreateJobConflictAction,
    ) -> SchedulerResult<bool> {
        self.ensure_not_disposed()?;
        self.inner
            .job_store
            .create_job(job_spec, job_data, creation_time, conflict_action)
            .await
    }

    pub async fn update_job(&self, existing_job_name: &str, job_spec: &JobSpec) -> SchedulerResult<()> {
        self.ensure_not_disposed()?;
        self.inner.job_store.update_job(existing_job_name, job_spec).await
    }

    pub async fn delete_job(&self, job_name: &str) -> SchedulerResult<bool> {
        self.ensure_not_disposed()?;
        self.inner.job_store.delete_job(job_name).await
    }

    pub async fn get_job_details(&self, job_name: &str) -> SchedulerResult<Option<JobDetails>> {
        self.ensure_not_disposed()?;
        self.inner.job_store.get_job_details(job_name).await
    }

    pub async fn get_job_names(&self) -> SchedulerResult<Vec<String>> {
        self.ensure_not_disposed()?;
        self.inner.job_store.get_job_names().await
    }
}

/// 判断一次到期触发是否已经错过
fn is_misfire(
    fire_time: DateTime<Utc>,
    misfire_threshold: Option<chrono::Duration>,
    time_basis: DateTime<Utc>,
) -> bool {
    misfire_threshold.is_some_and(|threshold| time_basis - fire_time > threshold)
}

impl SchedulerInner {
    async fn run(
        self: Arc<Self>,
        watcher: Arc<dyn JobWatcher>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        debug!("调度循环开始");

        loop {
            let result = match watcher.get_next_job_to_process().await {
                Ok(Some(job)) => self.process_job(job).await,
                Ok(None) => break,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_disposed() => break,
                Err(e) => {
                    JobEventLogger::log_store_error("process_next_job", &e);
                    self.metrics.record_error_recovery();
                    warn!(
                        "调度出错，{}ms 后重试",
                        self.options.error_recovery_delay.as_millis()
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(self.options.error_recovery_delay) => {}
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }
        }

        debug!("调度循环结束");
    }

    /// 等待执行中的作业全部结束，超时返回 false
    async fn wait_for_running_jobs(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.jobs_drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.running_jobs.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }

    async fn save(&self, job: &mut JobDetails, operation: &str) -> SchedulerResult<SaveOutcome> {
        let outcome = self.job_store.save_job_details(job).await?;
        if outcome == SaveOutcome::ConcurrentlyModified {
            JobEventLogger::log_concurrent_modification(job.name(), operation);
            self.metrics.record_concurrent_modification();
        }
        Ok(outcome)
    }

    async fn process_job(self: &Arc<Self>, mut job: JobDetails) -> SchedulerResult<()> {
        let time_basis = Utc::now();
        let previous_state = job.job_state;

        let condition = match job.job_state {
            JobState::Pending => TriggerScheduleCondition::FirstTime,
            JobState::Scheduled | JobState::Triggered => match job.next_trigger_fire_time {
                None => {
                    self.force_stop(job, "作业没有下次触发时间").await?;
                    return Ok(());
                }
                Some(fire_time) if fire_time > time_basis => {
                    // 认领后触发时间被其他实例改到了将来
                    if job.job_state == JobState::Triggered {
                        job.job_state = JobState::Scheduled;
                        let _ = self.save(&mut job, "reschedule").await?;
                    }
                    return Ok(());
                }
                Some(fire_time) => {
                    if is_misfire(fire_time, job.next_trigger_misfire_threshold, time_basis) {
                        TriggerScheduleCondition::Misfire
                    } else {
                        TriggerScheduleCondition::Fire
                    }
                }
            },
            JobState::Completed => {
                let succeeded = job
                    .last_job_execution_details
                    .as_ref()
                    .is_some_and(|d| d.succeeded);
                if succeeded {
                    TriggerScheduleCondition::JobSucceeded
                } else {
                    TriggerScheduleCondition::JobFailed
                }
            }
            JobState::Orphaned => {
                if let Some(details) = job.last_job_execution_details.as_mut() {
                    details.complete(time_basis, false, ORPHANED_STATUS);
                }
                TriggerScheduleCondition::JobFailed
            }
            JobState::Running | JobState::Stopped => {
                debug!("作业 {} 处于 {} 状态，无需处理", job.name(), job.job_state);
                return Ok(());
            }
        };

        let decision = match job.job_spec.trigger.schedule(condition, time_basis) {
            Ok(decision) => decision,
            Err(e) => {
                error!("作业 {} 的触发器调度失败: {}", job.name(), e);
                self.force_stop(job, "触发器调度失败").await?;
                return Ok(());
            }
        };

        job.job_spec.trigger = decision.trigger;
        JobEventLogger::log_schedule_decision(
            job.name(),
            previous_state,
            condition,
            decision.action,
            job.job_spec.trigger.next_fire_time(),
        );

        match decision.action {
            TriggerScheduleAction::Skip => {
                job.job_state = JobState::Scheduled;
                job.sync_trigger_schedule();
                let _ = self.save(&mut job, "skip").await?;
            }
            TriggerScheduleAction::Stop => {
                job.job_state = JobState::Stopped;
                job.clear_trigger_schedule();
                let _ = self.save(&mut job, "stop").await?;
            }
            TriggerScheduleAction::DeleteJob => {
                self.job_store.delete_job(job.name()).await?;
            }
            TriggerScheduleAction::ExecuteJob => {
                self.begin_execution(job).await?;
            }
        }

        Ok(())
    }

    async fn force_stop(&self, mut job: JobDetails, reason: &str) -> SchedulerResult<()> {
        warn!("强制停止作业 {}: {}", job.name(), reason);
        job.job_state = JobState::Stopped;
        job.clear_trigger_schedule();
        let _ = self.save(&mut job, "force_stop").await?;
        Ok(())
    }

    /// 标记作业为运行中并持久化，成功后在独立任务中执行
    async fn begin_execution(self: &Arc<Self>, mut job: JobDetails) -> SchedulerResult<()> {
        job.job_state = JobState::Running;
        job.sync_trigger_schedule();
        job.last_job_execution_details =
            Some(JobExecutionDetails::new(self.options.guid, Utc::now()));

        if !self.save(&mut job, "begin_execution").await?.is_saved() {
            return Ok(());
        }

        self.running_jobs.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.complete_execution(job).await;
            if inner.running_jobs.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.jobs_drained.notify_waiters();
            }
        });
        Ok(())
    }

    async fn complete_execution(&self, mut job: JobDetails) {
        let mut context = JobExecutionContext::new(
            self.options.guid,
            job.job_spec.clone(),
            job.job_data.clone(),
        );
        let span = context.span.clone();
        JobEventLogger::log_job_execution_start(job.name(), &job.job_spec.job_key, self.options.guid);

        let started = Instant::now();
        let runner = Arc::clone(&self.job_runner);
        let execution = tokio::spawn(
            async move {
                let result = runner.execute(&mut context).await;
                (result, context.job_data)
            }
            .instrument(span),
        );

        let (succeeded, status_message) = match execution.await {
            Ok((result, job_data)) => {
                job.job_data = job_data;
                match result {
                    Ok(true) => (true, SUCCEEDED_STATUS.to_string()),
                    Ok(false) => (false, "作业返回失败".to_string()),
                    Err(e) => (false, format!("作业执行出错: {e}")),
                }
            }
            Err(e) => (false, format!("作业执行异常终止: {e}")),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        self.metrics.record_job_execution(succeeded, duration_ms as f64);
        JobEventLogger::log_job_execution_complete(job.name(), succeeded, duration_ms, &status_message);

        job.job_state = JobState::Completed;
        if let Some(details) = job.last_job_execution_details.as_mut() {
            details.complete(Utc::now(), succeeded, status_message);
        }

        match self.save(&mut job, "complete_execution").await {
            Ok(_) => {}
            Err(e) => warn!("保存作业 {} 的执行结果失败: {}", job.name(), e),
        }
    }
}
