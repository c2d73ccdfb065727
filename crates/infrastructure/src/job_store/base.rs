//! 作业存储的公共部分：释放信号与轮询式作业观察器

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{JobDetails, JobWatcher};

/// 释放标志加变更通知
///
/// 等待方必须先创建并 `enable` 通知，再检查状态，避免丢失唤醒。
#[derive(Debug, Default)]
pub(crate) struct StoreSignal {
    disposed: AtomicBool,
    changed: Notify,
}

impl StoreSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_changed(&self) {
        self.changed.notify_waiters();
    }

    /// 标记为已释放，返回是否为首次释放
    pub fn dispose(&self) -> bool {
        let first = !self.disposed.swap(true, Ordering::SeqCst);
        self.changed.notify_waiters();
        first
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn ensure_not_disposed(&self, owner: &str) -> SchedulerResult<()> {
        if self.is_disposed() {
            return Err(SchedulerError::disposed(owner));
        }
        Ok(())
    }

    pub fn changed(&self) -> &Notify {
        &self.changed
    }
}

/// 一次轮询的结果
#[derive(Debug)]
pub(crate) enum PollOutcome {
    /// 找到需要处理的作业
    Ready(JobDetails),
    /// 暂无作业，附带最近的下次触发时间
    Idle(Option<DateTime<Utc>>),
}

/// 可被观察器轮询的作业来源
#[async_trait]
pub(crate) trait JobSource: Send + Sync + 'static {
    async fn poll_next_job(&self, scheduler_guid: Uuid) -> SchedulerResult<PollOutcome>;

    fn signal(&self) -> &StoreSignal;

    /// 两次轮询之间的最长等待时间，`None` 表示只依赖变更通知
    fn max_wait(&self) -> Option<Duration>;

    fn name(&self) -> &'static str;
}

/// 计算观察器下一次等待的时长
pub(crate) fn wait_duration(
    next_fire_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_wait: Option<Duration>,
) -> Option<Duration> {
    let until_fire = next_fire_time.map(|t| (t - now).to_std().unwrap_or(Duration::ZERO));
    match (until_fire, max_wait) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// 通用作业观察器
///
/// 反复轮询作业来源，没有作业时等待到最近的触发时间、来源变更或释放。
pub(crate) struct PollingJobWatcher<S: JobSource> {
    source: Arc<S>,
    scheduler_guid: Uuid,
    signal: StoreSignal,
}

impl<S: JobSource> PollingJobWatcher<S> {
    pub fn new(source: Arc<S>, scheduler_guid: Uuid) -> Self {
        Self {
            source,
            scheduler_guid,
            signal: StoreSignal::new(),
        }
    }
}

#[async_trait]
impl<S: JobSource> JobWatcher for PollingJobWatcher<S> {
    async fn get_next_job_to_process(&self) -> SchedulerResult<Option<JobDetails>> {
        loop {
            let store_changed = self.source.signal().changed().notified();
            let watcher_disposed = self.signal.changed().notified();
            tokio::pin!(store_changed);
            tokio::pin!(watcher_disposed);
            store_changed.as_mut().enable();
            watcher_disposed.as_mut().enable();

            if self.signal.is_disposed() {
                return Ok(None);
            }
            self.source.signal().ensure_not_disposed(self.source.name())?;

            let next_fire_time = match self.source.poll_next_job(self.scheduler_guid).await? {
                PollOutcome::Ready(job) => return Ok(Some(job)),
                PollOutcome::Idle(next_fire_time) => next_fire_time,
            };

            let wait = wait_duration(next_fire_time, Utc::now(), self.source.max_wait());
            debug!(
                scheduler_guid = %self.scheduler_guid,
                wait_ms = wait.map(|d| d.as_millis() as u64),
                "暂无待处理作业，等待"
            );

            match wait {
                Some(wait) => {
                    tokio::select! {
                        _ = &mut store_changed => {}
                        _ = &mut watcher_disposed => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = &mut store_changed => {}
                        _ = &mut watcher_disposed => {}
                    }
                }
            }
        }
    }

    fn dispose(&self) {
        if self.signal.dispose() {
            debug!(scheduler_guid = %self.scheduler_guid, "作业观察器已释放");
        }
    }
}
