//! 作业与调度器事件的结构化日志

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use scheduler_domain::{CreateJobConflictAction, JobState, TriggerScheduleAction, TriggerScheduleCondition};

/// 结构化事件日志
pub struct JobEventLogger;

impl JobEventLogger {
    pub fn log_scheduler_registered(scheduler_guid: Uuid, scheduler_name: &str) {
        info!(
            event = "scheduler_registered",
            scheduler.guid = %scheduler_guid,
            scheduler.name = scheduler_name,
            "调度器已注册"
        );
    }

    pub fn log_scheduler_unregistered(scheduler_guid: Uuid) {
        info!(
            event = "scheduler_unregistered",
            scheduler.guid = %scheduler_guid,
            "调度器已注销"
        );
    }

    pub fn log_scheduler_heartbeat(scheduler_guid: Uuid, last_seen: DateTime<Utc>) {
        debug!(
            event = "scheduler_heartbeat",
            scheduler.guid = %scheduler_guid,
            scheduler.last_seen = %last_seen,
            "调度器心跳"
        );
    }

    pub fn log_job_created(job_name: &str, job_key: &str, conflict_action: CreateJobConflictAction) {
        info!(
            event = "job_created",
            job.name = job_name,
            job.key = job_key,
            job.conflict_action = ?conflict_action,
            "作业已创建"
        );
    }

    pub fn log_job_updated(existing_job_name: &str, job_name: &str) {
        info!(
            event = "job_updated",
            job.previous_name = existing_job_name,
            job.name = job_name,
            "作业定义已更新"
        );
    }

    pub fn log_job_deleted(job_name: &str) {
        info!(event = "job_deleted", job.name = job_name, "作业已删除");
    }

    pub fn log_job_orphaned(job_name: &str, scheduler_guid: Uuid) {
        warn!(
            event = "job_orphaned",
            job.name = job_name,
            scheduler.guid = %scheduler_guid,
            "运行中的作业失去了调度器"
        );
    }

    /// 记录一次调度决策
    pub fn log_schedule_decision(
        job_name: &str,
        previous_state: JobState,
        condition: TriggerScheduleCondition,
        action: TriggerScheduleAction,
        next_fire_time: Option<DateTime<Utc>>,
    ) {
        debug!(
            event = "job_scheduled",
            job.name = job_name,
            job.previous_state = %previous_state,
            trigger.condition = ?condition,
            trigger.action = ?action,
            trigger.next_fire_time = next_fire_time.map(|t| t.to_rfc3339()),
            "作业调度决策"
        );
    }

    pub fn log_job_execution_start(job_name: &str, job_key: &str, scheduler_guid: Uuid) {
        info!(
            event = "job_execution_start",
            job.name = job_name,
            job.key = job_key,
            scheduler.guid = %scheduler_guid,
            "作业开始执行"
        );
    }

    pub fn log_job_execution_complete(
        job_name: &str,
        succeeded: bool,
        duration_ms: u64,
        status_message: &str,
    ) {
        if succeeded {
            info!(
                event = "job_execution_complete",
                job.name = job_name,
                job.succeeded = succeeded,
                job.duration_ms = duration_ms,
                "作业执行成功"
            );
        } else {
            error!(
                event = "job_execution_failed",
                job.name = job_name,
                job.succeeded = succeeded,
                job.duration_ms = duration_ms,
                job.status_message = status_message,
                "作业执行失败"
            );
        }
    }

    pub fn log_concurrent_modification(job_name: &str, operation: &str) {
        debug!(
            event = "concurrent_modification",
            job.name = job_name,
            store.operation = operation,
            "作业已被其他调度器修改，放弃本次处理"
        );
    }

    pub fn log_store_error(operation: &str, error: &dyn std::error::Error) {
        error!(
            event = "store_error",
            store.operation = operation,
            error.message = %error,
            "作业存储操作失败"
        );
    }
}
