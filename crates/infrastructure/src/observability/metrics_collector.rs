//! 调度器指标

use metrics::{counter, histogram};

pub const JOBS_EXECUTED_TOTAL: &str = "scheduler_jobs_executed_total";
pub const JOB_EXECUTION_DURATION_MS: &str = "scheduler_job_execution_duration_ms";
pub const CONCURRENT_MODIFICATIONS_TOTAL: &str = "scheduler_concurrent_modifications_total";
pub const ERROR_RECOVERIES_TOTAL: &str = "scheduler_error_recoveries_total";

/// 调度器指标采集
///
/// 未安装导出器时所有记录都是空操作。
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    pub fn record_job_execution(&self, succeeded: bool, duration_ms: f64) {
        let outcome = if succeeded { "succeeded" } else { "failed" };
        counter!(JOBS_EXECUTED_TOTAL, "outcome" => outcome).increment(1);
        histogram!(JOB_EXECUTION_DURATION_MS).record(duration_ms);
    }

    pub fn record_concurrent_modification(&self) {
        counter!(CONCURRENT_MODIFICATIONS_TOTAL).increment(1);
    }

    pub fn record_error_recovery(&self) {
        counter!(ERROR_RECOVERIES_TOTAL).increment(1);
    }
}
