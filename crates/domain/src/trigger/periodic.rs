use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use scheduler_core::{SchedulerError, SchedulerResult};

use super::{
    Trigger, TriggerDecision, TriggerPolicy, TriggerScheduleAction, TriggerScheduleCondition,
};
use crate::value_objects::duration_millis;

/// 周期触发器
///
/// 从 `start_time` 开始，每隔 `period` 触发一次，直到 `end_time` 或执行次数耗尽。
/// `period` 为空时只触发一次。下次触发时间始终按 `start_time + k·period` 对齐，
/// 不会因执行延迟而累积漂移。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicTrigger {
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    #[serde(rename = "period_ms", with = "duration_millis")]
    period: Option<Duration>,
    job_execution_count_remaining: Option<u32>,
    misfire_action: TriggerScheduleAction,
    #[serde(rename = "misfire_threshold_ms", with = "duration_millis")]
    misfire_threshold: Option<Duration>,
    next_fire_time: Option<DateTime<Utc>>,
    is_first_time: bool,
}

impl PeriodicTrigger {
    /// 创建周期触发器
    ///
    /// * `period` - 为空表示一次性触发器，否则至少为1毫秒
    /// * `job_execution_count` - 为空表示不限制执行次数
    pub fn new(
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        period: Option<Duration>,
        job_execution_count: Option<u32>,
    ) -> SchedulerResult<Self> {
        if let Some(p) = period {
            if p.num_milliseconds() <= 0 {
                return Err(SchedulerError::invalid_argument("触发周期至少为1毫秒"));
            }
        }

        Ok(Self {
            start_time,
            end_time,
            period,
            job_execution_count_remaining: job_execution_count,
            misfire_action: TriggerScheduleAction::Skip,
            misfire_threshold: None,
            next_fire_time: None,
            is_first_time: true,
        })
    }

    /// 在指定时间只执行一次的触发器
    pub fn one_shot(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time: None,
            period: None,
            job_execution_count_remaining: Some(1),
            misfire_action: TriggerScheduleAction::Skip,
            misfire_threshold: None,
            next_fire_time: None,
            is_first_time: true,
        }
    }

    /// 从指定时间开始每天执行一次的触发器
    pub fn daily(start_time: DateTime<Utc>) -> Self {
        Self {
            period: Some(Duration::days(1)),
            job_execution_count_remaining: None,
            ..Self::one_shot(start_time)
        }
    }

    pub fn with_misfire_action(mut self, misfire_action: TriggerScheduleAction) -> Self {
        self.misfire_action = misfire_action;
        self
    }

    /// 设置错过阈值；阈值为0时仍容忍恰好准点的触发
    pub fn with_misfire_threshold(mut self, misfire_threshold: Option<Duration>) -> Self {
        self.misfire_threshold = misfire_threshold;
        self
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    pub fn job_execution_count_remaining(&self) -> Option<u32> {
        self.job_execution_count_remaining
    }

    pub fn misfire_action(&self) -> TriggerScheduleAction {
        self.misfire_action
    }

    pub fn misfire_threshold(&self) -> Option<Duration> {
        self.misfire_threshold
    }

    fn is_exhausted(&self) -> bool {
        self.job_execution_count_remaining == Some(0)
    }

    fn is_past_end(&self, time_basis: DateTime<Utc>) -> bool {
        self.end_time.is_some_and(|end| time_basis > end)
    }

    fn stop(&mut self) -> TriggerScheduleAction {
        self.next_fire_time = None;
        self.job_execution_count_remaining = Some(0);
        TriggerScheduleAction::Stop
    }

    fn schedule_first_time(&mut self) -> TriggerScheduleAction {
        if self.is_exhausted() || self.end_time.is_some_and(|end| self.start_time > end) {
            return self.stop();
        }

        // 首次调度只确定触发时间，真正的触发或错过判定留到下一轮
        self.next_fire_time = Some(self.start_time);
        TriggerScheduleAction::Skip
    }

    fn schedule_after_execution(&mut self) -> TriggerScheduleAction {
        if self.is_exhausted() || self.next_fire_time.is_none() {
            return self.stop();
        }

        TriggerScheduleAction::Skip
    }

    fn schedule_suggested_action(
        &mut self,
        action: TriggerScheduleAction,
        time_basis: DateTime<Utc>,
    ) -> SchedulerResult<TriggerScheduleAction> {
        if action == TriggerScheduleAction::DeleteJob {
            self.next_fire_time = None;
            self.job_execution_count_remaining = Some(0);
            return Ok(TriggerScheduleAction::DeleteJob);
        }

        if action == TriggerScheduleAction::Stop || self.is_exhausted() || self.is_past_end(time_basis)
        {
            return Ok(self.stop());
        }

        match action {
            TriggerScheduleAction::ExecuteJob => {
                if let Some(remaining) = self.job_execution_count_remaining.as_mut() {
                    *remaining -= 1;
                }

                self.next_fire_time = if self.is_exhausted() {
                    None
                } else {
                    self.next_fire_time_after(time_basis)?
                };
                Ok(TriggerScheduleAction::ExecuteJob)
            }
            TriggerScheduleAction::Skip => match self.next_fire_time_after(time_basis)? {
                Some(next) => {
                    self.next_fire_time = Some(next);
                    Ok(TriggerScheduleAction::Skip)
                }
                None => Ok(self.stop()),
            },
            TriggerScheduleAction::DeleteJob | TriggerScheduleAction::Stop => Ok(self.stop()),
        }
    }

    /// 计算严格晚于时间基准的下一个对齐触发时间
    fn next_fire_time_after(&self, time_basis: DateTime<Utc>) -> SchedulerResult<Option<DateTime<Utc>>> {
        let Some(period) = self.period else {
            return Ok(None);
        };

        let next = if time_basis < self.start_time {
            self.start_time
        } else {
            let period_ms = period.num_milliseconds();
            let elapsed_ms = (time_basis - self.start_time).num_milliseconds();
            let offset = (elapsed_ms / period_ms + 1)
                .checked_mul(period_ms)
                .and_then(Duration::try_milliseconds)
                .ok_or_else(|| SchedulerError::TriggerPolicy("下次触发时间计算溢出".to_string()))?;
            self.start_time
                .checked_add_signed(offset)
                .ok_or_else(|| SchedulerError::TriggerPolicy("下次触发时间超出范围".to_string()))?
        };

        if self.end_time.is_some_and(|end| next > end) {
            return Ok(None);
        }

        Ok(Some(next))
    }

    fn check_invariants(&self) -> SchedulerResult<()> {
        if let Some(p) = self.period {
            if p.num_milliseconds() <= 0 {
                return Err(SchedulerError::TriggerPolicy(format!(
                    "触发周期无效: {}ms",
                    p.num_milliseconds()
                )));
            }
        }
        Ok(())
    }
}

impl TriggerPolicy for PeriodicTrigger {
    fn schedule(
        &self,
        condition: TriggerScheduleCondition,
        time_basis: DateTime<Utc>,
    ) -> SchedulerResult<TriggerDecision> {
        self.check_invariants()?;

        let mut next = self.clone();
        let action = match condition {
            TriggerScheduleCondition::FirstTime => next.schedule_first_time(),
            TriggerScheduleCondition::Fire => {
                next.is_first_time = false;
                next.schedule_suggested_action(TriggerScheduleAction::ExecuteJob, time_basis)?
            }
            TriggerScheduleCondition::Misfire => {
                next.is_first_time = false;
                next.schedule_suggested_action(self.misfire_action, time_basis)?
            }
            TriggerScheduleCondition::JobSucceeded | TriggerScheduleCondition::JobFailed => {
                next.schedule_after_execution()
            }
        };

        Ok(TriggerDecision {
            action,
            trigger: Trigger::Periodic(next),
        })
    }

    fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.next_fire_time
    }

    fn next_misfire_threshold(&self) -> Option<Duration> {
        self.next_fire_time.and(self.misfire_threshold)
    }

    fn is_active(&self) -> bool {
        !self.is_exhausted() && (self.is_first_time || self.next_fire_time.is_some())
    }
}
