//! 触发器：决定作业下一步做什么、何时再次触发的调度策略。
//!
//! `schedule` 是纯函数：它不修改触发器本身，而是返回一个 [`TriggerDecision`]，
//! 其中携带更新后的触发器。调度器把决策写回作业定义并保存，保存成功即视为
//! 触发器的待写入状态已经落盘。

mod periodic;

pub use periodic::PeriodicTrigger;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use scheduler_core::{SchedulerError, SchedulerResult};

/// 调度条件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerScheduleCondition {
    /// 作业首次被调度
    FirstTime,
    /// 计划的触发时间已到
    Fire,
    /// 计划的触发时间已错过且超过了容忍阈值
    Misfire,
    /// 上一次执行成功
    JobSucceeded,
    /// 上一次执行失败（包括执行实例失效）
    JobFailed,
}

/// 调度动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerScheduleAction {
    Skip,
    ExecuteJob,
    DeleteJob,
    Stop,
}

impl TriggerScheduleAction {
    /// 终止性动作会结束作业的活跃生命周期
    pub fn is_terminal(&self) -> bool {
        matches!(self, TriggerScheduleAction::DeleteJob | TriggerScheduleAction::Stop)
    }
}

/// 一次调度的结果：动作以及需要持久化的新触发器
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerDecision {
    pub action: TriggerScheduleAction,
    pub trigger: Trigger,
}

/// 触发器能力接口
pub trait TriggerPolicy: Send + Sync {
    /// 根据调度条件和时间基准计算调度动作
    fn schedule(
        &self,
        condition: TriggerScheduleCondition,
        time_basis: DateTime<Utc>,
    ) -> SchedulerResult<TriggerDecision>;

    fn next_fire_time(&self) -> Option<DateTime<Utc>>;

    fn next_misfire_threshold(&self) -> Option<Duration>;

    fn is_active(&self) -> bool;
}

/// 所有已知触发器类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Periodic(PeriodicTrigger),
}

impl Trigger {
    /// 序列化为可持久化的二进制块
    pub fn to_blob(&self) -> SchedulerResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| SchedulerError::Serialization(format!("序列化触发器失败: {e}")))
    }

    pub fn from_blob(bytes: &[u8]) -> SchedulerResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| SchedulerError::Serialization(format!("反序列化触发器失败: {e}")))
    }
}

impl TriggerPolicy for Trigger {
    fn schedule(
        &self,
        condition: TriggerScheduleCondition,
        time_basis: DateTime<Utc>,
    ) -> SchedulerResult<TriggerDecision> {
        match self {
            Trigger::Periodic(t) => t.schedule(condition, time_basis),
        }
    }

    fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Periodic(t) => t.next_fire_time(),
        }
    }

    fn next_misfire_threshold(&self) -> Option<Duration> {
        match self {
            Trigger::Periodic(t) => t.next_misfire_threshold(),
        }
    }

    fn is_active(&self) -> bool {
        match self {
            Trigger::Periodic(t) => t.is_active(),
        }
    }
}

impl From<PeriodicTrigger> for Trigger {
    fn from(trigger: PeriodicTrigger) -> Self {
        Trigger::Periodic(trigger)
    }
}
