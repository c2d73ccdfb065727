use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scheduler_core::{SchedulerError, SchedulerResult};

use crate::trigger::{Trigger, TriggerPolicy};

/// 作业定义
///
/// 跨越存储边界时总是整体克隆，存储与调用方不会共享同一个触发器实例。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// 作业名称，全局唯一
    pub name: String,
    pub description: String,
    /// 用于定位作业实现的键
    pub job_key: String,
    pub trigger: Trigger,
}

impl JobSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        job_key: impl Into<String>,
        trigger: Trigger,
    ) -> SchedulerResult<Self> {
        let spec = Self {
            name: name.into(),
            description: description.into(),
            job_key: job_key.into(),
            trigger,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::invalid_argument("作业名称不能为空"));
        }
        if self.job_key.trim().is_empty() {
            return Err(SchedulerError::invalid_argument("作业键不能为空"));
        }
        Ok(())
    }
}

/// 作业执行时传入、可被作业修改的键值数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobData {
    pub state: HashMap<String, serde_json::Value>,
}

impl JobData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.state.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.state.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.state.insert(key.into(), value);
    }

    pub fn to_blob(&self) -> SchedulerResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| SchedulerError::Serialization(format!("序列化作业数据失败: {e}")))
    }

    pub fn from_blob(bytes: &[u8]) -> SchedulerResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| SchedulerError::Serialization(format!("反序列化作业数据失败: {e}")))
    }
}

/// 一次作业执行的记录
#[derive(Debug, Clone, PartialEq)]
pub struct JobExecutionDetails {
    pub scheduler_guid: Uuid,
    pub start_time: DateTime<Utc>,
    /// 仅在执行结束后设置
    pub end_time: Option<DateTime<Utc>>,
    pub succeeded: bool,
    pub status_message: String,
}

impl JobExecutionDetails {
    pub const UNKNOWN_STATUS: &'static str = "Unknown";

    pub fn new(scheduler_guid: Uuid, start_time: DateTime<Utc>) -> Self {
        Self {
            scheduler_guid,
            start_time,
            end_time: None,
            succeeded: false,
            status_message: Self::UNKNOWN_STATUS.to_string(),
        }
    }

    pub fn complete(&mut self, end_time: DateTime<Utc>, succeeded: bool, status_message: impl Into<String>) {
        self.end_time = Some(end_time);
        self.succeeded = succeeded;
        self.status_message = status_message.into();
    }
}

/// 作业状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "SCHEDULED")]
    Scheduled,
    #[serde(rename = "TRIGGERED")]
    Triggered,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "ORPHANED")]
    Orphaned,
    #[serde(rename = "STOPPED")]
    Stopped,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Scheduled => "SCHEDULED",
            JobState::Triggered => "TRIGGERED",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Orphaned => "ORPHANED",
            JobState::Stopped => "STOPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobState::Pending),
            "SCHEDULED" => Some(JobState::Scheduled),
            "TRIGGERED" => Some(JobState::Triggered),
            "RUNNING" => Some(JobState::Running),
            "COMPLETED" => Some(JobState::Completed),
            "ORPHANED" => Some(JobState::Orphaned),
            "STOPPED" => Some(JobState::Stopped),
            _ => None,
        }
    }

    /// 需要调度器立即处理的状态
    pub fn needs_attention(&self) -> bool {
        matches!(
            self,
            JobState::Pending | JobState::Triggered | JobState::Orphaned | JobState::Completed
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<sqlx::Postgres> for JobState {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <str as sqlx::Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
    }
}

impl sqlx::Type<sqlx::Sqlite> for JobState {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <str as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for JobState {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        JobState::parse(s).ok_or_else(|| format!("Invalid job state: {s}").into())
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for JobState {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        JobState::parse(s).ok_or_else(|| format!("Invalid job state: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for JobState {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for JobState {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 作业的完整持久化记录
#[derive(Debug, Clone, PartialEq)]
pub struct JobDetails {
    pub job_spec: JobSpec,
    pub creation_time: DateTime<Utc>,
    pub job_state: JobState,
    pub job_data: Option<JobData>,
    pub next_trigger_fire_time: Option<DateTime<Utc>>,
    pub next_trigger_misfire_threshold: Option<Duration>,
    pub last_job_execution_details: Option<JobExecutionDetails>,
    /// 乐观并发版本号，每次成功保存后加一
    pub version: i64,
}

impl JobDetails {
    pub fn new(job_spec: JobSpec, job_data: Option<JobData>, creation_time: DateTime<Utc>) -> Self {
        Self {
            job_spec,
            creation_time,
            job_state: JobState::Pending,
            job_data,
            next_trigger_fire_time: None,
            next_trigger_misfire_threshold: None,
            last_job_execution_details: None,
            version: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.job_spec.name
    }

    /// 根据当前触发器刷新下次触发时间和错过阈值
    pub fn sync_trigger_schedule(&mut self) {
        self.next_trigger_fire_time = self.job_spec.trigger.next_fire_time();
        self.next_trigger_misfire_threshold = self.job_spec.trigger.next_misfire_threshold();
    }

    pub fn clear_trigger_schedule(&mut self) {
        self.next_trigger_fire_time = None;
        self.next_trigger_misfire_threshold = None;
    }

    /// 判断作业是否由指定调度器实例运行
    pub fn is_running_on(&self, scheduler_guid: Uuid) -> bool {
        self.job_state == JobState::Running
            && self
                .last_job_execution_details
                .as_ref()
                .is_some_and(|d| d.scheduler_guid == scheduler_guid)
    }
}
