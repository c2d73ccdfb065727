//! 数据库行与领域对象之间的映射
//!
//! 时间统一以毫秒时间戳存储，触发器和作业数据以 JSON 二进制块存储，
//! 两种数据库共用这里的转换逻辑。

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{JobData, JobDetails, JobExecutionDetails, JobSpec, JobState, Trigger};

/// jobs 表的全部列，按 [`JobRecord`] 字段顺序排列
pub const JOB_COLUMNS: &str = "job_name, job_description, job_key, trigger_object, job_data_object, \
    creation_time_ms, version, job_state, next_trigger_fire_time_ms, next_trigger_misfire_threshold_ms, \
    last_execution_scheduler_guid, last_execution_start_time_ms, last_execution_end_time_ms, \
    last_execution_succeeded, last_execution_status_message";

pub fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub fn from_millis(millis: i64) -> SchedulerResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| SchedulerError::Serialization(format!("无效的时间戳: {millis}")))
}

fn opt_from_millis(millis: Option<i64>) -> SchedulerResult<Option<DateTime<Utc>>> {
    millis.map(from_millis).transpose()
}

/// jobs 表中的一行
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job_name: String,
    pub job_description: String,
    pub job_key: String,
    pub trigger_object: Vec<u8>,
    pub job_data_object: Option<Vec<u8>>,
    pub creation_time_ms: i64,
    pub version: i64,
    pub job_state: JobState,
    pub next_trigger_fire_time_ms: Option<i64>,
    pub next_trigger_misfire_threshold_ms: Option<i64>,
    pub last_execution_scheduler_guid: Option<String>,
    pub last_execution_start_time_ms: Option<i64>,
    pub last_execution_end_time_ms: Option<i64>,
    pub last_execution_succeeded: Option<bool>,
    pub last_execution_status_message: Option<String>,
}

impl JobRecord {
    pub fn from_job_details(details: &JobDetails) -> SchedulerResult<Self> {
        let execution = details.last_job_execution_details.as_ref();

        Ok(Self {
            job_name: details.job_spec.name.clone(),
            job_description: details.job_spec.description.clone(),
            job_key: details.job_spec.job_key.clone(),
            trigger_object: details.job_spec.trigger.to_blob()?,
            job_data_object: details.job_data.as_ref().map(JobData::to_blob).transpose()?,
            creation_time_ms: to_millis(details.creation_time),
            version: details.version,
            job_state: details.job_state,
            next_trigger_fire_time_ms: details.next_trigger_fire_time.map(to_millis),
            next_trigger_misfire_threshold_ms: details
                .next_trigger_misfire_threshold
                .map(|d| d.num_milliseconds()),
            last_execution_scheduler_guid: execution.map(|e| e.scheduler_guid.to_string()),
            last_execution_start_time_ms: execution.map(|e| to_millis(e.start_time)),
            last_execution_end_time_ms: execution.and_then(|e| e.end_time).map(to_millis),
            last_execution_succeeded: execution.map(|e| e.succeeded),
            last_execution_status_message: execution.map(|e| e.status_message.clone()),
        })
    }

    pub fn into_job_details(self) -> SchedulerResult<JobDetails> {
        let last_job_execution_details = match (
            self.last_execution_scheduler_guid,
            self.last_execution_start_time_ms,
        ) {
            (Some(guid), Some(start_ms)) => {
                let scheduler_guid = Uuid::parse_str(&guid).map_err(|e| {
                    SchedulerError::Serialization(format!("无效的调度器标识 {guid}: {e}"))
                })?;
                Some(JobExecutionDetails {
                    scheduler_guid,
                    start_time: from_millis(start_ms)?,
                    end_time: opt_from_millis(self.last_execution_end_time_ms)?,
                    succeeded: self.last_execution_succeeded.unwrap_or(false),
                    status_message: self
                        .last_execution_status_message
                        .unwrap_or_else(|| JobExecutionDetails::UNKNOWN_STATUS.to_string()),
                })
            }
            _ => None,
        };

        Ok(JobDetails {
            job_spec: JobSpec {
                name: self.job_name,
                description: self.job_description,
                job_key: self.job_key,
                trigger: Trigger::from_blob(&self.trigger_object)?,
            },
            creation_time: from_millis(self.creation_time_ms)?,
            job_state: self.job_state,
            job_data: self
                .job_data_object
                .as_deref()
                .map(JobData::from_blob)
                .transpose()?,
            next_trigger_fire_time: opt_from_millis(self.next_trigger_fire_time_ms)?,
            next_trigger_misfire_threshold: self
                .next_trigger_misfire_threshold_ms
                .map(Duration::milliseconds),
            last_job_execution_details,
            version: self.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scheduler_domain::PeriodicTrigger;

    #[test]
    fn test_job_record_preserves_execution_details() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let spec = JobSpec::new(
            "report",
            "日报",
            "report",
            PeriodicTrigger::daily(start).into(),
        )
        .unwrap();
        let mut details = JobDetails::new(
            spec,
            Some(JobData::new().with("count", serde_json::json!(3))),
            start,
        );
        details.job_state = JobState::Completed;
        details.version = 7;
        details.next_trigger_fire_time = Some(start + Duration::days(1));
        details.next_trigger_misfire_threshold = Some(Duration::seconds(30));
        let mut execution = JobExecutionDetails::new(Uuid::new_v4(), start);
        execution.complete(start + Duration::milliseconds(1500), true, "ok");
        details.last_job_execution_details = Some(execution);

        let record = JobRecord::from_job_details(&details).unwrap();
        assert_eq!(record.job_state, JobState::Completed);
        assert_eq!(record.last_execution_end_time_ms, Some(to_millis(start) + 1500));

        assert_eq!(record.into_job_details().unwrap(), details);
    }

    #[test]
    fn test_job_record_without_history() {
        let spec = JobSpec::new(
            "once",
            "",
            "noop",
            PeriodicTrigger::one_shot(Utc.timestamp_millis_opt(0).unwrap()).into(),
        )
        .unwrap();
        let details = JobDetails::new(spec, None, Utc.timestamp_millis_opt(1_000).unwrap());

        let record = JobRecord::from_job_details(&details).unwrap();
        assert!(record.job_data_object.is_none());
        assert!(record.last_execution_scheduler_guid.is_none());
        assert_eq!(record.into_job_details().unwrap(), details);
    }

    #[test]
    fn test_corrupt_trigger_blob_is_serialization_error() {
        let spec = JobSpec::new("x", "", "noop", PeriodicTrigger::one_shot(Utc::now()).into()).unwrap();
        let mut record = JobRecord::from_job_details(&JobDetails::new(spec, None, Utc::now())).unwrap();
        record.trigger_object = b"not json".to_vec();

        let err = record.into_job_details().unwrap_err();
        assert!(matches!(err, SchedulerError::Serialization(_)));
    }
}
