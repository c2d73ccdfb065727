//! 两种数据库共用的 SQL 语句

pub const UPSERT_SCHEDULER: &str = r#"
    INSERT INTO schedulers (scheduler_guid, scheduler_name, last_seen_ms)
    VALUES ($1, $2, $3)
    ON CONFLICT (scheduler_guid) DO UPDATE SET
        scheduler_name = excluded.scheduler_name,
        last_seen_ms = excluded.last_seen_ms
"#;

pub const DELETE_SCHEDULER: &str = "DELETE FROM schedulers WHERE scheduler_guid = $1";

pub const INSERT_JOB_IF_ABSENT: &str = r#"
    INSERT INTO jobs (job_name, job_description, job_key, trigger_object, job_data_object,
                      creation_time_ms, version, job_state)
    VALUES ($1, $2, $3, $4, $5, $6, 0, 'PENDING')
    ON CONFLICT (job_name) DO NOTHING
"#;

pub const UPSERT_JOB: &str = r#"
    INSERT INTO jobs (job_name, job_description, job_key, trigger_object, job_data_object,
                      creation_time_ms, version, job_state)
    VALUES ($1, $2, $3, $4, $5, $6, 0, 'PENDING')
    ON CONFLICT (job_name) DO UPDATE SET
        job_description = excluded.job_description,
        job_key = excluded.job_key,
        trigger_object = excluded.trigger_object,
        job_data_object = excluded.job_data_object,
        job_state = 'PENDING',
        next_trigger_fire_time_ms = NULL,
        next_trigger_misfire_threshold_ms = NULL,
        version = jobs.version + 1
"#;

pub const JOB_NAME_EXISTS: &str = "SELECT job_name FROM jobs WHERE job_name = $1";

pub const UPDATE_JOB_SPEC: &str = r#"
    UPDATE jobs SET
        job_name = $1,
        job_description = $2,
        job_key = $3,
        trigger_object = $4,
        job_state = 'PENDING',
        next_trigger_fire_time_ms = NULL,
        next_trigger_misfire_threshold_ms = NULL,
        version = version + 1
    WHERE job_name = $5
"#;

pub const DELETE_JOB: &str = "DELETE FROM jobs WHERE job_name = $1";

pub const SAVE_JOB_DETAILS: &str = r#"
    UPDATE jobs SET
        job_description = $1,
        job_key = $2,
        trigger_object = $3,
        job_data_object = $4,
        job_state = $5,
        next_trigger_fire_time_ms = $6,
        next_trigger_misfire_threshold_ms = $7,
        last_execution_scheduler_guid = $8,
        last_execution_start_time_ms = $9,
        last_execution_end_time_ms = $10,
        last_execution_succeeded = $11,
        last_execution_status_message = $12,
        version = version + 1
    WHERE job_name = $13 AND version = $14
"#;

pub const SELECT_JOB_NAMES: &str = "SELECT job_name FROM jobs ORDER BY job_name";

/// 运行中但所属调度器已注销或心跳过期的作业
pub const ORPHAN_EXPIRED_JOBS: &str = r#"
    UPDATE jobs SET job_state = 'ORPHANED', version = version + 1
    WHERE job_state = 'RUNNING'
      AND (last_execution_scheduler_guid IS NULL
           OR last_execution_scheduler_guid NOT IN (
               SELECT scheduler_guid FROM schedulers WHERE last_seen_ms > $1))
"#;

/// 状态列无法识别的作业直接停止
pub const STOP_JOBS_IN_UNKNOWN_STATE: &str = r#"
    UPDATE jobs SET
        job_state = 'STOPPED',
        next_trigger_fire_time_ms = NULL,
        next_trigger_misfire_threshold_ms = NULL,
        version = version + 1
    WHERE job_state NOT IN ('PENDING', 'SCHEDULED', 'TRIGGERED', 'RUNNING', 'COMPLETED', 'ORPHANED', 'STOPPED')
"#;

/// 记录无法解析的作业直接停止
pub const STOP_JOB: &str = r#"
    UPDATE jobs SET
        job_state = 'STOPPED',
        next_trigger_fire_time_ms = NULL,
        next_trigger_misfire_threshold_ms = NULL,
        version = version + 1
    WHERE job_name = $1
"#;

pub const CLAIM_DUE_JOBS: &str = r#"
    UPDATE jobs SET job_state = 'TRIGGERED', version = version + 1
    WHERE job_state = 'SCHEDULED' AND next_trigger_fire_time_ms <= $1
"#;

pub const SELECT_MIN_NEXT_FIRE_TIME: &str =
    "SELECT MIN(next_trigger_fire_time_ms) AS next_fire_time_ms FROM jobs WHERE job_state = 'SCHEDULED'";

pub fn select_job_by_name() -> String {
    format!("SELECT {} FROM jobs WHERE job_name = $1", super::mapping::JOB_COLUMNS)
}

pub fn select_job_needing_attention() -> String {
    format!(
        "SELECT {} FROM jobs WHERE job_state IN ('PENDING', 'TRIGGERED', 'ORPHANED', 'COMPLETED') \
         ORDER BY job_name LIMIT 1",
        super::mapping::JOB_COLUMNS
    )
}
