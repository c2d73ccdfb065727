use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{CreateJobConflictAction, JobData, JobDetails, JobSpec, SaveOutcome};
use sqlx::{Row, PgPool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::database::mapping::{to_millis, JobRecord};
use crate::database::statements;
use crate::database::{JobStoreDao, NextJob};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS schedulers (
        scheduler_guid TEXT PRIMARY KEY,
        scheduler_name TEXT NOT NULL,
        last_seen_ms BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        job_name TEXT PRIMARY KEY,
        job_description TEXT NOT NULL,
        job_key TEXT NOT NULL,
        trigger_object BYTEA NOT NULL,
        job_data_object BYTEA,
        creation_time_ms BIGINT NOT NULL,
        version BIGINT NOT NULL DEFAULT 0,
        job_state TEXT NOT NULL,
        next_trigger_fire_time_ms BIGINT,
        next_trigger_misfire_threshold_ms BIGINT,
        last_execution_scheduler_guid TEXT,
        last_execution_start_time_ms BIGINT,
        last_execution_end_time_ms BIGINT,
        last_execution_succeeded BOOLEAN,
        last_execution_status_message TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs (job_state)",
];

pub struct PostgresJobStoreDao {
    pool: PgPool,
}

impl PostgresJobStoreDao {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_job_record(row: &sqlx::postgres::PgRow) -> SchedulerResult<JobRecord> {
        Ok(JobRecord {
            job_name: row.try_get("job_name")?,
            job_description: row.try_get("job_description")?,
            job_key: row.try_get("job_key")?,
            trigger_object: row.try_get("trigger_object")?,
            job_data_object: row.try_get("job_data_object")?,
            creation_time_ms: row.try_get("creation_time_ms")?,
            version: row.try_get("version")?,
            job_state: row.try_get("job_state")?,
            next_trigger_fire_time_ms: row.try_get("next_trigger_fire_time_ms")?,
            next_trigger_misfire_threshold_ms: row.try_get("next_trigger_misfire_threshold_ms")?,
            last_execution_scheduler_guid: row.try_get("last_execution_scheduler_guid")?,
            last_execution_start_time_ms: row.try_get("last_execution_start_time_ms")?,
            last_execution_end_time_ms: row.try_get("last_execution_end_time_ms")?,
            last_execution_succeeded: row.try_get("last_execution_succeeded")?,
            last_execution_status_message: row.try_get("last_execution_status_message")?,
        })
    }

    fn row_to_job_details(row: &sqlx::postgres::PgRow) -> SchedulerResult<JobDetails> {
        Self::row_to_job_record(row)?.into_job_details()
    }
}

#[async_trait]
impl JobStoreDao for PostgresJobStoreDao {
    async fn ensure_schema(&self) -> SchedulerResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(SchedulerError::Database)?;
        }
        debug!("PostgreSQL作业存储表结构已就绪");
        Ok(())
    }

    async fn register_scheduler(
        &self,
        scheduler_guid: Uuid,
        scheduler_name: &str,
        last_seen: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        sqlx::query(statements::UPSERT_SCHEDULER)
            .bind(scheduler_guid.to_string())
            .bind(scheduler_name)
            .bind(to_millis(last_seen))
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(())
    }

    async fn unregister_scheduler(&self, scheduler_guid: Uuid) -> SchedulerResult<()> {
        sqlx::query(statements::DELETE_SCHEDULER)
            .bind(scheduler_guid.to_string())
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(())
    }

    async fn create_job(
        &self,
        job_spec: &JobSpec,
        job_data: Option<&JobData>,
        creation_time: DateTime<Utc>,
        conflict_action: CreateJobConflictAction,
    ) -> SchedulerResult<bool> {
        let statement = match conflict_action {
            CreateJobConflictAction::Update => statements::UPSERT_JOB,
            CreateJobConflictAction::Ignore | CreateJobConflictAction::Throw => {
                statements::INSERT_JOB_IF_ABSENT
            }
        };

        let result = sqlx::query(statement)
            .bind(&job_spec.name)
            .bind(&job_spec.description)
            .bind(&job_spec.job_key)
            .bind(job_spec.trigger.to_blob()?)
            .bind(job_data.map(JobData::to_blob).transpose()?)
            .bind(to_millis(creation_time))
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        if result.rows_affected() > 0 {
            debug!("创建作业成功: {}", job_spec.name);
            return Ok(true);
        }

        match conflict_action {
            CreateJobConflictAction::Throw => Err(SchedulerError::JobAlreadyExists {
                name: job_spec.name.clone(),
            }),
            _ => Ok(false),
        }
    }

    async fn update_job(&self, existing_job_name: &str, job_spec: &JobSpec) -> SchedulerResult<()> {
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;

        if existing_job_name != job_spec.name {
            let taken = sqlx::query(statements::JOB_NAME_EXISTS)
                .bind(&job_spec.name)
                .fetch_optional(&mut *tx)
                .await
                .map_err(SchedulerError::Database)?;
            if taken.is_some() {
                return Err(SchedulerError::JobAlreadyExists {
                    name: job_spec.name.clone(),
                });
            }
        }

        let result = sqlx::query(statements::UPDATE_JOB_SPEC)
            .bind(&job_spec.name)
            .bind(&job_spec.description)
            .bind(&job_spec.job_key)
            .bind(job_spec.trigger.to_blob()?)
            .bind(existing_job_name)
            .execute(&mut *tx)
            .await
            .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::JobNotFound {
                name: existing_job_name.to_string(),
            });
        }

        tx.commit().await.map_err(SchedulerError::Database)?;
        debug!("更新作业成功: {} -> {}", existing_job_name, job_spec.name);
        Ok(())
    }

    async fn delete_job(&self, job_name: &str) -> SchedulerResult<bool> {
        let result = sqlx::query(statements::DELETE_JOB)
            .bind(job_name)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_job_details(&self, job_name: &str) -> SchedulerResult<Option<JobDetails>> {
        let row = sqlx::query(&statements::select_job_by_name())
            .bind(job_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        row.as_ref().map(Self::row_to_job_details).transpose()
    }

    async fn save_job_details(&self, job_details: &JobDetails) -> SchedulerResult<SaveOutcome> {
        let record = JobRecord::from_job_details(job_details)?;

        let result = sqlx::query(statements::SAVE_JOB_DETAILS)
            .bind(&record.job_description)
            .bind(&record.job_key)
            .bind(&record.trigger_object)
            .bind(&record.job_data_object)
            .bind(record.job_state)
            .bind(record.next_trigger_fire_time_ms)
            .bind(record.next_trigger_misfire_threshold_ms)
            .bind(&record.last_execution_scheduler_guid)
            .bind(record.last_execution_start_time_ms)
            .bind(record.last_execution_end_time_ms)
            .bind(record.last_execution_succeeded)
            .bind(&record.last_execution_status_message)
            .bind(&record.job_name)
            .bind(record.version)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Ok(SaveOutcome::ConcurrentlyModified);
        }
        Ok(SaveOutcome::Saved)
    }

    async fn get_job_names(&self) -> SchedulerResult<Vec<String>> {
        let rows = sqlx::query(statements::SELECT_JOB_NAMES)
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        rows.iter()
            .map(|row| row.try_get("job_name").map_err(SchedulerError::Database))
            .collect()
    }

    async fn get_next_job_to_process(
        &self,
        scheduler_guid: Uuid,
        time_basis: DateTime<Utc>,
        scheduler_expiration_time: Duration,
    ) -> SchedulerResult<NextJob> {
        let now_ms = to_millis(time_basis);
        let expired_before_ms = now_ms.saturating_sub(scheduler_expiration_time.as_millis() as i64);
        let mut tx = self.pool.begin().await.map_err(SchedulerError::Database)?;

        let orphaned = sqlx::query(statements::ORPHAN_EXPIRED_JOBS)
            .bind(expired_before_ms)
            .execute(&mut *tx)
            .await
            .map_err(SchedulerError::Database)?
            .rows_affected();
        if orphaned > 0 {
            debug!(scheduler_guid = %scheduler_guid, orphaned, "检测到失效作业");
        }

        let unknown_state = sqlx::query(statements::STOP_JOBS_IN_UNKNOWN_STATE)
            .execute(&mut *tx)
            .await
            .map_err(SchedulerError::Database)?
            .rows_affected();
        if unknown_state > 0 {
            warn!(scheduler_guid = %scheduler_guid, unknown_state, "作业状态无法识别，已强制停止");
        }

        sqlx::query(statements::CLAIM_DUE_JOBS)
            .bind(now_ms)
            .execute(&mut *tx)
            .await
            .map_err(SchedulerError::Database)?;

        let job = loop {
            let Some(row) = sqlx::query(&statements::select_job_needing_attention())
                .fetch_optional(&mut *tx)
                .await
                .map_err(SchedulerError::Database)?
            else {
                break None;
            };

            match Self::row_to_job_details(&row) {
                Ok(details) => break Some(details),
                Err(e) => {
                    let job_name: String = row.try_get("job_name")?;
                    warn!(job_name = %job_name, error = %e, "作业记录无法解析，已强制停止");
                    sqlx::query(statements::STOP_JOB)
                        .bind(&job_name)
                        .execute(&mut *tx)
                        .await
                        .map_err(SchedulerError::Database)?;
                }
            }
        };

        let next_fire_time_ms: Option<i64> = sqlx::query(statements::SELECT_MIN_NEXT_FIRE_TIME)
            .fetch_one(&mut *tx)
            .await
            .map_err(SchedulerError::Database)?
            .try_get("next_fire_time_ms")?;

        tx.commit().await.map_err(SchedulerError::Database)?;

        Ok(NextJob {
            job,
            next_fire_time: next_fire_time_ms
                .map(crate::database::mapping::from_millis)
                .transpose()?,
        })
    }
}
