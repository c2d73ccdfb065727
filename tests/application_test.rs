#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use chrono::Utc;
    use tokio::sync::broadcast;

    use scheduler::app::{Application, DEMO_JOB_NAME};
    use scheduler_core::config::{AppConfig, JobStoreKind};
    use scheduler_dispatcher::LogJob;
    use scheduler_domain::{CreateJobConflictAction, JobSpec, JobState, PeriodicTrigger};

    fn sqlite_config(dir: &tempfile::TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.scheduler.name = "app-test".to_string();
        config.job_store.kind = JobStoreKind::Sqlite;
        config.job_store.polling_interval_seconds = 1;
        config.database.url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        config.database.max_connections = 4;
        config.validate().unwrap();
        config
    }

    #[tokio::test]
    async fn test_sqlite_application_runs_jobs_and_survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        let app = Arc::new(Application::new(sqlite_config(&dir)).await.unwrap());
        assert_eq!(app.scheduler().name(), "app-test");

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = {
            let app = Arc::clone(&app);
            tokio::spawn(async move { app.run(shutdown_rx).await })
        };

        let spec = JobSpec::new(
            "report",
            "生成报表",
            LogJob::JOB_KEY,
            PeriodicTrigger::one_shot(Utc::now()).into(),
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !app.scheduler().is_running() {
            assert!(Instant::now() < deadline, "调度器未启动");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(app
            .scheduler()
            .create_job(&spec, None, Utc::now(), CreateJobConflictAction::Throw)
            .await
            .unwrap());

        loop {
            let job = app.scheduler().get_job_details("report").await.unwrap().unwrap();
            if job.job_state == JobState::Stopped {
                assert!(job.last_job_execution_details.unwrap().succeeded);
                break;
            }
            assert!(Instant::now() < deadline, "作业未完成: {:?}", job.job_state);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // 持久化存储不会写入示例作业
        assert_eq!(app.scheduler().get_job_names().await.unwrap(), vec!["report"]);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        drop(app);

        let restarted = Application::new(sqlite_config(&dir)).await.unwrap();
        let job = restarted
            .scheduler()
            .get_job_details("report")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.job_state, JobState::Stopped);
        assert!(restarted
            .scheduler()
            .get_job_details(DEMO_JOB_NAME)
            .await
            .unwrap()
            .is_none());
    }
}
