use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::broadcast;
use tracing::{info, warn};

use scheduler_core::config::{AppConfig, JobStoreKind};
use scheduler_dispatcher::{DefaultJobRunner, DefaultScheduler, JobRegistry, LogJob, SchedulerOptions};
use scheduler_domain::{CreateJobConflictAction, JobData, JobSpec, JobStore, PeriodicTrigger};
use scheduler_infrastructure::{
    connect_job_store_dao, MemoryJobStore, PersistentJobStore, PersistentJobStoreOptions,
};

pub const DEMO_JOB_NAME: &str = "heartbeat-log";

/// 调度器守护进程
pub struct Application {
    config: AppConfig,
    job_store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    scheduler: DefaultScheduler,
}

impl Application {
    /// 按配置创建作业存储、执行器和调度器
    pub async fn new(config: AppConfig) -> Result<Self> {
        let job_store = create_job_store(&config).await?;

        let registry = Arc::new(JobRegistry::new());
        registry.register(LogJob::JOB_KEY, Arc::new(LogJob)).await;
        let job_runner = Arc::new(DefaultJobRunner::new(Arc::clone(&registry)));

        let mut options = SchedulerOptions::from(&config.scheduler);
        if options.name.trim().is_empty() {
            options.name = default_scheduler_name();
        }
        let scheduler = DefaultScheduler::new(Arc::clone(&job_store), job_runner, options);

        Ok(Self {
            config,
            job_store,
            registry,
            scheduler,
        })
    }

    pub fn scheduler(&self) -> &DefaultScheduler {
        &self.scheduler
    }

    /// 作业键注册表，可在启动前注册更多作业实现
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// 启动调度器并运行到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        if self.config.job_store.kind == JobStoreKind::Memory {
            self.seed_demo_job().await?;
        }

        self.scheduler.start().await.context("启动调度器失败")?;
        info!(
            "调度器 {} ({}) 正在运行，作业存储: {:?}",
            self.scheduler.name(),
            self.scheduler.guid(),
            self.config.job_store.kind
        );

        let _ = shutdown_rx.recv().await;
        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        info!("正在停止调度器");
        let running = self.scheduler.running_job_count();
        if running > 0 {
            warn!("仍有 {} 个作业在执行，结果将尽力写回", running);
        }
        self.scheduler.dispose().await;
        self.job_store.dispose();
        info!("调度器已停止");
    }

    /// 内存存储重启后为空，写入一个每分钟执行的日志作业
    async fn seed_demo_job(&self) -> Result<()> {
        let trigger = PeriodicTrigger::new(Utc::now(), None, Some(Duration::minutes(1)), None)?
            .with_misfire_threshold(Some(Duration::seconds(30)));
        let job_spec = JobSpec::new(DEMO_JOB_NAME, "定时心跳日志", LogJob::JOB_KEY, trigger.into())?;
        let job_data = JobData::new().with("source", serde_json::json!("demo"));

        self.scheduler
            .create_job(
                &job_spec,
                Some(&job_data),
                Utc::now(),
                CreateJobConflictAction::Ignore,
            )
            .await
            .context("创建示例作业失败")?;
        Ok(())
    }
}

async fn create_job_store(config: &AppConfig) -> Result<Arc<dyn JobStore>> {
    match config.job_store.kind {
        JobStoreKind::Memory => {
            info!("使用内存作业存储");
            Ok(Arc::new(MemoryJobStore::new()))
        }
        JobStoreKind::Sqlite | JobStoreKind::Postgres => {
            info!("使用持久化作业存储: {:?}", config.job_store.kind);
            let dao = connect_job_store_dao(&config.database)
                .await
                .context("连接作业存储数据库失败")?;
            let options = PersistentJobStoreOptions::from(&config.job_store);
            Ok(Arc::new(PersistentJobStore::new(dao, options)))
        }
    }
}

fn default_scheduler_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "scheduler".to_string())
}

/// 安装 Prometheus 指标导出器
pub fn init_metrics(bind_address: &str) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {bind_address}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("安装Prometheus指标导出器失败")?;

    info!("Prometheus指标导出器已在 {} 上启动", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_application_runs_demo_job() {
        let app = Arc::new(Application::new(AppConfig::default()).await.unwrap());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = {
            let app = Arc::clone(&app);
            tokio::spawn(async move { app.run(shutdown_rx).await })
        };

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let job = app
                .scheduler()
                .get_job_details(DEMO_JOB_NAME)
                .await
                .unwrap();
            let run_count = job
                .and_then(|j| j.job_data)
                .and_then(|d| d.get(LogJob::RUN_COUNT_KEY).cloned());
            if run_count == Some(serde_json::json!(1)) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "示例作业未执行");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!app.scheduler().is_running());
        assert_eq!(app.registry().job_keys().await, vec![LogJob::JOB_KEY.to_string()]);
    }

    #[tokio::test]
    async fn test_blank_name_defaults_to_hostname() {
        let app = Application::new(AppConfig::default()).await.unwrap();
        assert!(!app.scheduler().name().is_empty());
    }
}
