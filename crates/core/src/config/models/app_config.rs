use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig,
    observability::ObservabilityConfig,
    scheduler::{JobStoreConfig, JobStoreKind, SchedulerConfig},
};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub job_store: JobStoreConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: SCHEDULER__, nested keys separated by `__`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = toml::to_string(&AppConfig::default()).context("序列化默认配置失败")?;
        let mut builder =
            ConfigBuilder::builder().add_source(File::from_str(&defaults, FileFormat::Toml));

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/scheduler.toml", "scheduler.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SCHEDULER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate().context("调度器配置验证失败")?;
        self.job_store.validate().context("作业存储配置验证失败")?;

        if self.job_store.kind != JobStoreKind::Memory {
            self.database.validate().context("数据库配置验证失败")?;

            match self.job_store.kind {
                JobStoreKind::Sqlite if !self.database.is_sqlite() => {
                    return Err(anyhow::anyhow!("SQLite作业存储需要sqlite:格式的数据库URL"));
                }
                JobStoreKind::Postgres if !self.database.is_postgres() => {
                    return Err(anyhow::anyhow!(
                        "PostgreSQL作业存储需要postgresql://格式的数据库URL"
                    ));
                }
                _ => {}
            }
        }

        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.error_recovery_delay_seconds, 30);
        assert_eq!(config.job_store.scheduler_expiration_time_seconds, 120);
        assert_eq!(config.job_store.polling_interval_seconds, 15);
        assert_eq!(config.job_store.kind, JobStoreKind::Memory);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = AppConfig::from_toml(
            r#"
            [scheduler]
            name = "node-a"
            error_recovery_delay_seconds = 5

            [job_store]
            kind = "sqlite"
            scheduler_expiration_time_seconds = 60
            polling_interval_seconds = 3

            [database]
            url = "sqlite://jobs.db"
            max_connections = 4
            min_connections = 1
            connection_timeout_seconds = 10
            idle_timeout_seconds = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.name, "node-a");
        assert_eq!(config.job_store.kind, JobStoreKind::Sqlite);
        assert_eq!(config.job_store.polling_interval_seconds, 3);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_validate_rejects_mismatched_database_url() {
        let mut config = AppConfig::default();
        config.job_store.kind = JobStoreKind::Postgres;
        config.database.url = "sqlite://jobs.db".to_string();
        assert!(config.validate().is_err());

        config.database.url = "postgres://localhost/scheduler".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = AppConfig::default();
        config.job_store.polling_interval_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.scheduler.error_recovery_delay_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.job_store.kind, config.job_store.kind);
        assert_eq!(parsed.database.url, config.database.url);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [scheduler]
            name = "from-file"
            error_recovery_delay_seconds = 7
            "#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.scheduler.name, "from-file");
        assert_eq!(config.scheduler.error_recovery_delay_seconds, 7);
        assert_eq!(config.job_store.polling_interval_seconds, 15);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/definitely/not/here.toml")).is_err());
    }
}
