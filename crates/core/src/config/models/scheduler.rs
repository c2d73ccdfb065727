use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 调度器实例配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 调度器实例名称，为空时使用主机名
    pub name: String,
    /// 作业存储出错后的恢复等待时间（秒）
    pub error_recovery_delay_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            error_recovery_delay_seconds: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.error_recovery_delay_seconds == 0 {
            return Err(anyhow::anyhow!("错误恢复等待时间必须大于0"));
        }
        Ok(())
    }

    pub fn error_recovery_delay(&self) -> Duration {
        Duration::from_secs(self.error_recovery_delay_seconds)
    }
}

/// 作业存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStoreKind {
    Memory,
    Sqlite,
    Postgres,
}

/// 作业存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStoreConfig {
    pub kind: JobStoreKind,
    /// 调度器实例心跳过期时间（秒），超过该时间未刷新心跳的实例视为失效
    pub scheduler_expiration_time_seconds: u64,
    /// 持久化存储的最长轮询间隔（秒）
    pub polling_interval_seconds: u64,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            kind: JobStoreKind::Memory,
            scheduler_expiration_time_seconds: 120,
            polling_interval_seconds: 15,
        }
    }
}

impl JobStoreConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler_expiration_time_seconds == 0 {
            return Err(anyhow::anyhow!("调度器过期时间必须大于0"));
        }

        if self.polling_interval_seconds == 0 {
            return Err(anyhow::anyhow!("轮询间隔必须大于0"));
        }

        Ok(())
    }

    pub fn scheduler_expiration_time(&self) -> Duration {
        Duration::from_secs(self.scheduler_expiration_time_seconds)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_seconds)
    }
}
