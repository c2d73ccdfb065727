use thiserror::Error;

/// 调度器错误类型定义
///
/// 并发修改冲突不属于错误：保存作业详情时以 `SaveOutcome::ConcurrentlyModified`
/// 返回，调用方无法把它误当作需要延迟重试的基础设施故障。
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("作业未找到: {name}")]
    JobNotFound { name: String },

    #[error("作业已存在: {name}")]
    JobAlreadyExists { name: String },

    #[error("无效的参数: {0}")]
    InvalidArgument(String),

    #[error("对象已释放: {0}")]
    Disposed(String),

    #[error("触发器策略错误: {0}")]
    TriggerPolicy(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("作业执行错误: {0}")]
    JobExecution(String),
}

impl SchedulerError {
    /// 是否为资源已释放（关闭信号）
    pub fn is_disposed(&self) -> bool {
        matches!(self, SchedulerError::Disposed(_))
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        SchedulerError::InvalidArgument(message.into())
    }

    pub fn disposed(what: impl Into<String>) -> Self {
        SchedulerError::Disposed(what.into())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::Serialization(e.to_string())
    }
}
