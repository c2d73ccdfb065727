//! 可观测性：结构化事件日志与指标

pub mod metrics_collector;
pub mod structured_logger;

pub use metrics_collector::SchedulerMetrics;
pub use structured_logger::JobEventLogger;
