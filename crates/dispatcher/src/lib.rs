//! 调度编排：轮询作业存储、驱动触发器并执行作业

pub mod job_runner;
pub mod scheduler;

pub use job_runner::{DefaultJobRunner, Job, JobRegistry, LogJob};
pub use scheduler::{DefaultScheduler, SchedulerOptions};
