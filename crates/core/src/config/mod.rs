pub mod models;

pub use models::{
    AppConfig, DatabaseConfig, JobStoreConfig, JobStoreKind, ObservabilityConfig, SchedulerConfig,
};
