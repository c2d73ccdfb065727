pub mod database;
pub mod job_store;
pub mod observability;

pub use database::*;
pub use job_store::*;
pub use observability::*;
