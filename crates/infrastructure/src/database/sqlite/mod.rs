pub mod sqlite_job_store_dao;

pub use sqlite_job_store_dao::SqliteJobStoreDao;
