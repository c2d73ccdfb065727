pub mod postgres_job_store_dao;

pub use postgres_job_store_dao::PostgresJobStoreDao;
