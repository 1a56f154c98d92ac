//! Storage layer: hot-tier repository, cold-tier client, change log, DDL.
//!
//! - [`schema`] - table DDL and idempotent schema application
//! - [`postgres`] - hot-tier repository (CRUD + paged reads)
//! - [`changelog`] - change-log records and the dirty-row contract
//! - [`duckdb`] - cold-tier analytic engine client

pub mod changelog;
pub mod duckdb;
pub mod postgres;
pub mod schema;

pub use self::changelog::ChangeLogEntry;
pub use self::duckdb::{DuckDbClient, global_engine, set_global_engine};
pub use self::postgres::PostgresRepository;
