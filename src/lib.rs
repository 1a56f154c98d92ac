//! `ltbase` - hybrid entity store with federated query execution
//!
//! Entities split between fixed main-table columns and open-ended EAV rows;
//! reads are routed between a row-oriented hot tier (PostgreSQL) and a
//! columnar cold tier (DuckDB), with dirty rows excluded from analytic
//! reads so the two tiers never disagree on fresh data.
//!
//! # Architecture
//!
//! - [`config`] - engine/table configuration
//! - [`schema`] - schema registry and attribute metadata cache
//! - [`layout`] - the fixed main-table column catalog
//! - [`record`] - persistent records and the boundary transformer
//! - [`query`] - condition compiler and the optimized paged query
//! - [`storage`] - hot-tier repository, cold-tier client, change log
//! - [`federation`] - routing policy and the federated coordinator
//! - [`manager`] - JSON-facing entity CRUD
//! - [`error`] - error types and handling
//! - [`util`] - identifier and value utilities

#![forbid(unsafe_code)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod federation;
pub mod layout;
pub mod logging;
pub mod manager;
pub mod query;
pub mod record;
pub mod schema;
pub mod storage;
pub mod util;

pub use config::{EngineConfig, StorageTables};
pub use error::{LtBaseError, Result};
pub use federation::routing::{Tier, evaluate_routing_policy};
pub use federation::{FederatedCoordinator, QueryOptions};
pub use query::{Condition, FederatedQuery, QueryPage};
pub use record::{EAVRecord, PersistentRecord};
pub use storage::{DuckDbClient, PostgresRepository};
