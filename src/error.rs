//! Error types for the ltbase storage core.
//!
//! One crate-wide error enum; driver errors are wrapped with a short static
//! context string and the cause preserved. Validation errors surface before
//! any SQL is issued.

use uuid::Uuid;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LtBaseError>;

/// Errors produced by the storage core.
#[derive(Debug, thiserror::Error)]
pub enum LtBaseError {
    /// A table reference was empty after sanitization.
    #[error("empty table name for {context}")]
    EmptyTableName { context: &'static str },

    /// Schema ids must be positive.
    #[error("invalid schema id {schema_id}, must be > 0")]
    InvalidSchemaId { schema_id: i16 },

    /// A main-column bucket key is not in the fixed catalog.
    #[error("unknown main column {column:?}")]
    UnknownMainColumn { column: String },

    /// A bucket key exists in the catalog but under a different kind.
    #[error("main column {column:?} is not a {kind} column")]
    MainColumnKindMismatch { column: String, kind: &'static str },

    /// The operator cannot be pushed down for the attribute's value type.
    #[error("operator {op:?} not supported for attribute {attr:?}")]
    UnsupportedOperator { op: String, attr: String },

    /// A date/datetime literal was neither RFC3339 nor Unix milliseconds.
    #[error("invalid date literal {literal:?} for attribute {attr:?}")]
    InvalidDateLiteral { attr: String, literal: String },

    /// A value could not be coerced to a UUID.
    #[error("invalid uuid value {value:?}")]
    InvalidUuid { value: String },

    /// A logical value could not be coerced to its attribute's value type.
    #[error("value {value:?} not valid for attribute {attr:?}")]
    InvalidAttributeValue { attr: String, value: String },

    /// The schema is not present in the metadata cache.
    #[error("schema {schema:?} not found in metadata cache")]
    SchemaNotFound { schema: String },

    /// An update referenced a row that does not exist.
    #[error("row {row_id} not found in schema {schema_id}")]
    RowNotFound { schema_id: i16, row_id: Uuid },

    /// An EAV row referenced an attribute id missing from the schema cache.
    /// Signals cache drift; always fatal.
    #[error("attribute id {attr_id} not in cache for schema {schema_id}")]
    AttributeCacheMiss { schema_id: i16, attr_id: i16 },

    /// A stored iso8601 text column failed to parse on read.
    #[error("invalid timestamp {value:?} in column {column:?}")]
    InvalidTimestamp { column: String, value: String },

    /// The aggregated-EAV JSON column of a paged row was malformed.
    #[error("malformed attribute json for row {row_id}")]
    AttributeJson {
        row_id: Uuid,
        #[source]
        source: serde_json::Error,
    },

    /// An engine configuration knob is out of range.
    #[error("invalid engine config: {reason}")]
    InvalidEngineConfig { reason: &'static str },

    /// Cold tier requested by routing but no live client is available.
    #[error("cold tier requested but no engine client is available")]
    ColdTierUnavailable,

    /// Hot-tier driver failure, with the operation that was in flight.
    #[error("{context}")]
    Driver {
        context: &'static str,
        #[source]
        source: tokio_postgres::Error,
    },

    /// Cold-tier driver failure, with the operation that was in flight.
    #[error("{context}")]
    Cold {
        context: &'static str,
        #[source]
        source: duckdb::Error,
    },

    /// Connection pool checkout failure.
    #[error("acquire connection from pool")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// A blocking cold-tier task panicked or was cancelled.
    #[error("cold tier worker task failed")]
    ColdTask(#[from] tokio::task::JoinError),

    /// An operation exceeded its configured deadline.
    #[error("{context} timed out")]
    Timeout { context: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LtBaseError {
    /// Wrap a hot-tier driver error with a short operation context.
    pub fn driver(context: &'static str) -> impl FnOnce(tokio_postgres::Error) -> Self {
        move |source| Self::Driver { context, source }
    }

    /// Wrap a cold-tier driver error with a short operation context.
    pub fn cold(context: &'static str) -> impl FnOnce(duckdb::Error) -> Self {
        move |source| Self::Cold { context, source }
    }
}
