//! Generic store contract
//!
//! [`DbClient`] is the storage-agnostic surface the repositories are written
//! against. Records, filters and updates cross it as untyped [`Document`]s;
//! every backend sanitizes them against its configured whitelist before
//! building a native query.
//!
//! Two backends exist:
//! - [`MongoDbClient`]: document store (MongoDB)
//! - [`SqlDbClient`]: relational store (PostgreSQL, with SQLite for embedded use)

pub mod mongo;
pub mod sanitize;
pub mod sql;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::info;

use crate::config::{DatabaseConfig, DatabaseKind};
use crate::types::ErrorClass;

pub use mongo::{MongoDbClient, MongoSettings, ServerApiSettings};
pub use sanitize::Sanitizer;
pub use sql::{DatabaseType, SqlDbClient, SqlSettings};

/// String-keyed value mapping used for records, filters and updates.
pub type Document = serde_json::Map<String, Value>;

/// Identity field as surfaced to callers, whatever the native key is.
pub const ID_FIELD: &str = "id";

/// Which concrete backend a client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbBackend {
    Mongo,
    Sql,
}

impl DbBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mongo => "mongo",
            Self::Sql => "sql",
        }
    }
}

impl std::fmt::Display for DbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-specific description of the structure a collection/table needs.
///
/// Constraint creation is not portable, so this is the one place where the
/// caller has to know which backend it is talking to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaDescriptor {
    /// Index over document fields (document backend)
    Index {
        name: String,
        keys: Vec<String>,
        unique: bool,
    },
    /// Idempotent DDL statements executed in order (relational backend)
    Ddl(Vec<String>),
}

/// Errors raised by store backends.
///
/// "No matching record" is not an error: lookups return `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} client is not connected")]
    NotConnected(DbBackend),

    #[error("invalid data source name: {0}")]
    InvalidDsn(String),

    #[error("invalid collection or table name: {0:?}")]
    InvalidCollection(String),

    #[error("filter has no usable fields after sanitization")]
    EmptyFilter,

    #[error("update has no usable fields after sanitization")]
    EmptyUpdate,

    #[error("{backend} backend cannot apply schema descriptor: {reason}")]
    UnsupportedSchema { backend: DbBackend, reason: String },

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("mongodb {op} failed: {source}")]
    Mongo {
        op: &'static str,
        #[source]
        source: mongodb::error::Error,
    },

    #[error("sql {op} failed: {source}")]
    Sql {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("record decode failed: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UniqueViolation(_) => ErrorClass::AlreadyExists,
            Self::InvalidDsn(_)
            | Self::InvalidCollection(_)
            | Self::EmptyFilter
            | Self::EmptyUpdate => ErrorClass::Validation,
            Self::NotConnected(_) | Self::Timeout { .. } | Self::Mongo { .. } | Self::Sql { .. } => {
                ErrorClass::Connectivity
            }
            Self::UnsupportedSchema { .. } | Self::Decode(_) => ErrorClass::Internal,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }
}

/// Storage-agnostic operations over opaque documents.
///
/// Futures are cancelled by dropping them; each backend also bounds every
/// operation by its configured timeout.
#[async_trait]
pub trait DbClient: Send + Sync {
    /// Which backend this client drives.
    fn backend(&self) -> DbBackend;

    /// Establish the connection pool.
    async fn connect(&self, dsn: &str) -> Result<(), StoreError>;

    /// Release the pool. Safe to call repeatedly or before `connect`.
    async fn disconnect(&self) -> Result<(), StoreError>;

    /// Persist one record and return its generated identity.
    async fn insert_one(&self, collection: &str, document: Document) -> Result<String, StoreError>;

    /// Fetch the first record matching `filter`, restricted to `fields`
    /// (all fields when empty).
    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        fields: &[&str],
    ) -> Result<Option<Document>, StoreError>;

    /// Fetch every record matching `filter` (everything when the filter is empty).
    async fn find_many(
        &self,
        collection: &str,
        filter: Document,
        fields: &[&str],
    ) -> Result<Vec<Document>, StoreError>;

    /// Set the fields in `update` on the first record matching `filter`.
    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> Result<u64, StoreError>;

    /// Remove the first record matching `filter`.
    async fn delete_one(&self, collection: &str, filter: Document) -> Result<u64, StoreError>;

    /// Remove every record matching `filter`.
    async fn delete_many(&self, collection: &str, filter: Document) -> Result<u64, StoreError>;

    /// Liveness check against the server.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Idempotently create the structure described by `schema`.
    async fn ensure_schema(
        &self,
        collection: &str,
        schema: &SchemaDescriptor,
    ) -> Result<(), StoreError>;
}

/// A typed record whose stored shape is known up front.
pub trait Record: DeserializeOwned {
    /// Field (column) names read back from the store.
    const FIELDS: &'static [&'static str];
}

/// Look up one record and decode it into `T`.
pub async fn find_record<T: Record>(
    client: &dyn DbClient,
    collection: &str,
    filter: Document,
) -> Result<Option<T>, StoreError> {
    match client.find_one(collection, filter, T::FIELDS).await? {
        Some(document) => serde_json::from_value(Value::Object(document))
            .map(Some)
            .map_err(|e| StoreError::Decode(e.to_string())),
        None => Ok(None),
    }
}

/// Build a single-field filter.
pub fn filter_eq(field: &str, value: impl Into<Value>) -> Document {
    let mut filter = Document::new();
    filter.insert(field.to_string(), value.into());
    filter
}

/// Run a store operation under a deadline and record its outcome.
pub(crate) async fn timed<T, F>(
    backend: DbBackend,
    op: &'static str,
    limit: Duration,
    fut: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    let started = Instant::now();
    let result = if limit.is_zero() {
        fut.await
    } else {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout { op, after: limit }),
        }
    };

    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.class().as_str(),
    };
    crate::metrics::record_store_operation(backend.as_str(), op, outcome, started.elapsed());

    result
}

/// Build the configured backend and connect it.
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn DbClient>, StoreError> {
    let timeout = Duration::from_millis(config.timeout_ms);

    let client: Arc<dyn DbClient> = match config.kind {
        DatabaseKind::Mongo => Arc::new(MongoDbClient::new(MongoSettings {
            valid_collections: config.mongodb.valid_collections.clone(),
            valid_fields: config.mongodb.valid_fields.clone(),
            max_pool_size: config.mongodb.max_pool_size,
            timeout,
            server_api: config.mongodb.server_api.as_ref().map(|api| ServerApiSettings {
                version: api.api_version.clone(),
                strict: api.strict,
                deprecation_errors: api.deprecation_errors,
            }),
        })?),
        DatabaseKind::Postgres | DatabaseKind::Sqlite => Arc::new(SqlDbClient::new(SqlSettings {
            valid_tables: config.sql.valid_tables.clone(),
            valid_fields: config.sql.valid_fields.clone(),
            max_connections: config.sql.max_open_conns,
            min_connections: config.sql.min_conns,
            max_lifetime: Duration::from_secs(config.sql.conn_max_lifetime_secs),
            idle_timeout: Duration::from_secs(config.sql.idle_timeout_secs),
            timeout,
        })),
    };

    client.connect(&config.dsn).await?;
    info!("{} store connected", client.backend());

    Ok(client)
}
