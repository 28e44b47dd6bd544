//! Relational store backend
//!
//! Runs on sqlx's `Any` driver so the same client serves PostgreSQL in
//! production and SQLite for embedded deployments and tests. Identities are
//! generated client-side as UUID v4 strings and stored in a TEXT primary key,
//! which keeps them portable across both dialects.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Column, Row};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::sanitize::{sql_identifier_allowed, Sanitizer};
use super::{timed, DbBackend, DbClient, Document, SchemaDescriptor, StoreError, ID_FIELD};

/// SQLSTATE for unique_violation.
pub const UNIQUE_VIOLATION_CODE: &str = "23505";

/// SQL dialect, detected from the DSN scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    PostgreSQL,
    SQLite,
}

impl DatabaseType {
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if url.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Bind placeholder for the 1-based parameter `n`.
    fn placeholder(&self, n: usize) -> String {
        match self {
            Self::PostgreSQL => format!("${}", n),
            Self::SQLite => format!("?{}", n),
        }
    }
}

/// Pool and whitelist settings for [`SqlDbClient`].
#[derive(Debug, Clone)]
pub struct SqlSettings {
    pub valid_tables: Vec<String>,
    pub valid_fields: Vec<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
    /// Acquire timeout and per-operation deadline.
    pub timeout: Duration,
}

struct Connection {
    pool: AnyPool,
    db_type: DatabaseType,
}

/// Relational implementation of [`DbClient`].
pub struct SqlDbClient {
    connection: RwLock<Option<Connection>>,
    settings: SqlSettings,
    sanitizer: Sanitizer,
}

impl SqlDbClient {
    pub fn new(settings: SqlSettings) -> Self {
        let sanitizer = Sanitizer::new(
            DbBackend::Sql,
            ID_FIELD,
            settings
                .valid_tables
                .iter()
                .filter(|t| sql_identifier_allowed(t))
                .cloned(),
            settings.valid_fields.iter().cloned(),
            sql_identifier_allowed,
        );

        Self {
            connection: RwLock::new(None),
            settings,
            sanitizer,
        }
    }

    /// Cheap clone of the live pool.
    async fn pool(&self) -> Result<(AnyPool, DatabaseType), StoreError> {
        self.connection
            .read()
            .await
            .as_ref()
            .map(|c| (c.pool.clone(), c.db_type))
            .ok_or(StoreError::NotConnected(DbBackend::Sql))
    }
}

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Statement {
    pub sql: String,
    pub binds: Vec<Value>,
}

/// Renders parameterized statements; values are never inlined.
struct StatementBuilder {
    db_type: DatabaseType,
    binds: Vec<Value>,
}

impl StatementBuilder {
    fn new(db_type: DatabaseType) -> Self {
        Self {
            db_type,
            binds: Vec::new(),
        }
    }

    fn push(&mut self, value: Value) -> String {
        self.binds.push(value);
        self.db_type.placeholder(self.binds.len())
    }

    fn where_clause(&mut self, filter: Document) -> String {
        if filter.is_empty() {
            return String::new();
        }
        let conditions: Vec<String> = filter
            .into_iter()
            .map(|(column, value)| match value {
                Value::Null => format!("{} IS NULL", column),
                value => format!("{} = {}", column, self.push(value)),
            })
            .collect();
        format!(" WHERE {}", conditions.join(" AND "))
    }

    fn finish(self, sql: String) -> Statement {
        Statement {
            sql,
            binds: self.binds,
        }
    }
}

pub(crate) fn build_insert(db_type: DatabaseType, table: &str, document: Document) -> Statement {
    let mut builder = StatementBuilder::new(db_type);
    let mut columns = Vec::with_capacity(document.len());
    let mut values = Vec::with_capacity(document.len());

    for (column, value) in document {
        columns.push(column);
        values.push(builder.push(value));
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        values.join(", ")
    );
    builder.finish(sql)
}

pub(crate) fn build_select(
    db_type: DatabaseType,
    table: &str,
    fields: &[&str],
    filter: Document,
    limit: Option<u32>,
) -> Statement {
    let mut builder = StatementBuilder::new(db_type);
    let mut sql = format!("SELECT {} FROM {}", fields.join(", "), table);
    sql.push_str(&builder.where_clause(filter));
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    builder.finish(sql)
}

/// `UPDATE ... LIMIT` is not portable, so the single target row is picked
/// by identity in a subquery.
pub(crate) fn build_update_one(
    db_type: DatabaseType,
    table: &str,
    update: Document,
    filter: Document,
) -> Statement {
    let mut builder = StatementBuilder::new(db_type);
    let assignments: Vec<String> = update
        .into_iter()
        .map(|(column, value)| format!("{} = {}", column, builder.push(value)))
        .collect();
    let where_clause = builder.where_clause(filter);

    let sql = format!(
        "UPDATE {table} SET {} WHERE {id} IN (SELECT {id} FROM {table}{} LIMIT 1)",
        assignments.join(", "),
        where_clause,
        table = table,
        id = ID_FIELD,
    );
    builder.finish(sql)
}

pub(crate) fn build_delete(
    db_type: DatabaseType,
    table: &str,
    filter: Document,
    single: bool,
) -> Statement {
    let mut builder = StatementBuilder::new(db_type);
    let where_clause = builder.where_clause(filter);

    let sql = if single {
        format!(
            "DELETE FROM {table} WHERE {id} IN (SELECT {id} FROM {table}{} LIMIT 1)",
            where_clause,
            table = table,
            id = ID_FIELD,
        )
    } else {
        format!("DELETE FROM {}{}", table, where_clause)
    };
    builder.finish(sql)
}

fn bind_value<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    value: Value,
) -> Query<'q, Any, AnyArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s),
        // Sanitization drops non-scalars before statements are built
        other => query.bind(other.to_string()),
    }
}

fn prepare(statement: &Statement) -> Query<'_, Any, AnyArguments<'_>> {
    statement
        .binds
        .iter()
        .cloned()
        .fold(sqlx::query(&statement.sql), bind_value)
}

fn decode_column(row: &AnyRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(index) {
        return serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    Value::Null
}

fn row_to_document(row: &AnyRow) -> Document {
    row.columns()
        .iter()
        .map(|column| (column.name().to_string(), decode_column(row, column.ordinal())))
        .collect()
}

/// SQLite DSNs that name a private in-memory database.
fn is_in_memory(dsn: &str) -> bool {
    dsn.contains(":memory:") || dsn.contains("mode=memory")
}

fn map_sql_error(op: &'static str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() || db_err.code().as_deref() == Some(UNIQUE_VIOLATION_CODE)
        {
            return StoreError::UniqueViolation(db_err.message().to_string());
        }
    }
    StoreError::Sql { op, source: err }
}

#[async_trait]
impl DbClient for SqlDbClient {
    fn backend(&self) -> DbBackend {
        DbBackend::Sql
    }

    async fn connect(&self, dsn: &str) -> Result<(), StoreError> {
        let db_type = DatabaseType::from_url(dsn).ok_or_else(|| {
            StoreError::InvalidDsn("expected a postgres:// or sqlite: data source name".into())
        })?;

        sqlx::any::install_default_drivers();

        let settings = &self.settings;
        let options = if db_type == DatabaseType::SQLite && is_in_memory(dsn) {
            // Every connection to an in-memory SQLite DSN opens its own empty
            // database, so the pool is pinned to one connection that never expires.
            debug!("In-memory SQLite: using a single pooled connection");
            AnyPoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .max_lifetime(None)
                .idle_timeout(None)
        } else {
            AnyPoolOptions::new()
                .max_connections(settings.max_connections.max(1))
                .min_connections(settings.min_connections)
                .max_lifetime(settings.max_lifetime)
                .idle_timeout(settings.idle_timeout)
        };

        let pool = timed(DbBackend::Sql, "connect", settings.timeout, async {
            let pool = options
                .acquire_timeout(settings.timeout)
                .connect(dsn)
                .await
                .map_err(|e| map_sql_error("connect", e))?;

            sqlx::query("SELECT 1")
                .execute(&pool)
                .await
                .map_err(|e| map_sql_error("ping", e))?;

            Ok(pool)
        })
        .await?;

        info!(?db_type, "Connected to relational store");

        let previous = self
            .connection
            .write()
            .await
            .replace(Connection { pool, db_type });
        if let Some(previous) = previous {
            previous.pool.close().await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        if let Some(connection) = self.connection.write().await.take() {
            connection.pool.close().await;
            info!("Relational store connection closed");
        }
        Ok(())
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<String, StoreError> {
        self.sanitizer.check_collection(collection)?;
        let (pool, db_type) = self.pool().await?;

        let mut document = self.sanitizer.sanitize(document);
        if document.is_empty() {
            return Err(StoreError::EmptyUpdate);
        }
        let id = uuid::Uuid::new_v4().to_string();
        document.insert(ID_FIELD.to_string(), Value::String(id.clone()));

        let statement = build_insert(db_type, collection, document);
        debug!(sql = %statement.sql, "insert_one");

        timed(DbBackend::Sql, "insert_one", self.settings.timeout, async {
            prepare(&statement)
                .execute(&pool)
                .await
                .map_err(|e| map_sql_error("insert_one", e))?;
            Ok(id)
        })
        .await
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        fields: &[&str],
    ) -> Result<Option<Document>, StoreError> {
        self.sanitizer.check_collection(collection)?;
        let (pool, db_type) = self.pool().await?;

        let filter = self.sanitizer.sanitize_filter(filter, false)?;
        let fields = self.sanitizer.projection(fields);
        let statement = build_select(db_type, collection, &fields, filter, Some(1));

        timed(DbBackend::Sql, "find_one", self.settings.timeout, async {
            let row = prepare(&statement)
                .fetch_optional(&pool)
                .await
                .map_err(|e| map_sql_error("find_one", e))?;
            Ok(row.as_ref().map(row_to_document))
        })
        .await
    }

    async fn find_many(
        &self,
        collection: &str,
        filter: Document,
        fields: &[&str],
    ) -> Result<Vec<Document>, StoreError> {
        self.sanitizer.check_collection(collection)?;
        let (pool, db_type) = self.pool().await?;

        let filter = self.sanitizer.sanitize_filter(filter, true)?;
        let fields = self.sanitizer.projection(fields);
        let statement = build_select(db_type, collection, &fields, filter, None);

        timed(DbBackend::Sql, "find_many", self.settings.timeout, async {
            let rows = prepare(&statement)
                .fetch_all(&pool)
                .await
                .map_err(|e| map_sql_error("find_many", e))?;
            Ok(rows.iter().map(row_to_document).collect())
        })
        .await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> Result<u64, StoreError> {
        self.sanitizer.check_collection(collection)?;
        let (pool, db_type) = self.pool().await?;

        let filter = self.sanitizer.sanitize_filter(filter, false)?;
        let update = self.sanitizer.sanitize(update);
        if update.is_empty() {
            return Err(StoreError::EmptyUpdate);
        }
        let statement = build_update_one(db_type, collection, update, filter);

        timed(DbBackend::Sql, "update_one", self.settings.timeout, async {
            let result = prepare(&statement)
                .execute(&pool)
                .await
                .map_err(|e| map_sql_error("update_one", e))?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> Result<u64, StoreError> {
        self.sanitizer.check_collection(collection)?;
        let (pool, db_type) = self.pool().await?;

        let filter = self.sanitizer.sanitize_filter(filter, false)?;
        let statement = build_delete(db_type, collection, filter, true);

        timed(DbBackend::Sql, "delete_one", self.settings.timeout, async {
            let result = prepare(&statement)
                .execute(&pool)
                .await
                .map_err(|e| map_sql_error("delete_one", e))?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn delete_many(&self, collection: &str, filter: Document) -> Result<u64, StoreError> {
        self.sanitizer.check_collection(collection)?;
        let (pool, db_type) = self.pool().await?;

        let filter = self.sanitizer.sanitize_filter(filter, true)?;
        let statement = build_delete(db_type, collection, filter, false);

        timed(DbBackend::Sql, "delete_many", self.settings.timeout, async {
            let result = prepare(&statement)
                .execute(&pool)
                .await
                .map_err(|e| map_sql_error("delete_many", e))?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let (pool, _) = self.pool().await?;
        timed(DbBackend::Sql, "ping", self.settings.timeout, async {
            sqlx::query("SELECT 1")
                .execute(&pool)
                .await
                .map_err(|e| map_sql_error("ping", e))?;
            Ok(())
        })
        .await
    }

    async fn ensure_schema(
        &self,
        collection: &str,
        schema: &SchemaDescriptor,
    ) -> Result<(), StoreError> {
        self.sanitizer.check_collection(collection)?;
        let statements = match schema {
            SchemaDescriptor::Ddl(statements) => statements,
            SchemaDescriptor::Index { .. } => {
                return Err(StoreError::UnsupportedSchema {
                    backend: DbBackend::Sql,
                    reason: "expected DDL statements".into(),
                })
            }
        };
        let (pool, _) = self.pool().await?;

        timed(DbBackend::Sql, "ensure_schema", self.settings.timeout, async {
            for statement in statements {
                sqlx::query(statement)
                    .execute(&pool)
                    .await
                    .map_err(|e| map_sql_error("ensure_schema", e))?;
            }
            Ok(())
        })
        .await?;

        info!(table = collection, "Schema ensured");
        Ok(())
    }
}

impl std::fmt::Debug for SqlDbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlDbClient")
            .field("max_connections", &self.settings.max_connections)
            .field("timeout", &self.settings.timeout)
            .finish_non_exhaustive()
    }
}
