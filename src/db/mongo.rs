//! MongoDB store backend
//!
//! Documents are converted field-by-field between JSON scalars and BSON.
//! The native `_id` is surfaced to callers as a hex string under `id`.

use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Bson};
use futures_util::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    ClientOptions, FindOneOptions, FindOptions, IndexOptions, ReadPreference, SelectionCriteria,
    ServerApi, ServerApiVersion,
};
use mongodb::{Client, Collection, Database, IndexModel};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::sanitize::{mongo_key_allowed, Sanitizer};
use super::{timed, DbBackend, DbClient, Document, SchemaDescriptor, StoreError, ID_FIELD};

/// Native identity key.
pub const MONGO_ID_FIELD: &str = "_id";

/// Server error code for a duplicate key on a unique index.
pub const DUPLICATE_KEY_CODE: i32 = 11000;

pub const DEFAULT_MAX_POOL_SIZE: u32 = 20;

/// Stable API pinning.
#[derive(Debug, Clone)]
pub struct ServerApiSettings {
    pub version: String,
    pub strict: bool,
    pub deprecation_errors: bool,
}

/// Pool and whitelist settings for [`MongoDbClient`].
#[derive(Debug, Clone)]
pub struct MongoSettings {
    pub valid_collections: Vec<String>,
    pub valid_fields: Vec<String>,
    pub max_pool_size: u32,
    /// Connect/server-selection timeout and per-operation deadline.
    pub timeout: Duration,
    pub server_api: Option<ServerApiSettings>,
}

/// MongoDB implementation of [`DbClient`].
pub struct MongoDbClient {
    connection: RwLock<Option<(Client, Database)>>,
    max_pool_size: u32,
    timeout: Duration,
    server_api: Option<ServerApi>,
    sanitizer: Sanitizer,
}

impl MongoDbClient {
    pub fn new(settings: MongoSettings) -> Result<Self, StoreError> {
        let server_api = settings
            .server_api
            .as_ref()
            .map(|api| {
                let version = match api.version.as_str() {
                    "1" => ServerApiVersion::V1,
                    other => {
                        return Err(StoreError::InvalidDsn(format!(
                            "unsupported server API version '{}'",
                            other
                        )))
                    }
                };
                Ok(ServerApi::builder()
                    .version(version)
                    .strict(api.strict)
                    .deprecation_errors(api.deprecation_errors)
                    .build())
            })
            .transpose()?;

        let sanitizer = Sanitizer::new(
            DbBackend::Mongo,
            MONGO_ID_FIELD,
            settings.valid_collections,
            settings.valid_fields,
            mongo_key_allowed,
        );

        Ok(Self {
            connection: RwLock::new(None),
            max_pool_size: if settings.max_pool_size == 0 {
                DEFAULT_MAX_POOL_SIZE
            } else {
                settings.max_pool_size
            },
            timeout: settings.timeout,
            server_api,
            sanitizer,
        })
    }

    async fn database(&self) -> Result<Database, StoreError> {
        self.connection
            .read()
            .await
            .as_ref()
            .map(|(_, db)| db.clone())
            .ok_or(StoreError::NotConnected(DbBackend::Mongo))
    }

    async fn collection(&self, name: &str) -> Result<Collection<bson::Document>, StoreError> {
        self.sanitizer.check_collection(name)?;
        Ok(self.database().await?.collection::<bson::Document>(name))
    }

    fn projection(&self, fields: &[&str]) -> bson::Document {
        let mut projection = bson::Document::new();
        for field in self.sanitizer.projection(fields) {
            let key = if field == ID_FIELD { MONGO_ID_FIELD } else { field };
            projection.insert(key, 1);
        }
        projection
    }
}

/// Check the scheme and return the database named in the DSN path.
pub fn database_name_from_dsn(dsn: &str) -> Result<String, StoreError> {
    let rest = dsn
        .strip_prefix("mongodb+srv://")
        .or_else(|| dsn.strip_prefix("mongodb://"))
        .ok_or_else(|| {
            StoreError::InvalidDsn("expected a mongodb:// or mongodb+srv:// scheme".into())
        })?;

    let name = rest
        .split_once('/')
        .map(|(_, path)| path.split(['?', '/']).next().unwrap_or_default())
        .unwrap_or_default();

    if name.is_empty() {
        return Err(StoreError::InvalidDsn(
            "no database name in connection string path".into(),
        ));
    }
    Ok(name.to_string())
}

fn json_to_bson(value: Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Bson::Int64(i),
            None => n.as_f64().map(Bson::Double).unwrap_or(Bson::Null),
        },
        Value::String(s) => Bson::String(s),
        // Sanitization drops non-scalars before conversion
        other => Bson::String(other.to_string()),
    }
}

fn to_bson_document(document: Document) -> bson::Document {
    document
        .into_iter()
        .map(|(key, value)| (key, json_to_bson(value)))
        .collect()
}

fn id_to_string(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn from_bson_document(document: bson::Document) -> Document {
    document
        .into_iter()
        .map(|(key, value)| {
            if key == MONGO_ID_FIELD {
                (ID_FIELD.to_string(), Value::String(id_to_string(&value)))
            } else {
                (key, value.into_relaxed_extjson())
            }
        })
        .collect()
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => {
            write_error.code == DUPLICATE_KEY_CODE
        }
        _ => err.to_string().contains("E11000"),
    }
}

fn map_mongo_error(op: &'static str, err: mongodb::error::Error) -> StoreError {
    if is_duplicate_key(&err) {
        StoreError::UniqueViolation(err.to_string())
    } else {
        StoreError::Mongo { op, source: err }
    }
}

#[async_trait]
impl DbClient for MongoDbClient {
    fn backend(&self) -> DbBackend {
        DbBackend::Mongo
    }

    async fn connect(&self, dsn: &str) -> Result<(), StoreError> {
        let db_name = database_name_from_dsn(dsn)?;

        let mut options = ClientOptions::parse(dsn)
            .await
            .map_err(|e| StoreError::InvalidDsn(e.to_string()))?;
        options.max_pool_size = Some(self.max_pool_size);
        options.selection_criteria = Some(SelectionCriteria::ReadPreference(
            ReadPreference::PrimaryPreferred {
                options: Default::default(),
            },
        ));
        if !self.timeout.is_zero() {
            options.connect_timeout = Some(self.timeout);
            options.server_selection_timeout = Some(self.timeout);
        }
        options.server_api = self.server_api.clone();

        let client =
            Client::with_options(options).map_err(|e| map_mongo_error("connect", e))?;
        let db = client.database(&db_name);

        timed(DbBackend::Mongo, "connect", self.timeout, async {
            db.run_command(doc! { "ping": 1 })
                .await
                .map_err(|e| map_mongo_error("ping", e))?;
            Ok(())
        })
        .await?;

        info!("Connected to MongoDB database '{}'", db_name);

        let previous = self.connection.write().await.replace((client, db));
        if let Some((previous, _)) = previous {
            previous.shutdown().await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        if let Some((client, _)) = self.connection.write().await.take() {
            client.shutdown().await;
            info!("MongoDB connection closed");
        }
        Ok(())
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<String, StoreError> {
        let coll = self.collection(collection).await?;

        let document = self.sanitizer.sanitize(document);
        if document.is_empty() {
            return Err(StoreError::EmptyUpdate);
        }
        let document = to_bson_document(document);

        timed(DbBackend::Mongo, "insert_one", self.timeout, async {
            let result = coll
                .insert_one(document)
                .await
                .map_err(|e| map_mongo_error("insert_one", e))?;
            Ok(id_to_string(&result.inserted_id))
        })
        .await
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        fields: &[&str],
    ) -> Result<Option<Document>, StoreError> {
        let coll = self.collection(collection).await?;
        let filter = to_bson_document(self.sanitizer.sanitize_filter(filter, false)?);
        let options = FindOneOptions::builder()
            .projection(Some(self.projection(fields)))
            .build();
        debug!(collection, ?filter, "find_one");

        timed(DbBackend::Mongo, "find_one", self.timeout, async {
            let found = coll
                .find_one(filter)
                .with_options(options)
                .await
                .map_err(|e| map_mongo_error("find_one", e))?;
            Ok(found.map(from_bson_document))
        })
        .await
    }

    async fn find_many(
        &self,
        collection: &str,
        filter: Document,
        fields: &[&str],
    ) -> Result<Vec<Document>, StoreError> {
        let coll = self.collection(collection).await?;
        let filter = to_bson_document(self.sanitizer.sanitize_filter(filter, true)?);
        let options = FindOptions::builder()
            .projection(Some(self.projection(fields)))
            .build();

        timed(DbBackend::Mongo, "find_many", self.timeout, async {
            let cursor = coll
                .find(filter)
                .with_options(options)
                .await
                .map_err(|e| map_mongo_error("find_many", e))?;
            let documents: Vec<bson::Document> = cursor
                .try_collect()
                .await
                .map_err(|e| map_mongo_error("find_many", e))?;
            Ok(documents.into_iter().map(from_bson_document).collect())
        })
        .await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> Result<u64, StoreError> {
        let coll = self.collection(collection).await?;
        let filter = to_bson_document(self.sanitizer.sanitize_filter(filter, false)?);
        let update = self.sanitizer.sanitize(update);
        if update.is_empty() {
            return Err(StoreError::EmptyUpdate);
        }
        let update = doc! { "$set": to_bson_document(update) };

        timed(DbBackend::Mongo, "update_one", self.timeout, async {
            let result = coll
                .update_one(filter, update)
                .await
                .map_err(|e| map_mongo_error("update_one", e))?;
            Ok(result.modified_count)
        })
        .await
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> Result<u64, StoreError> {
        let coll = self.collection(collection).await?;
        let filter = to_bson_document(self.sanitizer.sanitize_filter(filter, false)?);

        timed(DbBackend::Mongo, "delete_one", self.timeout, async {
            let result = coll
                .delete_one(filter)
                .await
                .map_err(|e| map_mongo_error("delete_one", e))?;
            Ok(result.deleted_count)
        })
        .await
    }

    async fn delete_many(&self, collection: &str, filter: Document) -> Result<u64, StoreError> {
        let coll = self.collection(collection).await?;
        let filter = to_bson_document(self.sanitizer.sanitize_filter(filter, true)?);

        timed(DbBackend::Mongo, "delete_many", self.timeout, async {
            let result = coll
                .delete_many(filter)
                .await
                .map_err(|e| map_mongo_error("delete_many", e))?;
            Ok(result.deleted_count)
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let db = self.database().await?;
        timed(DbBackend::Mongo, "ping", self.timeout, async {
            db.run_command(doc! { "ping": 1 })
                .await
                .map_err(|e| map_mongo_error("ping", e))?;
            Ok(())
        })
        .await
    }

    async fn ensure_schema(
        &self,
        collection: &str,
        schema: &SchemaDescriptor,
    ) -> Result<(), StoreError> {
        let (name, keys, unique) = match schema {
            SchemaDescriptor::Index { name, keys, unique } => (name, keys, *unique),
            SchemaDescriptor::Ddl(_) => {
                return Err(StoreError::UnsupportedSchema {
                    backend: DbBackend::Mongo,
                    reason: "expected an index descriptor".into(),
                })
            }
        };
        let coll = self.collection(collection).await?;

        let mut key_doc = bson::Document::new();
        for key in keys {
            key_doc.insert(key.as_str(), 1);
        }
        let index = IndexModel::builder()
            .keys(key_doc)
            .options(IndexOptions::builder().name(name.clone()).unique(unique).build())
            .build();

        timed(DbBackend::Mongo, "ensure_schema", self.timeout, async {
            coll.create_index(index)
                .await
                .map_err(|e| map_mongo_error("ensure_schema", e))?;
            Ok(())
        })
        .await?;

        info!(collection, index = %name, "Index ensured");
        Ok(())
    }
}

impl std::fmt::Debug for MongoDbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoDbClient")
            .field("max_pool_size", &self.max_pool_size)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
