//! User repository
//!
//! Maps the generic store contract onto the single user entity. One adapter
//! per backend; each refuses a store client of the other kind.

pub mod mongo;
pub mod sql;

use std::sync::Arc;

use async_trait::async_trait;

use crate::db::{DbBackend, DbClient, StoreError};
use crate::models::User;
use crate::types::ErrorClass;

pub use mongo::MongoUserRepository;
pub use sql::SqlUserRepository;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("username '{0}' already exists")]
    AlreadyExists(String),

    #[error("repository needs a {expected} store client, got {actual}")]
    WrongBackend {
        expected: DbBackend,
        actual: DbBackend,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("stored user record is unreadable: {0}")]
    Decode(String),
}

impl RepositoryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AlreadyExists(_) => ErrorClass::AlreadyExists,
            Self::WrongBackend { .. } | Self::Decode(_) => ErrorClass::Internal,
            Self::Store(err) => err.class(),
        }
    }
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert a user and return the store-assigned id.
    async fn add_user(&self, user: &User) -> Result<String, RepositoryError>;

    /// `Ok(None)` when no user has this name.
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, RepositoryError>;

    /// Create the username uniqueness constraint if missing.
    async fn ensure_indices(&self) -> Result<(), RepositoryError>;

    /// Release the underlying store connection.
    async fn close(&self) -> Result<(), RepositoryError>;
}

/// Build the adapter for `backend` over `client`.
pub fn create_repository(
    backend: DbBackend,
    client: Arc<dyn DbClient>,
) -> Result<Arc<dyn UserRepository>, RepositoryError> {
    let repository: Arc<dyn UserRepository> = match backend {
        DbBackend::Mongo => Arc::new(MongoUserRepository::new(client)?),
        DbBackend::Sql => Arc::new(SqlUserRepository::new(client)?),
    };
    Ok(repository)
}

fn require_backend(client: &dyn DbClient, expected: DbBackend) -> Result<(), RepositoryError> {
    let actual = client.backend();
    if actual != expected {
        return Err(RepositoryError::WrongBackend { expected, actual });
    }
    Ok(())
}

/// Map a store insert failure, turning uniqueness violations into a
/// duplicate-username error.
fn map_insert_error(err: StoreError, username: &str) -> RepositoryError {
    if err.is_unique_violation() {
        RepositoryError::AlreadyExists(username.to_string())
    } else {
        RepositoryError::Store(err)
    }
}

fn map_lookup_error(err: StoreError) -> RepositoryError {
    match err {
        StoreError::Decode(msg) => RepositoryError::Decode(msg),
        other => RepositoryError::Store(other),
    }
}
