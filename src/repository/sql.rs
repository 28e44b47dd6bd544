//! User repository over the relational store (PostgreSQL, SQLite)

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{map_insert_error, map_lookup_error, require_backend, RepositoryError, UserRepository};
use crate::db::{filter_eq, find_record, DbBackend, DbClient, SchemaDescriptor};
use crate::models::{User, USERS_COLLECTION};

const CREATE_USERS_TABLE: &str = "CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL,
    hashed_password TEXT NOT NULL
)";

const CREATE_USERNAME_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_username ON users (username)";

pub struct SqlUserRepository {
    client: Arc<dyn DbClient>,
}

impl SqlUserRepository {
    pub fn new(client: Arc<dyn DbClient>) -> Result<Self, RepositoryError> {
        require_backend(client.as_ref(), DbBackend::Sql)?;
        Ok(Self { client })
    }

    pub fn schema() -> SchemaDescriptor {
        SchemaDescriptor::Ddl(vec![
            CREATE_USERS_TABLE.to_string(),
            CREATE_USERNAME_INDEX.to_string(),
        ])
    }
}

#[async_trait]
impl UserRepository for SqlUserRepository {
    async fn add_user(&self, user: &User) -> Result<String, RepositoryError> {
        let id = self
            .client
            .insert_one(USERS_COLLECTION, user.to_document())
            .await
            .map_err(|e| map_insert_error(e, &user.username))?;

        info!(user_id = %id, "User stored");
        Ok(id)
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, RepositoryError> {
        find_record::<User>(
            self.client.as_ref(),
            USERS_COLLECTION,
            filter_eq("username", username),
        )
        .await
        .map_err(map_lookup_error)
    }

    async fn ensure_indices(&self) -> Result<(), RepositoryError> {
        self.client
            .ensure_schema(USERS_COLLECTION, &Self::schema())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), RepositoryError> {
        self.client.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::{SqlDbClient, SqlSettings};
    use std::time::Duration;

    /// In-memory SQLite repository with the schema applied.
    pub(crate) async fn sqlite_repository() -> (Arc<dyn DbClient>, SqlUserRepository) {
        let client: Arc<dyn DbClient> = Arc::new(SqlDbClient::new(SqlSettings {
            valid_tables: vec![USERS_COLLECTION.into()],
            valid_fields: vec!["username".into(), "hashed_password".into()],
            max_connections: 1,
            min_connections: 1,
            max_lifetime: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(3600),
            timeout: Duration::from_secs(5),
        }));
        client.connect("sqlite::memory:").await.expect("Failed to connect");

        let repo = SqlUserRepository::new(Arc::clone(&client)).unwrap();
        repo.ensure_indices().await.expect("Failed to create schema");
        (client, repo)
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let (_, repo) = sqlite_repository().await;

        let id = repo
            .add_user(&User::new("alice01", "$argon2id$hash"))
            .await
            .unwrap();
        assert!(!id.is_empty());

        let user = repo.get_user_by_username("alice01").await.unwrap().unwrap();
        assert_eq!(user.id.as_deref(), Some(id.as_str()));
        assert_eq!(user.username, "alice01");
        assert_eq!(user.hashed_password, "$argon2id$hash");
    }

    #[tokio::test]
    async fn test_duplicate_username() {
        let (_, repo) = sqlite_repository().await;

        repo.add_user(&User::new("alice01", "first")).await.unwrap();
        let result = repo.add_user(&User::new("alice01", "second")).await;
        assert!(matches!(result, Err(RepositoryError::AlreadyExists(name)) if name == "alice01"));
    }

    #[tokio::test]
    async fn test_absent_user_is_none() {
        let (_, repo) = sqlite_repository().await;
        assert!(repo.get_user_by_username("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_supplied_id_is_ignored() {
        let (_, repo) = sqlite_repository().await;
        let mut user = User::new("alice01", "h");
        user.id = Some("chosen-by-caller".into());

        let id = repo.add_user(&user).await.unwrap();
        assert_ne!(id, "chosen-by-caller");
    }

    #[test]
    fn test_schema_declares_username_uniqueness_once() {
        let SchemaDescriptor::Ddl(statements) = SqlUserRepository::schema() else {
            panic!("relational schema must be DDL");
        };
        let unique = statements
            .iter()
            .map(|s| s.matches("UNIQUE").count())
            .sum::<usize>();
        assert_eq!(unique, 1);
    }

    #[tokio::test]
    async fn test_ensure_indices_is_idempotent() {
        let (_, repo) = sqlite_repository().await;
        assert!(repo.ensure_indices().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_disconnects() {
        let (client, repo) = sqlite_repository().await;
        repo.close().await.unwrap();
        assert!(client.ping().await.is_err());
    }
}
