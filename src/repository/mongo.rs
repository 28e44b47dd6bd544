//! User repository over the document store

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{map_insert_error, map_lookup_error, require_backend, RepositoryError, UserRepository};
use crate::db::{filter_eq, find_record, DbBackend, DbClient, SchemaDescriptor};
use crate::models::{User, USERS_COLLECTION};

pub const USERNAME_INDEX: &str = "username_unique";

pub struct MongoUserRepository {
    client: Arc<dyn DbClient>,
}

impl MongoUserRepository {
    pub fn new(client: Arc<dyn DbClient>) -> Result<Self, RepositoryError> {
        require_backend(client.as_ref(), DbBackend::Mongo)?;
        Ok(Self { client })
    }

    pub fn schema() -> SchemaDescriptor {
        SchemaDescriptor::Index {
            name: USERNAME_INDEX.to_string(),
            keys: vec!["username".to_string()],
            unique: true,
        }
    }
}

#[async_trait]
impl UserRepository for MongoUserRepository {
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
mod tests {
    use super::*;
    use crate::db::{MongoDbClient, MongoSettings};
    use std::time::Duration;

    fn client() -> Arc<dyn DbClient> {
        Arc::new(
            MongoDbClient::new(MongoSettings {
                valid_collections: vec![USERS_COLLECTION.into()],
                valid_fields: vec!["username".into(), "hashed_password".into()],
                max_pool_size: 20,
                timeout: Duration::from_secs(3),
                server_api: None,
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_schema_is_unique_username_index() {
        match MongoUserRepository::schema() {
            SchemaDescriptor::Index { keys, unique, .. } => {
                assert_eq!(keys, vec!["username".to_string()]);
                assert!(unique);
            }
            other => panic!("unexpected descriptor {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lookup_without_connection_is_store_error() {
        let repo = MongoUserRepository::new(client()).unwrap();
        let result = repo.get_user_by_username("alice01").await;
        assert!(matches!(result, Err(RepositoryError::Store(_))));
    }

    #[tokio::test]
    async fn test_close_before_connect() {
        let repo = MongoUserRepository::new(client()).unwrap();
        assert!(repo.close().await.is_ok());
    }

    /// Requires a running server at MONGODB_TEST_URI.
    #[tokio::test]
    #[ignore]
    async fn test_live_duplicate_and_absent() {
        let uri = std::env::var("MONGODB_TEST_URI")
            .unwrap_or_else(|_| "mongodb://localhost:27017/portcullis_test".into());
        let client = client();
        client.connect(&uri).await.unwrap();
        client
            .delete_many(USERS_COLLECTION, crate::db::Document::new())
            .await
            .unwrap();

        let repo = MongoUserRepository::new(client).unwrap();
        repo.ensure_indices().await.unwrap();
        repo.ensure_indices().await.unwrap();

        let id = repo.add_user(&User::new("alice01", "h")).await.unwrap();
        assert!(!id.is_empty());
        assert!(matches!(
            repo.add_user(&User::new("alice01", "other")).await,
            Err(RepositoryError::AlreadyExists(_))
        ));

        let found = repo.get_user_by_username("alice01").await.unwrap().unwrap();
        assert_eq!(found.id.as_deref(), Some(id.as_str()));
        assert!(repo.get_user_by_username("nobody").await.unwrap().is_none());

        repo.close().await.unwrap();
    }
}
