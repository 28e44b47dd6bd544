//! Signup and login orchestration
//!
//! Backend-agnostic: talks only to a [`UserRepository`] and a [`TokenIssuer`].
//! Argon2 work runs on the blocking pool so it never stalls request tasks.

use std::sync::Arc;

use tracing::{info, warn};

use super::ServiceError;
use crate::auth::{hash_password, verify_password, Claims, IssuedToken, TokenIssuer};
use crate::models::User;
use crate::repository::UserRepository;

pub struct UserService {
    repository: Arc<dyn UserRepository>,
    issuer: Arc<TokenIssuer>,
}

impl UserService {
    pub fn new(repository: Arc<dyn UserRepository>, issuer: Arc<TokenIssuer>) -> Self {
        Self { repository, issuer }
    }

    /// Hash the password and store a new user. Returns the new user's id.
    pub async fn register_user(&self, username: &str, password: &str) -> Result<String, ServiceError> {
        let password = password.to_owned();
        let hashed = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| ServiceError::Hashing(e.to_string()))?
            .map_err(|e| ServiceError::Hashing(e.to_string()))?;

        let id = self
            .repository
            .add_user(&User::new(username, hashed))
            .await?;

        info!(user_id = %id, "User registered");
        Ok(id)
    }

    /// Check credentials against the stored hash.
    ///
    /// The two failure causes stay distinct here for logging; the HTTP layer
    /// collapses them into one response.
    pub async fn authenticate_user(&self, username: &str, password: &str) -> Result<User, ServiceError> {
        let user = match self.repository.get_user_by_username(username).await? {
            Some(user) => user,
            None => {
                warn!(username, "Login failed: user not found");
                return Err(ServiceError::UserNotFound(username.to_string()));
            }
        };

        let password = password.to_owned();
        let stored = user.hashed_password.clone();
        let verified = tokio::task::spawn_blocking(move || verify_password(&password, &stored))
            .await
            .map_err(|e| ServiceError::Hashing(e.to_string()))?;

        match verified {
            Ok(true) => Ok(user),
            Ok(false) => {
                warn!(username, "Login failed: invalid password");
                Err(ServiceError::InvalidPassword(username.to_string()))
            }
            Err(e) => {
                warn!(username, error = %e, "Login failed: stored hash unreadable");
                Err(ServiceError::InvalidPassword(username.to_string()))
            }
        }
    }

    /// Authenticate and issue a session token.
    pub async fn login(&self, username: &str, password: &str) -> Result<IssuedToken, ServiceError> {
        let user = self.authenticate_user(username, password).await?;
        let issued = self.issuer.issue(&user.username)?;

        info!(username = %user.username, jti = %issued.claims.jti, "Session token issued");
        Ok(issued)
    }

    /// Verify a presented session token.
    pub fn verify_session(&self, token: &str) -> Result<Claims, ServiceError> {
        Ok(self.issuer.verify(token)?)
    }

    /// Close the repository's store connection.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.repository.close().await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::keys::tests::generate;
    use crate::auth::TokenError;
    use crate::repository::RepositoryError;
    use crate::types::ErrorClass;
    use async_trait::async_trait;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Repository double keyed by username.
    #[derive(Default)]
    pub(crate) struct InMemoryRepository {
        users: DashMap<String, User>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl UserRepository for InMemoryRepository {
        async fn add_user(&self, user: &User) -> Result<String, RepositoryError> {
            use dashmap::mapref::entry::Entry;
            match self.users.entry(user.username.clone()) {
                Entry::Occupied(_) => Err(RepositoryError::AlreadyExists(user.username.clone())),
                Entry::Vacant(slot) => {
                    let id = uuid::Uuid::new_v4().to_string();
                    let mut stored = user.clone();
                    stored.id = Some(id.clone());
                    slot.insert(stored);
                    Ok(id)
                }
            }
        }

        async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, RepositoryError> {
            Ok(self.users.get(username).map(|u| u.clone()))
        }

        async fn ensure_indices(&self) -> Result<(), RepositoryError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), RepositoryError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn test_service() -> (Arc<InMemoryRepository>, UserService) {
        let repo = Arc::new(InMemoryRepository::default());
        let issuer = Arc::new(TokenIssuer::new(generate()));
        let service = UserService::new(repo.clone(), issuer);
        (repo, service)
    }

    #[tokio::test]
    async fn test_signup_then_duplicate() {
        let (repo, service) = test_service();

        let id = service.register_user("alice01", "Secret123!").await.unwrap();
        assert!(!id.is_empty());

        let stored = repo.users.get("alice01").unwrap().clone();
        assert_ne!(stored.hashed_password, "Secret123!");
        assert!(stored.hashed_password.starts_with("$argon2"));

        let again = service.register_user("alice01", "Secret123!").await;
        assert!(matches!(
            again,
            Err(ServiceError::Repository(RepositoryError::AlreadyExists(_)))
        ));
    }

    #[tokio::test]
    async fn test_login_success_issues_token() {
        let (_, service) = test_service();
        service.register_user("alice01", "Secret123!").await.unwrap();

        let issued = service.login("alice01", "Secret123!").await.unwrap();
        let claims = service.verify_session(&issued.token).unwrap();
        assert_eq!(claims.username, "alice01");
    }

    #[tokio::test]
    async fn test_login_failures_are_distinct_internally() {
        let (_, service) = test_service();
        service.register_user("alice01", "Secret123!").await.unwrap();

        let wrong = service.login("alice01", "WrongPass").await.unwrap_err();
        assert!(matches!(wrong, ServiceError::InvalidPassword(_)));
        assert!(wrong.is_credential_failure());
        assert_eq!(wrong.class(), ErrorClass::Unauthorized);

        let missing = service.login("bob02", "Secret123!").await.unwrap_err();
        assert!(matches!(missing, ServiceError::UserNotFound(_)));
        assert!(missing.is_credential_failure());
        assert_eq!(missing.class(), ErrorClass::NotFound);
    }

    #[tokio::test]
    async fn test_corrupt_stored_hash_fails_closed() {
        let (repo, service) = test_service();
        repo.add_user(&User::new("alice01", "not-a-phc-string")).await.unwrap();

        let result = service.authenticate_user("alice01", "Secret123!").await;
        assert!(matches!(result, Err(ServiceError::InvalidPassword(_))));
    }

    #[tokio::test]
    async fn test_verify_session_rejects_garbage() {
        let (_, service) = test_service();
        let result = service.verify_session("garbage");
        assert!(matches!(result, Err(ServiceError::Token(TokenError::Malformed))));
    }

    #[tokio::test]
    async fn test_shutdown_closes_repository() {
        let (repo, service) = test_service();
        service.shutdown().await.unwrap();
        assert!(repo.closed.load(Ordering::SeqCst));
    }
}
