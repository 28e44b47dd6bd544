//! User credential record
//!
//! The only persisted entity. Usernames are unique across the store; the
//! hashed password is read back only for verification during login.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{Document, Record};

/// Collection (table) holding user records
pub const USERS_COLLECTION: &str = "users";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Store-assigned identity, absent until inserted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub username: String,

    /// Argon2 PHC string
    pub hashed_password: String,
}

impl User {
    pub fn new(username: impl Into<String>, hashed_password: impl Into<String>) -> Self {
        Self {
            id: None,
            username: username.into(),
            hashed_password: hashed_password.into(),
        }
    }

    /// Generic document form for inserts. Never carries the identity.
    pub fn to_document(&self) -> Document {
        let mut document = Document::new();
        document.insert("username".into(), Value::String(self.username.clone()));
        document.insert(
            "hashed_password".into(),
            Value::String(self.hashed_password.clone()),
        );
        document
    }
}

impl Record for User {
    const FIELDS: &'static [&'static str] = &["id", "username", "hashed_password"];
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("hashed_password", &"<redacted>")
            .finish()
    }
}
