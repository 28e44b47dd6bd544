//! Whitelist sanitization shared by both backends
//!
//! Caller-supplied keys never reach a query unless they are on the backend's
//! field whitelist. Dropped keys are logged, not rejected.

use std::collections::HashSet;

use serde_json::Value;
use tracing::info;

use super::{DbBackend, Document, StoreError};

/// Field and collection whitelist for one backend.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    backend: DbBackend,
    identity_field: &'static str,
    collections: HashSet<String>,
    fields: HashSet<String>,
    key_allowed: fn(&str) -> bool,
}

impl Sanitizer {
    pub fn new(
        backend: DbBackend,
        identity_field: &'static str,
        collections: impl IntoIterator<Item = String>,
        fields: impl IntoIterator<Item = String>,
        key_allowed: fn(&str) -> bool,
    ) -> Self {
        Self {
            backend,
            identity_field,
            collections: collections.into_iter().filter(|c| !c.is_empty()).collect(),
            fields: fields.into_iter().filter(|f| key_allowed(f)).collect(),
            key_allowed,
        }
    }

    /// Reject empty or unknown collection (table) names.
    pub fn check_collection(&self, name: &str) -> Result<(), StoreError> {
        if name.is_empty() || !self.collections.contains(name) {
            return Err(StoreError::InvalidCollection(name.to_string()));
        }
        Ok(())
    }

    /// Keep only whitelisted keys holding scalar values.
    ///
    /// The identity field is always removed; stores generate identities.
    pub fn sanitize(&self, document: Document) -> Document {
        let mut clean = Document::new();

        for (key, value) in document {
            let reason = if key == self.identity_field || key == super::ID_FIELD {
                Some("identity field")
            } else if !(self.key_allowed)(&key) {
                Some("reserved characters")
            } else if !self.fields.contains(&key) {
                Some("not whitelisted")
            } else if matches!(value, Value::Object(_) | Value::Array(_)) {
                Some("non-scalar value")
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    info!(backend = %self.backend, field = %key, reason, "dropping field");
                }
                None => {
                    clean.insert(key, value);
                }
            }
        }

        clean
    }

    /// Sanitize a filter, refusing one that sanitization emptied.
    ///
    /// An empty input is only accepted when `allow_empty` is set, so that a
    /// filter made entirely of rejected keys never widens to "match all".
    pub fn sanitize_filter(
        &self,
        filter: Document,
        allow_empty: bool,
    ) -> Result<Document, StoreError> {
        let supplied = !filter.is_empty();
        let clean = self.sanitize(filter);

        if clean.is_empty() && (supplied || !allow_empty) {
            return Err(StoreError::EmptyFilter);
        }
        Ok(clean)
    }

    /// Keep only requested fields that are whitelisted or the identity.
    ///
    /// An empty request means every whitelisted field. A request whose fields
    /// are all rejected narrows to the identity alone, never to "everything".
    pub fn projection<'a>(&'a self, fields: &[&'a str]) -> Vec<&'a str> {
        if fields.is_empty() {
            let mut all: Vec<&str> = self.fields.iter().map(String::as_str).collect();
            all.sort_unstable();
            all.insert(0, super::ID_FIELD);
            return all;
        }

        let kept: Vec<&str> = fields
            .iter()
            .copied()
            .filter(|f| *f == super::ID_FIELD || self.fields.contains(*f))
            .collect();
        if kept.is_empty() {
            info!(backend = %self.backend, requested = ?fields, "no requested field is whitelisted, projecting identity only");
            return vec![super::ID_FIELD];
        }
        kept
    }
}

/// Document-store keys must not carry operator or path syntax.
pub fn mongo_key_allowed(key: &str) -> bool {
    !key.is_empty() && !key.contains('$') && !key.contains('.')
}

/// Relational names must be plain identifiers.
pub fn sql_identifier_allowed(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mongo_sanitizer() -> Sanitizer {
        Sanitizer::new(
            DbBackend::Mongo,
            "_id",
            vec!["users".to_string()],
            vec!["username".to_string(), "hashed_password".to_string()],
            mongo_key_allowed,
        )
    }

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => Document::new(),
        }
    }

    #[test]
    fn test_drops_unknown_and_identity_keys() {
        let sanitizer = mongo_sanitizer();
        let clean = sanitizer.sanitize(doc(json!({
            "_id": "forged",
            "id": "forged",
            "username": "alice01",
            "role": "admin"
        })));

        assert_eq!(clean.len(), 1);
        assert_eq!(clean["username"], json!("alice01"));
    }

    #[test]
    fn test_drops_operator_keys_and_nested_values() {
        let sanitizer = mongo_sanitizer();
        let clean = sanitizer.sanitize(doc(json!({
            "$where": "1 == 1",
            "username.first": "a",
            "username": { "$ne": null },
            "hashed_password": "h"
        })));

        assert_eq!(clean.len(), 1);
        assert!(clean.contains_key("hashed_password"));
    }

    #[test]
    fn test_filter_emptied_by_sanitization_is_rejected() {
        let sanitizer = mongo_sanitizer();

        let result = sanitizer.sanitize_filter(doc(json!({ "role": "admin" })), true);
        assert!(matches!(result, Err(StoreError::EmptyFilter)));

        let all = sanitizer.sanitize_filter(Document::new(), true).unwrap();
        assert!(all.is_empty());

        let required = sanitizer.sanitize_filter(Document::new(), false);
        assert!(matches!(required, Err(StoreError::EmptyFilter)));
    }

    #[test]
    fn test_check_collection() {
        let sanitizer = mongo_sanitizer();
        assert!(sanitizer.check_collection("users").is_ok());
        assert!(sanitizer.check_collection("").is_err());
        assert!(sanitizer.check_collection("accounts").is_err());
    }

    #[test]
    fn test_projection_keeps_identity_and_whitelisted() {
        let sanitizer = mongo_sanitizer();
        let fields = sanitizer.projection(&["id", "username", "secret"]);
        assert_eq!(fields, vec!["id", "username"]);
    }

    #[test]
    fn test_projection_of_rejected_fields_is_identity_only() {
        let sanitizer = mongo_sanitizer();
        assert_eq!(sanitizer.projection(&["email"]), vec!["id"]);
        assert_eq!(sanitizer.projection(&["$where", "role"]), vec!["id"]);
    }

    #[test]
    fn test_empty_projection_lists_whitelisted_fields() {
        let sanitizer = mongo_sanitizer();
        assert_eq!(
            sanitizer.projection(&[]),
            vec!["id", "hashed_password", "username"]
        );
    }

    #[test]
    fn test_sql_identifier_allowed() {
        assert!(sql_identifier_allowed("hashed_password"));
        assert!(sql_identifier_allowed("_private"));
        assert!(!sql_identifier_allowed("1column"));
        assert!(!sql_identifier_allowed("name; DROP TABLE users"));
        assert!(!sql_identifier_allowed("user-name"));
        assert!(!sql_identifier_allowed(""));
    }
}
