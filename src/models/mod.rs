//! Persisted record types

pub mod user;

pub use user::{User, USERS_COLLECTION};
