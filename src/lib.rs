//! Portcullis - credential gateway
//!
//! Signup and login over HTTP, with users kept in either a document store
//! (MongoDB) or a relational store (PostgreSQL, SQLite) behind one generic
//! store contract, and ES256-signed session tokens.
//!
//! ## Layers
//!
//! - **db**: the [`db::DbClient`] contract and its two backends
//! - **repository**: user persistence per backend
//! - **auth**: Argon2 password hashing, key loading, token issue/verify
//! - **services**: signup and login orchestration
//! - **server** / **routes**: the HTTP surface

pub mod auth;
pub mod config;
pub mod db;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod repository;
pub mod routes;
pub mod server;
pub mod services;
pub mod types;

pub use config::{Args, ServiceConfig};
pub use server::{run, AppState};
pub use types::{PortcullisError, Result};
