//! Shared types

pub mod error;

pub use error::{ErrorClass, PortcullisError, Result};
