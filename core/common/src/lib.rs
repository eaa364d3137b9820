//! Common utilities and types shared across the Tether sync crates.
//!
//! This module provides the error type and the small identifier types that the
//! storage and sync layers agree on.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ConflictId, EntityType, OperationId};
