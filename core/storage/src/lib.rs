//! Storage abstractions for Tether.
//!
//! This module provides the two storage seams the sync engine writes through:
//! - [`StateStore`]: durable blobs holding the engine's persisted snapshot
//! - [`LocalStore`]: the application's local entity representation, used to
//!   reconcile accepted and resolved payloads
//!
//! # Design Principles
//! - Engine isolation: no entity schema knowledge in this crate
//! - Async operations: all I/O operations are async
//! - Crash safety: filesystem writes are atomic renames

pub mod local;
pub mod memory;
pub mod provider;

pub use local::FileStore;
pub use memory::MemoryStore;
pub use provider::{LocalStore, StateStore};
