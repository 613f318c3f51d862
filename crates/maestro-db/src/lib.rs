//! Persistence gateway for the maestro orchestration core.
//!
//! Every durable read or write in the system goes through the typed
//! accessors in [`queries`]; no other component issues raw SQL. The store
//! itself (PostgreSQL) is treated as an external collaborator that provides
//! atomic row updates, which this crate leans on for the mission claim
//! protocol.

pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod queries;

pub use error::StorageError;

/// Result alias used throughout the gateway.
pub type DbResult<T> = Result<T, StorageError>;
