//! Data layer module
//!
//! Handles actor persistence:
//! - `ActorStore` collaborator interface
//! - SQLite store (durable)
//! - In-memory store (tests, tooling)

mod database;
mod models;
mod store;

pub use database::SqliteActorStore;
pub use models::*;
pub use store::{ActorStore, MemoryActorStore};
