//! Mailpipe Storage - Database access for the delivery pipeline
//!
//! Repositories come in two flavours with identical semantics:
//! PostgreSQL (sqlx) and an in-process memory store.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
