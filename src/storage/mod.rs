//! Storage backends for trove-memory

mod facts;
mod sqlite;
pub mod vector;

pub use facts::SqliteFactStore;
pub use sqlite::SqliteStorage;
pub use vector::VectorStorage;
