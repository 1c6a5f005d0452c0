//! Relationship graph backends

mod memory;

pub use memory::InMemoryGraph;
