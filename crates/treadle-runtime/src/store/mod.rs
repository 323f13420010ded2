//! Store implementations backing the engine's unit-of-work contract.

mod memory;

pub use memory::MemoryStore;
