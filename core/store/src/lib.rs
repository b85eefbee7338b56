//! Persistence abstraction for DocVault sync.
//!
//! This module provides the trait-based interface the sync coordinator uses
//! to commit entity groups and read revision state, plus an in-memory store
//! for tests and simulation.
//!
//! # Design Principles
//! - Store isolation: no backend-specific logic in the sync crate
//! - Async operations: all store calls are async
//! - Per-call atomicity: each `save` commits one group, never more

pub mod memory;
pub mod persistence;

pub use memory::MemoryStore;
pub use persistence::{EntityGroup, Persistence, Resolution, RevisionRecord};
