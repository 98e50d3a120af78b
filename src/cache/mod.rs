//! Generational response cache and the strategies that serve from it.
//!
//! This module provides:
//! - A storage trait holding named generations of request → response maps,
//!   with SQLite and in-memory backends
//! - A cache layer implementing cache-first, network-first and
//!   cache-with-fallback serving
//! - Strategy selection by request category

mod layer;
mod storage;
mod strategy;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use strategy::Strategy;
pub use traits::{CacheResult, CacheSource, RequestKey};
