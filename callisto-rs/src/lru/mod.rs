//! Provides a size constrained LRU Cache.
//!
//! An LRU cache drops the least recently used entry if it is about to grow beyond the given
//! memory limit.
//!
//! Provides a generic cache which can store all kinds of values for which the
//! [ByteSize](ByteSize) trait is implemented. The cache tracks the memory allocated by its keys
//! and values and reports evictions via an optional callback.
mod lru_cache;

pub use lru_cache::ByteSize;
pub use lru_cache::EvictionHandler;
pub use lru_cache::LRUCache;
