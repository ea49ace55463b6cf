//! Cache coherency subsystem.
//!
//! # Data Flow
//! ```text
//! Read path:
//!     swr.rs get / swr_fetch
//!     → storage.rs (durable key/value store)
//!     → instant cached value + optional refresh future
//!
//! Refresh path:
//!     request.rs (dedup / throttle / debounce)
//!     → guarded backend call
//!     → swr.rs set (write back before the refresh resolves)
//! ```
//!
//! # Design Decisions
//! - A cache miss is always safe: storage failures never reach callers
//! - Expired and missing entries are indistinguishable
//! - Last writer wins per key; callers namespace keys by user and resource

pub mod request;
pub mod storage;
pub mod swr;

pub use request::{Debounced, RequestDeduplicator, RequestError, SharedRequest, Throttle};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError, UnavailableStore};
pub use swr::{cache_key, CacheEnvelope, CachedEntry, EntryInfo, Staleness, SwrCache, SwrOptions, SwrResult};
