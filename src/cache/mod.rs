//! Response caching.
//!
//! - [`key`]: SHA-256 request fingerprints.
//! - [`local`]: bounded in-process tier (moka) with per-entry TTL.
//! - [`durable`]: the [`DurableStore`] trait and its backends.
//! - [`tiered`]: the two tiers combined, with failure isolation for the
//!   durable side.
//! - [`flight`]: optional single-flight deduplication of concurrent misses.

pub mod durable;
pub mod flight;
pub mod key;
pub mod local;
pub mod tiered;

pub use durable::{DurableStore, KvRestConfig, KvRestStore, MemoryStore, PutOptions};
pub use flight::SingleFlight;
pub use key::{CacheKey, CacheKeyGenerator};
pub use local::{CacheConfig, CacheEntry, CachedResponse, LocalCache};
pub use tiered::TieredCache;
