//! Versioned resource cache for offline support.
//!
//! Responses are stored per generation (a version-stamped cache name) in
//! SQLite. A generation is never expired entry by entry; it is replaced as a
//! whole when the version constant changes and the worker activates.

mod layer;
mod storage;
mod traits;

pub use layer::{is_cacheable, ResourceCache, WarmReport};
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{Generation, ResponseSource};

#[cfg(test)]
pub use storage::CachedEntry;
#[cfg(test)]
pub use traits::RequestIdentity;
