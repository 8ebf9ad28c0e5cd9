//! Cache core: keys, objects, freshness, storage and request coalescing.

pub mod coalesce;
pub mod freshness;
pub mod key;
pub mod object;
pub mod store;

pub use coalesce::{Coalescer, FetchGuard, Join, RefreshGuard, Subscription};
pub use freshness::{Freshness, FreshnessInput, compute};
pub use key::{CacheKey, Variant, vary_names};
pub use object::{CacheObject, Cacheability, ObjectState, Validators};
pub use store::{Lookup, MemoryStorage, Staleness, Storage};
