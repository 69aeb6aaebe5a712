//! Local content caching: blob store plus background eviction.

mod housekeeping;
mod store;

pub use housekeeping::{purge_pass, Housekeeper, LiveUuids};
pub use store::CacheStore;
