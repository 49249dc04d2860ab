pub mod policy;
pub mod state;
pub mod store;

pub use policy::{CachePolicy, ServeSource, Served};
pub use state::CacheState;
pub use store::{CacheEntry, CacheStore, EntryIdGenerator};
