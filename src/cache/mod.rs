mod query;
mod snapshot;
mod store;

pub use query::NoteQueries;
pub use snapshot::{
    clear_boot_snapshot, load_boot_snapshot, save_boot_snapshot, BootSnapshot, BrowserStorage,
    MemoryStorage, SnapshotStorage,
};
pub use store::{CacheEntry, CacheKey, CacheStore, CacheValue, FetchTicket};
