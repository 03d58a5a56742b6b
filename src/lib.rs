//! Client-side sync engine for Glassy Notes.
//!
//! Notes live in a local cache that every view reads from. Edits are applied to the
//! cache first and confirmed or rolled back once the server answers; changes made
//! elsewhere arrive through a push stream (or polling) and are pulled back in by
//! refetching. Shared notes that are open for editing are protected from having a
//! collaborator's copy overwrite unsaved local text.
//!
//! The crate targets `wasm32-unknown-unknown` (Leptos CSR); native builds are used
//! for unit tests.

pub mod api;
pub mod cache;
pub mod config;
pub mod events;
pub mod models;
pub mod positions;
pub mod state;
pub mod sync;
pub mod util;

#[cfg(test)]
mod testing;

pub use api::{ApiClient, NotesApi, SyncError};
pub use config::{EnvConfig, SyncConfig};
pub use models::{Note, NoteDraft, NoteKind, NotePatch, Partition};
pub use state::{provide_sync_engine, use_sync_engine, EngineDeps, SyncEngine};
pub use sync::{CollabSession, Mutation};
