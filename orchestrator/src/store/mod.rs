//! Story Store (C1): durable persistence of stories, steps, and chat
//! history, with atomic status updates and a compare-and-swap on
//! `Story.status` so the scheduler can safely re-enter after a crash.
//!
//! Backend: RocksDB column families, bincode-encoded values — the same
//! `RwLock<DB>` + column-family layout the ensemble state store uses,
//! generalized from session/task/result/vote entities to story/step/chat.

mod schema;
mod store;

pub use store::{SharedStoryStore, StoryStore};
