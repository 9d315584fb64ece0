//! Infrastructure layer for Parley.
//!
//! File-backed persistence for conversation logs: atomic JSON writes,
//! lazy schema migration, a write-through read cache, and debounced
//! per-space index maintenance. The rest of the system reaches this
//! crate only through the `ConversationRepository` trait from core.

pub mod cache;
pub mod index;
pub mod migration;
pub mod paths;
pub mod storage;
pub mod store;

pub use paths::SpacePaths;
pub use store::JsonConversationStore;
