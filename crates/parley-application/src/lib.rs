//! Application layer for Parley.
//!
//! Coordinates the conversation store, the provider session registry and
//! the UI notifier. `SessionRegistry` manages provider connection
//! lifecycle; `ChatOrchestrator` runs turns end to end.

pub mod orchestrator;
pub mod registry;

pub use orchestrator::{ChatOrchestrator, SendRequest};
pub use registry::{SessionRegistry, TurnHandle};
