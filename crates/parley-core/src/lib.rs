//! Core domain layer for Parley.
//!
//! Contains the conversation data model, the typed error taxonomy, the
//! provider abstraction (event union + session trait), the per-turn
//! stream aggregator, and the notifier seam toward the UI transport.
//! Nothing in this crate touches disk or a real provider connection.

pub mod aggregator;
pub mod conversation;
pub mod error;
pub mod notify;
pub mod provider;

// Re-export common error type
pub use error::{ParleyError, Result};
