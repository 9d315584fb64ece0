//! Conversation domain module.
//!
//! # Module Structure
//!
//! - `model`: Persisted entities (`Conversation`, `Message`, `Thought`,
//!   `ConversationMeta`, `ConversationIndex`) and schema versions
//! - `repository`: Repository trait and patch types for persistence

mod model;
mod repository;

pub use model::{
    CONVERSATION_SCHEMA_VERSION, Conversation, ConversationIndex, ConversationMeta,
    INDEX_SCHEMA_VERSION, Message, MessageRole, Thought, ThoughtKind, ThoughtLog, ThoughtsSummary,
    TokenUsage, ToolCallRecord, now_rfc3339,
};
pub use repository::{ConversationPatch, ConversationRepository, MessagePatch};
