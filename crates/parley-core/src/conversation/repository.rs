//! Repository trait for conversation persistence.

use super::model::{Conversation, ConversationMeta, Message, Thought, TokenUsage, ToolCallRecord};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Partial update applied to a conversation record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starred: Option<bool>,
}

/// Partial update applied to the last message of a conversation.
///
/// A non-empty `thoughts` array is diverted to overflow storage on write
/// and replaced in the main record by the externalized marker plus a
/// computed summary.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub thoughts: Option<Vec<Thought>>,
    pub token_usage: Option<TokenUsage>,
    pub tool_calls: Option<Vec<ToolCallRecord>>,
}

/// Persistence interface for conversation logs.
///
/// Implementations exclusively own the on-disk representation: atomic
/// writes, caching, index maintenance and schema migration all live
/// behind this trait. Absence is a normal outcome for `get`-style
/// operations and is reported as `None` rather than an error.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Lists conversations in a space, most recently updated first.
    ///
    /// Never fails on a corrupt or missing index; a rebuild always yields
    /// a usable (possibly empty) result.
    async fn list(&self, space_id: &str) -> Result<Vec<ConversationMeta>>;

    /// Creates a new conversation with an optional title.
    async fn create(&self, space_id: &str, title: Option<String>) -> Result<Conversation>;

    /// Loads a conversation by id; `None` if it does not exist.
    async fn get(&self, space_id: &str, conversation_id: &str) -> Result<Option<Conversation>>;

    /// Applies a partial update; `None` if the conversation does not exist.
    async fn update(
        &self,
        space_id: &str,
        conversation_id: &str,
        patch: ConversationPatch,
    ) -> Result<Option<Conversation>>;

    /// Appends a message, recomputing derived fields.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the conversation does not exist.
    async fn append_message(
        &self,
        space_id: &str,
        conversation_id: &str,
        message: Message,
    ) -> Result<Message>;

    /// Mutates the last message, only if its role is `assistant`.
    ///
    /// Returns the updated message, or `None` when the conversation is
    /// missing, empty, or its last message is not an assistant message.
    async fn update_last_message(
        &self,
        space_id: &str,
        conversation_id: &str,
        patch: MessagePatch,
    ) -> Result<Option<Message>>;

    /// Deletes a conversation, its overflow record and temp artifacts.
    async fn delete(&self, space_id: &str, conversation_id: &str) -> Result<bool>;

    /// Loads externalized thoughts for one message; empty on absence.
    async fn get_thoughts(
        &self,
        space_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Vec<Thought>>;

    /// Sets the starred flag, bypassing any pending debounced index write.
    async fn toggle_star(
        &self,
        space_id: &str,
        conversation_id: &str,
        starred: bool,
    ) -> Result<Option<ConversationMeta>>;
}
