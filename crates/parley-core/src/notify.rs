//! Notification sink toward the UI transport.
//!
//! The transport layer (IPC wiring, renderer) is out of scope; the
//! orchestrator only ever talks to it through this trait.

use crate::conversation::TokenUsage;
use async_trait::async_trait;

/// Receives user-visible progress for one conversation's turns.
///
/// Implementations must tolerate being called from concurrent tasks for
/// different conversations.
#[async_trait]
pub trait ChatNotifier: Send + Sync {
    /// Incremental or final message text. `is_complete` marks the last
    /// content notification of the turn.
    async fn message(&self, conversation_id: &str, text: &str, is_complete: bool);

    /// The renderer should reset its current-block state. Emitted from the
    /// explicit block-start event only.
    async fn block_start(&self, conversation_id: &str);

    /// The agent invoked a tool.
    async fn tool_call(&self, conversation_id: &str, id: &str, name: &str, input: &serde_json::Value);

    /// A tool invocation finished.
    async fn tool_result(&self, conversation_id: &str, id: &str, output: &str, is_error: bool);

    /// Extended reasoning text, for live display.
    async fn thinking(&self, conversation_id: &str, text: &str);

    /// The provider compacted the context window.
    async fn compact(&self, conversation_id: &str, trigger: &str, pre_tokens: u64);

    /// The turn failed. Always followed by `complete` so the UI never
    /// hangs waiting for a terminal notification.
    async fn error(&self, conversation_id: &str, message: &str);

    /// The turn ended.
    async fn complete(&self, conversation_id: &str, usage: Option<TokenUsage>);
}
