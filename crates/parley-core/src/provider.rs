//! Provider abstraction.
//!
//! The orchestrator treats the model provider as an opaque bidirectional
//! message stream it starts, feeds and can interrupt. The concrete client
//! lives outside this crate; it is reached through `ProviderSession` and
//! constructed through `ProviderFactory`.
//!
//! Incoming events are modeled as a closed tagged union at this boundary:
//! unknown kinds from the wire must be rejected (or logged and dropped) by
//! the adapter, never passed through as loosely-typed payloads.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Token accounting reported by the provider for one turn.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TurnUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    /// Cumulative cost across the whole session, only meaningful on the
    /// terminal event.
    #[serde(default)]
    pub total_cost_usd: f64,
}

/// One event in a provider's per-turn stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    /// Connection established; carries the opaque resumable session token.
    Init { session_id: String },
    /// A new text block begins; the previous block (if any) is scratch.
    TextBlockStart,
    /// Incremental text for the current block.
    TextDelta { text: String },
    /// The current text block is complete. Carries the single-call token
    /// usage when the provider reports it at message boundaries.
    TextBlockEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TurnUsage>,
    },
    /// The agent invoked a tool.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// A tool invocation finished.
    ToolResult {
        id: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    /// Extended reasoning text.
    Thinking { text: String },
    /// The provider compacted the conversation context.
    CompactNotice { trigger: String, pre_tokens: u64 },
    /// Terminal event for the turn.
    FinalResult {
        usage: TurnUsage,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        cancelled: bool,
    },
    /// Mid-stream failure; terminates the turn.
    Error { message: String },
}

impl ProviderEvent {
    /// Whether this event ends the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderEvent::FinalResult { .. } | ProviderEvent::Error { .. }
        )
    }
}

/// Configuration fixed at connection start.
///
/// A change to any of these fields between the cached session's captured
/// config and a new request forces a session rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Whether the embedded-browser tool set is exposed to the agent.
    #[serde(default)]
    pub browser_tools: bool,
}

/// Runtime-tunable parameters pushed onto a live session.
///
/// These never trigger a rebuild.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DynamicConfig {
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_budget: Option<u32>,
}

/// Full per-request model configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub dynamic: DynamicConfig,
}

impl SessionConfig {
    /// Whether a cached session built with `captured` must be rebuilt to
    /// serve this config. Only process-level fields participate.
    pub fn requires_rebuild(&self, captured: &SessionConfig) -> bool {
        self.process != captured.process
    }
}

/// A message submitted to the provider for one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

/// Parameters for establishing a provider connection.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub space_id: String,
    pub conversation_id: String,
    /// Resumable token from a previous session, if any.
    pub resume_session_id: Option<String>,
    pub process: ProcessConfig,
}

/// A live, reusable connection to the model provider, scoped to one
/// conversation and outliving individual turns.
#[async_trait]
pub trait ProviderSession: Send + Sync {
    /// Submits a message, starting a turn.
    async fn send(&self, message: OutboundMessage) -> Result<()>;

    /// Awaits the next event of the current turn.
    ///
    /// Returns `None` when the underlying stream is closed.
    async fn next_event(&self) -> Result<Option<ProviderEvent>>;

    /// Requests the provider abort the current turn. Best-effort.
    async fn interrupt(&self) -> Result<()>;

    /// Closes the connection.
    async fn close(&self) -> Result<()>;

    /// Pushes a new model identifier onto the live session.
    async fn set_model(&self, model: &str) -> Result<()>;

    /// Pushes a new reasoning budget onto the live session.
    async fn set_reasoning_budget(&self, budget: Option<u32>) -> Result<()>;
}

/// Factory for provider sessions; the only way the registry creates
/// connections, so tests can substitute scripted providers.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn create(&self, spec: SessionSpec) -> Result<Box<dyn ProviderSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_terminality() {
        assert!(
            ProviderEvent::FinalResult {
                usage: TurnUsage::default(),
                is_error: false,
                cancelled: false,
            }
            .is_terminal()
        );
        assert!(
            ProviderEvent::Error {
                message: "boom".into()
            }
            .is_terminal()
        );
        assert!(!ProviderEvent::TextBlockStart.is_terminal());
        assert!(!ProviderEvent::TextBlockEnd { usage: None }.is_terminal());
        assert!(
            !ProviderEvent::TextDelta {
                text: "hi".into()
            }
            .is_terminal()
        );
    }

    #[test]
    fn test_rebuild_only_on_process_fields() {
        let captured = SessionConfig::default();

        let mut dynamic_change = SessionConfig::default();
        dynamic_change.dynamic.model = "newer-model".to_string();
        dynamic_change.dynamic.reasoning_budget = Some(8192);
        assert!(!dynamic_change.requires_rebuild(&captured));

        let mut process_change = SessionConfig::default();
        process_change.process.browser_tools = true;
        assert!(process_change.requires_rebuild(&captured));
    }

    #[test]
    fn test_event_tagging_round_trip() {
        let event = ProviderEvent::ToolUse {
            id: "t1".into(),
            name: "bash".into(),
            input: serde_json::json!({"command": "ls"}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool_use");
        let back: ProviderEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_unknown_event_kind_rejected() {
        let json = serde_json::json!({"type": "telemetry_blob", "payload": {}});
        assert!(serde_json::from_value::<ProviderEvent>(json).is_err());
    }
}
