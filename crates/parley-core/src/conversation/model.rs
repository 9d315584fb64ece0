//! Conversation domain model.
//!
//! This module contains the core persisted entities: `Conversation`,
//! `Message`, `Thought` and their supporting types. These are the "pure"
//! domain models that business logic operates on, independent of any
//! specific storage location.
//!
//! On disk, a conversation record is version-tagged. Version 1 stored
//! thoughts inline on each message; version 2 externalizes them into a
//! sibling overflow file and leaves a `null` marker plus a summary on the
//! message.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current schema version for persisted conversation records.
pub const CONVERSATION_SCHEMA_VERSION: u32 = 2;

/// Maximum characters of message content kept in a listing preview.
const PREVIEW_LEN: usize = 80;

/// Maximum characters of a title derived from the first user message.
const DERIVED_TITLE_LEN: usize = 50;

/// Returns the current time as an RFC 3339 string with millisecond precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Represents the role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// Message from the user.
    User,
    /// Message from the AI agent.
    Assistant,
    /// System-generated message.
    System,
}

/// The kind of a reasoning/tool-activity event recorded during a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThoughtKind {
    Thinking,
    Text,
    ToolUse,
    ToolResult,
    System,
    Result,
    Error,
}

impl ThoughtKind {
    /// Stable string name used as a key in thought summaries.
    pub fn as_str(&self) -> &'static str {
        match self {
            ThoughtKind::Thinking => "thinking",
            ThoughtKind::Text => "text",
            ThoughtKind::ToolUse => "tool_use",
            ThoughtKind::ToolResult => "tool_result",
            ThoughtKind::System => "system",
            ThoughtKind::Result => "result",
            ThoughtKind::Error => "error",
        }
    }
}

/// A single reasoning or tool-activity event belonging to one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thought {
    /// The kind of event.
    #[serde(rename = "type")]
    pub kind: ThoughtKind,
    /// Timestamp when the event occurred (ISO 8601 format).
    pub timestamp: String,
    /// Free-form text payload (thinking text, tool output, error message).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool name for `tool_use` / `tool_result` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Tool input for `tool_use` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,
    /// Whether the event represents a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    /// Duration in milliseconds for events that carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl Thought {
    /// Creates a thought of the given kind stamped with the current time.
    pub fn new(kind: ThoughtKind) -> Self {
        Self {
            kind,
            timestamp: now_rfc3339(),
            content: None,
            tool_name: None,
            tool_input: None,
            is_error: None,
            duration_ms: None,
        }
    }

    /// Creates a thought with text content.
    pub fn with_content(kind: ThoughtKind, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::new(kind)
        }
    }
}

/// Compact summary of an externalized thought log.
///
/// Stored on the message in place of the full thought array once thoughts
/// move to overflow storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtsSummary {
    /// Number of thoughts per kind.
    pub counts: BTreeMap<String, usize>,
    /// Wall-clock span in milliseconds from the first to the last thought.
    pub total_duration_ms: i64,
}

impl ThoughtsSummary {
    /// Computes a summary over a thought sequence.
    ///
    /// The duration is the span between the first and last thought
    /// timestamps; unparsable timestamps contribute zero.
    pub fn from_thoughts(thoughts: &[Thought]) -> Self {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for thought in thoughts {
            *counts.entry(thought.kind.as_str().to_string()).or_insert(0) += 1;
        }

        let total_duration_ms = match (thoughts.first(), thoughts.last()) {
            (Some(first), Some(last)) => {
                let start = DateTime::parse_from_rfc3339(&first.timestamp);
                let end = DateTime::parse_from_rfc3339(&last.timestamp);
                match (start, end) {
                    (Ok(s), Ok(e)) => (e - s).num_milliseconds().max(0),
                    _ => 0,
                }
            }
            _ => 0,
        };

        Self {
            counts,
            total_duration_ms,
        }
    }
}

/// Token accounting for one persisted assistant message.
///
/// Combines the last single-call token counts (authoritative for current
/// context size) with the cumulative cost reported by the terminal event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
}

/// A tool invocation recorded on a message for re-rendering after reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

/// The thought log attached to a message.
///
/// Three states with distinct on-disk shapes: `Inline` serializes as an
/// array, `Externalized` as an explicit JSON `null` (the marker that the
/// thoughts live in overflow storage), and `Absent` omits the field.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ThoughtLog {
    /// No thoughts were recorded for this message.
    #[default]
    Absent,
    /// Thoughts stored inline on the message (schema v1).
    Inline(Vec<Thought>),
    /// Thoughts moved to overflow storage; only the marker remains.
    Externalized,
}

impl ThoughtLog {
    pub fn is_absent(&self) -> bool {
        matches!(self, ThoughtLog::Absent)
    }

    pub fn is_externalized(&self) -> bool {
        matches!(self, ThoughtLog::Externalized)
    }

    /// Returns the inline thoughts, if any.
    pub fn as_inline(&self) -> Option<&[Thought]> {
        match self {
            ThoughtLog::Inline(thoughts) => Some(thoughts),
            _ => None,
        }
    }
}

impl Serialize for ThoughtLog {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            // Absent is normally skipped at the field level; serialize as
            // null if it is ever forced out.
            ThoughtLog::Absent | ThoughtLog::Externalized => serializer.serialize_none(),
            ThoughtLog::Inline(thoughts) => thoughts.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ThoughtLog {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value: Option<Vec<Thought>> = Option::deserialize(deserializer)?;
        Ok(match value {
            None => ThoughtLog::Externalized,
            Some(thoughts) => ThoughtLog::Inline(thoughts),
        })
    }
}

/// A single message in a conversation.
///
/// Only the most recently appended assistant message is ever mutated in
/// place (streaming append); all earlier messages are immutable once
/// appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier (UUID format).
    pub id: String,
    /// The role of the message sender.
    pub role: MessageRole,
    /// The content of the message.
    pub content: String,
    /// Timestamp when the message was created (ISO 8601 format).
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    /// Inline thoughts, the externalized-marker, or nothing.
    #[serde(default, skip_serializing_if = "ThoughtLog::is_absent")]
    pub thoughts: ThoughtLog,
    /// Summary of externalized thoughts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts_summary: Option<ThoughtsSummary>,
}

impl Message {
    /// Creates a new message with a generated id and current timestamp.
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: now_rfc3339(),
            images: None,
            tool_calls: None,
            token_usage: None,
            thoughts: ThoughtLog::Absent,
            thoughts_summary: None,
        }
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Creates an assistant message (typically an empty streaming placeholder).
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// A titled, ordered sequence of messages plus resumable session metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Schema version of the persisted record.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Owning space identifier.
    pub space_id: String,
    /// Unique conversation identifier (UUID format).
    pub id: String,
    /// Human-readable title; empty until set or derived.
    #[serde(default)]
    pub title: String,
    /// Timestamp when the conversation was created (ISO 8601 format).
    pub created_at: String,
    /// Timestamp when the conversation was last updated (ISO 8601 format).
    pub updated_at: String,
    /// Opaque provider token for context resumption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub starred: bool,
    #[serde(default)]
    pub messages: Vec<Message>,
}

fn default_version() -> u32 {
    1
}

impl Conversation {
    /// Creates an empty conversation with a generated id.
    pub fn new(space_id: impl Into<String>, title: Option<String>) -> Self {
        let now = now_rfc3339();
        Self {
            version: CONVERSATION_SCHEMA_VERSION,
            space_id: space_id.into(),
            id: uuid::Uuid::new_v4().to_string(),
            title: title.unwrap_or_default(),
            created_at: now.clone(),
            updated_at: now,
            session_id: None,
            starred: false,
            messages: Vec::new(),
        }
    }

    /// Advances `updated_at`, keeping it monotonically non-decreasing even
    /// if the clock steps backwards.
    pub fn touch(&mut self) {
        let now = now_rfc3339();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Derives a title from the first user message when none is set.
    ///
    /// Uses the first line of the message, truncated on a char boundary.
    pub fn derive_title_if_empty(&mut self) {
        if !self.title.is_empty() {
            return;
        }
        let Some(first_user) = self
            .messages
            .iter()
            .find(|m| m.role == MessageRole::User && !m.content.trim().is_empty())
        else {
            return;
        };
        let first_line = first_user.content.lines().next().unwrap_or("").trim();
        self.title = truncate_chars(first_line, DERIVED_TITLE_LEN);
    }

    /// Projects this conversation to its listing representation.
    pub fn to_meta(&self) -> ConversationMeta {
        let preview = self
            .messages
            .last()
            .map(|m| truncate_chars(&m.content, PREVIEW_LEN))
            .unwrap_or_default();

        ConversationMeta {
            space_id: self.space_id.clone(),
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
            message_count: self.messages.len(),
            preview,
            starred: self.starred,
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// Listing projection of a conversation.
///
/// This is the only representation returned by listing operations and is
/// always derivable from a full `Conversation` via `to_meta()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub space_id: String,
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: usize,
    #[serde(default)]
    pub preview: String,
    #[serde(default)]
    pub starred: bool,
}

/// Current schema version for the persisted per-space index.
pub const INDEX_SCHEMA_VERSION: u32 = 1;

/// Ordered set of conversation metadata for one space.
///
/// Persisted once per space, sorted by `updated_at` descending. A stored
/// index whose version does not match `INDEX_SCHEMA_VERSION` is discarded
/// and rebuilt from a full directory scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationIndex {
    pub version: u32,
    pub conversations: Vec<ConversationMeta>,
}

impl ConversationIndex {
    /// Creates an index at the current schema version from an unsorted list.
    pub fn from_metas(mut conversations: Vec<ConversationMeta>) -> Self {
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Self {
            version: INDEX_SCHEMA_VERSION,
            conversations,
        }
    }

    /// Inserts or replaces the entry for a conversation and restores order.
    pub fn upsert(&mut self, meta: ConversationMeta) {
        self.conversations.retain(|m| m.id != meta.id);
        self.conversations.push(meta);
        self.conversations
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }

    /// Removes the entry for a conversation; returns whether it existed.
    pub fn remove(&mut self, conversation_id: &str) -> bool {
        let before = self.conversations.len();
        self.conversations.retain(|m| m.id != conversation_id);
        self.conversations.len() != before
    }
}
