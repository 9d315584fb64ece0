//! Per-turn stream reduction.
//!
//! `StreamAggregator` consumes the ordered event sequence of one provider
//! turn and reduces it into renderable signals plus a final outcome.
//!
//! Reply selection: only the *last* closed text block of a turn becomes
//! the persisted reply. Earlier blocks are turn-scoped scratch or visible
//! reasoning. This is intentional policy, not a bug to "fix" by
//! concatenating blocks. If a turn ends with no closed block at all (a
//! protocol anomaly), the leftover open buffer is promoted so the caller
//! is never left without a reply.

use crate::conversation::{Thought, ThoughtKind, TokenUsage, ToolCallRecord};
use crate::provider::{ProviderEvent, TurnUsage};
use tracing::warn;

/// A renderable increment or terminal notification produced from the
/// event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnSignal {
    /// The consumer should reset its current-block rendering state.
    ///
    /// Derived from the explicit block-start event only, never inferred
    /// from content: inference is unreliable when deltas arrive faster
    /// than block boundaries.
    BlockStart,
    /// Incremental text; no re-transmission of prior content.
    Delta(String),
    /// Live reasoning text.
    Thinking(String),
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        id: String,
        output: String,
        is_error: bool,
    },
    Compact {
        trigger: String,
        pre_tokens: u64,
    },
    /// The turn completed; carries everything to persist.
    Finished(TurnOutcome),
    /// The turn failed mid-stream. The owning session should be evicted.
    Failed(String),
}

/// Everything a completed turn leaves behind for persistence.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TurnOutcome {
    /// The persisted reply text (last closed block, or fallback buffer).
    pub reply: String,
    /// Resumable session token observed on the init event.
    pub session_id: Option<String>,
    /// Full accumulated thought log for the turn.
    pub thoughts: Vec<Thought>,
    /// Tool invocations with their results, for re-rendering after reload.
    pub tool_calls: Vec<ToolCallRecord>,
    /// Last single-call token counts combined with cumulative cost.
    pub usage: Option<TokenUsage>,
    /// Whether the turn ended by cancellation rather than completion.
    pub cancelled: bool,
}

/// Reduces one turn's provider events into `TurnSignal`s.
///
/// Maintains exactly one "current text block" buffer at a time. Thought
/// events are accumulated in full as the authoritative record for later
/// persistence and for session recovery after a UI reload.
#[derive(Debug, Default)]
pub struct StreamAggregator {
    buffer: String,
    last_block: Option<String>,
    thoughts: Vec<Thought>,
    tool_calls: Vec<ToolCallRecord>,
    session_id: Option<String>,
    last_call_usage: Option<TurnUsage>,
    finished: bool,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a terminal event has been observed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feeds one event, returning the signals it produced.
    pub fn push(&mut self, event: ProviderEvent) -> Vec<TurnSignal> {
        if self.finished {
            warn!("event received after terminal event; dropping: {:?}", event);
            return Vec::new();
        }

        match event {
            ProviderEvent::Init { session_id } => {
                self.thoughts.push(Thought::with_content(
                    ThoughtKind::System,
                    format!("session initialized: {}", session_id),
                ));
                self.session_id = Some(session_id);
                Vec::new()
            }
            ProviderEvent::TextBlockStart => {
                self.buffer.clear();
                vec![TurnSignal::BlockStart]
            }
            ProviderEvent::TextDelta { text } => {
                self.buffer.push_str(&text);
                vec![TurnSignal::Delta(text)]
            }
            ProviderEvent::TextBlockEnd { usage } => {
                let block = std::mem::take(&mut self.buffer);
                self.thoughts
                    .push(Thought::with_content(ThoughtKind::Text, block.clone()));
                self.last_block = Some(block);
                if let Some(usage) = usage {
                    self.last_call_usage = Some(usage);
                }
                Vec::new()
            }
            ProviderEvent::ToolUse { id, name, input } => {
                let mut thought = Thought::new(ThoughtKind::ToolUse);
                thought.tool_name = Some(name.clone());
                thought.tool_input = Some(input.clone());
                self.thoughts.push(thought);
                self.tool_calls.push(ToolCallRecord {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                    output: None,
                    is_error: false,
                });
                vec![TurnSignal::ToolCall { id, name, input }]
            }
            ProviderEvent::ToolResult {
                id,
                output,
                is_error,
            } => {
                let mut thought = Thought::with_content(ThoughtKind::ToolResult, output.clone());
                thought.is_error = Some(is_error);
                self.thoughts.push(thought);
                if let Some(record) = self.tool_calls.iter_mut().rev().find(|r| r.id == id) {
                    record.output = Some(output.clone());
                    record.is_error = is_error;
                }
                vec![TurnSignal::ToolResult {
                    id,
                    output,
                    is_error,
                }]
            }
            ProviderEvent::Thinking { text } => {
                self.thoughts
                    .push(Thought::with_content(ThoughtKind::Thinking, text.clone()));
                vec![TurnSignal::Thinking(text)]
            }
            ProviderEvent::CompactNotice {
                trigger,
                pre_tokens,
            } => {
                self.thoughts.push(Thought::with_content(
                    ThoughtKind::System,
                    format!("context compacted ({trigger}, {pre_tokens} tokens before)"),
                ));
                vec![TurnSignal::Compact {
                    trigger,
                    pre_tokens,
                }]
            }
            ProviderEvent::FinalResult {
                usage,
                is_error,
                cancelled,
            } => {
                self.finished = true;
                let mut result_thought = Thought::new(ThoughtKind::Result);
                result_thought.is_error = Some(is_error);
                self.thoughts.push(result_thought);

                if is_error && !cancelled {
                    return vec![TurnSignal::Failed(
                        "provider reported an error result".to_string(),
                    )];
                }

                vec![TurnSignal::Finished(self.make_outcome(usage, cancelled))]
            }
            ProviderEvent::Error { message } => {
                self.finished = true;
                self.thoughts
                    .push(Thought::with_content(ThoughtKind::Error, message.clone()));
                vec![TurnSignal::Failed(message)]
            }
        }
    }

    fn make_outcome(&mut self, terminal_usage: TurnUsage, cancelled: bool) -> TurnOutcome {
        // Last closed block wins; fall back to whatever partial buffer
        // exists when the turn closed without a block end.
        let reply = match self.last_block.take() {
            Some(block) => block,
            None => {
                if !self.buffer.is_empty() {
                    warn!("turn ended with no closed text block; using partial buffer");
                }
                std::mem::take(&mut self.buffer)
            }
        };

        let counts = self.last_call_usage.clone().unwrap_or_else(|| TurnUsage {
            total_cost_usd: 0.0,
            ..terminal_usage.clone()
        });

        TurnOutcome {
            reply,
            session_id: self.session_id.clone(),
            thoughts: std::mem::take(&mut self.thoughts),
            tool_calls: std::mem::take(&mut self.tool_calls),
            usage: Some(TokenUsage {
                input_tokens: counts.input_tokens,
                output_tokens: counts.output_tokens,
                cache_read_tokens: counts.cache_read_tokens,
                cache_creation_tokens: counts.cache_creation_tokens,
                total_cost_usd: terminal_usage.total_cost_usd,
            }),
            cancelled,
        }
    }
}
