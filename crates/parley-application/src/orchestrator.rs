//! Turn orchestration.
//!
//! `ChatOrchestrator` owns the full lifecycle of one turn: persist the
//! user's message and an assistant placeholder, submit to the provider
//! through the registry, reduce the event stream with `StreamAggregator`
//! while forwarding renderable signals to the notifier, then persist the
//! outcome. Every turn ends with a `complete` notification, success or
//! not, so the UI never hangs on a missing terminal signal.
//!
//! Turns on the same conversation are strictly ordered (one in flight at
//! a time); turns on different conversations are independent and may run
//! concurrently.

use crate::registry::SessionRegistry;
use parley_core::aggregator::{StreamAggregator, TurnOutcome, TurnSignal};
use parley_core::conversation::{
    ConversationPatch, ConversationRepository, Message, MessagePatch,
};
use parley_core::notify::ChatNotifier;
use parley_core::provider::{OutboundMessage, ProviderEvent, SessionConfig, TurnUsage};
use parley_core::{ParleyError, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One request to run a turn on a conversation.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub space_id: String,
    pub conversation_id: String,
    pub message: String,
    pub images: Vec<String>,
    /// Overrides the session token stored on the conversation record.
    pub resume_session_id: Option<String>,
    pub config: SessionConfig,
}

/// Coordinates the store, the session registry and the notifier for the
/// duration of a turn.
pub struct ChatOrchestrator {
    store: Arc<dyn ConversationRepository>,
    registry: Arc<SessionRegistry>,
    notifier: Arc<dyn ChatNotifier>,
    /// Conversations with a turn currently in flight.
    in_flight: Mutex<HashSet<String>>,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<dyn ConversationRepository>,
        registry: Arc<SessionRegistry>,
        notifier: Arc<dyn ChatNotifier>,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Runs one turn to completion.
    ///
    /// # Errors
    ///
    /// Returns an error when a turn is already in flight for the
    /// conversation, when persistence fails, or when the turn fails
    /// mid-stream. In the mid-stream case the failure has already been
    /// reported through the notifier.
    pub async fn send_message(&self, request: SendRequest) -> Result<()> {
        let conversation_id = request.conversation_id.clone();
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(conversation_id.clone()) {
                return Err(ParleyError::internal(format!(
                    "A turn is already in flight for conversation {conversation_id}"
                )));
            }
        }

        let result = self.run_turn(request).await;
        self.in_flight.lock().await.remove(&conversation_id);
        result
    }

    /// Stops generation for one conversation, or for all of them.
    pub async fn stop_generation(&self, conversation_id: Option<&str>) {
        self.registry.stop(conversation_id).await;
    }

    /// Delivers the user's answer to a pending permission request.
    pub async fn resolve_approval(&self, conversation_id: &str, approved: bool) -> bool {
        self.registry.resolve_approval(conversation_id, approved).await
    }

    async fn run_turn(&self, request: SendRequest) -> Result<()> {
        let SendRequest {
            space_id,
            conversation_id,
            message,
            images,
            resume_session_id,
            config,
        } = request;

        let outbound = OutboundMessage {
            text: message.clone(),
            images: images.clone(),
        };

        // Establish the session before touching the record: a connection
        // that cannot be made must not leave a user message with an empty
        // assistant placeholder persisted forever.
        if let Err(e) = self
            .registry
            .connect(&space_id, &conversation_id, &config, resume_session_id)
            .await
        {
            self.notifier.error(&conversation_id, &e.to_string()).await;
            self.notifier.complete(&conversation_id, None).await;
            return Err(e);
        }

        // The user message is immutable once appended; the assistant
        // placeholder is the only message this turn will mutate.
        let mut user_message = Message::user(message);
        if !images.is_empty() {
            user_message.images = Some(images);
        }
        self.store
            .append_message(&space_id, &conversation_id, user_message)
            .await?;
        self.store
            .append_message(&space_id, &conversation_id, Message::assistant(""))
            .await?;

        // The resume id was consumed by connect; send reuses the session
        // it established.
        let handle = match self
            .registry
            .send(&space_id, &conversation_id, outbound, &config, None)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.notifier.error(&conversation_id, &e.to_string()).await;
                self.notifier.complete(&conversation_id, None).await;
                return Err(e);
            }
        };

        let mut aggregator = StreamAggregator::new();
        let mut failure: Option<String> = None;
        let outcome: Option<TurnOutcome> = 'turn: loop {
            let event = tokio::select! {
                biased;
                _ = handle.cancel.cancelled() => {
                    // stop() interrupts the provider and drains whatever
                    // is left of the aborted turn; finalize from what has
                    // arrived so far.
                    debug!(conversation_id, "Turn cancelled, finalizing partial outcome");
                    let signals = aggregator.push(ProviderEvent::FinalResult {
                        usage: TurnUsage::default(),
                        is_error: false,
                        cancelled: true,
                    });
                    break 'turn signals.into_iter().find_map(|signal| match signal {
                        TurnSignal::Finished(outcome) => Some(outcome),
                        _ => None,
                    });
                }
                event = handle.session.next_event() => event,
            };

            let event = match event {
                Ok(Some(event)) => event,
                Ok(None) => {
                    failure = Some("provider stream closed mid-turn".to_string());
                    break 'turn None;
                }
                Err(e) => {
                    failure = Some(e.to_string());
                    break 'turn None;
                }
            };

            for signal in aggregator.push(event) {
                match signal {
                    TurnSignal::BlockStart => {
                        self.notifier.block_start(&conversation_id).await;
                    }
                    TurnSignal::Delta(text) => {
                        self.notifier.message(&conversation_id, &text, false).await;
                    }
                    TurnSignal::Thinking(text) => {
                        self.notifier.thinking(&conversation_id, &text).await;
                    }
                    TurnSignal::ToolCall { id, name, input } => {
                        self.notifier
                            .tool_call(&conversation_id, &id, &name, &input)
                            .await;
                    }
                    TurnSignal::ToolResult {
                        id,
                        output,
                        is_error,
                    } => {
                        self.notifier
                            .tool_result(&conversation_id, &id, &output, is_error)
                            .await;
                    }
                    TurnSignal::Compact {
                        trigger,
                        pre_tokens,
                    } => {
                        self.notifier
                            .compact(&conversation_id, &trigger, pre_tokens)
                            .await;
                    }
                    TurnSignal::Finished(outcome) => break 'turn Some(outcome),
                    TurnSignal::Failed(message) => {
                        failure = Some(message);
                        break 'turn None;
                    }
                }
            }
        };

        match outcome {
            Some(outcome) => self.finish_turn(&space_id, &conversation_id, outcome).await,
            None => {
                let message = failure.unwrap_or_else(|| "turn failed".to_string());
                // A session that failed mid-turn cannot be trusted for
                // the next one.
                self.registry.evict(&conversation_id).await;
                self.notifier.error(&conversation_id, &message).await;
                self.notifier.complete(&conversation_id, None).await;
                Err(ParleyError::provider(message))
            }
        }
    }

    /// Persists a completed turn and emits the terminal notifications.
    async fn finish_turn(
        &self,
        space_id: &str,
        conversation_id: &str,
        outcome: TurnOutcome,
    ) -> Result<()> {
        let patch = MessagePatch {
            content: Some(outcome.reply.clone()),
            thoughts: (!outcome.thoughts.is_empty()).then_some(outcome.thoughts),
            token_usage: outcome.usage.clone(),
            tool_calls: (!outcome.tool_calls.is_empty()).then_some(outcome.tool_calls),
        };
        if self
            .store
            .update_last_message(space_id, conversation_id, patch)
            .await?
            .is_none()
        {
            warn!(conversation_id, "No trailing assistant message to finalize");
        }

        if let Some(session_id) = outcome.session_id {
            self.store
                .update(
                    space_id,
                    conversation_id,
                    ConversationPatch {
                        session_id: Some(session_id),
                        ..Default::default()
                    },
                )
                .await?;
        }

        self.notifier
            .message(conversation_id, &outcome.reply, true)
            .await;
        self.notifier
            .complete(conversation_id, outcome.usage)
            .await;
        Ok(())
    }
}
