//! JSON-file conversation repository.
//!
//! One JSON record per conversation, a sibling overflow file for
//! externalized thoughts, and a per-space listing index. All writes go
//! through `AtomicJsonFile`, reads go through a small write-through LRU
//! cache, and index maintenance is delegated to `IndexWriter`.

use crate::cache::{CacheKey, LruCache};
use crate::index::IndexWriter;
use crate::migration::{self, ThoughtOverflow};
use crate::paths::SpacePaths;
use crate::storage::AtomicJsonFile;
use async_trait::async_trait;
use parley_core::conversation::{
    Conversation, ConversationMeta, ConversationPatch, ConversationRepository, Message,
    MessagePatch, MessageRole, Thought, ThoughtLog, ThoughtsSummary,
};
use parley_core::{ParleyError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// File-backed implementation of `ConversationRepository`.
pub struct JsonConversationStore {
    paths: Arc<SpacePaths>,
    cache: Mutex<LruCache>,
    index: IndexWriter,
}

impl JsonConversationStore {
    /// Creates a store rooted at an explicit base directory.
    pub fn new(base_dir: PathBuf) -> Self {
        let paths = Arc::new(SpacePaths::new(base_dir));
        Self {
            cache: Mutex::new(LruCache::new(LruCache::DEFAULT_CAPACITY)),
            index: IndexWriter::new(Arc::clone(&paths)),
            paths,
        }
    }

    /// Creates a store rooted at the platform data directory.
    pub fn with_default_location() -> Result<Self> {
        let paths = SpacePaths::default_location()?;
        Ok(Self::new(paths.base().clone()))
    }

    /// Same as `new` with an explicit index debounce window, for tests.
    #[cfg(test)]
    fn with_flush_delay(base_dir: PathBuf, delay: std::time::Duration) -> Self {
        let paths = Arc::new(SpacePaths::new(base_dir));
        Self {
            cache: Mutex::new(LruCache::new(LruCache::DEFAULT_CAPACITY)),
            index: IndexWriter::with_delay(Arc::clone(&paths), delay),
            paths,
        }
    }

    fn cache_key(space_id: &str, conversation_id: &str) -> CacheKey {
        (space_id.to_string(), conversation_id.to_string())
    }

    fn conversation_file(
        &self,
        space_id: &str,
        conversation_id: &str,
    ) -> AtomicJsonFile<Conversation> {
        AtomicJsonFile::new(self.paths.conversation_file(space_id, conversation_id))
    }

    fn thoughts_file(
        &self,
        space_id: &str,
        conversation_id: &str,
    ) -> AtomicJsonFile<ThoughtOverflow> {
        AtomicJsonFile::new(self.paths.thoughts_file(space_id, conversation_id))
    }

    /// Loads a conversation through the cache, migrating stale records.
    async fn load(&self, space_id: &str, conversation_id: &str) -> Result<Option<Conversation>> {
        let key = Self::cache_key(space_id, conversation_id);
        if let Some(conversation) = self.cache.lock().await.get(&key) {
            return Ok(Some(conversation));
        }

        let file = self.conversation_file(space_id, conversation_id);
        let Some(mut conversation) = file.load().await? else {
            return Ok(None);
        };

        if migration::needs_migration(&conversation) {
            let overflow_file = self.thoughts_file(space_id, conversation_id);
            match migration::migrate_conversation(&mut conversation, &overflow_file).await {
                Ok(()) => {
                    file.save(&conversation).await?;
                    info!(conversation_id, "Migrated conversation to current schema");
                }
                Err(e) => {
                    // The in-memory value may be half mutated; serve the
                    // original record and retry migration on a later read.
                    warn!(conversation_id, error = %e, "Schema migration failed, serving original record");
                    conversation = file.load().await?.ok_or_else(|| {
                        ParleyError::not_found("Conversation", conversation_id)
                    })?;
                }
            }
        }

        self.cache.lock().await.put(key, conversation.clone());
        Ok(Some(conversation))
    }

    /// Persists the main record and refreshes the cache entry.
    async fn persist(&self, conversation: &Conversation) -> Result<()> {
        self.conversation_file(&conversation.space_id, &conversation.id)
            .save(conversation)
            .await?;
        let key = Self::cache_key(&conversation.space_id, &conversation.id);
        self.cache.lock().await.put(key, conversation.clone());
        Ok(())
    }

    /// Moves a thought log into the overflow file and returns the marker
    /// state to store on the message. The overflow write happens before
    /// the main record is persisted by the caller.
    async fn externalize_thoughts(
        &self,
        space_id: &str,
        conversation_id: &str,
        message_id: &str,
        thoughts: Vec<Thought>,
    ) -> Result<(ThoughtLog, ThoughtsSummary)> {
        let overflow_file = self.thoughts_file(space_id, conversation_id);
        let mut overflow = match overflow_file.load().await {
            Ok(existing) => existing.unwrap_or_default(),
            Err(e) if e.is_corruption() => {
                warn!(conversation_id, error = %e, "Thought overflow unreadable, starting fresh");
                ThoughtOverflow::default()
            }
            Err(e) => return Err(e),
        };
        let summary = ThoughtsSummary::from_thoughts(&thoughts);
        overflow.insert(message_id.to_string(), thoughts);
        overflow_file.save(&overflow).await?;
        Ok((ThoughtLog::Externalized, summary))
    }
}

#[async_trait]
impl ConversationRepository for JsonConversationStore {
    async fn list(&self, space_id: &str) -> Result<Vec<ConversationMeta>> {
        let index = self.index.load_or_rebuild(space_id).await?;
        Ok(index.conversations)
    }

    async fn create(&self, space_id: &str, title: Option<String>) -> Result<Conversation> {
        let conversation = Conversation::new(space_id, title);
        self.persist(&conversation).await?;

        let meta = conversation.to_meta();
        self.index.cancel_pending(space_id, &conversation.id).await;
        self.index
            .write_now(space_id, |index| index.upsert(meta))
            .await?;

        debug!(conversation_id = %conversation.id, space_id, "Created conversation");
        Ok(conversation)
    }

    async fn get(&self, space_id: &str, conversation_id: &str) -> Result<Option<Conversation>> {
        self.load(space_id, conversation_id).await
    }

    async fn update(
        &self,
        space_id: &str,
        conversation_id: &str,
        patch: ConversationPatch,
    ) -> Result<Option<Conversation>> {
        let Some(mut conversation) = self.load(space_id, conversation_id).await? else {
            return Ok(None);
        };

        if let Some(title) = patch.title {
            conversation.title = title;
        }
        if let Some(session_id) = patch.session_id {
            conversation.session_id = Some(session_id);
        }
        if let Some(starred) = patch.starred {
            conversation.starred = starred;
        }
        conversation.touch();
        self.persist(&conversation).await?;

        self.index.schedule(space_id, conversation.to_meta()).await;
        Ok(Some(conversation))
    }

    async fn append_message(
        &self,
        space_id: &str,
        conversation_id: &str,
        message: Message,
    ) -> Result<Message> {
        let Some(mut conversation) = self.load(space_id, conversation_id).await? else {
            return Err(ParleyError::not_found("Conversation", conversation_id));
        };

        conversation.messages.push(message.clone());
        conversation.derive_title_if_empty();
        conversation.touch();
        self.persist(&conversation).await?;

        self.index.schedule(space_id, conversation.to_meta()).await;
        Ok(message)
    }

    async fn update_last_message(
        &self,
        space_id: &str,
        conversation_id: &str,
        patch: MessagePatch,
    ) -> Result<Option<Message>> {
        let Some(mut conversation) = self.load(space_id, conversation_id).await? else {
            return Ok(None);
        };

        // Only a trailing assistant message is ever mutated in place.
        let is_assistant_last = conversation
            .messages
            .last()
            .is_some_and(|m| m.role == MessageRole::Assistant);
        if !is_assistant_last {
            return Ok(None);
        }

        let message_id = conversation
            .messages
            .last()
            .map(|m| m.id.clone())
            .unwrap_or_default();

        // Overflow before main record, so a crash in between leaves a
        // record without the marker and an orphaned (harmless) overflow
        // entry rather than a marker pointing at nothing.
        let externalized = match patch.thoughts {
            Some(thoughts) if !thoughts.is_empty() => Some(
                self.externalize_thoughts(space_id, conversation_id, &message_id, thoughts)
                    .await?,
            ),
            _ => None,
        };

        let last = conversation
            .messages
            .last_mut()
            .ok_or_else(|| ParleyError::internal("Last message vanished during update"))?;
        if let Some(content) = patch.content {
            last.content = content;
        }
        if let Some(usage) = patch.token_usage {
            last.token_usage = Some(usage);
        }
        if let Some(tool_calls) = patch.tool_calls {
            last.tool_calls = Some(tool_calls);
        }
        if let Some((marker, summary)) = externalized {
            last.thoughts = marker;
            last.thoughts_summary = Some(summary);
        }
        let updated = last.clone();

        conversation.touch();
        self.persist(&conversation).await?;

        self.index.schedule(space_id, conversation.to_meta()).await;
        Ok(Some(updated))
    }

    async fn delete(&self, space_id: &str, conversation_id: &str) -> Result<bool> {
        let file = self.conversation_file(space_id, conversation_id);
        let overflow_file = self.thoughts_file(space_id, conversation_id);

        let existed = file.remove().await?;
        overflow_file.remove().await?;
        file.remove_temp_artifacts().await;
        overflow_file.remove_temp_artifacts().await;

        self.cache
            .lock()
            .await
            .remove(&Self::cache_key(space_id, conversation_id));

        self.index.cancel_pending(space_id, conversation_id).await;
        self.index
            .write_now(space_id, |index| {
                index.remove(conversation_id);
            })
            .await?;

        if existed {
            debug!(conversation_id, space_id, "Deleted conversation");
        }
        Ok(existed)
    }

    async fn get_thoughts(
        &self,
        space_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Vec<Thought>> {
        match self.thoughts_file(space_id, conversation_id).load().await {
            Ok(Some(mut overflow)) => Ok(overflow.remove(message_id).unwrap_or_default()),
            Ok(None) => Ok(Vec::new()),
            Err(e) if e.is_corruption() => {
                warn!(conversation_id, error = %e, "Thought overflow unreadable");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn toggle_star(
        &self,
        space_id: &str,
        conversation_id: &str,
        starred: bool,
    ) -> Result<Option<ConversationMeta>> {
        let Some(mut conversation) = self.load(space_id, conversation_id).await? else {
            return Ok(None);
        };

        // Starring is an organizational gesture, not activity; it must
        // not reorder the recency-sorted listing.
        conversation.starred = starred;
        self.persist(&conversation).await?;

        let meta = conversation.to_meta();
        self.index.cancel_pending(space_id, conversation_id).await;
        self.index
            .write_now(space_id, {
                let meta = meta.clone();
                |index| index.upsert(meta)
            })
            .await?;

        Ok(Some(meta))
    }
}
