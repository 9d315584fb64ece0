//! Per-space listing index maintenance.
//!
//! The index is a denormalized projection of every conversation in a
//! space, kept so listing never has to open each record. It is rebuilt
//! from a full directory scan whenever it is absent, corrupt or written
//! by a different schema version; the records themselves stay the source
//! of truth.
//!
//! Metadata-only changes (a streamed delta bumping `updated_at`, a title
//! edit) are debounced: the first change in a window schedules a flush
//! and later changes in the same window coalesce into it, last meta per
//! conversation winning. Structural changes (create, delete, star) write
//! the index immediately and purge any pending entry for the same id so
//! a stale debounced meta cannot overwrite them.

use crate::paths::SpacePaths;
use crate::storage::AtomicJsonFile;
use parley_core::conversation::{
    Conversation, ConversationIndex, ConversationMeta, INDEX_SCHEMA_VERSION,
};
use parley_core::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Debounce window for metadata-only index writes.
pub const INDEX_FLUSH_DELAY: Duration = Duration::from_millis(300);

#[derive(Default)]
struct PendingFlush {
    /// Latest meta per conversation id awaiting flush.
    metas: HashMap<String, ConversationMeta>,
    /// Whether a flush task is already sleeping for this space.
    scheduled: bool,
}

/// Writes and rebuilds per-space listing indexes.
#[derive(Clone)]
pub struct IndexWriter {
    paths: Arc<SpacePaths>,
    pending: Arc<Mutex<HashMap<String, PendingFlush>>>,
    /// Per-space write locks. Every load-modify-save of an index file
    /// happens under its space's lock, so a debounced flush and an
    /// immediate structural write can never interleave: whichever takes
    /// the lock second sees (and preserves) the other's result.
    writers: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    delay: Duration,
}

impl IndexWriter {
    pub fn new(paths: Arc<SpacePaths>) -> Self {
        Self::with_delay(paths, INDEX_FLUSH_DELAY)
    }

    /// Same as `new` with an explicit debounce window, for tests.
    pub fn with_delay(paths: Arc<SpacePaths>, delay: Duration) -> Self {
        Self {
            paths,
            pending: Arc::new(Mutex::new(HashMap::new())),
            writers: Arc::new(Mutex::new(HashMap::new())),
            delay,
        }
    }

    fn index_file(&self, space_id: &str) -> AtomicJsonFile<ConversationIndex> {
        AtomicJsonFile::new(self.paths.index_file(space_id))
    }

    async fn writer_lock(&self, space_id: &str) -> Arc<Mutex<()>> {
        let mut writers = self.writers.lock().await;
        Arc::clone(writers.entry(space_id.to_string()).or_default())
    }

    /// Loads the persisted index, rebuilding when it is unusable.
    ///
    /// Never fails on a corrupt or version-mismatched index; the rebuild
    /// scan always produces a usable (possibly empty) result.
    pub async fn load_or_rebuild(&self, space_id: &str) -> Result<ConversationIndex> {
        let lock = self.writer_lock(space_id).await;
        let _guard = lock.lock().await;
        self.load_or_rebuild_locked(space_id).await
    }

    /// Body of `load_or_rebuild`; caller holds the space's writer lock.
    async fn load_or_rebuild_locked(&self, space_id: &str) -> Result<ConversationIndex> {
        match self.index_file(space_id).load().await {
            Ok(Some(index)) if index.version == INDEX_SCHEMA_VERSION => Ok(index),
            Ok(Some(index)) => {
                warn!(
                    space_id,
                    stored_version = index.version,
                    expected_version = INDEX_SCHEMA_VERSION,
                    "Index schema version mismatch, rebuilding from scan"
                );
                self.rebuild(space_id).await
            }
            Ok(None) => self.rebuild(space_id).await,
            Err(e) => {
                warn!(space_id, error = %e, "Index unreadable, rebuilding from scan");
                self.rebuild(space_id).await
            }
        }
    }

    /// Rebuilds the index from a full scan of the conversations directory
    /// and persists it.
    ///
    /// Corrupt records are skipped with a warning. A missing directory
    /// yields an empty index without creating anything on disk.
    async fn rebuild(&self, space_id: &str) -> Result<ConversationIndex> {
        let dir = self.paths.conversations_dir(space_id);
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ConversationIndex::from_metas(Vec::new()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut metas = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "index.json" || name.ends_with(".thoughts.json") || !name.ends_with(".json")
            {
                continue;
            }
            let file = AtomicJsonFile::<Conversation>::new(entry.path());
            match file.load().await {
                Ok(Some(conversation)) => metas.push(conversation.to_meta()),
                Ok(None) => {}
                Err(e) => {
                    warn!(space_id, file = %name, error = %e, "Skipping unreadable conversation record");
                }
            }
        }

        let index = ConversationIndex::from_metas(metas);
        self.index_file(space_id).save(&index).await?;
        debug!(space_id, entries = index.conversations.len(), "Rebuilt conversation index");
        Ok(index)
    }

    /// Records a metadata change and schedules a debounced flush.
    ///
    /// Multiple changes to the same conversation inside one window
    /// coalesce; the last meta wins.
    pub async fn schedule(&self, space_id: &str, meta: ConversationMeta) {
        let mut pending = self.pending.lock().await;
        let entry = pending.entry(space_id.to_string()).or_default();
        entry.metas.insert(meta.id.clone(), meta);

        if !entry.scheduled {
            entry.scheduled = true;
            let writer = self.clone();
            let space = space_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(writer.delay).await;
                if let Err(e) = writer.flush(&space).await {
                    warn!(space_id = %space, error = %e, "Debounced index flush failed");
                }
            });
        }
    }

    /// Drops any pending debounced meta for one conversation.
    ///
    /// Called before an immediate structural write so a stale scheduled
    /// meta cannot land on top of it.
    pub async fn cancel_pending(&self, space_id: &str, conversation_id: &str) {
        let mut pending = self.pending.lock().await;
        if let Some(entry) = pending.get_mut(space_id) {
            entry.metas.remove(conversation_id);
        }
    }

    /// Applies a mutation to the index and persists it immediately.
    pub async fn write_now<F>(&self, space_id: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ConversationIndex),
    {
        let lock = self.writer_lock(space_id).await;
        let _guard = lock.lock().await;
        let mut index = self.load_or_rebuild_locked(space_id).await?;
        apply(&mut index);
        self.index_file(space_id).save(&index).await
    }

    async fn flush(&self, space_id: &str) -> Result<()> {
        // Take the writer lock before draining. A structural write that
        // raced us has either already purged its meta via cancel_pending
        // (we flush nothing for it) or is queued behind this lock and
        // will overwrite whatever we save.
        let lock = self.writer_lock(space_id).await;
        let _guard = lock.lock().await;

        let metas: Vec<ConversationMeta> = {
            let mut pending = self.pending.lock().await;
            let Some(entry) = pending.get_mut(space_id) else {
                return Ok(());
            };
            entry.scheduled = false;
            entry.metas.drain().map(|(_, meta)| meta).collect()
        };
        if metas.is_empty() {
            return Ok(());
        }

        let mut index = self.load_or_rebuild_locked(space_id).await?;
        for meta in metas {
            index.upsert(meta);
        }
        self.index_file(space_id).save(&index).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::conversation::Message;
    use tempfile::TempDir;

    fn writer(dir: &TempDir, delay_ms: u64) -> IndexWriter {
        IndexWriter::with_delay(
            Arc::new(SpacePaths::new(dir.path().to_path_buf())),
            Duration::from_millis(delay_ms),
        )
    }

    async fn write_conversation(paths: &SpacePaths, conv: &Conversation) {
        AtomicJsonFile::new(paths.conversation_file(&conv.space_id, &conv.id))
            .save(conv)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_directory_yields_empty_index() {
        let temp_dir = TempDir::new().unwrap();
        let index = writer(&temp_dir, 1).load_or_rebuild("nope").await.unwrap();
        assert!(index.conversations.is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_skips_corrupt_and_auxiliary_files() {
        let temp_dir = TempDir::new().unwrap();
        let writer = writer(&temp_dir, 1);
        let paths = SpacePaths::new(temp_dir.path().to_path_buf());

        let mut conv = Conversation::new("s", Some("keep".to_string()));
        conv.messages.push(Message::user("hi"));
        write_conversation(&paths, &conv).await;

        let dir = paths.conversations_dir("s");
        tokio::fs::write(dir.join("bad.json"), b"{garbage").await.unwrap();
        tokio::fs::write(dir.join("x.thoughts.json"), b"{}").await.unwrap();
        tokio::fs::write(dir.join("y.json.tmp"), b"{}").await.unwrap();

        let index = writer.load_or_rebuild("s").await.unwrap();
        assert_eq!(index.conversations.len(), 1);
        assert_eq!(index.conversations[0].id, conv.id);
        assert_eq!(index.conversations[0].message_count, 1);
    }

    #[tokio::test]
    async fn test_version_mismatch_triggers_full_rebuild() {
        let temp_dir = TempDir::new().unwrap();
        let writer = writer(&temp_dir, 1);
        let paths = SpacePaths::new(temp_dir.path().to_path_buf());

        let conv = Conversation::new("s", Some("real".to_string()));
        write_conversation(&paths, &conv).await;

        // Stale index from a future (or past) schema, with a ghost entry.
        let mut ghost = Conversation::new("s", Some("ghost".to_string())).to_meta();
        ghost.id = "ghost".to_string();
        let stale = ConversationIndex {
            version: 99,
            conversations: vec![ghost],
        };
        AtomicJsonFile::new(paths.index_file("s")).save(&stale).await.unwrap();

        let index = writer.load_or_rebuild("s").await.unwrap();
        assert_eq!(index.version, INDEX_SCHEMA_VERSION);
        assert_eq!(index.conversations.len(), 1);
        assert_eq!(index.conversations[0].id, conv.id);
    }

    #[tokio::test]
    async fn test_debounced_writes_coalesce_last_meta_wins() {
        let temp_dir = TempDir::new().unwrap();
        let writer = writer(&temp_dir, 20);
        let paths = SpacePaths::new(temp_dir.path().to_path_buf());

        let mut conv = Conversation::new("s", Some("v1".to_string()));
        write_conversation(&paths, &conv).await;

        writer.schedule("s", conv.to_meta()).await;
        conv.title = "v2".to_string();
        writer.schedule("s", conv.to_meta()).await;

        tokio::time::sleep(Duration::from_millis(100)).await;

        let index: ConversationIndex = AtomicJsonFile::new(paths.index_file("s"))
            .load()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(index.conversations.len(), 1);
        assert_eq!(index.conversations[0].title, "v2");
    }

    #[tokio::test]
    async fn test_structural_write_wins_over_inflight_flush() {
        let temp_dir = TempDir::new().unwrap();
        let writer = writer(&temp_dir, 10);
        let paths = SpacePaths::new(temp_dir.path().to_path_buf());

        let conv = Conversation::new("s", Some("t".to_string()));
        write_conversation(&paths, &conv).await;

        // Repeatedly land the structural write inside the debounce
        // window, including right at the flush boundary where the flush
        // task may already have drained the pending meta. The immediate
        // write must survive every interleaving.
        for i in 0..20u64 {
            let mut stale = conv.to_meta();
            stale.starred = false;
            writer.schedule("s", stale).await;

            tokio::time::sleep(Duration::from_millis(i % 3 * 5 + 5)).await;

            writer.cancel_pending("s", &conv.id).await;
            let mut starred = conv.to_meta();
            starred.starred = true;
            writer
                .write_now("s", |index| index.upsert(starred))
                .await
                .unwrap();

            tokio::time::sleep(Duration::from_millis(40)).await;

            let index: ConversationIndex = AtomicJsonFile::new(paths.index_file("s"))
                .load()
                .await
                .unwrap()
                .unwrap();
            assert!(
                index.conversations[0].starred,
                "flush clobbered the star on iteration {i}"
            );
        }
    }

    #[tokio::test]
    async fn test_cancel_pending_discards_scheduled_meta() {
        let temp_dir = TempDir::new().unwrap();
        let writer = writer(&temp_dir, 20);
        let paths = SpacePaths::new(temp_dir.path().to_path_buf());

        let conv = Conversation::new("s", Some("stale".to_string()));
        write_conversation(&paths, &conv).await;

        writer.schedule("s", conv.to_meta()).await;
        writer.cancel_pending("s", &conv.id).await;

        // The immediate write that motivated the cancel.
        writer
            .write_now("s", |index| {
                let mut meta = conv.to_meta();
                meta.title = "current".to_string();
                index.upsert(meta);
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let index: ConversationIndex = AtomicJsonFile::new(paths.index_file("s"))
            .load()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(index.conversations[0].title, "current");
    }
}
