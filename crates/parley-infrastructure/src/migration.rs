//! Lazy schema migration for conversation records.
//!
//! Version 1 stored thought logs inline on each message, which made large
//! agentic conversations slow to load and rewrite. Version 2 moves them
//! to a sibling overflow file keyed by message id and leaves a `null`
//! marker plus a summary on the message.
//!
//! Migration runs on read, the first time a v1 record is loaded. The
//! overflow file is written before the main record so a crash between
//! the two writes leaves a v1 record whose next read migrates again;
//! re-externalizing an already-present overflow entry is a no-op.

use crate::storage::AtomicJsonFile;
use parley_core::conversation::{
    Conversation, Thought, ThoughtLog, ThoughtsSummary, CONVERSATION_SCHEMA_VERSION,
};
use parley_core::Result;
use std::collections::HashMap;
use tracing::debug;

/// Externalized thought storage: message id to its full thought log.
pub type ThoughtOverflow = HashMap<String, Vec<Thought>>;

/// Whether a loaded record predates the current schema.
pub fn needs_migration(conversation: &Conversation) -> bool {
    conversation.version < CONVERSATION_SCHEMA_VERSION
}

/// Migrates a record to the current schema version in place.
///
/// Moves every inline thought log into the overflow file and replaces it
/// on the message with the externalized marker and a computed summary.
/// The overflow file is persisted here; the caller persists the main
/// record afterwards. On error the caller must discard `conversation`
/// and re-read the original record, as it may be half mutated.
pub async fn migrate_conversation(
    conversation: &mut Conversation,
    overflow_file: &AtomicJsonFile<ThoughtOverflow>,
) -> Result<()> {
    let mut overflow = overflow_file.load().await?.unwrap_or_default();
    let mut moved = 0usize;

    for message in &mut conversation.messages {
        match std::mem::take(&mut message.thoughts) {
            ThoughtLog::Inline(thoughts) if !thoughts.is_empty() => {
                message.thoughts_summary = Some(ThoughtsSummary::from_thoughts(&thoughts));
                overflow.insert(message.id.clone(), thoughts);
                message.thoughts = ThoughtLog::Externalized;
                moved += 1;
            }
            // An empty inline array carries no information; drop the field.
            ThoughtLog::Inline(_) => message.thoughts = ThoughtLog::Absent,
            // Already migrated (or never had thoughts); put it back.
            other => message.thoughts = other,
        }
    }

    // Overflow first. If this write fails the main record is untouched on
    // disk and the migration retries on the next read.
    if moved > 0 {
        overflow_file.save(&overflow).await?;
    }

    debug!(
        conversation_id = %conversation.id,
        from_version = conversation.version,
        moved_messages = moved,
        "Migrated conversation record"
    );
    conversation.version = CONVERSATION_SCHEMA_VERSION;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::conversation::{Message, ThoughtKind};
    use tempfile::TempDir;

    fn v1_conversation() -> Conversation {
        let mut conv = Conversation::new("space", Some("old".to_string()));
        conv.version = 1;
        conv.messages.push(Message::user("question"));
        let mut reply = Message::assistant("answer");
        reply.thoughts = ThoughtLog::Inline(vec![
            Thought::with_content(ThoughtKind::Thinking, "hmm"),
            Thought::with_content(ThoughtKind::Text, "answer"),
        ]);
        conv.messages.push(reply);
        conv
    }

    #[tokio::test]
    async fn test_migration_externalizes_inline_thoughts() {
        let temp_dir = TempDir::new().unwrap();
        let overflow_file =
            AtomicJsonFile::<ThoughtOverflow>::new(temp_dir.path().join("c.thoughts.json"));

        let mut conv = v1_conversation();
        let message_id = conv.messages[1].id.clone();
        migrate_conversation(&mut conv, &overflow_file).await.unwrap();

        assert_eq!(conv.version, CONVERSATION_SCHEMA_VERSION);
        assert!(conv.messages[0].thoughts.is_absent());
        assert!(conv.messages[1].thoughts.is_externalized());

        let summary = conv.messages[1].thoughts_summary.as_ref().unwrap();
        assert_eq!(summary.counts.get("thinking"), Some(&1));

        let overflow = overflow_file.load().await.unwrap().unwrap();
        assert_eq!(overflow.get(&message_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_migration_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let overflow_file =
            AtomicJsonFile::<ThoughtOverflow>::new(temp_dir.path().join("c.thoughts.json"));

        let mut conv = v1_conversation();
        migrate_conversation(&mut conv, &overflow_file).await.unwrap();
        let first_pass = conv.clone();
        let first_overflow = overflow_file.load().await.unwrap().unwrap();

        migrate_conversation(&mut conv, &overflow_file).await.unwrap();
        assert_eq!(conv, first_pass);
        assert_eq!(overflow_file.load().await.unwrap().unwrap(), first_overflow);
    }

    #[tokio::test]
    async fn test_empty_inline_array_becomes_absent() {
        let temp_dir = TempDir::new().unwrap();
        let overflow_file =
            AtomicJsonFile::<ThoughtOverflow>::new(temp_dir.path().join("c.thoughts.json"));

        let mut conv = Conversation::new("space", None);
        conv.version = 1;
        let mut msg = Message::assistant("hi");
        msg.thoughts = ThoughtLog::Inline(vec![]);
        conv.messages.push(msg);

        migrate_conversation(&mut conv, &overflow_file).await.unwrap();
        assert!(conv.messages[0].thoughts.is_absent());
        assert!(conv.messages[0].thoughts_summary.is_none());
        // No overflow file is created for nothing.
        assert!(overflow_file.load().await.unwrap().is_none());
    }
}
