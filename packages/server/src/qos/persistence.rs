//! Persistence providers for reliable messaging.
//!
//! [`InMemoryPersistence`] keeps everything in process memory and is used in
//! tests and when no durable store is configured. `RedbPersistence` (feature
//! `redb`) stores MessagePack-encoded contexts in an embedded redb database.

use async_trait::async_trait;
use dashmap::DashMap;

use super::reliable::MessageContext;
use crate::traits::MessagePersistenceProvider;

// ---------------------------------------------------------------------------
// InMemoryPersistence
// ---------------------------------------------------------------------------

/// Process-local provider backed by two `DashMap`s.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    pending: DashMap<String, MessageContext>,
    dead_letters: DashMap<String, MessageContext>,
}

impl InMemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut contexts: Vec<MessageContext>) -> Vec<MessageContext> {
    contexts.sort_by_key(|c| c.sequence_position);
    contexts
}

#[async_trait]
impl MessagePersistenceProvider for InMemoryPersistence {
    async fn persist_message(&self, context: &MessageContext) -> anyhow::Result<()> {
        self.dead_letters.remove(&context.message_id);
        self.pending
            .insert(context.message_id.clone(), context.clone());
        Ok(())
    }

    async fn remove_message(&self, message_id: &str) -> anyhow::Result<()> {
        self.pending.remove(message_id);
        self.dead_letters.remove(message_id);
        Ok(())
    }

    async fn move_to_dead_letter(&self, context: &MessageContext) -> anyhow::Result<()> {
        self.pending.remove(&context.message_id);
        self.dead_letters
            .insert(context.message_id.clone(), context.clone());
        Ok(())
    }

    async fn load_pending_messages(&self) -> anyhow::Result<Vec<MessageContext>> {
        Ok(sorted(self.pending.iter().map(|e| e.value().clone()).collect()))
    }

    async fn load_dead_letter_messages(&self) -> anyhow::Result<Vec<MessageContext>> {
        Ok(sorted(
            self.dead_letters.iter().map(|e| e.value().clone()).collect(),
        ))
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RedbPersistence
// ---------------------------------------------------------------------------

#[cfg(feature = "redb")]
pub use self::embedded::RedbPersistence;

#[cfg(feature = "redb")]
mod embedded {
    use std::path::Path;
    use std::sync::Arc;

    use anyhow::Context;
    use async_trait::async_trait;
    use redb::{Database, ReadableTable, TableDefinition};
    use tracing::debug;

    use super::{sorted, MessageContext};
    use crate::traits::MessagePersistenceProvider;

    /// Message id to MessagePack-encoded [`MessageContext`].
    type ContextTable = TableDefinition<'static, &'static str, &'static [u8]>;

    const PENDING: ContextTable = TableDefinition::new("pending");
    const DEAD_LETTER: ContextTable = TableDefinition::new("dead_letter");

    /// Provider storing contexts in an embedded redb file.
    ///
    /// redb is synchronous; every call runs on the blocking thread pool.
    #[derive(Clone)]
    pub struct RedbPersistence {
        db: Arc<Database>,
    }

    impl std::fmt::Debug for RedbPersistence {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RedbPersistence").finish_non_exhaustive()
        }
    }

    impl RedbPersistence {
        /// Opens (or creates) the database at `path`.
        ///
        /// # Errors
        ///
        /// Returns an error if the file cannot be opened as a redb database.
        pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
            let path = path.as_ref();
            let db = Database::create(path)
                .with_context(|| format!("opening reliable message store {}", path.display()))?;
            Ok(Self { db: Arc::new(db) })
        }

        async fn blocking<T, F>(&self, f: F) -> anyhow::Result<T>
        where
            T: Send + 'static,
            F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        {
            let db = Arc::clone(&self.db);
            tokio::task::spawn_blocking(move || f(&db)).await?
        }
    }

    fn encode(context: &MessageContext) -> anyhow::Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(context)?)
    }

    fn load_table(db: &Database, table: ContextTable) -> anyhow::Result<Vec<MessageContext>> {
        let txn = db.begin_read()?;
        let table = txn.open_table(table)?;
        let mut contexts = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            contexts.push(rmp_serde::from_slice(value.value())?);
        }
        Ok(sorted(contexts))
    }

    #[async_trait]
    impl MessagePersistenceProvider for RedbPersistence {
        async fn persist_message(&self, context: &MessageContext) -> anyhow::Result<()> {
            let id = context.message_id.clone();
            let bytes = encode(context)?;
            self.blocking(move |db| {
                let txn = db.begin_write()?;
                {
                    let mut dead = txn.open_table(DEAD_LETTER)?;
                    dead.remove(id.as_str())?;
                    let mut pending = txn.open_table(PENDING)?;
                    pending.insert(id.as_str(), bytes.as_slice())?;
                }
                txn.commit()?;
                Ok(())
            })
            .await
        }

        async fn remove_message(&self, message_id: &str) -> anyhow::Result<()> {
            let id = message_id.to_string();
            self.blocking(move |db| {
                let txn = db.begin_write()?;
                {
                    let mut pending = txn.open_table(PENDING)?;
                    pending.remove(id.as_str())?;
                    let mut dead = txn.open_table(DEAD_LETTER)?;
                    dead.remove(id.as_str())?;
                }
                txn.commit()?;
                Ok(())
            })
            .await
        }

        async fn move_to_dead_letter(&self, context: &MessageContext) -> anyhow::Result<()> {
            let id = context.message_id.clone();
            let bytes = encode(context)?;
            self.blocking(move |db| {
                let txn = db.begin_write()?;
                {
                    let mut pending = txn.open_table(PENDING)?;
                    pending.remove(id.as_str())?;
                    let mut dead = txn.open_table(DEAD_LETTER)?;
                    dead.insert(id.as_str(), bytes.as_slice())?;
                }
                txn.commit()?;
                Ok(())
            })
            .await
        }

        async fn load_pending_messages(&self) -> anyhow::Result<Vec<MessageContext>> {
            self.blocking(|db| load_table(db, PENDING)).await
        }

        async fn load_dead_letter_messages(&self) -> anyhow::Result<Vec<MessageContext>> {
            self.blocking(|db| load_table(db, DEAD_LETTER)).await
        }

        async fn initialize(&self) -> anyhow::Result<()> {
            self.blocking(|db| {
                let txn = db.begin_write()?;
                txn.open_table(PENDING)?;
                txn.open_table(DEAD_LETTER)?;
                txn.commit()?;
                debug!("reliable message store initialized");
                Ok(())
            })
            .await
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn context(id: &str, position: u64) -> MessageContext {
        let mut context = MessageContext::new(id, id.as_bytes().to_vec(), Some("S".into()), 10);
        context.sequence_position = position;
        context
    }

    async fn exercise(provider: &dyn MessagePersistenceProvider) {
        provider.initialize().await.unwrap();
        provider.persist_message(&context("b", 2)).await.unwrap();
        provider.persist_message(&context("a", 1)).await.unwrap();
        provider.persist_message(&context("c", 3)).await.unwrap();

        let ids: Vec<_> = provider
            .load_pending_messages()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.message_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let mut dead = context("b", 2);
        dead.retry_count = 3;
        provider.move_to_dead_letter(&dead).await.unwrap();
        provider.remove_message("c").await.unwrap();

        let pending = provider.load_pending_messages().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id, "a");
        let dead_letters = provider.load_dead_letter_messages().await.unwrap();
        assert_eq!(dead_letters, vec![dead.clone()]);

        // Persisting a dead letter again moves it back to pending.
        provider.persist_message(&dead).await.unwrap();
        assert!(provider.load_dead_letter_messages().await.unwrap().is_empty());
        assert_eq!(provider.load_pending_messages().await.unwrap().len(), 2);

        provider.close().await.unwrap();
    }

    #[tokio::test]
    async fn in_memory_provider_tracks_pending_and_dead_letters() {
        exercise(&InMemoryPersistence::new()).await;
    }

    #[cfg(feature = "redb")]
    #[tokio::test]
    async fn redb_provider_tracks_pending_and_dead_letters() {
        let dir = tempfile::tempdir().unwrap();
        let provider = RedbPersistence::open(dir.path().join("reliable.redb")).unwrap();
        exercise(&provider).await;
    }

    #[cfg(feature = "redb")]
    #[tokio::test]
    async fn redb_provider_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reliable.redb");
        {
            let provider = RedbPersistence::open(&path).unwrap();
            provider.initialize().await.unwrap();
            provider.persist_message(&context("kept", 1)).await.unwrap();
        }
        let reopened = RedbPersistence::open(&path).unwrap();
        let pending = reopened.load_pending_messages().await.unwrap();
        assert_eq!(pending, vec![context("kept", 1)]);
    }
}
