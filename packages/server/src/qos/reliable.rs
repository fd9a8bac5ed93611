//! Acknowledgement-based reliable delivery.
//!
//! Every message sent through [`ReliableMessagingModule`] stays pending until
//! it is acknowledged. Unacknowledged messages are redelivered by a retry
//! sweep and moved to the dead-letter set once `max_retries` attempts have
//! been made. Messages that share a sequence id are delivered one at a time in
//! send order: the next message is attempted only after the head has been
//! acknowledged.
//!
//! A dead-lettered sequence head stays at the head of its sequence and blocks
//! it until it is reprocessed or discarded.
//!
//! Advancing a sequence is a loop, not a call chain: a callback that
//! acknowledges inline hands the next head back to the loop already driving
//! that sequence, so draining a long backlog runs in constant stack depth.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use relaybus_core::{ClockSource, Message};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::persistence::InMemoryPersistence;
use crate::service::registry::{ManagedService, ServiceContext};
use crate::service::worker::{BackgroundRunnable, BackgroundWorker, SweepTask};
use crate::traits::{Endpoint, MessageDeliveryCallback, MessagePersistenceProvider};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Delivery state of one reliable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContext {
    pub message_id: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Ordering group; messages of one sequence are delivered one at a time.
    pub sequence_id: Option<String>,
    /// Send order within this module, used to rebuild sequences on recovery.
    #[serde(default)]
    pub sequence_position: u64,
    pub creation_time_ms: u64,
    /// Delivery attempts made so far.
    pub retry_count: u32,
    /// Time of the latest delivery attempt (ms), 0 if never attempted.
    pub last_attempt_ms: u64,
    pub acknowledged: bool,
}

impl MessageContext {
    #[must_use]
    pub fn new(
        message_id: impl Into<String>,
        payload: Vec<u8>,
        sequence_id: Option<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            payload,
            sequence_id,
            sequence_position: 0,
            creation_time_ms: now_ms,
            retry_count: 0,
            last_attempt_ms: 0,
            acknowledged: false,
        }
    }
}

/// Reliable messaging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliableMessagingConfig {
    /// Delivery attempts before a message is dead-lettered.
    pub max_retries: u32,
    /// Cadence of the retry sweep (ms).
    pub retry_interval_ms: u64,
    /// Time after an attempt before the message counts as unacknowledged (ms).
    pub ack_timeout_ms: u64,
    /// Mirror pending and dead-letter state into a persistence provider.
    pub persistence_enabled: bool,
    /// Location of the embedded store; in-memory persistence is used when unset.
    pub persistence_path: Option<std::path::PathBuf>,
    /// Capacity of the dead-letter notification channel.
    pub dead_letter_channel_capacity: usize,
}

impl Default for ReliableMessagingConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval_ms: 5_000,
            ack_timeout_ms: 30_000,
            persistence_enabled: false,
            persistence_path: None,
            dead_letter_channel_capacity: 256,
        }
    }
}

/// An acknowledged message, kept until the cleanup sweep purges it.
#[derive(Debug, Clone)]
struct ProcessedRecord {
    context: MessageContext,
    acknowledged_ms: u64,
}

// ---------------------------------------------------------------------------
// Sweeps
// ---------------------------------------------------------------------------

struct RetrySweeper {
    module: Weak<ReliableMessagingModule>,
}

#[async_trait]
impl BackgroundRunnable for RetrySweeper {
    type Task = SweepTask;

    async fn run(&mut self, _task: SweepTask) {
        self.on_tick().await;
    }

    async fn on_tick(&mut self) {
        if let Some(module) = self.module.upgrade() {
            module.retry_sweep().await;
        }
    }
}

struct CleanupSweeper {
    module: Weak<ReliableMessagingModule>,
}

#[async_trait]
impl BackgroundRunnable for CleanupSweeper {
    type Task = SweepTask;

    async fn run(&mut self, _task: SweepTask) {
        self.on_tick().await;
    }

    async fn on_tick(&mut self) {
        if let Some(module) = self.module.upgrade() {
            module.cleanup_sweep();
        }
    }
}

// ---------------------------------------------------------------------------
// AdvanceTurn
// ---------------------------------------------------------------------------

/// Ownership of one sequence's advance loop. Released when the loop finds no
/// handed-off head, or on drop if the loop is cancelled or panics; the retry
/// sweep then picks the head up again.
struct AdvanceTurn<'a> {
    advancing: &'a Mutex<HashMap<String, Option<String>>>,
    sequence_id: &'a str,
    finished: bool,
}

impl AdvanceTurn<'_> {
    fn next_head(&mut self) -> Option<String> {
        let mut advancing = self.advancing.lock();
        let next = advancing.get_mut(self.sequence_id).and_then(Option::take);
        if next.is_none() {
            advancing.remove(self.sequence_id);
            self.finished = true;
        }
        next
    }
}

impl Drop for AdvanceTurn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.advancing.lock().remove(self.sequence_id);
        }
    }
}

// ---------------------------------------------------------------------------
// ReliableMessagingModule
// ---------------------------------------------------------------------------

/// Tracks pending, processed and dead-lettered messages.
pub struct ReliableMessagingModule {
    this: Weak<Self>,
    config: ReliableMessagingConfig,
    clock: Arc<dyn ClockSource>,
    persistence: Option<Arc<dyn MessagePersistenceProvider>>,
    callback: RwLock<Option<Arc<dyn MessageDeliveryCallback>>>,
    pending: DashMap<String, MessageContext>,
    processed: DashMap<String, ProcessedRecord>,
    dead_letters: DashMap<String, MessageContext>,
    /// Per-sequence FIFO of message ids; the front is the only deliverable one.
    sequences: Mutex<HashMap<String, VecDeque<String>>>,
    /// Sequences with a running advance loop, mapped to the head handed off
    /// to that loop by an acknowledgement that landed while it was busy.
    advancing: Mutex<HashMap<String, Option<String>>>,
    next_position: AtomicU64,
    dead_letter_tx: broadcast::Sender<MessageContext>,
    retry_worker: Mutex<Option<BackgroundWorker<RetrySweeper>>>,
    cleanup_worker: Mutex<Option<BackgroundWorker<CleanupSweeper>>>,
    shutdown_timeout: Mutex<Duration>,
}

impl ReliableMessagingModule {
    /// Creates the module. When persistence is enabled and no provider is
    /// given, state is mirrored into an [`InMemoryPersistence`].
    #[must_use]
    pub fn new(
        config: ReliableMessagingConfig,
        clock: Arc<dyn ClockSource>,
        provider: Option<Arc<dyn MessagePersistenceProvider>>,
    ) -> Arc<Self> {
        let persistence = if config.persistence_enabled {
            Some(provider.unwrap_or_else(|| Arc::new(InMemoryPersistence::new())))
        } else {
            None
        };
        let (dead_letter_tx, _) = broadcast::channel(config.dead_letter_channel_capacity.max(1));
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            clock,
            persistence,
            callback: RwLock::new(None),
            pending: DashMap::new(),
            processed: DashMap::new(),
            dead_letters: DashMap::new(),
            sequences: Mutex::new(HashMap::new()),
            advancing: Mutex::new(HashMap::new()),
            next_position: AtomicU64::new(0),
            dead_letter_tx,
            retry_worker: Mutex::new(None),
            cleanup_worker: Mutex::new(None),
            shutdown_timeout: Mutex::new(Duration::from_secs(5)),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ReliableMessagingConfig {
        &self.config
    }

    /// Installs the callback invoked on every delivery attempt.
    pub fn set_callback(&self, callback: Arc<dyn MessageDeliveryCallback>) {
        *self.callback.write() = Some(callback);
    }

    /// Tracks a new message and attempts its first delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be persisted; nothing is
    /// tracked in that case.
    pub async fn send_message(
        &self,
        payload: Vec<u8>,
        sequence_id: Option<&str>,
    ) -> anyhow::Result<String> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let mut context = MessageContext::new(
            message_id.clone(),
            payload,
            sequence_id.map(str::to_string),
            self.clock.now(),
        );
        context.sequence_position = self.next_position.fetch_add(1, Ordering::Relaxed);

        if let Some(persistence) = &self.persistence {
            persistence.persist_message(&context).await?;
        }

        self.pending.insert(message_id.clone(), context);
        if let Some(sequence_id) = sequence_id {
            self.sequences
                .lock()
                .entry(sequence_id.to_string())
                .or_default()
                .push_back(message_id.clone());
        }
        debug!(message_id = %message_id, sequence_id = ?sequence_id, "reliable message queued");

        self.deliver_message(&message_id).await;
        Ok(message_id)
    }

    /// Makes one delivery attempt for a pending message.
    ///
    /// Returns `false` without attempting if the message is not pending or is
    /// not at the head of its sequence, and `false` if it settles while the
    /// attempt is being persisted. Callback errors are logged only.
    pub async fn deliver_message(&self, message_id: &str) -> bool {
        let sequence_id = match self.pending.get(message_id) {
            Some(context) => context.sequence_id.clone(),
            None => return false,
        };
        if let Some(sequence_id) = &sequence_id {
            if !self.is_sequence_head(sequence_id, message_id) {
                debug!(message_id, sequence_id = %sequence_id, "waiting for sequence head");
                return false;
            }
        }

        let now = self.clock.now();
        let attempt = match self.pending.get_mut(message_id) {
            Some(mut context) => {
                context.retry_count += 1;
                context.last_attempt_ms = now;
                context.clone()
            }
            None => return false,
        };

        if let Some(persistence) = &self.persistence {
            if let Err(error) = persistence.persist_message(&attempt).await {
                warn!(message_id, %error, "failed to persist delivery attempt");
            }
            if !self.reconcile_persisted(persistence, message_id).await {
                debug!(message_id, "message settled while its attempt was persisted");
                return false;
            }
        }

        let callback = self.callback.read().clone();
        match callback {
            Some(callback) => {
                debug!(message_id, attempt = attempt.retry_count, "delivering reliable message");
                if let Err(error) = callback.on_delivery(message_id, &attempt.payload).await {
                    warn!(
                        message_id,
                        attempt = attempt.retry_count,
                        %error,
                        "delivery callback failed"
                    );
                }
            }
            None => debug!(message_id, "no delivery callback installed"),
        }
        true
    }

    /// Marks a pending message processed.
    ///
    /// For sequence-bound messages the next message of the sequence is then
    /// attempted. Returns `false`, changing nothing, if the message is not
    /// pending (already acknowledged, dead-lettered or unknown).
    pub async fn acknowledge_message(&self, message_id: &str) -> bool {
        let Some((_, mut context)) = self.pending.remove(message_id) else {
            debug!(message_id, "acknowledgement for message that is not pending");
            return false;
        };
        context.acknowledged = true;
        let sequence_id = context.sequence_id.clone();
        self.processed.insert(
            message_id.to_string(),
            ProcessedRecord {
                context,
                acknowledged_ms: self.clock.now(),
            },
        );

        if let Some(persistence) = &self.persistence {
            if let Err(error) = persistence.remove_message(message_id).await {
                warn!(message_id, %error, "failed to remove acknowledged message from persistence");
            }
        }
        debug!(message_id, "reliable message acknowledged");

        if let Some(sequence_id) = sequence_id {
            if let Some(next) = self.remove_from_sequence(&sequence_id, message_id) {
                self.advance_sequence(&sequence_id, next).await;
            }
        }
        true
    }

    /// Delivers `head` and keeps going while each delivery hands a new head
    /// back. Joins the loop already running for `sequence_id` if there is one.
    async fn advance_sequence(&self, sequence_id: &str, head: String) {
        {
            let mut advancing = self.advancing.lock();
            if let Some(handoff) = advancing.get_mut(sequence_id) {
                *handoff = Some(head);
                return;
            }
            advancing.insert(sequence_id.to_string(), None);
        }

        let mut turn = AdvanceTurn {
            advancing: &self.advancing,
            sequence_id,
            finished: false,
        };
        let mut head = head;
        loop {
            self.deliver_message(&head).await;
            match turn.next_head() {
                Some(next) => head = next,
                None => return,
            }
        }
    }

    /// Undoes a persisted attempt that raced with an acknowledgement or a
    /// dead-letter move, so the provider never holds a settled message as
    /// pending. Returns whether the message is still pending.
    async fn reconcile_persisted(
        &self,
        persistence: &Arc<dyn MessagePersistenceProvider>,
        message_id: &str,
    ) -> bool {
        if self.pending.contains_key(message_id) {
            return true;
        }
        let dead_letter = self.dead_letters.get(message_id).map(|c| c.clone());
        let result = match dead_letter {
            Some(context) => persistence.move_to_dead_letter(&context).await,
            None => persistence.remove_message(message_id).await,
        };
        if let Err(error) = result {
            warn!(message_id, %error, "failed to reconcile persisted delivery attempt");
        }
        false
    }

    /// Redelivers overdue messages and dead-letters exhausted ones.
    ///
    /// A message is overdue when it was never attempted, or when at least
    /// `ack_timeout_ms` passed since its last attempt. Messages waiting
    /// behind their sequence head are skipped.
    pub async fn retry_sweep(&self) {
        let now = self.clock.now();
        let overdue: Vec<(String, u32)> = self
            .pending
            .iter()
            .filter(|entry| {
                let context = entry.value();
                context.retry_count == 0
                    || now.saturating_sub(context.last_attempt_ms) >= self.config.ack_timeout_ms
            })
            .map(|entry| (entry.key().clone(), entry.value().retry_count))
            .collect();

        for (message_id, retry_count) in overdue {
            if retry_count >= self.config.max_retries {
                self.move_to_dead_letter(&message_id).await;
            } else {
                self.deliver_message(&message_id).await;
            }
        }
    }

    /// Asks the retry worker to sweep now rather than at its next tick.
    /// Returns `false` if the module is not running.
    pub fn request_retry_sweep(&self) -> bool {
        self.retry_worker
            .lock()
            .as_ref()
            .is_some_and(|worker| worker.try_submit(SweepTask::RunNow))
    }

    /// Purges processed records older than twice the acknowledgement timeout.
    /// Returns the number of records removed.
    pub fn cleanup_sweep(&self) -> usize {
        let now = self.clock.now();
        let window = self.config.ack_timeout_ms.saturating_mul(2);
        let before = self.processed.len();
        self.processed
            .retain(|_, record| now.saturating_sub(record.acknowledged_ms) < window);
        let removed = before.saturating_sub(self.processed.len());
        if removed > 0 {
            debug!(removed, "purged processed reliable messages");
        }
        removed
    }

    async fn move_to_dead_letter(&self, message_id: &str) {
        let Some((_, context)) = self.pending.remove(message_id) else {
            return;
        };
        self.dead_letters.insert(message_id.to_string(), context.clone());
        if let Some(persistence) = &self.persistence {
            if let Err(error) = persistence.move_to_dead_letter(&context).await {
                warn!(message_id, %error, "failed to persist dead-letter move");
            }
        }
        warn!(
            message_id,
            sequence_id = ?context.sequence_id,
            attempts = context.retry_count,
            "reliable message dead-lettered"
        );
        metrics::counter!("relaybus_dead_letters_total").increment(1);
        // No subscribers is fine: dead letters stay pollable.
        let _ = self.dead_letter_tx.send(context);
    }

    /// Moves a dead-lettered message back to pending with a fresh retry
    /// count and attempts delivery immediately.
    pub async fn reprocess_dead_letter(&self, message_id: &str) -> bool {
        let Some((_, mut context)) = self.dead_letters.remove(message_id) else {
            return false;
        };
        context.retry_count = 0;
        context.acknowledged = false;
        self.pending.insert(message_id.to_string(), context.clone());
        if let Some(persistence) = &self.persistence {
            if let Err(error) = persistence.persist_message(&context).await {
                warn!(message_id, %error, "failed to persist reprocessed message");
            }
        }
        info!(message_id, "dead letter reprocessed");
        self.deliver_message(message_id).await;
        true
    }

    /// Drops a dead-lettered message for good, unblocking its sequence.
    pub async fn discard_dead_letter(&self, message_id: &str) -> bool {
        let Some((_, context)) = self.dead_letters.remove(message_id) else {
            return false;
        };
        if let Some(persistence) = &self.persistence {
            if let Err(error) = persistence.remove_message(message_id).await {
                warn!(message_id, %error, "failed to remove discarded message from persistence");
            }
        }
        info!(message_id, "dead letter discarded");
        if let Some(sequence_id) = context.sequence_id {
            if let Some(next) = self.remove_from_sequence(&sequence_id, message_id) {
                self.advance_sequence(&sequence_id, next).await;
            }
        }
        true
    }

    /// Subscribes to messages as they are dead-lettered.
    #[must_use]
    pub fn subscribe_dead_letters(&self) -> broadcast::Receiver<MessageContext> {
        self.dead_letter_tx.subscribe()
    }

    /// Looks a message up in the pending, dead-letter and processed sets.
    #[must_use]
    pub fn message(&self, message_id: &str) -> Option<MessageContext> {
        self.pending
            .get(message_id)
            .map(|c| c.clone())
            .or_else(|| self.dead_letters.get(message_id).map(|c| c.clone()))
            .or_else(|| self.processed.get(message_id).map(|r| r.context.clone()))
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    #[must_use]
    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    #[must_use]
    pub fn is_acknowledged(&self, message_id: &str) -> bool {
        self.processed.contains_key(message_id)
    }

    /// Ids of dead-lettered messages, sorted.
    #[must_use]
    pub fn dead_letter_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.dead_letters.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn is_sequence_head(&self, sequence_id: &str, message_id: &str) -> bool {
        self.sequences
            .lock()
            .get(sequence_id)
            .and_then(VecDeque::front)
            .is_some_and(|head| head == message_id)
    }

    /// Removes `message_id` from its sequence. Returns the new head if the
    /// removed message was the head and another message is waiting.
    fn remove_from_sequence(&self, sequence_id: &str, message_id: &str) -> Option<String> {
        let mut sequences = self.sequences.lock();
        let queue = sequences.get_mut(sequence_id)?;
        let was_head = queue.front().is_some_and(|head| head == message_id);
        queue.retain(|id| id != message_id);
        let next = queue.front().cloned();
        if queue.is_empty() {
            sequences.remove(sequence_id);
        }
        if was_head {
            next
        } else {
            None
        }
    }

    /// Rebuilds in-memory state from the persistence provider.
    async fn recover(
        &self,
        persistence: &Arc<dyn MessagePersistenceProvider>,
    ) -> anyhow::Result<()> {
        let pending = persistence.load_pending_messages().await?;
        let dead_letters = persistence.load_dead_letter_messages().await?;

        let next_position = pending
            .iter()
            .chain(dead_letters.iter())
            .map(|c| c.sequence_position + 1)
            .max()
            .unwrap_or(0);
        self.next_position.fetch_max(next_position, Ordering::Relaxed);

        let mut sequenced: Vec<(u64, u64, String, String)> = pending
            .iter()
            .chain(dead_letters.iter())
            .filter_map(|c| {
                c.sequence_id.clone().map(|s| {
                    (c.sequence_position, c.creation_time_ms, c.message_id.clone(), s)
                })
            })
            .collect();
        sequenced.sort();

        {
            let mut sequences = self.sequences.lock();
            for (_, _, message_id, sequence_id) in sequenced {
                sequences.entry(sequence_id).or_default().push_back(message_id);
            }
        }

        let (pending_count, dead_count) = (pending.len(), dead_letters.len());
        for context in pending {
            self.pending.insert(context.message_id.clone(), context);
        }
        for context in dead_letters {
            self.dead_letters.insert(context.message_id.clone(), context);
        }
        info!(
            pending = pending_count,
            dead_letters = dead_count,
            "recovered reliable messaging state"
        );
        Ok(())
    }

    fn start_workers(&self) {
        let retry_ms = self.config.retry_interval_ms;
        let cleanup_ms = self.config.ack_timeout_ms.saturating_mul(2);

        let mut retry = self.retry_worker.lock();
        if retry.is_none() {
            *retry = Some(BackgroundWorker::start(
                "reliable-retry",
                RetrySweeper {
                    module: self.this.clone(),
                },
                retry_ms,
            ));
        }
        let mut cleanup = self.cleanup_worker.lock();
        if cleanup.is_none() {
            *cleanup = Some(BackgroundWorker::start(
                "reliable-cleanup",
                CleanupSweeper {
                    module: self.this.clone(),
                },
                cleanup_ms,
            ));
        }
    }

    async fn stop_workers(&self, terminate: bool) {
        let timeout = *self.shutdown_timeout.lock();
        let retry = self.retry_worker.lock().take();
        if let Some(mut worker) = retry {
            if terminate {
                worker.abort();
            } else {
                worker.stop_within(timeout).await;
            }
        }
        let cleanup = self.cleanup_worker.lock().take();
        if let Some(mut worker) = cleanup {
            if terminate {
                worker.abort();
            } else {
                worker.stop_within(timeout).await;
            }
        }
    }

    fn clear_state(&self) {
        self.pending.clear();
        self.processed.clear();
        self.dead_letters.clear();
        self.sequences.lock().clear();
        self.advancing.lock().clear();
    }
}

#[async_trait]
impl ManagedService for ReliableMessagingModule {
    fn name(&self) -> &'static str {
        "reliable-messaging"
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        *self.shutdown_timeout.lock() = Duration::from_millis(ctx.config.shutdown_timeout_ms);
        if let Some(persistence) = &self.persistence {
            persistence.initialize().await?;
            self.recover(persistence).await?;
        }
        self.start_workers();
        info!(
            max_retries = self.config.max_retries,
            retry_interval_ms = self.config.retry_interval_ms,
            ack_timeout_ms = self.config.ack_timeout_ms,
            persistence = self.persistence.is_some(),
            "reliable messaging module started"
        );
        Ok(())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        self.clear_state();
        Ok(())
    }

    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()> {
        self.stop_workers(terminate).await;
        if let Some(persistence) = &self.persistence {
            persistence.close().await?;
        }
        self.clear_state();
        info!("reliable messaging module stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EndpointDeliveryCallback
// ---------------------------------------------------------------------------

/// Delivers reliable messages to an [`Endpoint`] and acknowledges them once
/// the endpoint answers successfully.
pub struct EndpointDeliveryCallback {
    endpoint: Arc<dyn Endpoint>,
    module: Weak<ReliableMessagingModule>,
}

impl EndpointDeliveryCallback {
    #[must_use]
    pub fn new(endpoint: Arc<dyn Endpoint>, module: &Arc<ReliableMessagingModule>) -> Self {
        Self {
            endpoint,
            module: Arc::downgrade(module),
        }
    }
}

#[async_trait]
impl MessageDeliveryCallback for EndpointDeliveryCallback {
    async fn on_delivery(&self, message_id: &str, payload: &[u8]) -> anyhow::Result<()> {
        if !self.endpoint.is_available() {
            anyhow::bail!("endpoint {} is unavailable", self.endpoint.name());
        }
        let message = Message::with_id(message_id, payload.to_vec());
        self.endpoint.send(&message).await?;
        if let Some(module) = self.module.upgrade() {
            module.acknowledge_message(message_id).await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
