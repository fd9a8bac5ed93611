use async_trait::async_trait;
use relaybus_core::Message;

use crate::qos::reliable::MessageContext;

/// Downstream target a proxy service forwards to.
/// Implementations wrap a concrete transport (HTTP, JMS, ...); the core is protocol-agnostic.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Registry name of this endpoint.
    fn name(&self) -> &str;

    /// Address of the backend, for logging.
    fn url(&self) -> &str;

    /// Send a request and wait for the backend's response.
    async fn send(&self, message: &Message) -> anyhow::Result<Message>;

    /// Whether the endpoint is currently able to accept requests.
    fn is_available(&self) -> bool {
        true
    }
}

/// Pluggable persistence backend for reliable messaging.
/// Implementations: in-memory (tests, ephemeral), redb (embedded).
#[async_trait]
pub trait MessagePersistenceProvider: Send + Sync {
    /// Store (or overwrite) a pending message.
    async fn persist_message(&self, context: &MessageContext) -> anyhow::Result<()>;

    /// Remove a message from both the pending and dead-letter sets.
    async fn remove_message(&self, message_id: &str) -> anyhow::Result<()>;

    /// Move a pending message into the dead-letter set.
    async fn move_to_dead_letter(&self, context: &MessageContext) -> anyhow::Result<()>;

    /// Load all pending messages, used for recovery on startup.
    async fn load_pending_messages(&self) -> anyhow::Result<Vec<MessageContext>>;

    /// Load all dead-lettered messages, used for recovery on startup.
    async fn load_dead_letter_messages(&self) -> anyhow::Result<Vec<MessageContext>>;

    /// One-time initialization (e.g., create tables).
    async fn initialize(&self) -> anyhow::Result<()>;

    /// Release resources.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Invoked on every (re)delivery attempt of a reliable message.
///
/// Errors are logged by the caller and never propagated; a missing
/// acknowledgement is how a failed delivery is detected.
#[async_trait]
pub trait MessageDeliveryCallback: Send + Sync {
    /// Deliver `payload` identified by `message_id`.
    async fn on_delivery(&self, message_id: &str, payload: &[u8]) -> anyhow::Result<()>;
}
