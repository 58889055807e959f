//! Seams between the message-lifecycle core and a concrete broker transport.
//!
//! The REST transport (`management`, `data_plane`, `connector`) talks to a
//! real namespace; `memory` implements the same traits in-process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::auth::ConnectionConfig;
use super::error::TransportResult;
use super::models::*;

/// Live administrative and data-plane handles for one namespace.
#[derive(Clone)]
pub struct BrokerHandles {
    pub admin: Arc<dyn AdminTransport>,
    pub data: Arc<dyn DataTransport>,
}

/// Establishes handles for a parsed connection string.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Lightweight reachability check of the namespace host.
    async fn probe(&self, config: &ConnectionConfig) -> TransportResult<()>;

    async fn open(&self, config: &ConnectionConfig) -> TransportResult<BrokerHandles>;
}

/// Metadata operations on queues, topics and subscriptions.
///
/// Enumerations are paged: `skip` entries are skipped and at most `top`
/// returned, in broker order.
#[async_trait]
pub trait AdminTransport: Send + Sync {
    async fn list_queues(&self, skip: usize, top: usize) -> TransportResult<Vec<QueueDescription>>;

    async fn queue_runtime_info(&self, name: &str) -> TransportResult<QueueRuntimeInfo>;

    async fn list_topics(&self, skip: usize, top: usize) -> TransportResult<Vec<TopicDescription>>;

    async fn list_subscriptions(
        &self,
        topic: &str,
        skip: usize,
        top: usize,
    ) -> TransportResult<Vec<SubscriptionDescription>>;
}

/// Factory for short-lived receivers and senders.
#[async_trait]
pub trait DataTransport: Send + Sync {
    async fn open_receiver(
        &self,
        target: &EntityTarget,
        sub_queue: SubQueue,
    ) -> TransportResult<Box<dyn ReceiverLink>>;

    /// `entity_path` names a queue or a topic.
    async fn open_sender(&self, entity_path: &str) -> TransportResult<Box<dyn SenderLink>>;

    async fn close(&self) -> TransportResult<()>;
}

/// A lock-mode receiver link scoped to one entity (or its dead-letter sub-queue).
#[async_trait]
pub trait ReceiverLink: Send + Sync {
    /// Read up to `max` messages with sequence number `>= from_sequence_number`
    /// without settling them.
    async fn peek(
        &self,
        max: usize,
        from_sequence_number: i64,
    ) -> TransportResult<Vec<ReceivedMessage>>;

    /// Lock up to `max` messages, waiting at most `wait` for the first one.
    async fn receive(&self, max: usize, wait: Duration) -> TransportResult<Vec<ReceivedMessage>>;

    /// Permanently remove a locked message.
    async fn complete(&self, message: &ReceivedMessage) -> TransportResult<()>;

    /// Release the lock on a message, returning it to the entity.
    async fn abandon(&self, message: &ReceivedMessage) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;
}

#[async_trait]
pub trait SenderLink: Send + Sync {
    async fn send(&self, request: &SendRequest) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;
}
