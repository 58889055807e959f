//! In-process broker implementing every transport seam.
//!
//! Deterministic: receives never wait, sequence numbers are namespace-wide
//! and start at 1. Faults and delays can be queued per call site, and individual
//! messages can be hidden from a number of receive calls to model another
//! consumer holding them. [`BrokerStats`] exposes call and handle counters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::auth::ConnectionConfig;
use super::error::{TransportError, TransportResult};
use super::models::*;
use super::transport::*;

/// Call sites at which a one-shot failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Probe,
    Open,
    ListQueues,
    QueueRuntime,
    ListTopics,
    ListSubscriptions,
    OpenReceiver,
    Peek,
    Receive,
    Complete,
    Abandon,
    Send,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub peek_calls: usize,
    pub receive_calls: usize,
    pub completed: usize,
    pub abandoned: usize,
    pub sent: usize,
    pub open_receivers: usize,
    pub open_senders: usize,
    pub data_plane_closes: usize,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message: ReceivedMessage,
    lock: Option<(u64, String)>,
    hidden_receives: usize,
}

impl StoredMessage {
    fn sequence_number(&self) -> i64 {
        self.message.sequence_number().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct EntityQueues {
    active: Vec<StoredMessage>,
    dead_letter: Vec<StoredMessage>,
}

impl EntityQueues {
    fn sub_queue(&mut self, sub_queue: SubQueue) -> &mut Vec<StoredMessage> {
        match sub_queue {
            SubQueue::Active => &mut self.active,
            SubQueue::DeadLetter => &mut self.dead_letter,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    next_sequence: i64,
    next_id: u64,
    queues: Vec<String>,
    topics: Vec<(String, Vec<String>)>,
    entities: HashMap<String, EntityQueues>,
    faults: Vec<(FaultPoint, TransportError)>,
    delays: Vec<(FaultPoint, Duration)>,
    probe_delay: Option<Duration>,
    stats: BrokerStats,
}

impl BrokerState {
    fn take_fault(&mut self, point: FaultPoint) -> TransportResult<()> {
        match self.faults.iter().position(|(p, _)| *p == point) {
            Some(idx) => Err(self.faults.remove(idx).1),
            None => Ok(()),
        }
    }

    fn entity(&mut self, entity_path: &str) -> TransportResult<&mut EntityQueues> {
        self.entities
            .get_mut(entity_path)
            .ok_or_else(|| TransportError::NotFound(entity_path.to_string()))
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Store a send request on one entity, returning its sequence number.
    fn store(&mut self, entity_path: &str, request: &SendRequest) -> TransportResult<i64> {
        self.next_sequence += 1;
        let sequence_number = self.next_sequence;
        let message = ReceivedMessage {
            body: request.body.clone(),
            broker_properties: BrokerProperties {
                message_id: request.message_id.clone(),
                correlation_id: request.correlation_id.clone(),
                session_id: request.session_id.clone(),
                label: request.subject.clone(),
                to: request.to.clone(),
                reply_to: request.reply_to.clone(),
                reply_to_session_id: request.reply_to_session_id.clone(),
                content_type: request.content_type.clone(),
                sequence_number: Some(sequence_number),
                enqueued_sequence_number: Some(sequence_number),
                enqueued_time_utc: Some(Utc::now().to_rfc2822()),
                time_to_live: request.time_to_live_ms.map(|ms| ms as f64 / 1000.0),
                delivery_count: Some(0),
                state: Some("Active".into()),
                size: Some(request.body.len() as i64),
                ..Default::default()
            },
            custom_properties: request
                .application_properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            lock_token: None,
        };
        self.entity(entity_path)?.active.push(StoredMessage {
            message,
            lock: None,
            hidden_receives: 0,
        });
        Ok(sequence_number)
    }
}

/// Shared handle to an in-process namespace. Clones see the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_queue(&self, name: &str) {
        let mut state = self.state.lock().await;
        if !state.entities.contains_key(name) {
            state.queues.push(name.to_string());
            state.entities.insert(name.to_string(), EntityQueues::default());
        }
    }

    pub async fn create_topic(&self, name: &str) {
        let mut state = self.state.lock().await;
        if !state.topics.iter().any(|(t, _)| t == name) {
            state.topics.push((name.to_string(), Vec::new()));
        }
    }

    pub async fn create_subscription(&self, topic: &str, subscription: &str) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let path = EntityTarget::subscription(topic, subscription).entity_path();
        if let Some((_, subs)) = state.topics.iter_mut().find(|(t, _)| t == topic) {
            if !subs.iter().any(|s| s == subscription) {
                subs.push(subscription.to_string());
                state.entities.insert(path, EntityQueues::default());
            }
        }
    }

    /// Place a message directly on a queue or subscription.
    pub async fn enqueue(&self, target: &EntityTarget, request: SendRequest) -> TransportResult<i64> {
        self.state
            .lock()
            .await
            .store(&target.entity_path(), &request)
    }

    /// Move an active message to the dead-letter sub-queue, as the broker
    /// would on expiry or max-delivery.
    pub async fn dead_letter(&self, target: &EntityTarget, sequence_number: i64, reason: &str) -> bool {
        let mut state = self.state.lock().await;
        let Ok(entity) = state.entity(&target.entity_path()) else {
            return false;
        };
        let Some(idx) = entity
            .active
            .iter()
            .position(|m| m.sequence_number() == sequence_number)
        else {
            return false;
        };
        let mut stored = entity.active.remove(idx);
        stored.lock = None;
        stored.message.broker_properties.dead_letter_reason = Some(reason.to_string());
        stored.message.broker_properties.state = Some("DeadLettered".into());
        entity.dead_letter.push(stored);
        true
    }

    /// Hide a message from the next `receives` receive calls on its sub-queue.
    /// Peeks still see it.
    pub async fn hold(
        &self,
        target: &EntityTarget,
        sub_queue: SubQueue,
        sequence_number: i64,
        receives: usize,
    ) {
        let mut state = self.state.lock().await;
        if let Ok(entity) = state.entity(&target.entity_path()) {
            for m in entity.sub_queue(sub_queue).iter_mut() {
                if m.sequence_number() == sequence_number {
                    m.hidden_receives = receives;
                }
            }
        }
    }

    /// Fail the next call at `point` with `error`.
    pub async fn fail_next(&self, point: FaultPoint, error: TransportError) {
        self.state.lock().await.faults.push((point, error));
    }

    /// Stall the next call at `point` for `delay` before it runs.
    pub async fn delay_next(&self, point: FaultPoint, delay: Duration) {
        self.state.lock().await.delays.push((point, delay));
    }

    /// Sleeps off a queued delay without holding the state lock.
    async fn pause(&self, point: FaultPoint) {
        let delay = {
            let mut state = self.state.lock().await;
            match state.delays.iter().position(|(p, _)| *p == point) {
                Some(idx) => Some(state.delays.remove(idx).1),
                None => None,
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub async fn set_probe_delay(&self, delay: Duration) {
        self.state.lock().await.probe_delay = Some(delay);
    }

    pub async fn stats(&self) -> BrokerStats {
        self.state.lock().await.stats
    }

    /// Sequence numbers currently on a sub-queue, in order.
    pub async fn sequence_numbers(&self, target: &EntityTarget, sub_queue: SubQueue) -> Vec<i64> {
        let mut state = self.state.lock().await;
        match state.entity(&target.entity_path()) {
            Ok(entity) => entity
                .sub_queue(sub_queue)
                .iter()
                .map(StoredMessage::sequence_number)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Messages on a sub-queue currently held under a lock.
    pub async fn locked_count(&self, target: &EntityTarget, sub_queue: SubQueue) -> usize {
        let mut state = self.state.lock().await;
        match state.entity(&target.entity_path()) {
            Ok(entity) => entity
                .sub_queue(sub_queue)
                .iter()
                .filter(|m| m.lock.is_some())
                .count(),
            Err(_) => 0,
        }
    }

    fn page<T: Clone>(items: &[T], skip: usize, top: usize) -> Vec<T> {
        items.iter().skip(skip).take(top).cloned().collect()
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn probe(&self, _config: &ConnectionConfig) -> TransportResult<()> {
        let delay = {
            let mut state = self.state.lock().await;
            state.take_fault(FaultPoint::Probe)?;
            state.probe_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn open(&self, _config: &ConnectionConfig) -> TransportResult<BrokerHandles> {
        self.state.lock().await.take_fault(FaultPoint::Open)?;
        Ok(BrokerHandles {
            admin: Arc::new(self.clone()),
            data: Arc::new(self.clone()),
        })
    }
}

#[async_trait]
impl AdminTransport for InMemoryBroker {
    async fn list_queues(&self, skip: usize, top: usize) -> TransportResult<Vec<QueueDescription>> {
        self.pause(FaultPoint::ListQueues).await;
        let mut state = self.state.lock().await;
        state.take_fault(FaultPoint::ListQueues)?;
        Ok(Self::page(&state.queues, skip, top)
            .into_iter()
            .map(|name| QueueDescription {
                name,
                status: Some("Active".into()),
                ..Default::default()
            })
            .collect())
    }

    async fn queue_runtime_info(&self, name: &str) -> TransportResult<QueueRuntimeInfo> {
        self.pause(FaultPoint::QueueRuntime).await;
        let mut state = self.state.lock().await;
        state.take_fault(FaultPoint::QueueRuntime)?;
        if !state.queues.iter().any(|q| q == name) {
            return Err(TransportError::NotFound(name.to_string()));
        }
        let entity = state.entity(name)?;
        let active = entity.active.len() as i64;
        let dead_letter = entity.dead_letter.len() as i64;
        Ok(QueueRuntimeInfo {
            name: name.to_string(),
            message_count: active + dead_letter,
            active_message_count: active,
            dead_letter_message_count: dead_letter,
            ..Default::default()
        })
    }

    async fn list_topics(&self, skip: usize, top: usize) -> TransportResult<Vec<TopicDescription>> {
        self.pause(FaultPoint::ListTopics).await;
        let mut state = self.state.lock().await;
        state.take_fault(FaultPoint::ListTopics)?;
        let names: Vec<String> = state.topics.iter().map(|(t, _)| t.clone()).collect();
        Ok(Self::page(&names, skip, top)
            .into_iter()
            .map(|name| TopicDescription {
                name,
                status: Some("Active".into()),
            })
            .collect())
    }

    async fn list_subscriptions(
        &self,
        topic: &str,
        skip: usize,
        top: usize,
    ) -> TransportResult<Vec<SubscriptionDescription>> {
        self.pause(FaultPoint::ListSubscriptions).await;
        let mut state = self.state.lock().await;
        state.take_fault(FaultPoint::ListSubscriptions)?;
        let subs = state
            .topics
            .iter()
            .find(|(t, _)| t == topic)
            .map(|(_, subs)| subs.clone())
            .ok_or_else(|| TransportError::NotFound(topic.to_string()))?;
        Ok(Self::page(&subs, skip, top)
            .into_iter()
            .map(|name| SubscriptionDescription {
                name,
                topic_name: topic.to_string(),
                status: Some("Active".into()),
                ..Default::default()
            })
            .collect())
    }
}

#[async_trait]
impl DataTransport for InMemoryBroker {
    async fn open_receiver(
        &self,
        target: &EntityTarget,
        sub_queue: SubQueue,
    ) -> TransportResult<Box<dyn ReceiverLink>> {
        self.pause(FaultPoint::OpenReceiver).await;
        let mut state = self.state.lock().await;
        state.take_fault(FaultPoint::OpenReceiver)?;
        let entity_path = target.entity_path();
        state.entity(&entity_path)?;
        let id = state.next_id();
        state.stats.open_receivers += 1;
        Ok(Box::new(MemoryReceiver {
            broker: self.clone(),
            id,
            entity_path,
            sub_queue,
            closed: Mutex::new(false),
        }))
    }

    async fn open_sender(&self, entity_path: &str) -> TransportResult<Box<dyn SenderLink>> {
        let mut state = self.state.lock().await;
        let known = state.queues.iter().any(|q| q == entity_path)
            || state.topics.iter().any(|(t, _)| t == entity_path);
        if !known {
            return Err(TransportError::NotFound(entity_path.to_string()));
        }
        state.stats.open_senders += 1;
        Ok(Box::new(MemorySender {
            broker: self.clone(),
            entity_path: entity_path.to_string(),
            closed: Mutex::new(false),
        }))
    }

    async fn close(&self) -> TransportResult<()> {
        self.state.lock().await.stats.data_plane_closes += 1;
        Ok(())
    }
}

struct MemoryReceiver {
    broker: InMemoryBroker,
    id: u64,
    entity_path: String,
    sub_queue: SubQueue,
    closed: Mutex<bool>,
}

impl MemoryReceiver {
    fn lock_token(message: &ReceivedMessage) -> TransportResult<&str> {
        message
            .lock_token
            .as_deref()
            .ok_or_else(|| TransportError::Other(anyhow::anyhow!("message is not locked")))
    }

    fn lock_lost(token: &str) -> TransportError {
        TransportError::Api {
            status: 410,
            body: format!("MessageLockLost: lock {} is no longer held", token),
        }
    }
}

#[async_trait]
impl ReceiverLink for MemoryReceiver {
    async fn peek(
        &self,
        max: usize,
        from_sequence_number: i64,
    ) -> TransportResult<Vec<ReceivedMessage>> {
        self.broker.pause(FaultPoint::Peek).await;
        let mut state = self.broker.state.lock().await;
        state.take_fault(FaultPoint::Peek)?;
        state.stats.peek_calls += 1;
        let messages = state.entity(&self.entity_path)?.sub_queue(self.sub_queue);
        let mut peeked: Vec<ReceivedMessage> = messages
            .iter()
            .filter(|m| m.sequence_number() >= from_sequence_number)
            .map(|m| m.message.clone())
            .collect();
        peeked.sort_by_key(|m| m.sequence_number());
        peeked.truncate(max);
        Ok(peeked)
    }

    /// Never waits: an empty result is returned immediately.
    async fn receive(&self, max: usize, _wait: Duration) -> TransportResult<Vec<ReceivedMessage>> {
        self.broker.pause(FaultPoint::Receive).await;
        let mut state = self.broker.state.lock().await;
        state.take_fault(FaultPoint::Receive)?;
        state.stats.receive_calls += 1;

        let receiver_id = self.id;
        let messages = state.entity(&self.entity_path)?.sub_queue(self.sub_queue);
        let mut received = Vec::new();
        // Every receive call counts against holds, whether or not the batch fills
        for m in messages.iter_mut() {
            if m.hidden_receives > 0 {
                m.hidden_receives -= 1;
                continue;
            }
            if m.lock.is_some() || received.len() >= max {
                continue;
            }
            let count = m.message.broker_properties.delivery_count.unwrap_or(0) + 1;
            m.message.broker_properties.delivery_count = Some(count);
            let token = format!("lock-{}-{}-{}", receiver_id, m.sequence_number(), count);
            m.lock = Some((receiver_id, token.clone()));
            let mut copy = m.message.clone();
            copy.lock_token = Some(token);
            received.push(copy);
        }
        Ok(received)
    }

    async fn complete(&self, message: &ReceivedMessage) -> TransportResult<()> {
        self.broker.pause(FaultPoint::Complete).await;
        let token = Self::lock_token(message)?;
        let mut state = self.broker.state.lock().await;
        state.take_fault(FaultPoint::Complete)?;
        let messages = state.entity(&self.entity_path)?.sub_queue(self.sub_queue);
        let idx = messages
            .iter()
            .position(|m| m.lock.as_ref().map(|(_, t)| t.as_str()) == Some(token))
            .ok_or_else(|| Self::lock_lost(token))?;
        messages.remove(idx);
        state.stats.completed += 1;
        Ok(())
    }

    async fn abandon(&self, message: &ReceivedMessage) -> TransportResult<()> {
        self.broker.pause(FaultPoint::Abandon).await;
        let token = Self::lock_token(message)?;
        let mut state = self.broker.state.lock().await;
        state.take_fault(FaultPoint::Abandon)?;
        let messages = state.entity(&self.entity_path)?.sub_queue(self.sub_queue);
        let stored = messages
            .iter_mut()
            .find(|m| m.lock.as_ref().map(|(_, t)| t.as_str()) == Some(token))
            .ok_or_else(|| Self::lock_lost(token))?;
        stored.lock = None;
        state.stats.abandoned += 1;
        Ok(())
    }

    /// Releases every lock this receiver still holds.
    async fn close(&self) -> TransportResult<()> {
        let mut closed = self.closed.lock().await;
        if *closed {
            return Ok(());
        }
        *closed = true;
        let mut state = self.broker.state.lock().await;
        if let Ok(entity) = state.entity(&self.entity_path) {
            for m in entity.sub_queue(self.sub_queue).iter_mut() {
                if matches!(m.lock, Some((owner, _)) if owner == self.id) {
                    m.lock = None;
                }
            }
        }
        state.stats.open_receivers = state.stats.open_receivers.saturating_sub(1);
        Ok(())
    }
}

struct MemorySender {
    broker: InMemoryBroker,
    entity_path: String,
    closed: Mutex<bool>,
}

#[async_trait]
impl SenderLink for MemorySender {
    /// Queues receive the message; topics fan it out to every subscription.
    async fn send(&self, request: &SendRequest) -> TransportResult<()> {
        self.broker.pause(FaultPoint::Send).await;
        let mut state = self.broker.state.lock().await;
        state.take_fault(FaultPoint::Send)?;
        let fan_out: Option<Vec<String>> = state
            .topics
            .iter()
            .find(|(t, _)| *t == self.entity_path)
            .map(|(t, subs)| {
                subs.iter()
                    .map(|s| EntityTarget::subscription(t.as_str(), s.as_str()).entity_path())
                    .collect()
            });
        match fan_out {
            Some(paths) => {
                for path in paths {
                    state.store(&path, request)?;
                }
            }
            None => {
                state.store(&self.entity_path, request)?;
            }
        }
        state.stats.sent += 1;
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        let mut closed = self.closed.lock().await;
        if !*closed {
            *closed = true;
            let mut state = self.broker.state.lock().await;
            state.stats.open_senders = state.stats.open_senders.saturating_sub(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(text: &str) -> SendRequest {
        SendRequest {
            body: text.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn receive_locks_and_abandon_releases() {
        let broker = InMemoryBroker::new();
        broker.create_queue("q").await;
        let q = EntityTarget::queue("q");
        broker.enqueue(&q, body("a")).await.unwrap();
        broker.enqueue(&q, body("b")).await.unwrap();

        let rx = broker.open_receiver(&q, SubQueue::Active).await.unwrap();
        let batch = rx.receive(5, Duration::from_millis(0)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(broker.locked_count(&q, SubQueue::Active).await, 2);

        // Locked messages are not redelivered but are still visible to peek
        assert!(rx.receive(5, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(rx.peek(10, 1).await.unwrap().len(), 2);

        rx.abandon(&batch[0]).await.unwrap();
        rx.complete(&batch[1]).await.unwrap();
        assert_eq!(broker.sequence_numbers(&q, SubQueue::Active).await, vec![1]);
        assert_eq!(broker.locked_count(&q, SubQueue::Active).await, 0);
        rx.close().await.unwrap();
        assert_eq!(broker.stats().await.open_receivers, 0);
    }

    #[tokio::test]
    async fn close_releases_outstanding_locks() {
        let broker = InMemoryBroker::new();
        broker.create_queue("q").await;
        let q = EntityTarget::queue("q");
        broker.enqueue(&q, body("a")).await.unwrap();

        let rx = broker.open_receiver(&q, SubQueue::Active).await.unwrap();
        rx.receive(1, Duration::ZERO).await.unwrap();
        rx.close().await.unwrap();
        rx.close().await.unwrap();
        assert_eq!(broker.locked_count(&q, SubQueue::Active).await, 0);
        assert_eq!(broker.stats().await.open_receivers, 0);
    }

    #[tokio::test]
    async fn topic_send_fans_out() {
        let broker = InMemoryBroker::new();
        broker.create_topic("t").await;
        broker.create_subscription("t", "a").await;
        broker.create_subscription("t", "b").await;

        let tx = broker.open_sender("t").await.unwrap();
        tx.send(&body("x")).await.unwrap();
        tx.close().await.unwrap();

        for sub in ["a", "b"] {
            let target = EntityTarget::subscription("t", sub);
            assert_eq!(broker.sequence_numbers(&target, SubQueue::Active).await.len(), 1);
        }
        assert_eq!(broker.stats().await.open_senders, 0);
    }

    #[tokio::test]
    async fn held_message_skips_receives() {
        let broker = InMemoryBroker::new();
        broker.create_queue("q").await;
        let q = EntityTarget::queue("q");
        let seq = broker.enqueue(&q, body("a")).await.unwrap();
        broker.hold(&q, SubQueue::Active, seq, 1).await;

        let rx = broker.open_receiver(&q, SubQueue::Active).await.unwrap();
        assert!(rx.receive(1, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(rx.receive(1, Duration::ZERO).await.unwrap().len(), 1);
        rx.close().await.unwrap();
    }

    #[tokio::test]
    async fn faults_are_one_shot() {
        let broker = InMemoryBroker::new();
        broker
            .fail_next(FaultPoint::ListQueues, TransportError::Auth("denied".into()))
            .await;
        assert!(broker.list_queues(0, 10).await.is_err());
        assert!(broker.list_queues(0, 10).await.is_ok());
    }

    #[tokio::test]
    async fn delays_are_one_shot_and_per_call_site() {
        let broker = InMemoryBroker::new();
        broker.create_queue("q").await;
        broker.delay_next(FaultPoint::ListTopics, Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        broker.list_queues(0, 10).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));

        broker.list_topics(0, 10).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));

        let again = std::time::Instant::now();
        broker.list_topics(0, 10).await.unwrap();
        assert!(again.elapsed() < Duration::from_millis(200));
    }
}
