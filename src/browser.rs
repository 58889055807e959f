//! Message Browser: non-destructive reads of active and dead-letter messages.

use tracing::debug;

use crate::broker_call::{close_receiver, with_deadline};
use crate::client::error::Result;
use crate::client::models::{EntityTarget, Message, SubQueue};
use crate::config::ExplorerSettings;
use crate::session::Connection;

/// Peeks start at the first sequence number the broker could hold.
const FIRST_SEQUENCE_NUMBER: i64 = 1;

pub struct MessageBrowser<'a> {
    conn: &'a Connection,
    settings: &'a ExplorerSettings,
}

impl<'a> MessageBrowser<'a> {
    pub fn new(conn: &'a Connection, settings: &'a ExplorerSettings) -> Self {
        Self { conn, settings }
    }

    /// Up to `max` messages from the head of `target`'s active or
    /// dead-letter sub-queue, in ascending sequence-number order.
    ///
    /// Nothing is locked or removed. The receiver opened for the peek is
    /// closed whether or not the peek succeeds.
    pub async fn peek(
        &self,
        target: &EntityTarget,
        max: usize,
        is_dead_letter: bool,
    ) -> Result<Vec<Message>> {
        let sub_queue = SubQueue::from_dead_letter(is_dead_letter);
        let receiver = with_deadline(
            self.settings.operation_timeout(),
            "open receiver",
            self.conn.data().open_receiver(target, sub_queue),
        )
        .await?;

        let settle = self.settings.settle_delay();
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }

        let peeked = with_deadline(
            self.settings.operation_timeout(),
            "peek messages",
            receiver.peek(max, FIRST_SEQUENCE_NUMBER),
        )
        .await;
        close_receiver(receiver, target).await;

        let mut peeked = peeked?;
        peeked.truncate(max);
        debug!(entity = %target, ?sub_queue, count = peeked.len(), "peeked messages");
        Ok(peeked.iter().map(Message::from_received).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::client::error::{ErrorKind, ServiceBusError, TransportError};
    use crate::client::memory::{FaultPoint, InMemoryBroker};
    use crate::client::models::SendRequest;
    use crate::session::Session;

    const CONN: &str = "Endpoint=sb://contoso.servicebus.windows.net/;SharedAccessKeyName=k;SharedAccessKey=s";

    fn settings() -> ExplorerSettings {
        ExplorerSettings {
            settle_delay_ms: 0,
            ..Default::default()
        }
    }

    async fn seeded(count: usize) -> (InMemoryBroker, Session) {
        let broker = InMemoryBroker::new();
        broker.create_queue("orders").await;
        let orders = EntityTarget::queue("orders");
        for i in 0..count {
            broker
                .enqueue(
                    &orders,
                    SendRequest {
                        body: format!("{{\"n\":{}}}", i),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        let mut session = Session::new(Arc::new(broker.clone()), settings());
        session.connect(CONN).await.unwrap();
        (broker, session)
    }

    #[tokio::test]
    async fn peek_is_bounded_ordered_and_non_destructive() {
        let (broker, session) = seeded(5).await;
        let orders = EntityTarget::queue("orders");
        let browser = session.browser().unwrap();

        let first = browser.peek(&orders, 3, false).await.unwrap();
        let seqs: Vec<i64> = first.iter().filter_map(|m| m.sequence_number).collect();
        assert_eq!(seqs, [1, 2, 3]);

        let again = browser.peek(&orders, 3, false).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(broker.sequence_numbers(&orders, SubQueue::Active).await.len(), 5);
        assert_eq!(broker.stats().await.open_receivers, 0);
    }

    #[tokio::test]
    async fn empty_entity_peeks_empty() {
        let (_broker, session) = seeded(0).await;
        let msgs = session
            .browser()
            .unwrap()
            .peek(&EntityTarget::queue("orders"), 10, true)
            .await
            .unwrap();
        assert!(msgs.is_empty());
    }

    #[tokio::test]
    async fn dead_letter_peek_only_sees_dead_letters() {
        let (broker, session) = seeded(3).await;
        let orders = EntityTarget::queue("orders");
        assert!(broker.dead_letter(&orders, 2, "MaxDeliveryCountExceeded").await);

        let dlq = session.browser().unwrap().peek(&orders, 10, true).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].sequence_number, Some(2));
        assert_eq!(
            dlq[0].system_properties["headers"]["deadLetterReason"],
            "MaxDeliveryCountExceeded"
        );
    }

    #[tokio::test]
    async fn receiver_is_closed_when_peek_fails() {
        let (broker, session) = seeded(1).await;
        broker
            .fail_next(FaultPoint::Peek, TransportError::Other(anyhow::anyhow!("link detached")))
            .await;
        let err = session
            .browser()
            .unwrap()
            .peek(&EntityTarget::queue("orders"), 10, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceBusError);
        assert_eq!(broker.stats().await.open_receivers, 0);
    }

    #[tokio::test]
    async fn slow_peek_times_out_and_closes_receiver() {
        let broker = InMemoryBroker::new();
        broker.create_queue("orders").await;
        let settings = ExplorerSettings {
            operation_timeout_ms: 20,
            ..settings()
        };
        let mut session = Session::new(Arc::new(broker.clone()), settings);
        session.connect(CONN).await.unwrap();
        broker.delay_next(FaultPoint::Peek, Duration::from_millis(200)).await;

        let err = session
            .browser()
            .unwrap()
            .peek(&EntityTarget::queue("orders"), 10, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(matches!(
            err,
            ServiceBusError::Timeout { operation: "peek messages", after_ms: 20 }
        ));
        assert_eq!(broker.stats().await.open_receivers, 0);
    }
}
