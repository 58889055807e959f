//! Message Mutator: locate a message by sequence number, then settle it.
//!
//! A message can only be settled while it is the subject of an active
//! receive, so deletion receives small batches until the target shows up,
//! abandoning everything else it picks up on the way. The search is bounded
//! by `locate_max_attempts`.

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker_call::{close_receiver, with_deadline};
use crate::client::error::{ErrorEnvelope, Result, ServiceBusError};
use crate::client::models::{EntityTarget, Message, ReceivedMessage, SubQueue, ViewMode};
use crate::client::transport::ReceiverLink;
use crate::config::ExplorerSettings;
use crate::sender::MessageSender;
use crate::session::Connection;

/// A completed delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    pub sequence_number: i64,
    /// Receive attempts consumed before the message was found, 1-based.
    pub attempts: u32,
}

/// What a resend actually did to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ResendOutcome {
    /// A copy was sent; the original was left where it was.
    Sent,
    /// A copy was sent and the dead-lettered original is gone.
    /// `attempts` is `None` when it was already absent.
    Moved { attempts: Option<u32> },
    /// A copy was sent but removing the dead-lettered original failed, so
    /// the message now exists twice.
    Duplicated { error: ErrorEnvelope },
}

pub struct MessageMutator<'a> {
    conn: &'a Connection,
    settings: &'a ExplorerSettings,
}

impl<'a> MessageMutator<'a> {
    pub fn new(conn: &'a Connection, settings: &'a ExplorerSettings) -> Self {
        Self { conn, settings }
    }

    /// Permanently remove `message` from `target` (or its dead-letter sub-queue).
    ///
    /// Fails with `MessageNotFound` if a peek from its sequence number does not
    /// return it, and with `ReceiveExhausted` if it never appears in a receive
    /// batch within the attempt bound.
    pub async fn delete_message(
        &self,
        target: &EntityTarget,
        message: &Message,
        is_dead_letter: bool,
    ) -> Result<DeleteReport> {
        let sequence_number = message
            .sequence_number
            .ok_or(ServiceBusError::MissingSequenceNumber)?;
        let sub_queue = SubQueue::from_dead_letter(is_dead_letter);

        let receiver = with_deadline(
            self.settings.operation_timeout(),
            "open receiver",
            self.conn.data().open_receiver(target, sub_queue),
        )
        .await?;

        let outcome = self.locate_and_complete(receiver.as_ref(), sequence_number).await;
        close_receiver(receiver, target).await;

        match &outcome {
            Ok(report) => info!(
                entity = %target,
                ?sub_queue,
                sequence_number,
                attempts = report.attempts,
                "deleted message"
            ),
            Err(e) => warn!(entity = %target, ?sub_queue, sequence_number, error = %e, "delete failed"),
        }
        outcome
    }

    async fn locate_and_complete(
        &self,
        receiver: &dyn ReceiverLink,
        sequence_number: i64,
    ) -> Result<DeleteReport> {
        let settle = self.settings.settle_delay();
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }

        let confirmed = with_deadline(
            self.settings.operation_timeout(),
            "peek message",
            receiver.peek(1, sequence_number),
        )
        .await?;
        if !confirmed
            .iter()
            .any(|m| m.sequence_number() == Some(sequence_number))
        {
            return Err(ServiceBusError::MessageNotFound { sequence_number });
        }

        let max_attempts = self.settings.locate_max_attempts;
        let wait = self.settings.locate_wait();
        let receive_limit = self.settings.operation_timeout().map(|t| t + wait);

        for attempt in 1..=max_attempts {
            let batch = with_deadline(
                receive_limit,
                "receive messages",
                receiver.receive(self.settings.locate_batch_size, wait),
            )
            .await?;

            let (mut matches, others): (Vec<ReceivedMessage>, Vec<ReceivedMessage>) = batch
                .into_iter()
                .partition(|m| m.sequence_number() == Some(sequence_number));
            debug!(attempt, received = others.len() + matches.len(), found = !matches.is_empty(), "locate attempt");

            // Non-matches go back before the match is settled
            let released = join_all(others.iter().map(|m| receiver.abandon(m))).await;
            for (msg, result) in others.iter().zip(released) {
                if let Err(e) = result {
                    warn!(sequence_number = ?msg.sequence_number(), error = %e, "failed to abandon message");
                }
            }

            if let Some(found) = matches.pop() {
                with_deadline(
                    self.settings.operation_timeout(),
                    "complete message",
                    receiver.complete(&found),
                )
                .await?;
                return Ok(DeleteReport {
                    sequence_number,
                    attempts: attempt,
                });
            }
        }

        Err(ServiceBusError::ReceiveExhausted {
            sequence_number,
            attempts: max_attempts,
        })
    }

    /// Send a copy of `message` to the live entity behind `target`. In
    /// receive mode the dead-lettered original is deleted afterwards.
    ///
    /// The two steps are not atomic: a failed delete after a successful send
    /// is reported as [`ResendOutcome::Duplicated`].
    pub async fn resend_message(
        &self,
        target: &EntityTarget,
        message: &Message,
        mode: ViewMode,
    ) -> Result<ResendOutcome> {
        if mode == ViewMode::Receive && message.sequence_number.is_none() {
            return Err(ServiceBusError::MissingSequenceNumber);
        }

        MessageSender::new(self.conn, self.settings)
            .send(target.send_path(), message)
            .await?;

        if mode == ViewMode::Peek {
            return Ok(ResendOutcome::Sent);
        }

        match self.delete_message(target, message, true).await {
            Ok(report) => Ok(ResendOutcome::Moved {
                attempts: Some(report.attempts),
            }),
            Err(ServiceBusError::MessageNotFound { .. }) => Ok(ResendOutcome::Moved { attempts: None }),
            Err(e) => {
                warn!(entity = %target, error = %e, "resent message left in dead-letter queue");
                Ok(ResendOutcome::Duplicated {
                    error: e.to_envelope(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::client::error::{ErrorKind, TransportError};
    use crate::client::memory::{FaultPoint, InMemoryBroker};
    use crate::client::models::SendRequest;
    use crate::session::Session;

    const CONN: &str = "Endpoint=sb://contoso.servicebus.windows.net/;SharedAccessKeyName=k;SharedAccessKey=s";

    async fn setup(messages: usize) -> (InMemoryBroker, Session, EntityTarget) {
        let broker = InMemoryBroker::new();
        broker.create_queue("orders").await;
        let orders = EntityTarget::queue("orders");
        for i in 0..messages {
            broker
                .enqueue(
                    &orders,
                    SendRequest {
                        body: format!("m{}", i),
                        message_id: Some(format!("id-{}", i)),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        let settings = ExplorerSettings {
            settle_delay_ms: 0,
            ..Default::default()
        };
        let mut session = Session::new(Arc::new(broker.clone()), settings);
        session.connect(CONN).await.unwrap();
        (broker, session, orders)
    }

    fn with_seq(seq: i64) -> Message {
        Message {
            sequence_number: Some(seq),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_sequence_number_is_rejected_up_front() {
        let (broker, session, orders) = setup(1).await;
        let err = session
            .mutator()
            .unwrap()
            .delete_message(&orders, &Message::default(), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingSequenceNumber);
        assert_eq!(broker.stats().await.open_receivers, 0);
        assert_eq!(broker.stats().await.peek_calls, 0);
    }

    #[tokio::test]
    async fn deletes_only_the_target() {
        let (broker, session, orders) = setup(3).await;
        let report = session
            .mutator()
            .unwrap()
            .delete_message(&orders, &with_seq(2), false)
            .await
            .unwrap();
        assert_eq!(report, DeleteReport { sequence_number: 2, attempts: 1 });
        assert_eq!(broker.sequence_numbers(&orders, SubQueue::Active).await, vec![1, 3]);
        assert_eq!(broker.locked_count(&orders, SubQueue::Active).await, 0);
        let stats = broker.stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.abandoned, 2);
        assert_eq!(stats.open_receivers, 0);
    }

    #[tokio::test]
    async fn confirmation_peek_requires_exact_sequence_number() {
        let (broker, session, orders) = setup(3).await;
        let mutator = session.mutator().unwrap();
        mutator.delete_message(&orders, &with_seq(2), false).await.unwrap();

        // Sequence 3 follows the deleted 2, but that is not a match
        let err = mutator
            .delete_message(&orders, &with_seq(2), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceBusError::MessageNotFound { sequence_number: 2 }));
        assert_eq!(broker.stats().await.receive_calls, 1);
    }

    #[tokio::test]
    async fn abandon_failure_does_not_abort_the_search() {
        let (broker, session, orders) = setup(2).await;
        broker
            .fail_next(FaultPoint::Abandon, TransportError::Other(anyhow::anyhow!("link detached")))
            .await;
        let report = session
            .mutator()
            .unwrap()
            .delete_message(&orders, &with_seq(2), false)
            .await
            .unwrap();
        assert_eq!(report.attempts, 1);
        // Closing the receiver released the lock the failed abandon left behind
        assert_eq!(broker.locked_count(&orders, SubQueue::Active).await, 0);
    }

    #[tokio::test]
    async fn complete_failure_is_classified() {
        let (broker, session, orders) = setup(1).await;
        broker
            .fail_next(FaultPoint::Complete, TransportError::Api { status: 401, body: "ExpiredToken".into() })
            .await;
        let err = session
            .mutator()
            .unwrap()
            .delete_message(&orders, &with_seq(1), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(broker.sequence_numbers(&orders, SubQueue::Active).await, vec![1]);
        assert_eq!(broker.locked_count(&orders, SubQueue::Active).await, 0);
    }

    #[tokio::test]
    async fn resend_in_peek_mode_leaves_original() {
        let (broker, session, orders) = setup(1).await;
        assert!(broker.dead_letter(&orders, 1, "TTLExpired").await);
        let dead = session.browser().unwrap().peek(&orders, 10, true).await.unwrap();

        let outcome = session
            .mutator()
            .unwrap()
            .resend_message(&orders, &dead[0], ViewMode::Peek)
            .await
            .unwrap();
        assert_eq!(outcome, ResendOutcome::Sent);
        assert_eq!(broker.sequence_numbers(&orders, SubQueue::DeadLetter).await, vec![1]);
        assert_eq!(broker.sequence_numbers(&orders, SubQueue::Active).await, vec![2]);
    }

    #[tokio::test]
    async fn resend_in_receive_mode_moves() {
        let (broker, session, orders) = setup(1).await;
        assert!(broker.dead_letter(&orders, 1, "TTLExpired").await);
        let dead = session.browser().unwrap().peek(&orders, 10, true).await.unwrap();

        let outcome = session
            .mutator()
            .unwrap()
            .resend_message(&orders, &dead[0], ViewMode::Receive)
            .await
            .unwrap();
        assert_eq!(outcome, ResendOutcome::Moved { attempts: Some(1) });
        assert!(broker.sequence_numbers(&orders, SubQueue::DeadLetter).await.is_empty());
        assert_eq!(broker.sequence_numbers(&orders, SubQueue::Active).await, vec![2]);
    }

    #[tokio::test]
    async fn resend_without_sequence_number_in_receive_mode_sends_nothing() {
        let (broker, session, orders) = setup(0).await;
        let err = session
            .mutator()
            .unwrap()
            .resend_message(&orders, &Message::default(), ViewMode::Receive)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingSequenceNumber);
        assert_eq!(broker.stats().await.sent, 0);
    }
}
