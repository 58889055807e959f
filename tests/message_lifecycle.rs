use std::sync::Arc;

use sb_explorer::client::error::TransportError;
use sb_explorer::client::memory::{FaultPoint, InMemoryBroker};
use sb_explorer::client::models::{EntityTarget, Message, SendRequest, SubQueue, ViewMode};
use sb_explorer::config::ExplorerSettings;
use sb_explorer::mutator::ResendOutcome;
use sb_explorer::session::Session;
use sb_explorer::{ErrorKind, ServiceBusError};

const CONTOSO: &str = "Endpoint=sb://contoso.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=c2VjcmV0";

fn settings() -> ExplorerSettings {
    ExplorerSettings {
        settle_delay_ms: 0,
        ..Default::default()
    }
}

async fn queue_with(broker: &InMemoryBroker, name: &str, count: usize) -> EntityTarget {
    broker.create_queue(name).await;
    let target = EntityTarget::queue(name);
    for i in 0..count {
        broker
            .enqueue(
                &target,
                SendRequest {
                    body: format!("{{\"index\":{}}}", i),
                    content_type: Some("application/json".into()),
                    message_id: Some(format!("{}-{}", name, i)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }
    target
}

async fn connect(broker: &InMemoryBroker, settings: ExplorerSettings) -> Session {
    let mut session = Session::new(Arc::new(broker.clone()), settings);
    session.connect(CONTOSO).await.unwrap();
    session
}

fn by_sequence(seq: i64) -> Message {
    Message {
        sequence_number: Some(seq),
        ..Default::default()
    }
}

#[tokio::test]
async fn queue_counters_add_up() {
    let broker = InMemoryBroker::new();
    let q1 = queue_with(&broker, "q1", 7).await;
    for seq in [2, 5] {
        assert!(broker.dead_letter(&q1, seq, "MaxDeliveryCountExceeded").await);
    }
    let session = connect(&broker, settings()).await;

    let queues = session.directory().unwrap().list_queues().await.unwrap();
    assert_eq!(queues.len(), 1);
    assert_eq!(queues[0].name, "q1");
    assert_eq!(queues[0].message_count, 7);
    assert_eq!(queues[0].active_message_count, 5);
    assert_eq!(queues[0].dead_letter_count, 2);
}

#[tokio::test]
async fn peek_is_repeatable() {
    let broker = InMemoryBroker::new();
    let q1 = queue_with(&broker, "q1", 4).await;
    let session = connect(&broker, settings()).await;
    let browser = session.browser().unwrap();

    let first = browser.peek(&q1, 10, false).await.unwrap();
    let second = browser.peek(&q1, 10, false).await.unwrap();
    let seqs = |msgs: &[Message]| msgs.iter().filter_map(|m| m.sequence_number).collect::<Vec<_>>();
    assert_eq!(seqs(&first), vec![1, 2, 3, 4]);
    assert_eq!(seqs(&first), seqs(&second));
    assert_eq!(first[0].body["index"], 0);
    assert_eq!(broker.stats().await.open_receivers, 0);
}

#[tokio::test]
async fn empty_queue_peeks_empty() {
    let broker = InMemoryBroker::new();
    let q1 = queue_with(&broker, "q1", 0).await;
    let session = connect(&broker, settings()).await;
    let msgs = session.browser().unwrap().peek(&q1, 10, false).await.unwrap();
    assert!(msgs.is_empty());
}

#[tokio::test]
async fn delete_found_on_third_attempt() {
    let broker = InMemoryBroker::new();
    let q1 = queue_with(&broker, "q1", 4).await;
    // Another consumer holds the target through the first two receives
    broker.hold(&q1, SubQueue::Active, 3, 2).await;
    let session = connect(&broker, settings()).await;

    let report = session
        .mutator()
        .unwrap()
        .delete_message(&q1, &by_sequence(3), false)
        .await
        .unwrap();
    assert_eq!(report.attempts, 3);

    let stats = broker.stats().await;
    assert_eq!(stats.receive_calls, 3);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.open_receivers, 0);
    assert_eq!(broker.locked_count(&q1, SubQueue::Active).await, 0);

    let remaining: Vec<i64> = session
        .browser()
        .unwrap()
        .peek(&q1, 10, false)
        .await
        .unwrap()
        .iter()
        .filter_map(|m| m.sequence_number)
        .collect();
    assert_eq!(remaining, vec![1, 2, 4]);
}

#[tokio::test]
async fn delete_gives_up_after_the_attempt_bound() {
    let broker = InMemoryBroker::new();
    let q1 = queue_with(&broker, "q1", 3).await;
    broker.hold(&q1, SubQueue::Active, 2, 100).await;
    let session = connect(&broker, settings()).await;

    let err = session
        .mutator()
        .unwrap()
        .delete_message(&q1, &by_sequence(2), false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceBusError::ReceiveExhausted { sequence_number: 2, attempts: 5 }
    ));
    assert_eq!(broker.stats().await.receive_calls, 5);
    assert_eq!(broker.sequence_numbers(&q1, SubQueue::Active).await, vec![1, 2, 3]);
    assert_eq!(broker.locked_count(&q1, SubQueue::Active).await, 0);
    assert_eq!(broker.stats().await.open_receivers, 0);
}

#[tokio::test]
async fn attempt_bound_is_configurable() {
    let broker = InMemoryBroker::new();
    let q1 = queue_with(&broker, "q1", 1).await;
    broker.hold(&q1, SubQueue::Active, 1, 100).await;
    let session = connect(
        &broker,
        ExplorerSettings {
            locate_max_attempts: 2,
            ..settings()
        },
    )
    .await;

    let err = session
        .mutator()
        .unwrap()
        .delete_message(&q1, &by_sequence(1), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReceiveExhausted);
    assert_eq!(broker.stats().await.receive_calls, 2);
}

#[tokio::test]
async fn deleted_message_is_not_found_again() {
    let broker = InMemoryBroker::new();
    let q1 = queue_with(&broker, "q1", 2).await;
    let session = connect(&broker, settings()).await;
    let mutator = session.mutator().unwrap();

    mutator.delete_message(&q1, &by_sequence(1), false).await.unwrap();
    let err = mutator
        .delete_message(&q1, &by_sequence(1), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MessageNotFound);
}

#[tokio::test]
async fn dead_letter_delete_leaves_active_untouched() {
    let broker = InMemoryBroker::new();
    let q1 = queue_with(&broker, "q1", 3).await;
    assert!(broker.dead_letter(&q1, 2, "TTLExpiredException").await);
    let session = connect(&broker, settings()).await;

    let report = session
        .mutator()
        .unwrap()
        .delete_message(&q1, &by_sequence(2), true)
        .await
        .unwrap();
    assert_eq!(report.attempts, 1);
    assert!(broker.sequence_numbers(&q1, SubQueue::DeadLetter).await.is_empty());
    assert_eq!(broker.sequence_numbers(&q1, SubQueue::Active).await, vec![1, 3]);
}

#[tokio::test]
async fn resend_moves_out_of_dead_letter() {
    let broker = InMemoryBroker::new();
    let q1 = queue_with(&broker, "q1", 1).await;
    assert!(broker.dead_letter(&q1, 1, "MaxDeliveryCountExceeded").await);
    let session = connect(&broker, settings()).await;
    let dead = session.browser().unwrap().peek(&q1, 10, true).await.unwrap();

    let outcome = session
        .mutator()
        .unwrap()
        .resend_message(&q1, &dead[0], ViewMode::Receive)
        .await
        .unwrap();
    assert!(matches!(outcome, ResendOutcome::Moved { attempts: Some(1) }));

    let dlq = session.browser().unwrap().peek(&q1, 10, true).await.unwrap();
    assert!(dlq.is_empty());
    let active = session.browser().unwrap().peek(&q1, 10, false).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].message_id.as_deref(), Some("q1-0"));
    assert_eq!(active[0].body, dead[0].body);
}

#[tokio::test]
async fn resend_partial_failure_is_reported_as_duplicate() {
    let broker = InMemoryBroker::new();
    let q1 = queue_with(&broker, "q1", 1).await;
    assert!(broker.dead_letter(&q1, 1, "MaxDeliveryCountExceeded").await);
    let session = connect(&broker, settings()).await;
    let dead = session.browser().unwrap().peek(&q1, 10, true).await.unwrap();

    broker
        .fail_next(
            FaultPoint::Complete,
            TransportError::Api {
                status: 503,
                body: "ServerBusy".into(),
            },
        )
        .await;
    let outcome = session
        .mutator()
        .unwrap()
        .resend_message(&q1, &dead[0], ViewMode::Receive)
        .await
        .unwrap();
    match outcome {
        ResendOutcome::Duplicated { error } => {
            assert_eq!(error.kind, Some(ErrorKind::ServiceBusError));
            assert!(error.details.unwrap().contains("ServerBusy"));
        }
        other => panic!("expected a duplicate, got {:?}", other),
    }

    // Both copies are observable
    assert_eq!(broker.sequence_numbers(&q1, SubQueue::DeadLetter).await, vec![1]);
    assert_eq!(broker.sequence_numbers(&q1, SubQueue::Active).await, vec![2]);
    assert_eq!(broker.locked_count(&q1, SubQueue::DeadLetter).await, 0);
}

#[tokio::test]
async fn subscription_round_trip() {
    let broker = InMemoryBroker::new();
    broker.create_topic("events").await;
    broker.create_subscription("events", "audit").await;
    broker.create_subscription("events", "billing").await;
    let session = connect(&broker, settings()).await;

    let message = Message {
        body: serde_json::json!({"kind": "signup"}),
        content_type: Some("application/json".into()),
        ..Default::default()
    };
    session.sender().unwrap().send("events", &message).await.unwrap();

    let audit = EntityTarget::subscription("events", "audit");
    let billing = EntityTarget::subscription("events", "billing");
    let peeked = session.browser().unwrap().peek(&audit, 10, false).await.unwrap();
    assert_eq!(peeked.len(), 1);
    assert_eq!(peeked[0].body["kind"], "signup");

    let seq = peeked[0].sequence_number.unwrap();
    session
        .mutator()
        .unwrap()
        .delete_message(&audit, &peeked[0], false)
        .await
        .unwrap();
    assert!(broker.sequence_numbers(&audit, SubQueue::Active).await.is_empty());
    // Deleting from one subscription leaves the other's copy alone
    assert_eq!(broker.sequence_numbers(&billing, SubQueue::Active).await.len(), 1);
    assert!(!broker.sequence_numbers(&billing, SubQueue::Active).await.contains(&seq));
}

#[tokio::test]
async fn subscription_resend_goes_through_the_topic() {
    let broker = InMemoryBroker::new();
    broker.create_topic("events").await;
    broker.create_subscription("events", "audit").await;
    let audit = EntityTarget::subscription("events", "audit");
    broker
        .enqueue(
            &audit,
            SendRequest {
                body: "late".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(broker.dead_letter(&audit, 1, "TTLExpiredException").await);
    let session = connect(&broker, settings()).await;
    let dead = session.browser().unwrap().peek(&audit, 10, true).await.unwrap();

    let outcome = session
        .mutator()
        .unwrap()
        .resend_message(&audit, &dead[0], ViewMode::Peek)
        .await
        .unwrap();
    assert_eq!(outcome, ResendOutcome::Sent);
    assert_eq!(broker.sequence_numbers(&audit, SubQueue::Active).await, vec![2]);
    assert_eq!(broker.sequence_numbers(&audit, SubQueue::DeadLetter).await, vec![1]);
}

#[tokio::test]
async fn operations_after_disconnect_are_not_connected() {
    let broker = InMemoryBroker::new();
    let q1 = queue_with(&broker, "q1", 1).await;
    let mut session = connect(&broker, settings()).await;
    session.disconnect().await;

    assert_eq!(session.browser().err().map(|e| e.kind()), Some(ErrorKind::NotConnected));
    assert_eq!(session.mutator().err().map(|e| e.kind()), Some(ErrorKind::NotConnected));
    assert_eq!(session.sender().err().map(|e| e.kind()), Some(ErrorKind::NotConnected));
    assert_eq!(broker.sequence_numbers(&q1, SubQueue::Active).await, vec![1]);
}
