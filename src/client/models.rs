use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ──────────────────────────── Entity addressing ────────────────────────────

/// A browsable entity: a queue, or a subscription under a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityTarget {
    Subscription {
        #[serde(rename = "topicName")]
        topic: String,
        #[serde(rename = "subscriptionName")]
        subscription: String,
    },
    Queue {
        #[serde(rename = "queueName")]
        queue: String,
    },
}

impl EntityTarget {
    pub fn queue(name: impl Into<String>) -> Self {
        Self::Queue { queue: name.into() }
    }

    pub fn subscription(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self::Subscription {
            topic: topic.into(),
            subscription: subscription.into(),
        }
    }

    /// Parse `queue`, `topic/subscription` or `topic/Subscriptions/subscription`.
    pub fn parse(text: &str) -> Self {
        let parts: Vec<&str> = text.split('/').collect();
        match parts.as_slice() {
            [topic, marker, sub] if marker.eq_ignore_ascii_case("subscriptions") => {
                Self::subscription(*topic, *sub)
            }
            [topic, sub] => Self::subscription(*topic, *sub),
            _ => Self::queue(text),
        }
    }

    /// Path of the entity relative to the namespace root.
    pub fn entity_path(&self) -> String {
        match self {
            Self::Queue { queue } => queue.clone(),
            Self::Subscription {
                topic,
                subscription,
            } => format!("{}/Subscriptions/{}", topic, subscription),
        }
    }

    /// The live entity a message for this target is sent to.
    /// Subscriptions are fed by their topic.
    pub fn send_path(&self) -> &str {
        match self {
            Self::Queue { queue } => queue,
            Self::Subscription { topic, .. } => topic,
        }
    }
}

impl fmt::Display for EntityTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue { queue } => f.write_str(queue),
            Self::Subscription {
                topic,
                subscription,
            } => write!(f, "{}/{}", topic, subscription),
        }
    }
}

/// Which sub-queue of an entity a receiver is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubQueue {
    Active,
    DeadLetter,
}

impl SubQueue {
    pub fn from_dead_letter(is_dead_letter: bool) -> Self {
        if is_dead_letter {
            Self::DeadLetter
        } else {
            Self::Active
        }
    }

    pub fn scoped_path(self, entity_path: &str) -> String {
        match self {
            Self::Active => entity_path.to_string(),
            Self::DeadLetter => format!("{}/$deadletterqueue", entity_path),
        }
    }
}

/// How the caller is viewing an entity; decides whether a resend from the
/// dead-letter queue also removes the dead-lettered copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    #[default]
    Peek,
    Receive,
}

// ──────────────────────────── Directory Models ────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueueDescription {
    pub name: String,
    pub status: Option<String>,
    pub requires_session: Option<bool>,
    pub max_delivery_count: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueueRuntimeInfo {
    pub name: String,
    pub message_count: i64,
    pub active_message_count: i64,
    pub dead_letter_message_count: i64,
    pub scheduled_message_count: i64,
    pub transfer_message_count: i64,
    pub transfer_dead_letter_message_count: i64,
    pub size_in_bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopicDescription {
    pub name: String,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubscriptionDescription {
    pub name: String,
    pub topic_name: String,
    pub status: Option<String>,
    pub requires_session: Option<bool>,
    pub max_delivery_count: Option<i32>,
}

/// A queue with its message counters, as shown in the namespace tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub name: String,
    pub message_count: i64,
    pub active_message_count: i64,
    pub dead_letter_count: i64,
}

impl QueueSummary {
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            message_count: 0,
            active_message_count: 0,
            dead_letter_count: 0,
        }
    }

    pub fn from_runtime(name: &str, info: &QueueRuntimeInfo) -> Self {
        Self {
            name: name.to_string(),
            message_count: info.message_count,
            active_message_count: info.active_message_count,
            dead_letter_count: info.dead_letter_message_count,
        }
    }
}

/// Result of a successful connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceInfo {
    pub namespace_name: String,
    pub endpoint: String,
}

// ──────────────────────────── Wire Models ────────────────────────────

/// Broker-side metadata of a received or peeked message.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BrokerProperties {
    #[serde(rename = "MessageId", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(rename = "CorrelationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(rename = "SessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "Label", skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "To", skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(rename = "ReplyTo", skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(rename = "ReplyToSessionId", skip_serializing_if = "Option::is_none")]
    pub reply_to_session_id: Option<String>,
    #[serde(rename = "ContentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(rename = "SequenceNumber", skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<i64>,
    #[serde(rename = "EnqueuedSequenceNumber", skip_serializing_if = "Option::is_none")]
    pub enqueued_sequence_number: Option<i64>,
    #[serde(rename = "EnqueuedTimeUtc", skip_serializing_if = "Option::is_none")]
    pub enqueued_time_utc: Option<String>,
    #[serde(rename = "LockedUntilUtc", skip_serializing_if = "Option::is_none")]
    pub locked_until_utc: Option<String>,
    #[serde(rename = "LockToken", skip_serializing_if = "Option::is_none")]
    pub lock_token: Option<String>,
    /// Seconds.
    #[serde(rename = "TimeToLive", skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<f64>,
    #[serde(rename = "DeliveryCount", skip_serializing_if = "Option::is_none")]
    pub delivery_count: Option<i32>,
    #[serde(rename = "DeadLetterSource", skip_serializing_if = "Option::is_none")]
    pub dead_letter_source: Option<String>,
    #[serde(rename = "DeadLetterReason", skip_serializing_if = "Option::is_none")]
    pub dead_letter_reason: Option<String>,
    #[serde(rename = "DeadLetterErrorDescription", skip_serializing_if = "Option::is_none")]
    pub dead_letter_error_description: Option<String>,
    #[serde(rename = "State", skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(rename = "PartitionKey", skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(rename = "Size", skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

/// A message as delivered by a transport's receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub body: String,
    pub broker_properties: BrokerProperties,
    pub custom_properties: Vec<(String, Value)>,
    /// Opaque settlement handle for lock-mode receives (the lock URI on REST).
    /// `None` for peeked messages.
    pub lock_token: Option<String>,
}

impl ReceivedMessage {
    pub fn sequence_number(&self) -> Option<i64> {
        self.broker_properties.sequence_number
    }
}

/// A send request as handed to a transport sender.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SendRequest {
    pub body: String,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub session_id: Option<String>,
    pub subject: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_session_id: Option<String>,
    pub time_to_live_ms: Option<u64>,
    pub application_properties: BTreeMap<String, Value>,
}

// ──────────────────────────── Normalized Message ────────────────────────────

/// Uniform representation of a peeked, received or to-be-sent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Structured JSON, or a JSON string holding raw text.
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<i64>,
    #[serde(default)]
    pub application_properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub system_properties: BTreeMap<String, Value>,
}

impl Message {
    /// Normalize a wire message.
    pub fn from_received(msg: &ReceivedMessage) -> Self {
        let bp = &msg.broker_properties;
        let application_properties: BTreeMap<String, Value> =
            msg.custom_properties.iter().cloned().collect();

        let mut system_properties = application_properties.clone();
        system_properties.insert("headers".into(), broker_headers(bp));

        Self {
            message_id: bp.message_id.clone(),
            body: body_from_wire(&msg.body, bp.content_type.as_deref()),
            content_type: Some(
                bp.content_type
                    .clone()
                    .unwrap_or_else(|| "text/plain".to_string()),
            ),
            correlation_id: bp.correlation_id.clone(),
            subject: bp.label.clone(),
            to: bp.to.clone(),
            reply_to: bp.reply_to.clone(),
            reply_to_session_id: bp.reply_to_session_id.clone(),
            session_id: bp.session_id.clone(),
            time_to_live: bp
                .time_to_live
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(|s| (s * 1000.0).round() as u64),
            enqueued_time: bp.enqueued_time_utc.as_deref().and_then(parse_broker_time),
            sequence_number: bp.sequence_number,
            application_properties,
            system_properties,
        }
    }

    /// Map the sendable fields onto a wire send request. Broker-assigned
    /// fields (sequence number, enqueued time, system properties) are dropped.
    pub fn to_send_request(&self) -> SendRequest {
        SendRequest {
            body: body_to_wire(&self.body),
            content_type: self.content_type.clone(),
            message_id: self.message_id.clone(),
            correlation_id: self.correlation_id.clone(),
            session_id: self.session_id.clone(),
            subject: self.subject.clone(),
            to: self.to.clone(),
            reply_to: self.reply_to.clone(),
            reply_to_session_id: self.reply_to_session_id.clone(),
            time_to_live_ms: self.time_to_live,
            application_properties: self.application_properties.clone(),
        }
    }
}

/// Interpret a wire body: JSON documents become structured values, anything
/// else is kept as raw text.
pub fn body_from_wire(body: &str, content_type: Option<&str>) -> Value {
    let declared_json = content_type
        .map(|ct| ct.to_ascii_lowercase().contains("json"))
        .unwrap_or(false);
    match serde_json::from_str::<Value>(body) {
        Ok(v) if declared_json || v.is_object() || v.is_array() => v,
        _ => Value::String(body.to_string()),
    }
}

/// Inverse of [`body_from_wire`]: strings go out verbatim, other values as JSON text.
pub fn body_to_wire(body: &Value) -> String {
    match body {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Broker timestamps arrive as RFC 1123 on REST; RFC 3339 is accepted too.
fn parse_broker_time(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(text)
        .or_else(|_| DateTime::parse_from_rfc3339(text))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn broker_headers(bp: &BrokerProperties) -> Value {
    let mut headers = serde_json::Map::new();
    let mut put = |key: &str, value: Option<Value>| {
        if let Some(v) = value {
            headers.insert(key.to_string(), v);
        }
    };
    put("deliveryCount", bp.delivery_count.map(Value::from));
    put("enqueuedSequenceNumber", bp.enqueued_sequence_number.map(Value::from));
    put("lockedUntilUtc", bp.locked_until_utc.clone().map(Value::from));
    put("deadLetterSource", bp.dead_letter_source.clone().map(Value::from));
    put("deadLetterReason", bp.dead_letter_reason.clone().map(Value::from));
    put(
        "deadLetterErrorDescription",
        bp.dead_letter_error_description.clone().map(Value::from),
    );
    put("state", bp.state.clone().map(Value::from));
    put("partitionKey", bp.partition_key.clone().map(Value::from));
    put("size", bp.size.map(Value::from));
    Value::Object(headers)
}
