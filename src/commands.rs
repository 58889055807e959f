//! Command surface: typed requests in, `{success, data | error}` out.
//!
//! Requests are JSON objects tagged by `command`, one per line. An optional
//! `id` is echoed back on the response. Failures carry the error envelope
//! string-encoded in `error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::client::error::{ErrorEnvelope, Result, ServiceBusError};
use crate::client::models::{EntityTarget, Message, ViewMode};
use crate::session::Session;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    Connect {
        connection_string: String,
    },
    ListQueues,
    ListTopics,
    ListSubscriptions {
        topic_name: String,
    },
    GetQueueSummary {
        queue_name: String,
    },
    PeekQueueMessages {
        queue_name: String,
        #[serde(default)]
        max_messages: Option<usize>,
    },
    PeekQueueDeadLetterMessages {
        queue_name: String,
        #[serde(default)]
        max_messages: Option<usize>,
    },
    PeekSubscriptionMessages {
        topic_name: String,
        subscription_name: String,
        #[serde(default)]
        max_messages: Option<usize>,
    },
    PeekSubscriptionDeadLetterMessages {
        topic_name: String,
        subscription_name: String,
        #[serde(default)]
        max_messages: Option<usize>,
    },
    SendMessage {
        queue_name: String,
        message: Message,
    },
    DeleteMessage {
        queue_name: String,
        message: Message,
        #[serde(default)]
        is_dlq: bool,
    },
    DeleteSubscriptionMessage {
        topic_name: String,
        subscription_name: String,
        message: Message,
        #[serde(default)]
        is_dlq: bool,
    },
    ResendMessage {
        target: EntityTarget,
        message: Message,
        #[serde(default)]
        mode: ViewMode,
    },
    Disconnect,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::ListQueues => "listQueues",
            Self::ListTopics => "listTopics",
            Self::ListSubscriptions { .. } => "listSubscriptions",
            Self::GetQueueSummary { .. } => "getQueueSummary",
            Self::PeekQueueMessages { .. } => "peekQueueMessages",
            Self::PeekQueueDeadLetterMessages { .. } => "peekQueueDeadLetterMessages",
            Self::PeekSubscriptionMessages { .. } => "peekSubscriptionMessages",
            Self::PeekSubscriptionDeadLetterMessages { .. } => "peekSubscriptionDeadLetterMessages",
            Self::SendMessage { .. } => "sendMessage",
            Self::DeleteMessage { .. } => "deleteMessage",
            Self::DeleteSubscriptionMessage { .. } => "deleteSubscriptionMessage",
            Self::ResendMessage { .. } => "resendMessage",
            Self::Disconnect => "disconnect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// JSON text of an [`ErrorEnvelope`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn ok(data: Option<Value>) -> Self {
        Self {
            id: None,
            success: true,
            data,
            error: None,
        }
    }

    fn failed(envelope: &ErrorEnvelope) -> Self {
        Self {
            id: None,
            success: false,
            data: None,
            error: Some(envelope.encode()),
        }
    }

    /// Decode the error envelope, if this is a failure.
    pub fn envelope(&self) -> Option<ErrorEnvelope> {
        self.error
            .as_deref()
            .and_then(|text| serde_json::from_str(text).ok())
    }
}

/// Result of a delete as reported to callers. A message that was already
/// gone counts as deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum DeleteOutcome {
    Deleted {
        #[serde(rename = "sequenceNumber")]
        sequence_number: i64,
        attempts: u32,
    },
    AlreadyDeleted {
        #[serde(rename = "sequenceNumber")]
        sequence_number: i64,
    },
}

/// Dispatches commands against one owned [`Session`].
pub struct CommandHandler {
    session: Session,
}

impl CommandHandler {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub async fn handle(&mut self, command: Command) -> Response {
        let name = command.name();
        debug!(command = name, "handling command");
        match self.execute(command).await {
            Ok(data) => Response::ok(data),
            Err(e) => {
                warn!(command = name, error = %e, kind = ?e.kind(), "command failed");
                Response::failed(&e.to_envelope())
            }
        }
    }

    pub async fn execute(&mut self, command: Command) -> Result<Option<Value>> {
        match command {
            Command::Connect { connection_string } => {
                payload(self.session.connect(&connection_string).await?)
            }
            Command::ListQueues => payload(self.session.directory()?.list_queues().await?),
            Command::ListTopics => {
                let topics = self.session.directory()?.list_topics().await?;
                payload(topics.into_iter().map(|t| t.name).collect::<Vec<_>>())
            }
            Command::ListSubscriptions { topic_name } => {
                let subs = self
                    .session
                    .directory()?
                    .list_subscriptions(&topic_name)
                    .await?;
                payload(subs.into_iter().map(|s| s.name).collect::<Vec<_>>())
            }
            Command::GetQueueSummary { queue_name } => {
                payload(self.session.directory()?.queue_summary(&queue_name).await?)
            }
            Command::PeekQueueMessages {
                queue_name,
                max_messages,
            } => {
                self.peek(EntityTarget::queue(queue_name), max_messages, false)
                    .await
            }
            Command::PeekQueueDeadLetterMessages {
                queue_name,
                max_messages,
            } => {
                self.peek(EntityTarget::queue(queue_name), max_messages, true)
                    .await
            }
            Command::PeekSubscriptionMessages {
                topic_name,
                subscription_name,
                max_messages,
            } => {
                let target = EntityTarget::subscription(topic_name, subscription_name);
                self.peek(target, max_messages, false).await
            }
            Command::PeekSubscriptionDeadLetterMessages {
                topic_name,
                subscription_name,
                max_messages,
            } => {
                let target = EntityTarget::subscription(topic_name, subscription_name);
                self.peek(target, max_messages, true).await
            }
            Command::SendMessage {
                queue_name,
                message,
            } => {
                self.session.sender()?.send(&queue_name, &message).await?;
                Ok(None)
            }
            Command::DeleteMessage {
                queue_name,
                message,
                is_dlq,
            } => {
                self.delete(EntityTarget::queue(queue_name), &message, is_dlq)
                    .await
            }
            Command::DeleteSubscriptionMessage {
                topic_name,
                subscription_name,
                message,
                is_dlq,
            } => {
                let target = EntityTarget::subscription(topic_name, subscription_name);
                self.delete(target, &message, is_dlq).await
            }
            Command::ResendMessage {
                target,
                message,
                mode,
            } => payload(
                self.session
                    .mutator()?
                    .resend_message(&target, &message, mode)
                    .await?,
            ),
            Command::Disconnect => {
                self.session.disconnect().await;
                Ok(None)
            }
        }
    }

    /// Peek, reconnecting once with the last good connection string if the
    /// link looks dropped.
    async fn peek(
        &mut self,
        target: EntityTarget,
        max_messages: Option<usize>,
        is_dead_letter: bool,
    ) -> Result<Option<Value>> {
        let max = max_messages.unwrap_or(self.session.settings().peek_count);
        let messages = match self.peek_once(&target, max, is_dead_letter).await {
            Err(e) if e.is_connection_lost() && self.session.can_reconnect() => {
                warn!(entity = %target, error = %e, "peek failed on a dropped connection, reconnecting");
                self.session.reconnect().await?;
                self.peek_once(&target, max, is_dead_letter).await?
            }
            other => other?,
        };
        payload(messages)
    }

    async fn peek_once(
        &self,
        target: &EntityTarget,
        max: usize,
        is_dead_letter: bool,
    ) -> Result<Vec<Message>> {
        self.session
            .browser()?
            .peek(target, max, is_dead_letter)
            .await
    }

    async fn delete(
        &self,
        target: EntityTarget,
        message: &Message,
        is_dead_letter: bool,
    ) -> Result<Option<Value>> {
        let outcome = match self
            .session
            .mutator()?
            .delete_message(&target, message, is_dead_letter)
            .await
        {
            Ok(report) => DeleteOutcome::Deleted {
                sequence_number: report.sequence_number,
                attempts: report.attempts,
            },
            Err(ServiceBusError::MessageNotFound { sequence_number }) => {
                info!(entity = %target, sequence_number, "message already deleted");
                DeleteOutcome::AlreadyDeleted { sequence_number }
            }
            Err(e) => return Err(e),
        };
        payload(outcome)
    }
}

fn payload<T: Serialize>(value: T) -> Result<Option<Value>> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|e| ServiceBusError::ServiceBus(format!("failed to encode response: {}", e)))
}

/// Parse one request line. The `id` member, if any, is split off first.
fn parse_request(line: &str) -> (Option<Value>, std::result::Result<Command, serde_json::Error>) {
    let mut value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return (None, Err(e)),
    };
    let id = value.as_object_mut().and_then(|obj| obj.remove("id"));
    (id, serde_json::from_value(value))
}

/// Serve newline-delimited JSON requests from `reader` until end of input,
/// writing one response line per request. The session is disconnected on exit.
pub async fn serve<R, W>(handler: &mut CommandHandler, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let served = async {
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (id, request) = parse_request(line);
            let mut response = match request {
                Ok(command) => handler.handle(command).await,
                Err(e) => {
                    warn!(error = %e, "rejected malformed request");
                    Response::failed(&ErrorEnvelope {
                        message: "Invalid request".to_string(),
                        details: Some(e.to_string()),
                        kind: None,
                    })
                }
            };
            response.id = id;

            let mut encoded = serde_json::to_string(&response)?;
            encoded.push('\n');
            writer.write_all(encoded.as_bytes()).await?;
            writer.flush().await?;
        }
        anyhow::Ok(())
    }
    .await;

    handler.session_mut().disconnect().await;
    served
}
