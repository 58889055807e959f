use tracing::info;
use uuid::Uuid;

use crate::broker_call::{close_sender, with_deadline};
use crate::client::error::Result;
use crate::client::models::Message;
use crate::config::ExplorerSettings;
use crate::session::Connection;

/// Message Sender: one short-lived sender per send.
pub struct MessageSender<'a> {
    conn: &'a Connection,
    settings: &'a ExplorerSettings,
}

impl<'a> MessageSender<'a> {
    pub fn new(conn: &'a Connection, settings: &'a ExplorerSettings) -> Self {
        Self { conn, settings }
    }

    /// Send `message` to the queue or topic at `entity_path`. A message
    /// without an id is given a random one.
    pub async fn send(&self, entity_path: &str, message: &Message) -> Result<()> {
        let mut request = message.to_send_request();
        if request.message_id.is_none() {
            request.message_id = Some(Uuid::new_v4().to_string());
        }

        let sender = with_deadline(
            self.settings.operation_timeout(),
            "open sender",
            self.conn.data().open_sender(entity_path),
        )
        .await?;
        let sent = with_deadline(
            self.settings.operation_timeout(),
            "send message",
            sender.send(&request),
        )
        .await;
        close_sender(sender, entity_path).await;

        sent?;
        info!(entity = entity_path, message_id = ?request.message_id, "sent message");
        Ok(())
    }
}
