use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::auth::ConnectionConfig;
use super::error::{TransportError, TransportResult};
use super::models::*;
use super::transport::{DataTransport, ReceiverLink, SenderLink};

/// Upper bound on messages locked while scanning for a peek window.
const PEEK_SCAN_LIMIT: usize = 256;

/// Client for Azure Service Bus data-plane operations (send, receive, peek).
#[derive(Clone)]
pub struct DataPlaneClient {
    config: ConnectionConfig,
    http: Client,
}

impl DataPlaneClient {
    pub fn new(config: ConnectionConfig, http: Client) -> Self {
        Self { config, http }
    }

    /// Normalize entity paths for the data-plane REST API.
    /// Management API uses `/Subscriptions/` but data plane expects `/subscriptions/`.
    fn normalize_path(entity_path: &str) -> String {
        entity_path.replace("/Subscriptions/", "/subscriptions/")
    }

    // ────────── Send ──────────

    /// Send a message to a queue or topic.
    async fn send_message(&self, entity_path: &str, message: &SendRequest) -> TransportResult<()> {
        let entity_path = Self::normalize_path(entity_path);
        let url = format!(
            "{}/{}/messages?api-version=2017-04",
            self.config.https_endpoint, entity_path
        );
        let token = self.config.entity_token(&entity_path)?;

        let broker_props = BrokerProperties {
            message_id: message.message_id.clone(),
            correlation_id: message.correlation_id.clone(),
            session_id: message.session_id.clone(),
            label: message.subject.clone(),
            to: message.to.clone(),
            reply_to: message.reply_to.clone(),
            reply_to_session_id: message.reply_to_session_id.clone(),
            time_to_live: message.time_to_live_ms.map(|ms| ms as f64 / 1000.0),
            ..Default::default()
        };
        let broker_props =
            serde_json::to_string(&broker_props).map_err(|e| TransportError::Other(e.into()))?;

        let mut req = self
            .http
            .post(&url)
            .header("Authorization", token)
            .header(
                "Content-Type",
                message.content_type.as_deref().unwrap_or("application/json"),
            )
            .header("BrokerProperties", broker_props);

        // Custom properties travel as individual JSON-encoded headers
        for (k, v) in &message.application_properties {
            req = req.header(k.as_str(), v.to_string());
        }

        let resp = req.body(message.body.clone()).send().await?;

        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await?;
            return Err(TransportError::Api { status, body });
        }
        Ok(())
    }

    // ────────── Receive ──────────

    /// Peek-lock the head message, waiting up to `timeout_secs` for one to arrive.
    async fn peek_lock(
        &self,
        entity_path: &str,
        timeout_secs: u64,
    ) -> TransportResult<Option<ReceivedMessage>> {
        let url = format!(
            "{}/{}/messages/head?api-version=2017-04&timeout={}",
            self.config.https_endpoint, entity_path, timeout_secs
        );
        let token = self.config.entity_token(entity_path)?;

        let resp = self
            .http
            .post(&url)
            .header("Authorization", token)
            .header("Content-Length", "0")
            .body("")
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 204 {
            return Ok(None);
        }
        if status >= 400 {
            let body = resp.text().await?;
            return Err(TransportError::Api { status, body });
        }

        let lock_uri = resp
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut msg = parse_received_message(resp).await?;
        msg.lock_token = lock_uri;
        Ok(Some(msg))
    }

    /// Complete a peek-locked message (removes it from the entity).
    async fn complete_lock(&self, lock_uri: &str) -> TransportResult<()> {
        let token = self.config.namespace_token()?;

        let resp = self
            .http
            .delete(lock_uri)
            .header("Authorization", token)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await?;
            return Err(TransportError::Api { status, body });
        }
        Ok(())
    }

    /// Abandon a peek-locked message (makes it available again).
    async fn abandon_lock(&self, lock_uri: &str) -> TransportResult<()> {
        let token = self.config.namespace_token()?;

        let resp = self
            .http
            .put(lock_uri)
            .header("Authorization", token)
            .header("Content-Length", "0")
            .body("")
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await?;
            return Err(TransportError::Api { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl DataTransport for DataPlaneClient {
    async fn open_receiver(
        &self,
        target: &EntityTarget,
        sub_queue: SubQueue,
    ) -> TransportResult<Box<dyn ReceiverLink>> {
        let path = Self::normalize_path(&sub_queue.scoped_path(&target.entity_path()));
        Ok(Box::new(RestReceiver {
            client: self.clone(),
            path,
            held: Mutex::new(Vec::new()),
        }))
    }

    async fn open_sender(&self, entity_path: &str) -> TransportResult<Box<dyn SenderLink>> {
        Ok(Box::new(RestSender {
            client: self.clone(),
            path: entity_path.to_string(),
        }))
    }

    /// HTTP links are per request; there is nothing to tear down.
    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }
}

// ──────────────────────────── Receiver ────────────────────────────

/// REST receiver. Every lock it takes is tracked until settled so `close`
/// can hand back anything still outstanding.
pub struct RestReceiver {
    client: DataPlaneClient,
    path: String,
    held: Mutex<Vec<String>>,
}

impl RestReceiver {
    fn lock_uri(message: &ReceivedMessage) -> TransportResult<&str> {
        message
            .lock_token
            .as_deref()
            .ok_or_else(|| TransportError::Other(anyhow::anyhow!("message is not locked")))
    }

    async fn release(&self, uri: &str) {
        self.held.lock().await.retain(|u| u != uri);
    }

    /// Abandon each of `uris` in turn, carrying on past failures. Released
    /// locks stop being tracked; the rest stay held and are returned.
    async fn abandon_tracked<F, Fut>(&self, uris: &[String], abandon: F) -> Vec<String>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = TransportResult<()>>,
    {
        let mut kept = Vec::new();
        for uri in uris {
            match abandon(uri.clone()).await {
                Ok(()) => self.release(uri).await,
                Err(e) => {
                    warn!(entity = %self.path, lock = %uri, error = %e, "failed to release lock");
                    kept.push(uri.clone());
                }
            }
        }
        kept
    }
}

#[async_trait]
impl ReceiverLink for RestReceiver {
    /// The REST API has no sequence-number cursor, so a peek locks messages
    /// from the head, keeps those at or after `from_sequence_number`, and
    /// abandons every lock before returning. Each pass bumps `DeliveryCount`.
    async fn peek(
        &self,
        max: usize,
        from_sequence_number: i64,
    ) -> TransportResult<Vec<ReceivedMessage>> {
        let mut messages = Vec::new();
        let mut lock_uris = Vec::new();
        let mut outcome = Ok(());

        for _ in 0..PEEK_SCAN_LIMIT {
            if messages.len() >= max {
                break;
            }
            match self.client.peek_lock(&self.path, 1).await {
                Ok(Some(mut msg)) => {
                    if let Some(uri) = msg.lock_token.take() {
                        self.held.lock().await.push(uri.clone());
                        lock_uris.push(uri);
                    }
                    if msg.sequence_number().unwrap_or(i64::MIN) >= from_sequence_number {
                        messages.push(msg);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        let client = &self.client;
        let kept = self
            .abandon_tracked(&lock_uris, |uri| async move { client.abandon_lock(&uri).await })
            .await;
        if !kept.is_empty() {
            debug!(entity = %self.path, count = kept.len(), "peek locks left for close");
        }

        outcome?;
        messages.sort_by_key(|m| m.sequence_number());
        Ok(messages)
    }

    async fn receive(&self, max: usize, wait: Duration) -> TransportResult<Vec<ReceivedMessage>> {
        let mut messages = Vec::new();
        let mut timeout_secs = wait.as_secs().max(1);

        while messages.len() < max {
            match self.client.peek_lock(&self.path, timeout_secs).await? {
                Some(msg) => {
                    if let Some(ref uri) = msg.lock_token {
                        self.held.lock().await.push(uri.clone());
                    }
                    messages.push(msg);
                }
                None => break,
            }
            // Only the first lock waits the full window
            timeout_secs = 1;
        }
        Ok(messages)
    }

    async fn complete(&self, message: &ReceivedMessage) -> TransportResult<()> {
        let uri = Self::lock_uri(message)?;
        self.client.complete_lock(uri).await?;
        self.release(uri).await;
        Ok(())
    }

    async fn abandon(&self, message: &ReceivedMessage) -> TransportResult<()> {
        let uri = Self::lock_uri(message)?;
        self.client.abandon_lock(uri).await?;
        self.release(uri).await;
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        let outstanding: Vec<String> = self.held.lock().await.clone();
        if outstanding.is_empty() {
            return Ok(());
        }
        debug!(entity = %self.path, count = outstanding.len(), "abandoning locks on close");
        let client = &self.client;
        let kept = self
            .abandon_tracked(&outstanding, |uri| async move { client.abandon_lock(&uri).await })
            .await;
        if kept.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Other(anyhow::anyhow!(
                "{} of {} locks on {} could not be released",
                kept.len(),
                outstanding.len(),
                self.path
            )))
        }
    }
}

// ──────────────────────────── Sender ────────────────────────────

pub struct RestSender {
    client: DataPlaneClient,
    path: String,
}

#[async_trait]
impl SenderLink for RestSender {
    async fn send(&self, request: &SendRequest) -> TransportResult<()> {
        self.client.send_message(&self.path, request).await
    }

    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }
}

// ──────────────────────────── Response parsing ────────────────────────────

async fn parse_received_message(resp: reqwest::Response) -> TransportResult<ReceivedMessage> {
    let broker_props_str = resp
        .headers()
        .get("BrokerProperties")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("{}")
        .to_string();

    // Custom properties are every non-standard header
    let custom_props: Vec<(String, Value)> = resp
        .headers()
        .iter()
        .filter(|(name, _)| is_custom_property_header(name.as_str()))
        .map(|(name, value)| {
            let raw = value.to_str().unwrap_or("");
            let parsed = serde_json::from_str::<Value>(raw)
                .unwrap_or_else(|_| Value::String(raw.trim_matches('"').to_string()));
            (name.to_string(), parsed)
        })
        .collect();

    let body = resp.text().await?;

    let broker_properties: BrokerProperties =
        serde_json::from_str(&broker_props_str).unwrap_or_default();

    Ok(ReceivedMessage {
        body,
        broker_properties,
        custom_properties: custom_props,
        lock_token: None,
    })
}

fn is_custom_property_header(name: &str) -> bool {
    let n = name.to_lowercase();
    !n.starts_with("content-")
        && !n.starts_with("x-ms-")
        && !matches!(
            n.as_str(),
            "brokerproperties"
                | "date"
                | "server"
                | "transfer-encoding"
                | "strict-transport-security"
                | "location"
        )
}
