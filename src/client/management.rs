use std::collections::HashMap;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;

use super::auth::ConnectionConfig;
use super::error::{TransportError, TransportResult};
use super::models::*;
use super::transport::AdminTransport;

/// Client for Azure Service Bus management-plane operations (ATOM XML feeds).
#[derive(Clone)]
pub struct ManagementClient {
    config: ConnectionConfig,
    http: Client,
}

impl ManagementClient {
    pub fn new(config: ConnectionConfig, http: Client) -> Self {
        Self { config, http }
    }

    async fn get_atom(&self, path: &str, query: &str) -> TransportResult<String> {
        let url = format!(
            "{}/{}?api-version=2017-04{}",
            self.config.https_endpoint, path, query
        );
        let token = self.config.namespace_token()?;

        let resp = self
            .http
            .get(&url)
            .header("Authorization", token)
            .header("Content-Type", "application/atom+xml;charset=utf-8")
            .send()
            .await?;

        let status = resp.status().as_u16();
        let body = resp.text().await?;

        if status == 404 {
            return Err(TransportError::NotFound(path.to_string()));
        }
        if status >= 400 {
            return Err(TransportError::Api { status, body });
        }

        Ok(body)
    }

    async fn get_feed(&self, path: &str, skip: usize, top: usize) -> TransportResult<Vec<AtomEntry>> {
        let query = format!("&$skip={}&$top={}", skip, top);
        let xml = self.get_atom(path, &query).await?;
        parse_entries(&xml)
    }
}

#[async_trait]
impl AdminTransport for ManagementClient {
    async fn list_queues(&self, skip: usize, top: usize) -> TransportResult<Vec<QueueDescription>> {
        let entries = self.get_feed("$Resources/Queues", skip, top).await?;
        Ok(entries.iter().map(queue_from_entry).collect())
    }

    async fn queue_runtime_info(&self, name: &str) -> TransportResult<QueueRuntimeInfo> {
        let xml = self.get_atom(name, "").await?;
        let entry = parse_entries(&xml)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::NotFound(name.to_string()))?;
        Ok(queue_runtime_from_entry(name, &entry))
    }

    async fn list_topics(&self, skip: usize, top: usize) -> TransportResult<Vec<TopicDescription>> {
        let entries = self.get_feed("$Resources/Topics", skip, top).await?;
        Ok(entries
            .iter()
            .map(|e| TopicDescription {
                name: e.title.clone(),
                status: e.text("Status"),
            })
            .collect())
    }

    async fn list_subscriptions(
        &self,
        topic: &str,
        skip: usize,
        top: usize,
    ) -> TransportResult<Vec<SubscriptionDescription>> {
        let entries = self
            .get_feed(&format!("{}/Subscriptions", topic), skip, top)
            .await?;
        Ok(entries
            .iter()
            .map(|e| SubscriptionDescription {
                name: e.title.clone(),
                topic_name: topic.to_string(),
                status: e.text("Status"),
                requires_session: e.parse("RequiresSession"),
                max_delivery_count: e.parse("MaxDeliveryCount"),
            })
            .collect())
    }
}

// ──────────────────────────── ATOM parsing ────────────────────────────
// Leaf elements are keyed by local name so the auto-generated namespace
// prefixes Azure's serializer emits (`d2p1:`, `d3p1:`...) do not matter.

#[derive(Debug, Default)]
struct AtomEntry {
    title: String,
    fields: HashMap<String, String>,
}

impl AtomEntry {
    fn text(&self, name: &str) -> Option<String> {
        self.fields.get(name).cloned()
    }

    fn parse<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.fields.get(name).and_then(|v| v.parse().ok())
    }

    fn count(&self, name: &str) -> i64 {
        self.parse(name).unwrap_or(0)
    }
}

fn parse_entries(xml: &str) -> TransportResult<Vec<AtomEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<AtomEntry> = None;
    let mut stack: Vec<String> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "entry" {
                    current = Some(AtomEntry::default());
                    stack.clear();
                } else if current.is_some() {
                    stack.push(name);
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"entry" {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                } else {
                    stack.pop();
                }
            }
            Event::Text(t) => {
                let text = t.unescape()?.into_owned();
                record_text(current.as_mut(), stack.last(), text);
            }
            Event::CData(c) => {
                let text = String::from_utf8_lossy(&c).into_owned();
                record_text(current.as_mut(), stack.last(), text);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(entries)
}

fn record_text(entry: Option<&mut AtomEntry>, element: Option<&String>, text: String) {
    let (Some(entry), Some(element)) = (entry, element) else {
        return;
    };
    if text.is_empty() {
        return;
    }
    if element == "title" {
        if entry.title.is_empty() {
            entry.title = text;
        }
    } else {
        entry.fields.entry(element.clone()).or_insert(text);
    }
}

fn queue_from_entry(entry: &AtomEntry) -> QueueDescription {
    QueueDescription {
        name: entry.title.clone(),
        status: entry.text("Status"),
        requires_session: entry.parse("RequiresSession"),
        max_delivery_count: entry.parse("MaxDeliveryCount"),
    }
}

fn queue_runtime_from_entry(name: &str, entry: &AtomEntry) -> QueueRuntimeInfo {
    QueueRuntimeInfo {
        name: name.to_string(),
        message_count: entry.count("MessageCount"),
        active_message_count: entry.count("ActiveMessageCount"),
        dead_letter_message_count: entry.count("DeadLetterMessageCount"),
        scheduled_message_count: entry.count("ScheduledMessageCount"),
        transfer_message_count: entry.count("TransferMessageCount"),
        transfer_dead_letter_message_count: entry.count("TransferDeadLetterMessageCount"),
        size_in_bytes: entry.count("SizeInBytes"),
    }
}
