//! Namespace Directory: enumerate queues, topics and subscriptions.

use tracing::{debug, warn};

use crate::broker_call::with_deadline;
use crate::client::error::Result;
use crate::client::models::{QueueSummary, SubscriptionDescription, TopicDescription};
use crate::config::ExplorerSettings;
use crate::session::Connection;

/// Entities requested per management call.
pub const PAGE_SIZE: usize = 100;

pub struct NamespaceDirectory<'a> {
    conn: &'a Connection,
    settings: &'a ExplorerSettings,
}

impl<'a> NamespaceDirectory<'a> {
    pub fn new(conn: &'a Connection, settings: &'a ExplorerSettings) -> Self {
        Self { conn, settings }
    }

    /// Every queue with its counters, in the order the broker enumerates them.
    ///
    /// A queue whose runtime counters cannot be read is still listed, with
    /// zero counts. Entries without a name are skipped.
    pub async fn list_queues(&self) -> Result<Vec<QueueSummary>> {
        let mut names = Vec::new();
        let mut skip = 0;
        loop {
            let page = with_deadline(
                self.settings.operation_timeout(),
                "list queues",
                self.conn.admin().list_queues(skip, PAGE_SIZE),
            )
            .await?;
            let fetched = page.len();
            names.extend(page.into_iter().map(|q| q.name).filter(|n| !n.is_empty()));
            if fetched < PAGE_SIZE {
                break;
            }
            skip += fetched;
        }
        debug!(count = names.len(), "enumerated queues");

        let mut summaries = Vec::with_capacity(names.len());
        for name in &names {
            summaries.push(self.summary_or_empty(name).await);
        }
        Ok(summaries)
    }

    /// Counters for a single queue. Unlike [`list_queues`](Self::list_queues),
    /// a failure is reported.
    pub async fn queue_summary(&self, name: &str) -> Result<QueueSummary> {
        let info = with_deadline(
            self.settings.operation_timeout(),
            "get queue runtime properties",
            self.conn.admin().queue_runtime_info(name),
        )
        .await?;
        Ok(QueueSummary::from_runtime(name, &info))
    }

    async fn summary_or_empty(&self, name: &str) -> QueueSummary {
        match self.queue_summary(name).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(queue = name, error = %e, details = e.details().unwrap_or_default(), "runtime properties unavailable, reporting zero counts");
                QueueSummary::empty(name)
            }
        }
    }

    /// Every topic. Entries without a name are skipped.
    pub async fn list_topics(&self) -> Result<Vec<TopicDescription>> {
        let mut topics = Vec::new();
        let mut skip = 0;
        loop {
            let page = with_deadline(
                self.settings.operation_timeout(),
                "list topics",
                self.conn.admin().list_topics(skip, PAGE_SIZE),
            )
            .await?;
            let fetched = page.len();
            topics.extend(page.into_iter().filter(|t| !t.name.is_empty()));
            if fetched < PAGE_SIZE {
                break;
            }
            skip += fetched;
        }
        Ok(topics)
    }

    /// Subscriptions of `topic`. Entries without a name are skipped.
    pub async fn list_subscriptions(&self, topic: &str) -> Result<Vec<SubscriptionDescription>> {
        let mut subscriptions = Vec::new();
        let mut skip = 0;
        loop {
            let page = with_deadline(
                self.settings.operation_timeout(),
                "list subscriptions",
                self.conn.admin().list_subscriptions(topic, skip, PAGE_SIZE),
            )
            .await?;
            let fetched = page.len();
            subscriptions.extend(page.into_iter().filter(|s| !s.name.is_empty()));
            if fetched < PAGE_SIZE {
                break;
            }
            skip += fetched;
        }
        Ok(subscriptions)
    }
}
