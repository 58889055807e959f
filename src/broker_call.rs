//! Shared plumbing for calls that cross into a broker transport: deadline
//! enforcement with classification, and guaranteed link release.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::client::error::{classify, Result, ServiceBusError, TransportResult};
use crate::client::models::EntityTarget;
use crate::client::transport::{ReceiverLink, SenderLink};

/// Await a transport call, classifying its failure and bounding it by
/// `limit` when one is set.
pub(crate) async fn with_deadline<T, F>(
    limit: Option<Duration>,
    operation: &'static str,
    call: F,
) -> Result<T>
where
    F: Future<Output = TransportResult<T>>,
{
    let outcome = match limit {
        Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
            ServiceBusError::Timeout {
                operation,
                after_ms: limit.as_millis() as u64,
            }
        })?,
        None => call.await,
    };
    outcome.map_err(classify)
}

/// Close a receiver link. Failures are logged, never propagated: the
/// operation's own outcome is what the caller sees.
pub(crate) async fn close_receiver(receiver: Box<dyn ReceiverLink>, target: &EntityTarget) {
    match receiver.close().await {
        Ok(()) => debug!(entity = %target, "closed receiver"),
        Err(e) => warn!(entity = %target, error = %e, "error closing receiver"),
    }
}

pub(crate) async fn close_sender(sender: Box<dyn SenderLink>, entity_path: &str) {
    match sender.close().await {
        Ok(()) => debug!(entity = entity_path, "closed sender"),
        Err(e) => warn!(entity = entity_path, error = %e, "error closing sender"),
    }
}
