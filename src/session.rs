//! Connection Manager: one explicitly owned session per namespace.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker_call::with_deadline;
use crate::browser::MessageBrowser;
use crate::client::auth::ConnectionConfig;
use crate::client::error::{classify, Result, ServiceBusError};
use crate::client::models::NamespaceInfo;
use crate::client::transport::{AdminTransport, BrokerHandles, Connector, DataTransport};
use crate::config::ExplorerSettings;
use crate::directory::NamespaceDirectory;
use crate::mutator::MessageMutator;
use crate::sender::MessageSender;

/// An authenticated session to one namespace. Both handles live and die together.
pub struct Connection {
    info: NamespaceInfo,
    https_endpoint: String,
    handles: BrokerHandles,
}

impl Connection {
    pub fn info(&self) -> &NamespaceInfo {
        &self.info
    }

    pub fn https_endpoint(&self) -> &str {
        &self.https_endpoint
    }

    pub fn admin(&self) -> &dyn AdminTransport {
        self.handles.admin.as_ref()
    }

    pub fn data(&self) -> &dyn DataTransport {
        self.handles.data.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
}

enum SessionState {
    Disconnected,
    Connecting,
    Connected(Connection),
}

/// Owns the lifecycle `Disconnected -> Connecting -> Connected -> Disconnected`.
///
/// The last connection string that produced a working connection is kept in
/// memory so a dropped link can be re-established once.
pub struct Session {
    connector: Arc<dyn Connector>,
    settings: ExplorerSettings,
    state: SessionState,
    last_connection_string: Option<String>,
}

impl Session {
    pub fn new(connector: Arc<dyn Connector>, settings: ExplorerSettings) -> Self {
        Self {
            connector,
            settings,
            state: SessionState::Disconnected,
            last_connection_string: None,
        }
    }

    pub fn settings(&self) -> &ExplorerSettings {
        &self.settings
    }

    pub fn status(&self) -> SessionStatus {
        match self.state {
            SessionState::Disconnected => SessionStatus::Disconnected,
            SessionState::Connecting => SessionStatus::Connecting,
            SessionState::Connected(_) => SessionStatus::Connected,
        }
    }

    pub fn connection(&self) -> Result<&Connection> {
        match &self.state {
            SessionState::Connected(conn) => Ok(conn),
            _ => Err(ServiceBusError::NotConnected),
        }
    }

    pub fn directory(&self) -> Result<NamespaceDirectory<'_>> {
        Ok(NamespaceDirectory::new(self.connection()?, &self.settings))
    }

    pub fn browser(&self) -> Result<MessageBrowser<'_>> {
        Ok(MessageBrowser::new(self.connection()?, &self.settings))
    }

    pub fn mutator(&self) -> Result<MessageMutator<'_>> {
        Ok(MessageMutator::new(self.connection()?, &self.settings))
    }

    pub fn sender(&self) -> Result<MessageSender<'_>> {
        Ok(MessageSender::new(self.connection()?, &self.settings))
    }

    /// Connect to the namespace named by `connection_string`.
    ///
    /// All-or-nothing: any prior connection is dropped first, and on failure
    /// the session is left `Disconnected` with no handles and nothing cached
    /// to reconnect with.
    pub async fn connect(&mut self, connection_string: &str) -> Result<NamespaceInfo> {
        self.teardown().await;

        let config = ConnectionConfig::from_connection_string(connection_string)?;
        self.state = SessionState::Connecting;

        match self.establish(&config).await {
            Ok(conn) => {
                let info = conn.info.clone();
                info!(namespace = %info.namespace_name, "connected to Service Bus");
                self.state = SessionState::Connected(conn);
                self.last_connection_string = Some(connection_string.to_string());
                Ok(info)
            }
            Err(e) => {
                warn!(namespace = %config.namespace_name, error = %e, details = e.details().unwrap_or_default(), "connect failed");
                self.state = SessionState::Disconnected;
                self.last_connection_string = None;
                Err(e)
            }
        }
    }

    async fn establish(&self, config: &ConnectionConfig) -> Result<Connection> {
        let probe_timeout = self.settings.probe_timeout();
        match tokio::time::timeout(probe_timeout, self.connector.probe(config)).await {
            Err(_) => {
                return Err(ServiceBusError::ConnectTimeout(format!(
                    "{} did not answer within {} ms",
                    config.host,
                    probe_timeout.as_millis()
                )))
            }
            Ok(Err(e)) => return Err(classify(e)),
            Ok(Ok(())) => debug!(host = %config.host, "namespace reachable"),
        }

        let handles = self.connector.open(config).await.map_err(classify)?;

        // Credentials must authorize management calls, not just reach the host
        let verified = with_deadline(
            self.settings.operation_timeout(),
            "verify access",
            handles.admin.list_queues(0, 1),
        )
        .await;
        if let Err(e) = verified {
            if let Err(close_err) = handles.data.close().await {
                warn!(error = %close_err, "error closing data-plane handle after failed verification");
            }
            return Err(e);
        }

        Ok(Connection {
            info: NamespaceInfo {
                namespace_name: config.namespace_name.clone(),
                endpoint: config.endpoint.clone(),
            },
            https_endpoint: config.https_endpoint.clone(),
            handles,
        })
    }

    /// Drop the current connection and forget the cached connection string.
    /// Idempotent; never fails.
    pub async fn disconnect(&mut self) {
        self.teardown().await;
        self.last_connection_string = None;
    }

    async fn teardown(&mut self) {
        let previous = std::mem::replace(&mut self.state, SessionState::Disconnected);
        if let SessionState::Connected(conn) = previous {
            if let Err(e) = conn.handles.data.close().await {
                warn!(namespace = %conn.info.namespace_name, error = %e, "error closing data-plane handle");
            }
            info!(namespace = %conn.info.namespace_name, "disconnected");
        }
    }

    pub fn can_reconnect(&self) -> bool {
        self.last_connection_string.is_some()
    }

    /// Re-establish the session with the last connection string that worked.
    pub async fn reconnect(&mut self) -> Result<NamespaceInfo> {
        let connection_string = self
            .last_connection_string
            .clone()
            .ok_or(ServiceBusError::NotConnected)?;
        self.connect(&connection_string).await
    }
}
