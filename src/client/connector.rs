use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::auth::ConnectionConfig;
use super::data_plane::DataPlaneClient;
use super::error::TransportResult;
use super::management::ManagementClient;
use super::transport::{BrokerHandles, Connector};

/// Connects to a real namespace over HTTPS.
#[derive(Clone, Default)]
pub struct RestConnector {
    http: Client,
}

impl RestConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for RestConnector {
    /// Any HTTP answer from the namespace host counts as reachable; only
    /// transport-level failures (DNS, TLS, refused) fail the probe.
    async fn probe(&self, config: &ConnectionConfig) -> TransportResult<()> {
        let url = format!("{}/", config.https_endpoint);
        let resp = self.http.head(&url).send().await?;
        debug!(host = %config.host, status = resp.status().as_u16(), "namespace probe answered");
        Ok(())
    }

    async fn open(&self, config: &ConnectionConfig) -> TransportResult<BrokerHandles> {
        Ok(BrokerHandles {
            admin: Arc::new(ManagementClient::new(config.clone(), self.http.clone())),
            data: Arc::new(DataPlaneClient::new(config.clone(), self.http.clone())),
        })
    }
}
