use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::error::{ServiceBusError, TransportError, TransportResult};

type HmacSha256 = Hmac<Sha256>;

const NAMESPACE_SUFFIX: &str = ".servicebus.windows.net";

/// SAS tokens are minted per request; one hour is ample for a single call.
const TOKEN_VALIDITY_SECS: u64 = 3600;

/// Parsed components of a Service Bus connection string.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Host label, e.g. `contoso` for `contoso.servicebus.windows.net`.
    pub namespace_name: String,
    /// Fully-qualified host, e.g. `contoso.servicebus.windows.net`.
    pub host: String,
    /// The `sb://` endpoint as reported back to callers.
    pub endpoint: String,
    /// The HTTPS base URL used by the REST transport (no trailing slash).
    pub https_endpoint: String,
    shared_access_key_name: String,
    shared_access_key: String,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("namespace_name", &self.namespace_name)
            .field("endpoint", &self.endpoint)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .finish()
    }
}

impl ConnectionConfig {
    /// Parse a standard Service Bus connection string (SAS auth).
    ///
    /// Expected format:
    /// `Endpoint=sb://<namespace>.servicebus.windows.net/;SharedAccessKeyName=<name>;SharedAccessKey=<key>`
    ///
    /// Never touches the network; every failure is `InvalidConnectionString`.
    pub fn from_connection_string(conn_str: &str) -> Result<Self, ServiceBusError> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            // split_once keeps '=' padding of a base64 key in the value
            if let Some((k, v)) = part.split_once('=') {
                match k.trim() {
                    "Endpoint" => endpoint = Some(v.trim().to_string()),
                    "SharedAccessKeyName" => key_name = Some(v.trim().to_string()),
                    "SharedAccessKey" => key = Some(v.trim().to_string()),
                    _ => {}
                }
            }
        }

        let endpoint = endpoint
            .ok_or_else(|| ServiceBusError::InvalidConnectionString("missing Endpoint".into()))?;
        let (namespace_name, host) = parse_endpoint(&endpoint)?;
        let key_name = key_name.filter(|v| !v.is_empty()).ok_or_else(|| {
            ServiceBusError::InvalidConnectionString("missing SharedAccessKeyName".into())
        })?;
        let key = key.filter(|v| !v.is_empty()).ok_or_else(|| {
            ServiceBusError::InvalidConnectionString("missing SharedAccessKey".into())
        })?;

        Ok(Self {
            endpoint: format!("sb://{}/", host),
            https_endpoint: format!("https://{}", host),
            namespace_name,
            host,
            shared_access_key_name: key_name,
            shared_access_key: key,
        })
    }

    /// Generate a SAS token for the given resource URI, valid for `validity_secs`.
    fn generate_sas_token(
        key_name: &str,
        key: &str,
        resource_uri: &str,
        validity_secs: u64,
    ) -> TransportResult<String> {
        let encoded_uri = urlencoding::encode(resource_uri).to_lowercase();
        let expiry = Utc::now().timestamp() as u64 + validity_secs;
        let string_to_sign = format!("{}\n{}", encoded_uri, expiry);

        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| TransportError::Auth(format!("HMAC key error: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        let signature =
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        let encoded_signature = urlencoding::encode(&signature);

        Ok(format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            encoded_uri, encoded_signature, expiry, key_name
        ))
    }

    /// Authorization header scoped to the namespace root.
    pub fn namespace_token(&self) -> TransportResult<String> {
        Self::generate_sas_token(
            &self.shared_access_key_name,
            &self.shared_access_key,
            &self.https_endpoint,
            TOKEN_VALIDITY_SECS,
        )
    }

    /// Authorization header scoped to a specific entity path.
    pub fn entity_token(&self, entity_path: &str) -> TransportResult<String> {
        let uri = format!("{}/{}", self.https_endpoint, entity_path);
        Self::generate_sas_token(
            &self.shared_access_key_name,
            &self.shared_access_key,
            &uri,
            TOKEN_VALIDITY_SECS,
        )
    }
}

/// Split `sb://<label>.servicebus.windows.net/` into `(label, host)`.
fn parse_endpoint(endpoint: &str) -> Result<(String, String), ServiceBusError> {
    let rest = endpoint.strip_prefix("sb://").ok_or_else(|| {
        ServiceBusError::InvalidConnectionString(format!("endpoint must use sb://: {}", endpoint))
    })?;
    let host = rest.split('/').next().unwrap_or_default().to_lowercase();
    let label = host
        .strip_suffix(NAMESPACE_SUFFIX)
        .filter(|l| !l.is_empty() && !l.contains('.'))
        .ok_or_else(|| {
            ServiceBusError::InvalidConnectionString(format!(
                "endpoint host is not a Service Bus namespace: {}",
                endpoint
            ))
        })?
        .to_string();
    Ok((label, host))
}
