use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw failure reported by a broker transport, before classification.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Service Bus returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Stable discriminant of [`ServiceBusError`], carried in the error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidConnectionString,
    ConnectTimeout,
    Unauthorized,
    NetworkError,
    NotConnected,
    MissingSequenceNumber,
    MessageNotFound,
    ReceiveExhausted,
    Timeout,
    ServiceBusError,
}

/// Classified failure of a public operation.
#[derive(Error, Debug)]
pub enum ServiceBusError {
    #[error("Invalid connection string format")]
    InvalidConnectionString(String),

    #[error("Connection timed out. Please check your internet connection.")]
    ConnectTimeout(String),

    #[error("Authentication failed. Please check your connection string and ensure you have the necessary permissions.")]
    Unauthorized(String),

    #[error("Network error. Please check your internet connection and VPN settings.")]
    Network(String),

    #[error("Not connected to Service Bus")]
    NotConnected,

    #[error("Message has no sequence number")]
    MissingSequenceNumber,

    #[error("Message with sequence number {sequence_number} not found")]
    MessageNotFound { sequence_number: i64 },

    #[error("Message with sequence number {sequence_number} could not be received after {attempts} attempts")]
    ReceiveExhausted { sequence_number: i64, attempts: u32 },

    #[error("Operation '{operation}' did not complete within {after_ms} ms")]
    Timeout { operation: &'static str, after_ms: u64 },

    #[error("Service Bus Error")]
    ServiceBus(String),
}

pub type Result<T> = std::result::Result<T, ServiceBusError>;

impl ServiceBusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConnectionString(_) => ErrorKind::InvalidConnectionString,
            Self::ConnectTimeout(_) => ErrorKind::ConnectTimeout,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Network(_) => ErrorKind::NetworkError,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::MissingSequenceNumber => ErrorKind::MissingSequenceNumber,
            Self::MessageNotFound { .. } => ErrorKind::MessageNotFound,
            Self::ReceiveExhausted { .. } => ErrorKind::ReceiveExhausted,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ServiceBus(_) => ErrorKind::ServiceBusError,
        }
    }

    /// The underlying failure text, when there is one beyond the headline message.
    pub fn details(&self) -> Option<&str> {
        match self {
            Self::InvalidConnectionString(d)
            | Self::ConnectTimeout(d)
            | Self::Unauthorized(d)
            | Self::Network(d)
            | Self::ServiceBus(d) => Some(d.as_str()).filter(|d| !d.is_empty()),
            _ => None,
        }
    }

    /// Failures that suggest the link to the namespace dropped, making a
    /// reconnect with the last good connection string worth one attempt.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::Network(_) | Self::ConnectTimeout(_)
        )
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            message: self.to_string(),
            details: self.details().map(str::to_string),
            kind: Some(self.kind()),
        }
    }
}

/// Serialized error shape handed to the command surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl ErrorEnvelope {
    /// JSON text of the envelope, the form the command surface transmits.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"message\":{:?}}}", self.message))
    }
}

impl From<&ServiceBusError> for ErrorEnvelope {
    fn from(err: &ServiceBusError) -> Self {
        err.to_envelope()
    }
}

// ──────────────────────────── Classification ────────────────────────────

/// Map a transport failure into the public taxonomy.
///
/// Structured signals (HTTP status, reqwest's timeout/connect flags) win;
/// wording of the failure text is only consulted when none is present.
pub fn classify(err: TransportError) -> ServiceBusError {
    let details = error_chain_text(&err);

    match &err {
        TransportError::Api { status, .. } if *status == 401 || *status == 403 => {
            return ServiceBusError::Unauthorized(details);
        }
        TransportError::Auth(_) => return ServiceBusError::Unauthorized(details),
        TransportError::Http(e) if e.is_timeout() => {
            return ServiceBusError::ConnectTimeout(details);
        }
        TransportError::Http(e) if e.is_connect() => return ServiceBusError::Network(details),
        TransportError::Http(e) => {
            if let Some(status) = e.status() {
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    return ServiceBusError::Unauthorized(details);
                }
            }
        }
        _ => {}
    }

    match classify_message(&details) {
        Some(ErrorKind::ConnectTimeout) => ServiceBusError::ConnectTimeout(details),
        Some(ErrorKind::Unauthorized) => ServiceBusError::Unauthorized(details),
        Some(ErrorKind::NetworkError) => ServiceBusError::Network(details),
        _ => ServiceBusError::ServiceBus(details),
    }
}

/// Last-resort classification from the wording of a failure message.
///
/// Checked in order: timeout, authorization, network.
pub fn classify_message(message: &str) -> Option<ErrorKind> {
    let message = message.to_lowercase();
    if message.contains("timeout") || message.contains("timed out") {
        return Some(ErrorKind::ConnectTimeout);
    }
    if message.contains("unauthorized") || message.contains("401") {
        return Some(ErrorKind::Unauthorized);
    }
    if message.contains("network")
        || message.contains("enotfound")
        || message.contains("failed to lookup address")
        || message.contains("dns error")
        || message.contains("no such host")
    {
        return Some(ErrorKind::NetworkError);
    }
    None
}

fn error_chain_text(err: &TransportError) -> String {
    let mut text = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        let part = inner.to_string();
        if !text.contains(&part) {
            text.push_str(": ");
            text.push_str(&part);
        }
        source = inner.source();
    }
    text
}
