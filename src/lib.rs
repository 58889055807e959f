//! Message-lifecycle core of a Service Bus explorer: connect to a namespace,
//! enumerate its entities, peek messages, delete or resend them by sequence
//! number, and send new ones.

mod broker_call;
pub mod browser;
pub mod client;
pub mod commands;
pub mod config;
pub mod directory;
pub mod mutator;
pub mod sender;
pub mod session;

pub use browser::MessageBrowser;
pub use client::models::{EntityTarget, Message, QueueSummary, ViewMode};
pub use client::{ErrorEnvelope, ErrorKind, Result, ServiceBusError};
pub use commands::{Command, CommandHandler, DeleteOutcome, Response};
pub use config::{AppConfig, ExplorerSettings};
pub use directory::NamespaceDirectory;
pub use mutator::{DeleteReport, MessageMutator, ResendOutcome};
pub use sender::MessageSender;
pub use session::{Connection, Session, SessionStatus};
