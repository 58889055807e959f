pub mod auth;
pub mod connector;
pub mod data_plane;
pub mod error;
pub mod management;
pub mod memory;
pub mod models;
pub mod transport;

pub use auth::ConnectionConfig;
pub use connector::RestConnector;
pub use data_plane::DataPlaneClient;
pub use error::{ErrorEnvelope, ErrorKind, Result, ServiceBusError, TransportError};
pub use management::ManagementClient;
pub use memory::InMemoryBroker;
pub use transport::{AdminTransport, BrokerHandles, Connector, DataTransport, ReceiverLink, SenderLink};
