pub mod buffer;
pub mod channel;
pub mod codec;
pub mod config;
pub mod mediator;
pub mod message;
pub mod store;

#[cfg(test)]
mod tests;

// Re-export the transport building blocks for direct access
pub use buffer::{BufferError, BufferMode, MessageBuffer};
pub use channel::{Channel, ChannelError};
pub use codec::{CodecError, MessageReader, encode};
pub use config::{ConfigError, MediatorConfig};
pub use message::{Message, MessageType};

// Re-export the mediator API for easy access
pub use mediator::{
    Client, Connection, ConnectionKind, ConnectionStatus, Connector, ConnectorCommand,
    DisconnectCause, Mediator, MediatorError, TokenError, TokenGenerator,
};
pub use store::{CredentialStore, JsonStore, StoreError};
