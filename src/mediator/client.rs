// ABOUTME: Server-side representation of one authenticated user
// ABOUTME: Owns the user's named connections and the partner reference

use crate::mediator::connection::{Connection, Connector, ConnectorCommand};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("connection {0:?} already exists")]
    ConnectionExists(String),
    #[error("client is no longer accepting connections")]
    NotAccepting,
}

/// One logged-in user: a set of named connections, an optional partner, and
/// the coordinated close operations over them.
///
/// The partner is stored as a bare username and resolved through the
/// mediator's client map at every use, so a partner that logs out simply
/// stops resolving; nothing here keeps it alive.
pub struct Client {
    username: String,
    password: String,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    partner: Mutex<Option<String>>,
    accepting: AtomicBool,
    connector: Mutex<Option<Arc<Connector>>>,
}

impl Client {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Client {
        Client {
            username: username.into(),
            password: password.into(),
            connections: Mutex::new(HashMap::new()),
            partner: Mutex::new(None),
            accepting: AtomicBool::new(true),
            connector: Mutex::new(None),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn set_connector(&self, connector: Arc<Connector>) {
        *self.connector.lock().unwrap() = Some(connector);
    }

    pub fn connector(&self) -> Option<Arc<Connector>> {
        self.connector.lock().unwrap().clone()
    }

    /// Enqueue control work for this client's connector loop. Returns false
    /// when the client has no live connector or the queue is gone.
    pub async fn queue_command(&self, command: ConnectorCommand) -> bool {
        let Some(connector) = self.connector() else {
            return false;
        };
        connector.command_queue().send(command).await.is_ok()
    }

    /// Refuse any further admissions; flipped at the start of client-wide
    /// teardown so a racing token admission cannot repopulate the map.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn add_connection(&self, connection: Arc<Connection>) -> Result<(), ClientError> {
        if !self.is_accepting() {
            return Err(ClientError::NotAccepting);
        }
        let mut connections = self.connections.lock().unwrap();
        if connections.contains_key(connection.name()) {
            return Err(ClientError::ConnectionExists(connection.name().to_string()));
        }
        connections.insert(connection.name().to_string(), connection);
        Ok(())
    }

    pub fn remove_connection(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections.lock().unwrap().remove(name)
    }

    pub fn get_connection(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections.lock().unwrap().get(name).cloned()
    }

    pub fn has_connection(&self, name: &str) -> bool {
        self.connections.lock().unwrap().contains_key(name)
    }

    pub fn all_connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().unwrap().values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Whether any forwarding (non-control) connection is attached. Changing
    /// partners is only legal while this is false.
    pub fn has_forwarding_connections(&self) -> bool {
        self.connections
            .lock()
            .unwrap()
            .values()
            .any(|connection| connection.kind().is_forwarding())
    }

    pub fn partner(&self) -> Option<String> {
        self.partner.lock().unwrap().clone()
    }

    pub fn set_partner(&self, partner: Option<String>) {
        *self.partner.lock().unwrap() = partner;
    }

    /// Crash-close every connection and empty the map. Deliberately free of
    /// any dependency on the connector, which may be the thing that failed.
    pub fn crash_all(&self) {
        self.stop_accepting();
        let connections: Vec<_> = {
            let mut map = self.connections.lock().unwrap();
            map.drain().map(|(_, connection)| connection).collect()
        };
        for connection in connections {
            debug!(
                user = %self.username,
                connection = connection.name(),
                "crash-closing connection"
            );
            connection.crash();
        }
    }
}
