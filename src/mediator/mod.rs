//! The mediator server: accept loop, admission, and the per-connection role
//! loops that shuttle messages between partnered peers.

use crate::buffer::BufferMode;
use crate::channel::Channel;
use crate::config::MediatorConfig;
use crate::store::CredentialStore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod admission;
pub mod client;
pub mod connection;
pub mod forward;
pub mod token;

pub use client::Client;
pub use connection::{
    Connection, ConnectionKind, ConnectionStatus, Connector, ConnectorCommand,
};
pub use forward::DisconnectCause;
pub use token::{TokenError, TokenGenerator};

#[derive(Debug, Error)]
pub enum MediatorError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("bind error: {0}")]
    Bind(std::io::Error),
    #[error("mediator is already running")]
    AlreadyRunning,
}

struct Inner {
    config: MediatorConfig,
    store: Arc<dyn CredentialStore>,
    clients: Mutex<HashMap<String, Arc<Client>>>,
    tokens: TokenGenerator,
    running: AtomicBool,
    shutdown: tokio::sync::Notify,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handles all communication between clients.
#[derive(Clone)]
pub struct Mediator {
    inner: Arc<Inner>,
}

impl Mediator {
    pub fn new(
        config: MediatorConfig,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Mediator, MediatorError> {
        config.validate()?;
        Ok(Mediator {
            inner: Arc::new(Inner {
                config,
                store,
                clients: Mutex::new(HashMap::new()),
                tokens: TokenGenerator::new(),
                running: AtomicBool::new(false),
                shutdown: tokio::sync::Notify::new(),
                accept_task: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &MediatorConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.store
    }

    pub fn tokens(&self) -> &TokenGenerator {
        &self.inner.tokens
    }

    pub fn refresh_interval(&self) -> Duration {
        self.inner.config.refresh_interval()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Bind the listener and launch the accept worker. Returns the bound
    /// address, which matters when the configured port is 0.
    pub async fn start(&self) -> Result<SocketAddr, MediatorError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(MediatorError::AlreadyRunning);
        }
        let addr = format!(
            "{}:{}",
            self.inner.config.bind_address, self.inner.config.port
        );
        let listener = TcpListener::bind(&addr).await.map_err(MediatorError::Bind)?;
        let local_addr = listener.local_addr().map_err(MediatorError::Bind)?;
        info!("mediator listening on {local_addr}");

        let mediator = self.clone();
        *self.inner.accept_task.lock().unwrap() = Some(tokio::spawn(async move {
            mediator.accept_loop(listener).await;
        }));
        Ok(local_addr)
    }

    async fn accept_loop(&self, listener: TcpListener) {
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        if !self.is_running() {
                            break;
                        }
                        info!("new connection from {peer}");
                        let mediator = self.clone();
                        tokio::spawn(async move {
                            mediator.run_connection(stream).await;
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                    }
                },
                _ = self.inner.shutdown.notified() => break,
            }
            if !self.is_running() {
                break;
            }
        }
        debug!("accept worker exited");
    }

    /// Drive one accepted byte stream: admission, then the role main loop.
    async fn run_connection(&self, stream: TcpStream) {
        let channel = Channel::new(self.refresh_interval(), self.inner.config.max_frame_len);
        // The admission dialogue always runs over plain buffered FIFOs; role
        // buffer modes only apply after the drain handshake.
        channel.start(
            stream,
            BufferMode::Buffered { capacity: 0 },
            BufferMode::Buffered { capacity: 0 },
        );

        let admitted = match admission::admit(self, channel).await {
            Ok(admitted) => admitted,
            Err(e) => {
                warn!("admission failed: {e}");
                return;
            }
        };
        let client = admitted.client;
        let connection = admitted.connection;

        connection.set_status(ConnectionStatus::Connecting);
        let (input_mode, output_mode) = connection.kind().channel_modes();
        connection.channel().switch_modes(input_mode, output_mode);
        if connection.kind().mediator_never_sends() {
            connection.channel().close_send_worker();
        }
        if connection.kind().mediator_never_receives() {
            connection.channel().close_recv_worker();
        }
        if !self.is_running() {
            // Shutdown raced the admission; never reach Connected.
            connection.crash();
            client.remove_connection(connection.name());
            return;
        }
        connection.set_status(ConnectionStatus::Connected);
        info!(
            user = client.username(),
            connection = connection.name(),
            kind = connection.kind().as_wire(),
            "connection entered service"
        );

        forward::run_role(self, &client, &connection).await;
    }

    pub fn register_client(&self, client: Arc<Client>) {
        self.inner
            .clients
            .lock()
            .unwrap()
            .insert(client.username().to_string(), client);
    }

    /// Drop the username's entry, but only when it still maps to this exact
    /// client; a re-login may already have replaced it.
    pub fn remove_client(&self, client: &Arc<Client>) {
        let mut clients = self.inner.clients.lock().unwrap();
        if let Some(current) = clients.get(client.username())
            && Arc::ptr_eq(current, client)
        {
            clients.remove(client.username());
        }
    }

    pub fn resolve_client(&self, username: &str) -> Option<Arc<Client>> {
        self.inner.clients.lock().unwrap().get(username).cloned()
    }

    pub fn has_client(&self, username: &str) -> bool {
        self.inner.clients.lock().unwrap().contains_key(username)
    }

    /// Resolve this client's partner through the client map. The result is a
    /// snapshot; the partner may vanish between this call and any use.
    pub fn resolve_partner(&self, client: &Client) -> Option<Arc<Client>> {
        let partner = client.partner()?;
        self.resolve_client(&partner)
    }

    pub fn connected_usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.clients.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn all_clients(&self) -> Vec<Arc<Client>> {
        self.inner.clients.lock().unwrap().values().cloned().collect()
    }

    /// Graceful shutdown: stop accepting, then ask every client's connector
    /// loop to tear its client down, connector last. Waits a bounded time
    /// for the client map to drain.
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("mediator shutting down");
        self.inner.shutdown.notify_waiters();
        if let Some(task) = self.inner.accept_task.lock().unwrap().take() {
            task.abort();
        }
        for client in self.all_clients() {
            if !client.queue_command(ConnectorCommand::Disconnect).await {
                // No live connector to coordinate with.
                client.crash_all();
                self.remove_client(&client);
            }
        }
        let deadline = tokio::time::Instant::now() + self.refresh_interval() * 10;
        while tokio::time::Instant::now() < deadline {
            if self.inner.clients.lock().unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        warn!("graceful shutdown timed out; crash-closing the remainder");
        self.close();
    }

    /// Immediate teardown: crash-close every connection of every client.
    pub fn close(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
        if let Some(task) = self.inner.accept_task.lock().unwrap().take() {
            task.abort();
        }
        let clients: Vec<_> = {
            let mut map = self.inner.clients.lock().unwrap();
            map.drain().map(|(_, client)| client).collect()
        };
        for client in clients {
            client.crash_all();
        }
    }

    /// Graceful shutdown followed by forced socket teardown.
    pub async fn quick_close(&self) {
        self.shutdown().await;
        self.close();
    }

    /// One line per client for the operator's `status` command.
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for client in self.all_clients() {
            let mut connections: Vec<String> = client
                .all_connections()
                .iter()
                .map(|connection| {
                    format!(
                        "{} [{}] {:?}",
                        connection.name(),
                        connection.kind().as_wire(),
                        connection.status()
                    )
                })
                .collect();
            connections.sort();
            lines.push(format!(
                "{} (partner: {}): {}",
                client.username(),
                client.partner().unwrap_or_else(|| "-".to_string()),
                connections.join(", ")
            ));
        }
        lines.sort();
        lines
    }
}
