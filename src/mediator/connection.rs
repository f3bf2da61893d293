// ABOUTME: Connection identity for the mediator: role, status machine and the
// ABOUTME: distinguished connector subtype carrying the command queue

use crate::channel::Channel;
use num_enum::TryFromPrimitive;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Lifecycle of a connection.
///
/// ```text
/// NOT_STARTED → CONNECTING → CONNECTED → DISCONNECTING → DISCONNECTED
///                                   → CLOSING → CLOSED
/// ```
///
/// `Error` is reachable from any non-terminal state and then proceeds through
/// `Closing → Closed`. Every role loop polls its own status and exits as soon
/// as it is no longer `Connected`; that is the single cancellation signal for
/// in-progress work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ConnectionStatus {
    NotStarted = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
    Disconnected = 4,
    Closing = 5,
    Closed = 6,
    Error = 7,
}

/// Lock-free holder for a [`ConnectionStatus`].
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: ConnectionStatus) -> StatusCell {
        StatusCell(AtomicU8::new(status as u8))
    }

    pub fn load(&self) -> ConnectionStatus {
        // The cell only ever stores valid discriminants.
        ConnectionStatus::try_from(self.0.load(Ordering::SeqCst)).unwrap()
    }

    pub fn store(&self, status: ConnectionStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    /// Transition `from → to` atomically. Returns whether this caller won;
    /// racing close initiators use this to decide who drives the teardown.
    pub fn transition(&self, from: ConnectionStatus, to: ConnectionStatus) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// The closed set of connection roles. Each value selects one role main loop
/// on the mediator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Connector,
    Main,
    FrameSender,
    FrameReceiver,
    MouseSender,
    MouseReceiver,
    KeyboardSender,
    KeyboardReceiver,
    Settings,
}

impl ConnectionKind {
    /// The string clients put in the admission dialogue.
    pub fn as_wire(self) -> &'static str {
        match self {
            ConnectionKind::Connector => "connector",
            ConnectionKind::Main => "main",
            ConnectionKind::FrameSender => "frame - sender",
            ConnectionKind::FrameReceiver => "frame - receiver",
            ConnectionKind::MouseSender => "mouse - sender",
            ConnectionKind::MouseReceiver => "mouse - receiver",
            ConnectionKind::KeyboardSender => "keyboard - sender",
            ConnectionKind::KeyboardReceiver => "keyboard - receiver",
            ConnectionKind::Settings => "settings",
        }
    }

    pub fn from_wire(text: &str) -> Option<ConnectionKind> {
        Some(match text {
            "connector" => ConnectionKind::Connector,
            "main" => ConnectionKind::Main,
            "frame - sender" => ConnectionKind::FrameSender,
            "frame - receiver" => ConnectionKind::FrameReceiver,
            "mouse - sender" => ConnectionKind::MouseSender,
            "mouse - receiver" => ConnectionKind::MouseReceiver,
            "keyboard - sender" => ConnectionKind::KeyboardSender,
            "keyboard - receiver" => ConnectionKind::KeyboardReceiver,
            "settings" => ConnectionKind::Settings,
            _ => return None,
        })
    }

    /// Whether this role relays a stream to the partner (anything that is not
    /// a control channel).
    pub fn is_forwarding(self) -> bool {
        !matches!(self, ConnectionKind::Connector | ConnectionKind::Main)
    }

    /// Strictly one-way roles where the mediator never writes to the client,
    /// so the channel's send worker can be closed to save resources.
    pub fn mediator_never_sends(self) -> bool {
        matches!(
            self,
            ConnectionKind::MouseSender | ConnectionKind::KeyboardSender
        )
    }

    /// Strictly one-way roles where the mediator never reads from the client.
    pub fn mediator_never_receives(self) -> bool {
        matches!(
            self,
            ConnectionKind::MouseReceiver | ConnectionKind::KeyboardReceiver
        )
    }

    /// The channel buffer modes for this role, as `(input, output)` from the
    /// mediator's point of view. Frame paths coalesce on the bulk direction
    /// so a slow consumer only ever costs the stale frames.
    pub fn channel_modes(self) -> (crate::buffer::BufferMode, crate::buffer::BufferMode) {
        use crate::buffer::BufferMode::{Buffered, Coalescing};
        let fifo = Buffered { capacity: 0 };
        match self {
            ConnectionKind::FrameSender => (Coalescing, fifo),
            ConnectionKind::FrameReceiver => (fifo, Coalescing),
            _ => (fifo, fifo),
        }
    }
}

/// One logical substream between a user and the mediator.
pub struct Connection {
    name: String,
    kind: ConnectionKind,
    status: StatusCell,
    channel: Channel,
}

impl Connection {
    pub fn new(name: impl Into<String>, kind: ConnectionKind, channel: Channel) -> Connection {
        Connection {
            name: name.into(),
            kind,
            status: StatusCell::new(ConnectionStatus::NotStarted),
            channel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.load()
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.status.store(status);
    }

    /// Claim the `Connected → Disconnecting` transition. Whichever side
    /// claims it first drives the close; the loser observes the state and
    /// short-circuits its own sequence.
    pub fn begin_disconnect(&self) -> bool {
        self.status
            .transition(ConnectionStatus::Connected, ConnectionStatus::Disconnecting)
    }

    /// Complete the disconnect: give in-flight sends up to `drain_for` to
    /// leave the buffer, stop the channel, and mark the connection
    /// `Disconnected`.
    pub async fn disconnect(&self, drain_for: Duration) {
        self.channel.drain_send(drain_for).await;
        self.channel.shutdown(true).await;
        self.status.store(ConnectionStatus::Disconnected);
    }

    /// Crash path: latch `Error`, force the channel down, no draining and no
    /// cooperation required from anything else.
    pub fn crash(&self) {
        self.status.store(ConnectionStatus::Error);
        self.channel.abort();
    }
}

/// Commands travelling over a connector, on the wire as `<verb>:<argument>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorCommand {
    /// Mint a token admitting a sibling connection under the given name.
    GenerateToken(String),
    /// Close the named connection on both sides of the pair.
    Close(String),
    /// Tear down the whole client.
    Disconnect,
    /// The peer finished draining its half of a closing connection.
    Finished,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown connector command: {0:?}")]
    UnknownVerb(String),
    #[error("connector command {0:?} requires an argument")]
    MissingArgument(&'static str),
}

impl ConnectorCommand {
    pub fn parse(text: &str) -> Result<ConnectorCommand, CommandError> {
        let (verb, argument) = match text.split_once(':') {
            Some((verb, argument)) => (verb, argument),
            None => (text, ""),
        };
        match verb {
            "generate-token" => {
                if argument.is_empty() {
                    return Err(CommandError::MissingArgument("generate-token"));
                }
                Ok(ConnectorCommand::GenerateToken(argument.to_string()))
            }
            "close" => {
                if argument.is_empty() {
                    return Err(CommandError::MissingArgument("close"));
                }
                Ok(ConnectorCommand::Close(argument.to_string()))
            }
            "disconnect" => Ok(ConnectorCommand::Disconnect),
            "finished" => Ok(ConnectorCommand::Finished),
            other => Err(CommandError::UnknownVerb(other.to_string())),
        }
    }

    pub fn as_wire(&self) -> String {
        match self {
            ConnectorCommand::GenerateToken(name) => format!("generate-token:{name}"),
            ConnectorCommand::Close(name) => format!("close:{name}"),
            ConnectorCommand::Disconnect => "disconnect:".to_string(),
            ConnectorCommand::Finished => "finished".to_string(),
        }
    }
}

/// The distinguished control connection of a client.
///
/// Besides the socket it carries a bounded in-process command queue, so any
/// sibling worker can request control work without holding a lock while the
/// connector loop services both sources round-robin.
pub struct Connector {
    connection: Arc<Connection>,
    commands: mpsc::Sender<ConnectorCommand>,
    receiver: Mutex<Option<mpsc::Receiver<ConnectorCommand>>>,
}

impl Connector {
    pub fn new(connection: Arc<Connection>, queue_capacity: usize) -> Connector {
        let (commands, receiver) = mpsc::channel(queue_capacity);
        Connector {
            connection,
            commands,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// A handle sibling workers use to enqueue commands.
    pub fn command_queue(&self) -> mpsc::Sender<ConnectorCommand> {
        self.commands.clone()
    }

    /// Hand the queue's receiving end to the connector loop. Yields `None`
    /// after the first call.
    pub fn take_command_receiver(&self) -> Option<mpsc::Receiver<ConnectorCommand>> {
        self.receiver.lock().unwrap().take()
    }
}
