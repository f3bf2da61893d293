//! Role main loops: the connector command loop, the main-channel RPCs, and
//! the two partner-forwarding flavours.
//!
//! Every loop polls its own connection status and the server running flag;
//! leaving `Connected` is the one cancellation signal for in-progress work.

use crate::buffer::{BufferError, BufferMode, MessageBuffer};
use crate::mediator::Mediator;
use crate::mediator::client::Client;
use crate::mediator::connection::{
    CommandError, Connection, ConnectionKind, ConnectionStatus, Connector, ConnectorCommand,
};
use crate::message::{Message, MessageType};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// Why a role loop stopped. Each cause selects a specific teardown shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DisconnectCause {
    #[error("connection disconnected")]
    ConnectionDisconnected,
    #[error("partner connection disconnected")]
    PartnerConnectionDisconnected,
    #[error("client disconnected")]
    ClientDisconnected,
    #[error("partner disconnected")]
    PartnerDisconnected,
    #[error("server disconnected")]
    ServerDisconnected,
}

/// Dispatch an admitted connection to its role main loop and apply the
/// cause-specific teardown when the loop ends.
pub async fn run_role(mediator: &Mediator, client: &Arc<Client>, connection: &Arc<Connection>) {
    let cause = match connection.kind() {
        ConnectionKind::Connector => {
            // The connector owns client-wide teardown; no epilogue.
            run_connector(mediator, client, connection).await;
            return;
        }
        ConnectionKind::Main => run_main(mediator, client, connection).await,
        ConnectionKind::MouseSender | ConnectionKind::KeyboardSender | ConnectionKind::Settings => {
            run_ordered_forwarder(mediator, client, connection).await
        }
        ConnectionKind::FrameSender => run_frame_forwarder(mediator, client, connection).await,
        ConnectionKind::MouseReceiver
        | ConnectionKind::KeyboardReceiver
        | ConnectionKind::FrameReceiver => run_passive(mediator, client, connection).await,
    };
    let cause = match cause {
        Ok(()) => return,
        Err(cause) => cause,
    };
    debug!(
        user = client.username(),
        connection = connection.name(),
        %cause,
        "role loop ended"
    );

    match cause {
        DisconnectCause::ConnectionDisconnected => match connection.status() {
            // The coordinated close sequence owns the rest of the lifecycle.
            ConnectionStatus::Disconnecting
            | ConnectionStatus::Disconnected
            | ConnectionStatus::Closing
            | ConnectionStatus::Closed => {}
            _ => crash_and_notify(mediator, client, connection).await,
        },
        DisconnectCause::PartnerConnectionDisconnected | DisconnectCause::PartnerDisconnected => {
            // Close our half through the connector so both maps converge.
            if connection.status() == ConnectionStatus::Connected
                && !client
                    .queue_command(ConnectorCommand::Close(connection.name().to_string()))
                    .await
            {
                crash_and_notify(mediator, client, connection).await;
            }
        }
        DisconnectCause::ClientDisconnected | DisconnectCause::ServerDisconnected => {
            // Client-wide teardown is in progress elsewhere; it will sweep
            // this connection up.
        }
    }
}

/// The uniform liveness check every role loop runs between blocking steps.
fn check_alive(
    mediator: &Mediator,
    client: &Arc<Client>,
    connection: &Arc<Connection>,
) -> Result<(), DisconnectCause> {
    if !mediator.is_running() {
        return Err(DisconnectCause::ServerDisconnected);
    }
    if connection.status() != ConnectionStatus::Connected
        || connection.channel().fault().is_some()
    {
        return Err(DisconnectCause::ConnectionDisconnected);
    }
    match mediator.resolve_client(client.username()) {
        Some(current) if Arc::ptr_eq(&current, client) => Ok(()),
        _ => Err(DisconnectCause::ClientDisconnected),
    }
}

/// Resolve the partner's same-named connection, re-reading the maps so a
/// vanished partner is observed at the next use.
fn check_partner(
    mediator: &Mediator,
    client: &Arc<Client>,
    name: &str,
) -> Result<Arc<Connection>, DisconnectCause> {
    let partner = mediator
        .resolve_partner(client)
        .ok_or(DisconnectCause::PartnerDisconnected)?;
    let partner_conn = partner
        .get_connection(name)
        .ok_or(DisconnectCause::PartnerConnectionDisconnected)?;
    if partner_conn.status() != ConnectionStatus::Connected {
        return Err(DisconnectCause::PartnerConnectionDisconnected);
    }
    Ok(partner_conn)
}

/// Cooperatively wait for the partner client to exist and its same-named
/// connection to reach `Connected`.
async fn wait_for_partner(
    mediator: &Mediator,
    client: &Arc<Client>,
    connection: &Arc<Connection>,
) -> Result<Arc<Connection>, DisconnectCause> {
    loop {
        check_alive(mediator, client, connection)?;
        if let Some(partner) = mediator.resolve_partner(client)
            && let Some(partner_conn) = partner.get_connection(connection.name())
            && partner_conn.status() == ConnectionStatus::Connected
        {
            return Ok(partner_conn);
        }
        sleep(mediator.refresh_interval()).await;
    }
}

async fn crash_and_notify(mediator: &Mediator, client: &Arc<Client>, connection: &Arc<Connection>) {
    connection.crash();
    client.remove_connection(connection.name());
    if connection.kind().is_forwarding() {
        notify_partner_close(mediator, client, connection.name()).await;
    }
}

/// Ask the partner's connector to close its half of the pair, if that half
/// is still in service.
async fn notify_partner_close(mediator: &Mediator, client: &Arc<Client>, name: &str) {
    if let Some(partner) = mediator.resolve_partner(client)
        && let Some(partner_conn) = partner.get_connection(name)
        && partner_conn.status() == ConnectionStatus::Connected
    {
        let _ = partner
            .queue_command(ConnectorCommand::Close(name.to_string()))
            .await;
    }
}

// ---------------------------------------------------------------------------
// Main channel
// ---------------------------------------------------------------------------

/// Serve the user-level RPCs: `set partner`, `get all usernames`,
/// `get all connected usernames`.
async fn run_main(
    mediator: &Mediator,
    client: &Arc<Client>,
    connection: &Arc<Connection>,
) -> Result<(), DisconnectCause> {
    let refresh = mediator.refresh_interval();
    loop {
        check_alive(mediator, client, connection)?;
        let message = match connection.channel().recv_wait(refresh).await {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(_) => return Err(DisconnectCause::ConnectionDisconnected),
        };
        let Ok(text) = message.content_text() else {
            warn!(user = client.username(), "main channel sent non-text RPC");
            return Err(DisconnectCause::ConnectionDisconnected);
        };
        let mut lines = text.split('\n');
        let reply = match lines.next() {
            Some("set partner") => {
                let target = lines.next().unwrap_or_default();
                set_partner(mediator, client, target).await
            }
            Some("get all usernames") => match mediator.store().all_usernames() {
                Ok(usernames) => usernames.join(", "),
                Err(e) => {
                    warn!("credential store failed: {e}");
                    String::new()
                }
            },
            Some("get all connected usernames") => mediator.connected_usernames().join(", "),
            other => {
                warn!(user = client.username(), "unknown main RPC: {other:?}");
                continue;
            }
        };
        let reply = Message::text(MessageType::ServerInteraction, reply);
        if connection.channel().send(reply, false).await.is_err() {
            return Err(DisconnectCause::ConnectionDisconnected);
        }
    }
}

/// Assign a partner. Refused while forwarding connections are attached,
/// unless configured to auto-close them first.
async fn set_partner(mediator: &Mediator, client: &Arc<Client>, target: &str) -> String {
    if mediator.resolve_client(target).is_none() {
        debug!(
            user = client.username(),
            target, "set partner refused: no such client"
        );
        return "set partner error".to_string();
    }
    if client.has_forwarding_connections() {
        if !mediator.config().auto_close_forwarders_on_set_partner {
            debug!(
                user = client.username(),
                "set partner refused: forwarding connections attached"
            );
            return "set partner error".to_string();
        }
        for connection in client.all_connections() {
            if connection.kind().is_forwarding() {
                client
                    .queue_command(ConnectorCommand::Close(connection.name().to_string()))
                    .await;
            }
        }
        let deadline = Instant::now() + mediator.refresh_interval() * 10;
        while client.has_forwarding_connections() {
            if Instant::now() > deadline {
                return "set partner error".to_string();
            }
            sleep(mediator.refresh_interval()).await;
        }
    }
    client.set_partner(Some(target.to_string()));
    info!(user = client.username(), partner = target, "partner set");
    "set partner".to_string()
}

// ---------------------------------------------------------------------------
// Forwarder loops
// ---------------------------------------------------------------------------

/// Ordered buffered forwarding for the low-rate event roles. Inbound
/// messages are enqueued on a bounded FIFO; a helper task drains it onto the
/// partner's same-named connection. No ACKs; backpressure propagates to the
/// sender through the buffer fill.
async fn run_ordered_forwarder(
    mediator: &Mediator,
    client: &Arc<Client>,
    connection: &Arc<Connection>,
) -> Result<(), DisconnectCause> {
    let refresh = mediator.refresh_interval();
    let partner_conn = wait_for_partner(mediator, client, connection).await?;
    info!(
        user = client.username(),
        connection = connection.name(),
        "ordered forwarding started"
    );
    let buffer = Arc::new(MessageBuffer::new(BufferMode::Buffered {
        capacity: mediator.config().event_buffer_capacity,
    }));
    tokio::spawn(drain_ordered(
        mediator.clone(),
        buffer.clone(),
        connection.clone(),
        partner_conn,
    ));

    loop {
        check_alive(mediator, client, connection)?;
        check_partner(mediator, client, connection.name())?;
        match connection.channel().recv_wait(refresh).await {
            Ok(Some(message)) => loop {
                // Content is refcounted, so the retry clone is cheap.
                match buffer.add(message.clone(), Some(refresh)).await {
                    Ok(()) => break,
                    Err(BufferError::Full) => check_alive(mediator, client, connection)?,
                }
            },
            Ok(None) => {}
            Err(_) => return Err(DisconnectCause::ConnectionDisconnected),
        }
    }
}

/// Helper side of the ordered forwarder: pop and write in arrival order.
/// Keeps draining after the source starts disconnecting so no accepted event
/// is dropped, and stops once the buffer is dry.
async fn drain_ordered(
    mediator: Mediator,
    buffer: Arc<MessageBuffer>,
    source: Arc<Connection>,
    target: Arc<Connection>,
) {
    let refresh = mediator.refresh_interval();
    loop {
        if !mediator.is_running() || target.status() != ConnectionStatus::Connected {
            return;
        }
        match buffer.pop(Some(refresh)).await {
            Some(message) => {
                if target.channel().send(message, false).await.is_err() {
                    return;
                }
            }
            None => {
                if source.status() != ConnectionStatus::Connected {
                    return;
                }
            }
        }
    }
}

/// Latest-wins frame forwarding. Inbound frames land in a coalescing cell
/// and the helper sends at most one frame at a time to the partner, waiting
/// for the partner's one-token ACK before the next. A newer frame arriving
/// while the ACK is outstanding silently replaces the pending one.
async fn run_frame_forwarder(
    mediator: &Mediator,
    client: &Arc<Client>,
    connection: &Arc<Connection>,
) -> Result<(), DisconnectCause> {
    let refresh = mediator.refresh_interval();
    let partner_conn = wait_for_partner(mediator, client, connection).await?;
    info!(
        user = client.username(),
        connection = connection.name(),
        "frame forwarding started"
    );
    let cell = Arc::new(MessageBuffer::new(BufferMode::Coalescing));
    tokio::spawn(drain_frames(
        mediator.clone(),
        cell.clone(),
        connection.clone(),
        partner_conn,
    ));

    loop {
        check_alive(mediator, client, connection)?;
        check_partner(mediator, client, connection.name())?;
        match connection.channel().recv_wait(refresh).await {
            Ok(Some(frame)) => {
                // A coalescing add never blocks.
                let _ = cell.add(frame, None).await;
                // Flow-control echo: the sender holds its next frame until
                // this arrives.
                let ack = Message::text(MessageType::ControlledFrame, "Message received");
                if connection.channel().send(ack, false).await.is_err() {
                    return Err(DisconnectCause::ConnectionDisconnected);
                }
            }
            Ok(None) => {}
            Err(_) => return Err(DisconnectCause::ConnectionDisconnected),
        }
    }
}

/// Helper side of the frame forwarder: at most one frame in flight.
async fn drain_frames(
    mediator: Mediator,
    cell: Arc<MessageBuffer>,
    source: Arc<Connection>,
    target: Arc<Connection>,
) {
    let refresh = mediator.refresh_interval();
    loop {
        if !mediator.is_running() || target.status() != ConnectionStatus::Connected {
            return;
        }
        let Some(frame) = cell.pop(Some(refresh)).await else {
            if source.status() != ConnectionStatus::Connected {
                return;
            }
            continue;
        };
        if target.channel().send(frame, false).await.is_err() {
            return;
        }
        // One-token ACK before the next send.
        loop {
            if !mediator.is_running() || target.status() != ConnectionStatus::Connected {
                return;
            }
            match target.channel().recv_wait(refresh).await {
                Ok(Some(_ack)) => break,
                Ok(None) => {
                    if source.status() != ConnectionStatus::Connected {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }
}

/// Receiver-side roles have no loop work of their own; the partner's helper
/// writes into them. This just keeps watch so faults and closes are noticed.
async fn run_passive(
    mediator: &Mediator,
    client: &Arc<Client>,
    connection: &Arc<Connection>,
) -> Result<(), DisconnectCause> {
    loop {
        check_alive(mediator, client, connection)?;
        sleep(mediator.refresh_interval()).await;
    }
}

// ---------------------------------------------------------------------------
// Connector loop and coordinated close
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
enum CloseError {
    #[error("connector channel failed")]
    ConnectorDead,
    #[error("peer never confirmed the close")]
    Timeout,
}

enum LoopEvent {
    Continue,
    /// The peer asked for client-wide teardown.
    PeerDisconnect,
    /// Something broke; fall back to crash-close.
    Fault,
}

/// The connector main loop: starvation-free round-robin between the socket
/// (commands from the client) and the in-process queue (commands from
/// sibling workers), then client-wide teardown when either source ends it.
async fn run_connector(mediator: &Mediator, client: &Arc<Client>, connection: &Arc<Connection>) {
    let refresh = mediator.refresh_interval();
    let Some(connector) = client.connector() else {
        warn!(user = client.username(), "connector loop without a connector");
        connection.crash();
        mediator.remove_client(client);
        return;
    };
    let Some(mut queue) = connector.take_command_receiver() else {
        warn!(user = client.username(), "connector command queue already taken");
        connection.crash();
        mediator.remove_client(client);
        return;
    };

    let mut server_initiated = true;
    let mut faulted = false;
    loop {
        if !mediator.is_running() {
            break;
        }
        if connection.status() != ConnectionStatus::Connected {
            break;
        }
        let event = tokio::select! {
            result = connection.channel().recv_wait(refresh) => match result {
                Ok(Some(message)) => {
                    handle_wire_command(mediator, client, &connector, message).await
                }
                Ok(None) => LoopEvent::Continue,
                Err(e) => {
                    debug!(user = client.username(), "connector channel failed: {e}");
                    LoopEvent::Fault
                }
            },
            command = queue.recv() => match command {
                Some(command) => handle_queued_command(mediator, client, &connector, command).await,
                None => LoopEvent::Fault,
            },
        };
        match event {
            LoopEvent::Continue => {}
            LoopEvent::PeerDisconnect => {
                server_initiated = false;
                break;
            }
            LoopEvent::Fault => {
                faulted = true;
                break;
            }
        }
    }

    if faulted {
        crash_client(mediator, client).await;
        return;
    }
    teardown_client(mediator, client, &connector, server_initiated).await;
}

/// Commands arriving over the connector socket.
async fn handle_wire_command(
    mediator: &Mediator,
    client: &Arc<Client>,
    connector: &Arc<Connector>,
    message: Message,
) -> LoopEvent {
    let connection = connector.connection();
    let Ok(text) = message.content_text() else {
        warn!(user = client.username(), "connector sent a non-text command");
        return LoopEvent::Fault;
    };
    let command = match ConnectorCommand::parse(text) {
        Ok(command) => command,
        Err(e @ CommandError::MissingArgument("generate-token")) => {
            let reply = Message::text(MessageType::ServerInteraction, format!("error\n{e}"));
            let _ = connection.channel().send(reply, false).await;
            return LoopEvent::Continue;
        }
        Err(e) => {
            warn!(user = client.username(), "bad connector command: {e}");
            return LoopEvent::Continue;
        }
    };
    match command {
        ConnectorCommand::GenerateToken(name) => {
            let token = mediator.tokens().generate(client.username(), &name);
            debug!(
                user = client.username(),
                connection = %name,
                "minted admission token"
            );
            let reply = Message::text(MessageType::ServerInteraction, format!("ok\n{token}"));
            match connection.channel().send(reply, false).await {
                Ok(()) => LoopEvent::Continue,
                Err(_) => LoopEvent::Fault,
            }
        }
        ConnectorCommand::Close(name) => {
            match close_connection_pair(mediator, client, connector, &name, false).await {
                Ok(()) => LoopEvent::Continue,
                Err(e) => {
                    warn!(user = client.username(), connection = %name, "close failed: {e}");
                    LoopEvent::Fault
                }
            }
        }
        ConnectorCommand::Disconnect => {
            connection.begin_disconnect();
            LoopEvent::PeerDisconnect
        }
        ConnectorCommand::Finished => {
            // Only meaningful inside a close sequence; a stray one is noise.
            debug!(user = client.username(), "stray finished on connector");
            LoopEvent::Continue
        }
    }
}

/// Commands enqueued by sibling workers or the mediator itself.
async fn handle_queued_command(
    mediator: &Mediator,
    client: &Arc<Client>,
    connector: &Arc<Connector>,
    command: ConnectorCommand,
) -> LoopEvent {
    match command {
        ConnectorCommand::Close(name) => {
            match close_connection_pair(mediator, client, connector, &name, true).await {
                Ok(()) => LoopEvent::Continue,
                Err(e) => {
                    warn!(user = client.username(), connection = %name, "close failed: {e}");
                    LoopEvent::Fault
                }
            }
        }
        ConnectorCommand::Disconnect => {
            connector.connection().begin_disconnect();
            LoopEvent::Continue
        }
        ConnectorCommand::GenerateToken(_) | ConnectorCommand::Finished => LoopEvent::Continue,
    }
}

/// Close one named connection in coordination with the peer.
///
/// `this_side` marks the initiating side, which must announce the close; the
/// other side short-circuits that step because it is reacting to the
/// announcement. Both sides then disconnect their half, exchange `finished`,
/// and remove the name from their maps.
async fn close_connection_pair(
    mediator: &Mediator,
    client: &Arc<Client>,
    connector: &Arc<Connector>,
    name: &str,
    this_side: bool,
) -> Result<(), CloseError> {
    let refresh = mediator.refresh_interval();
    let connector_conn = connector.connection();
    let Some(connection) = client.get_connection(name) else {
        debug!(user = client.username(), connection = name, "close for unknown name");
        if !this_side {
            // Unblock the peer's wait even though we have nothing to close.
            send_command(connector_conn, ConnectorCommand::Finished).await?;
        }
        return Ok(());
    };
    if connection.kind() == ConnectionKind::Connector {
        warn!(user = client.username(), "refusing to close the connector by name");
        return Ok(());
    }

    if this_side {
        send_command(connector_conn, ConnectorCommand::Close(name.to_string())).await?;
    }

    // Whichever side first claims Connected -> Disconnecting wins the race;
    // the loser just follows the sequence already under way.
    connection.begin_disconnect();
    debug!(user = client.username(), connection = name, "disconnecting");

    // The role loop exits on the status change; drain what it accepted.
    connection.disconnect(refresh * 2).await;
    send_command(connector_conn, ConnectorCommand::Finished).await?;

    // Wait for the peer's own finished before releasing the name.
    let deadline = Instant::now() + refresh * 15;
    loop {
        if Instant::now() > deadline {
            return Err(CloseError::Timeout);
        }
        if !mediator.is_running() {
            break;
        }
        match connector_conn.channel().recv_wait(refresh).await {
            // Any response completes the wait; the peer sends nothing else
            // while a close is in flight.
            Ok(Some(_)) => break,
            Ok(None) => {}
            Err(_) => return Err(CloseError::ConnectorDead),
        }
    }

    connection.set_status(ConnectionStatus::Closing);
    client.remove_connection(name);
    connection.set_status(ConnectionStatus::Closed);
    info!(user = client.username(), connection = name, "connection closed");

    if connection.kind().is_forwarding() {
        notify_partner_close(mediator, client, name).await;
    }
    Ok(())
}

async fn send_command(
    connector_conn: &Arc<Connection>,
    command: ConnectorCommand,
) -> Result<(), CloseError> {
    let message = Message::text(MessageType::ServerInteraction, command.as_wire());
    connector_conn
        .channel()
        .send(message, false)
        .await
        .map_err(|_| CloseError::ConnectorDead)
}

/// Orderly client-wide teardown, connector last.
///
/// When this side initiated, every surviving connection goes through the
/// paired close dance and the peer is told `disconnect:` at the end. When
/// the peer initiated, it has already closed its halves, so the leftovers
/// are finished locally without a dance.
async fn teardown_client(
    mediator: &Mediator,
    client: &Arc<Client>,
    connector: &Arc<Connector>,
    server_initiated: bool,
) {
    info!(user = client.username(), "tearing down client");
    client.stop_accepting();
    let refresh = mediator.refresh_interval();
    let connector_conn = connector.connection();

    let orderly: Result<(), CloseError> = async {
        for connection in client.all_connections() {
            if connection.name() == connector_conn.name() {
                continue;
            }
            if server_initiated {
                close_connection_pair(mediator, client, connector, connection.name(), true)
                    .await?;
            } else {
                connection.begin_disconnect();
                connection.disconnect(refresh).await;
                connection.set_status(ConnectionStatus::Closing);
                client.remove_connection(connection.name());
                connection.set_status(ConnectionStatus::Closed);
                if connection.kind().is_forwarding() {
                    notify_partner_close(mediator, client, connection.name()).await;
                }
            }
        }
        if server_initiated {
            send_command(connector_conn, ConnectorCommand::Disconnect).await?;
        }
        Ok(())
    }
    .await;

    if let Err(e) = orderly {
        warn!(user = client.username(), "orderly teardown failed: {e}");
        crash_client(mediator, client).await;
        return;
    }

    // The connector is always the last to go down.
    connector_conn.begin_disconnect();
    connector_conn.disconnect(refresh).await;
    connector_conn.set_status(ConnectionStatus::Closing);
    client.remove_connection(connector_conn.name());
    connector_conn.set_status(ConnectionStatus::Closed);
    mediator.remove_client(client);
    info!(user = client.username(), "client closed");
}

/// Crash-close: every surviving sibling is force-closed and the partner is
/// told to drop its halves. Deliberately independent of the connector, which
/// is usually the thing that failed.
async fn crash_client(mediator: &Mediator, client: &Arc<Client>) {
    warn!(user = client.username(), "crash-closing client");
    let forwarding_names: Vec<String> = client
        .all_connections()
        .into_iter()
        .filter(|connection| connection.kind().is_forwarding())
        .map(|connection| connection.name().to_string())
        .collect();
    client.crash_all();
    mediator.remove_client(client);
    for name in forwarding_names {
        notify_partner_close(mediator, client, &name).await;
    }
}
