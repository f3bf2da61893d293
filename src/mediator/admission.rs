// ABOUTME: The admission dialogue: login, signup, and token-based attachment
// ABOUTME: of sibling connections, ending in the ready/ready drain handshake

use crate::channel::{Channel, ChannelError};
use crate::mediator::client::Client;
use crate::mediator::connection::{Connection, ConnectionKind, Connector};
use crate::mediator::token::TokenError;
use crate::mediator::Mediator;
use crate::message::{Message, MessageType};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Client-visible admission refusals. The `Display` strings are the wire
/// contract: they are sent to the client verbatim in place of `ready`.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Username or password are wrong")]
    BadCredentials,
    #[error("User already connected")]
    AlreadyConnected,
    #[error("Connection method does not exists")]
    UnknownMethod,
    #[error("Unknown server Error")]
    Unknown,
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// Why an accepted stream produced no connection.
#[derive(Debug, Error)]
pub enum AdmissionFailure {
    #[error("admission refused: {0}")]
    Refused(AdmissionError),
    #[error("admission transport failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("mediator is shutting down")]
    ShuttingDown,
}

/// The outcome of a successful admission: the connection is attached to its
/// client and both sides have confirmed their buffers are drained.
pub struct Admitted {
    pub client: Arc<Client>,
    pub connection: Arc<Connection>,
}

/// What the dialogue decided before any state was committed.
struct Prepared {
    name: String,
    kind: ConnectionKind,
    target: Target,
}

enum Target {
    NewClient { username: String, password: String },
    Existing(Arc<Client>),
}

/// Run the admission dialogue over a freshly started channel.
///
/// On refusal the error string is flushed to the client and the channel torn
/// down. On success the returned connection is already present in its
/// client's map, still in `NotStarted`; the caller owns the transition into
/// service.
pub async fn admit(mediator: &Mediator, channel: Channel) -> Result<Admitted, AdmissionFailure> {
    if !mediator.is_running() {
        channel.shutdown(true).await;
        return Err(AdmissionFailure::ShuttingDown);
    }

    let decision = dialogue(mediator, &channel).await;
    let prepared = match decision {
        Ok(prepared) => prepared,
        Err(DialogueEnd::Refused(refusal)) => {
            debug!("refusing admission: {refusal}");
            let refused = Message::text(MessageType::ServerInteraction, refusal.to_string());
            let _ = channel.send(refused, true).await;
            channel.shutdown(true).await;
            return Err(AdmissionFailure::Refused(refusal));
        }
        Err(DialogueEnd::Channel(e)) => {
            channel.shutdown(true).await;
            return Err(AdmissionFailure::Channel(e));
        }
    };

    // Commit: attach the connection before telling the client `ready`, so a
    // token admission racing a close cannot observe a half-attached name.
    let connection = Arc::new(Connection::new(
        prepared.name.clone(),
        prepared.kind,
        channel,
    ));
    let (client, is_new_client) = match prepared.target {
        Target::NewClient { username, password } => {
            (Arc::new(Client::new(username, password)), true)
        }
        Target::Existing(client) => (client, false),
    };

    if let Err(e) = client.add_connection(connection.clone()) {
        warn!("cannot attach connection {:?}: {e}", prepared.name);
        let refusal = AdmissionError::Unknown;
        let refused = Message::text(MessageType::ServerInteraction, refusal.to_string());
        let _ = connection.channel().send(refused, true).await;
        connection.channel().shutdown(true).await;
        return Err(AdmissionFailure::Refused(refusal));
    }
    if is_new_client {
        mediator.register_client(client.clone());
    }

    match handshake(&connection).await {
        Ok(()) => {
            // Only a confirmed connector takes over command routing; an
            // aborted handshake must not displace a client's live connector.
            if prepared.kind == ConnectionKind::Connector {
                let connector = Arc::new(Connector::new(
                    connection.clone(),
                    mediator.config().connector_queue_capacity,
                ));
                client.set_connector(connector);
            }
            info!(
                user = client.username(),
                connection = connection.name(),
                "admission complete"
            );
            Ok(Admitted { client, connection })
        }
        Err(e) => {
            // Roll the commit back; the client never confirmed.
            client.remove_connection(connection.name());
            if is_new_client {
                mediator.remove_client(&client);
            }
            connection.crash();
            Err(AdmissionFailure::Channel(e))
        }
    }
}

enum DialogueEnd {
    Refused(AdmissionError),
    Channel(ChannelError),
}

impl From<ChannelError> for DialogueEnd {
    fn from(e: ChannelError) -> DialogueEnd {
        DialogueEnd::Channel(e)
    }
}

impl From<AdmissionError> for DialogueEnd {
    fn from(e: AdmissionError) -> DialogueEnd {
        DialogueEnd::Refused(e)
    }
}

async fn dialogue(mediator: &Mediator, channel: &Channel) -> Result<Prepared, DialogueEnd> {
    let method = recv_text(channel).await?;
    debug!("connecting method: {method}");
    let info = recv_text(channel).await?;
    let fields: Vec<&str> = info.split('\n').collect();
    if fields.len() != 4 {
        return Err(AdmissionError::Unknown.into());
    }

    match method.as_str() {
        "login" => login(mediator, &fields),
        "signup" => signup(mediator, &fields),
        "token" => with_token(mediator, &fields),
        _ => Err(AdmissionError::UnknownMethod.into()),
    }
}

fn login(mediator: &Mediator, fields: &[&str]) -> Result<Prepared, DialogueEnd> {
    let [username, password, kind, name] = [fields[0], fields[1], fields[2], fields[3]];
    let store = mediator.store();

    let exists = store.username_exists(username).map_err(|e| {
        warn!("credential store failed: {e}");
        AdmissionError::Unknown
    })?;
    if !exists {
        return Err(AdmissionError::BadCredentials.into());
    }
    let stored = store.password_of(username).map_err(|e| {
        warn!("credential store failed: {e}");
        AdmissionError::Unknown
    })?;
    if stored != password {
        return Err(AdmissionError::BadCredentials.into());
    }
    let kind = ConnectionKind::from_wire(kind).ok_or(AdmissionError::Unknown)?;
    if let Some(client) = mediator.resolve_client(username) {
        if !mediator.config().allow_multiple_connectors {
            return Err(AdmissionError::AlreadyConnected.into());
        }
        // A further login joins the live client instead of replacing it, so
        // both devices share one connection map; the duplicate-name check in
        // the commit step refuses a second connection under the same name.
        return Ok(Prepared {
            name: name.to_string(),
            kind,
            target: Target::Existing(client),
        });
    }

    Ok(Prepared {
        name: name.to_string(),
        kind,
        target: Target::NewClient {
            username: username.to_string(),
            password: password.to_string(),
        },
    })
}

fn signup(mediator: &Mediator, fields: &[&str]) -> Result<Prepared, DialogueEnd> {
    let [username, password] = [fields[0], fields[1]];
    mediator.store().add_user(username, password).map_err(|e| {
        warn!("signup for {username:?} failed: {e}");
        AdmissionError::Unknown
    })?;
    login(mediator, fields)
}

fn with_token(mediator: &Mediator, fields: &[&str]) -> Result<Prepared, DialogueEnd> {
    let [username, token, kind, name] = [fields[0], fields[1], fields[2], fields[3]];

    // The user must still be connected; a vanished user invalidates every
    // outstanding token admission.
    let client = mediator
        .resolve_client(username)
        .ok_or(AdmissionError::Unknown)?;
    let kind = ConnectionKind::from_wire(kind).ok_or(AdmissionError::Unknown)?;
    mediator
        .tokens()
        .release(token, username, name)
        .map_err(AdmissionError::Token)?;

    Ok(Prepared {
        name: name.to_string(),
        kind,
        target: Target::Existing(client),
    })
}

/// Send `ready`, then wait for the client's `ready`, confirming both sides
/// have drained their admission-phase buffers before any mode switch.
async fn handshake(connection: &Arc<Connection>) -> Result<(), ChannelError> {
    connection
        .channel()
        .send(Message::text(MessageType::ServerInteraction, "ready"), true)
        .await?;
    let confirm = connection.channel().recv(true).await?;
    match confirm.as_ref().and_then(|m| m.content_text().ok()) {
        Some("ready") => Ok(()),
        other => {
            warn!(
                connection = connection.name(),
                "expected ready confirmation, got {other:?}"
            );
            Err(ChannelError::Closed {
                detail: "handshake broken".to_string(),
            })
        }
    }
}

async fn recv_text(channel: &Channel) -> Result<String, DialogueEnd> {
    let message = channel.recv(true).await?;
    let message = message.ok_or(ChannelError::Closed {
        detail: "stream ended during admission".to_string(),
    })?;
    Ok(message
        .content_text()
        .map_err(|_| AdmissionError::Unknown)?
        .to_string())
}
