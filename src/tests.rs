//! End-to-end tests driving a real mediator over loopback TCP. The test
//! side speaks the wire protocol through the same channel type the clients
//! ship with.

use crate::buffer::BufferMode;
use crate::channel::Channel;
use crate::config::MediatorConfig;
use crate::mediator::{ConnectionStatus, Mediator};
use crate::message::{Message, MessageType};
use crate::store::{CredentialStore, JsonStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::sleep;

const REFRESH_MS: u64 = 50;
const REFRESH: Duration = Duration::from_millis(REFRESH_MS);
const MAX_FRAME: usize = 16 * 1024 * 1024;

async fn start_mediator() -> (Mediator, SocketAddr) {
    start_mediator_with(MediatorConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        port: 0,
        refresh_interval_ms: REFRESH_MS,
        ..Default::default()
    })
    .await
}

async fn start_mediator_with(config: MediatorConfig) -> (Mediator, SocketAddr) {
    let store = JsonStore::in_memory();
    store.add_user("alice", "pw").unwrap();
    store.add_user("bob", "pw").unwrap();
    let mediator = Mediator::new(config, Arc::new(store)).unwrap();
    let addr = mediator.start().await.unwrap();
    (mediator, addr)
}

async fn open_channel(addr: SocketAddr) -> Channel {
    let stream = TcpStream::connect(addr).await.unwrap();
    let channel = Channel::new(REFRESH, MAX_FRAME);
    channel.start(
        stream,
        BufferMode::Buffered { capacity: 0 },
        BufferMode::Buffered { capacity: 0 },
    );
    channel
}

fn text(content: &str) -> Message {
    Message::text(MessageType::ServerInteraction, content)
}

async fn recv_text(channel: &Channel) -> String {
    channel
        .recv(true)
        .await
        .unwrap()
        .unwrap()
        .content_text()
        .unwrap()
        .to_string()
}

/// Log in a user's connector and complete the ready handshake.
async fn login(addr: SocketAddr, username: &str) -> Channel {
    let channel = open_channel(addr).await;
    channel.send(text("login"), false).await.unwrap();
    channel
        .send(text(&format!("{username}\npw\nconnector\nconnector")), false)
        .await
        .unwrap();
    assert_eq!(recv_text(&channel).await, "ready");
    channel.send(text("ready"), true).await.unwrap();
    channel
}

/// Ask the connector for a token for the given connection name.
async fn request_token(connector: &Channel, name: &str) -> String {
    connector
        .send(text(&format!("generate-token:{name}")), false)
        .await
        .unwrap();
    let reply = recv_text(connector).await;
    let (status, token) = reply.split_once('\n').unwrap();
    assert_eq!(status, "ok");
    token.to_string()
}

/// Open and admit a sibling connection via the token dance.
async fn open_sibling(
    addr: SocketAddr,
    connector: &Channel,
    username: &str,
    kind: &str,
    name: &str,
) -> Channel {
    let token = request_token(connector, name).await;
    let channel = open_channel(addr).await;
    channel.send(text("token"), false).await.unwrap();
    channel
        .send(text(&format!("{username}\n{token}\n{kind}\n{name}")), false)
        .await
        .unwrap();
    assert_eq!(recv_text(&channel).await, "ready");
    channel.send(text("ready"), true).await.unwrap();
    channel
}

async fn set_partner(main: &Channel, partner: &str) {
    main.send(text(&format!("set partner\n{partner}")), false)
        .await
        .unwrap();
    assert_eq!(recv_text(main).await, "set partner");
}

/// Poll a condition until it holds or the deadline passes.
async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..150 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

// -------------------------------------------------------------------------
// S1: login plus token admission of a sibling
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_login_and_token_admission_of_sibling() {
    let (mediator, addr) = start_mediator().await;
    let connector = login(addr, "alice").await;

    wait_until("alice's connector in service", || {
        mediator
            .resolve_client("alice")
            .and_then(|c| c.get_connection("connector"))
            .is_some_and(|c| c.status() == ConnectionStatus::Connected)
    })
    .await;

    let _mouse = open_sibling(addr, &connector, "alice", "mouse - sender", "mouse tracker").await;
    wait_until("mouse tracker in service", || {
        mediator
            .resolve_client("alice")
            .and_then(|c| c.get_connection("mouse tracker"))
            .is_some_and(|c| c.status() == ConnectionStatus::Connected)
    })
    .await;

    mediator.close();
}

#[tokio::test]
async fn test_wrong_password_refused() {
    let (mediator, addr) = start_mediator().await;
    let channel = open_channel(addr).await;
    channel.send(text("login"), false).await.unwrap();
    channel
        .send(text("alice\nwrong\nconnector\nconnector"), false)
        .await
        .unwrap();
    assert_eq!(recv_text(&channel).await, "Username or password are wrong");
    assert!(mediator.resolve_client("alice").is_none());
    mediator.close();
}

#[tokio::test]
async fn test_unknown_user_refused() {
    let (mediator, addr) = start_mediator().await;
    let channel = open_channel(addr).await;
    channel.send(text("login"), false).await.unwrap();
    channel
        .send(text("mallory\npw\nconnector\nconnector"), false)
        .await
        .unwrap();
    assert_eq!(recv_text(&channel).await, "Username or password are wrong");
    mediator.close();
}

#[tokio::test]
async fn test_second_login_refused_while_connected() {
    let (mediator, addr) = start_mediator().await;
    let _connector = login(addr, "alice").await;
    wait_until("alice connected", || mediator.has_client("alice")).await;

    let second = open_channel(addr).await;
    second.send(text("login"), false).await.unwrap();
    second
        .send(text("alice\npw\nconnector\nconnector"), false)
        .await
        .unwrap();
    assert_eq!(recv_text(&second).await, "User already connected");
    mediator.close();
}

#[tokio::test]
async fn test_second_login_joins_existing_client_when_allowed() {
    let (mediator, addr) = start_mediator_with(MediatorConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        port: 0,
        refresh_interval_ms: REFRESH_MS,
        allow_multiple_connectors: true,
        ..Default::default()
    })
    .await;
    let _first = login(addr, "alice").await;
    wait_until("alice connected", || mediator.has_client("alice")).await;
    let alice = mediator.resolve_client("alice").unwrap();

    // A second device logs in under its own connection name and must land on
    // the same client, not replace it.
    let second = open_channel(addr).await;
    second.send(text("login"), false).await.unwrap();
    second
        .send(text("alice\npw\nconnector\nconnector 2"), false)
        .await
        .unwrap();
    assert_eq!(recv_text(&second).await, "ready");
    second.send(text("ready"), true).await.unwrap();

    wait_until("second connector in service", || {
        alice
            .get_connection("connector 2")
            .is_some_and(|c| c.status() == ConnectionStatus::Connected)
    })
    .await;
    let current = mediator.resolve_client("alice").unwrap();
    assert!(Arc::ptr_eq(&current, &alice));
    assert_eq!(alice.connection_count(), 2);
    assert_eq!(
        alice.get_connection("connector").unwrap().status(),
        ConnectionStatus::Connected
    );
    mediator.close();
}

#[tokio::test]
async fn test_second_login_with_taken_name_refused_when_allowed() {
    let (mediator, addr) = start_mediator_with(MediatorConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        port: 0,
        refresh_interval_ms: REFRESH_MS,
        allow_multiple_connectors: true,
        ..Default::default()
    })
    .await;
    let _first = login(addr, "alice").await;
    wait_until("alice connected", || mediator.has_client("alice")).await;
    let alice = mediator.resolve_client("alice").unwrap();

    // The per-user name uniqueness rule still holds across devices.
    let second = open_channel(addr).await;
    second.send(text("login"), false).await.unwrap();
    second
        .send(text("alice\npw\nconnector\nconnector"), false)
        .await
        .unwrap();
    assert_eq!(recv_text(&second).await, "Unknown server Error");

    // The refusal leaves the first session untouched.
    let current = mediator.resolve_client("alice").unwrap();
    assert!(Arc::ptr_eq(&current, &alice));
    assert_eq!(alice.connection_count(), 1);
    assert_eq!(
        alice.get_connection("connector").unwrap().status(),
        ConnectionStatus::Connected
    );
    mediator.close();
}

#[tokio::test]
async fn test_unknown_method_refused() {
    let (mediator, addr) = start_mediator().await;
    let channel = open_channel(addr).await;
    channel.send(text("telnet"), false).await.unwrap();
    channel
        .send(text("alice\npw\nconnector\nconnector"), false)
        .await
        .unwrap();
    assert_eq!(recv_text(&channel).await, "Connection method does not exists");
    mediator.close();
}

#[tokio::test]
async fn test_signup_creates_user_and_logs_in() {
    let (mediator, addr) = start_mediator().await;
    let channel = open_channel(addr).await;
    channel.send(text("signup"), false).await.unwrap();
    channel
        .send(text("carol\nsecret\nconnector\nconnector"), false)
        .await
        .unwrap();
    assert_eq!(recv_text(&channel).await, "ready");
    channel.send(text("ready"), true).await.unwrap();

    wait_until("carol connected", || mediator.has_client("carol")).await;
    assert_eq!(mediator.store().password_of("carol").unwrap(), "secret");
    mediator.close();
}

#[tokio::test]
async fn test_token_bound_to_connection_name() {
    let (mediator, addr) = start_mediator().await;
    let connector = login(addr, "alice").await;
    let token = request_token(&connector, "mouse tracker").await;

    // Present the token under a different name.
    let channel = open_channel(addr).await;
    channel.send(text("token"), false).await.unwrap();
    channel
        .send(
            text(&format!("alice\n{token}\nmouse - sender\nkeyboard tracker")),
            false,
        )
        .await
        .unwrap();
    assert_eq!(
        recv_text(&channel).await,
        "Token's username or connection name is wrong"
    );

    // The failed attempt must not have burned the token.
    let channel = open_channel(addr).await;
    channel.send(text("token"), false).await.unwrap();
    channel
        .send(
            text(&format!("alice\n{token}\nmouse - sender\nmouse tracker")),
            false,
        )
        .await
        .unwrap();
    assert_eq!(recv_text(&channel).await, "ready");
    channel.send(text("ready"), true).await.unwrap();
    mediator.close();
}

#[tokio::test]
async fn test_unknown_token_refused() {
    let (mediator, addr) = start_mediator().await;
    let _connector = login(addr, "alice").await;
    wait_until("alice connected", || mediator.has_client("alice")).await;

    let channel = open_channel(addr).await;
    channel.send(text("token"), false).await.unwrap();
    channel
        .send(text("alice\nforged\nmouse - sender\nmouse tracker"), false)
        .await
        .unwrap();
    assert_eq!(recv_text(&channel).await, "Token does not exists");
    mediator.close();
}

// -------------------------------------------------------------------------
// S2: partner setup
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_set_partner_rejects_absent_target() {
    let (mediator, addr) = start_mediator().await;
    let connector = login(addr, "alice").await;
    let main = open_sibling(addr, &connector, "alice", "main", "main").await;

    main.send(text("set partner\nbob"), false).await.unwrap();
    assert_eq!(recv_text(&main).await, "set partner error");
    assert_eq!(mediator.resolve_client("alice").unwrap().partner(), None);
    mediator.close();
}

#[tokio::test]
async fn test_set_partner_succeeds_when_target_connected() {
    let (mediator, addr) = start_mediator().await;
    let alice_connector = login(addr, "alice").await;
    let _bob_connector = login(addr, "bob").await;
    wait_until("bob connected", || mediator.has_client("bob")).await;

    let main = open_sibling(addr, &alice_connector, "alice", "main", "main").await;
    set_partner(&main, "bob").await;
    assert_eq!(
        mediator.resolve_client("alice").unwrap().partner(),
        Some("bob".to_string())
    );
    mediator.close();
}

#[tokio::test]
async fn test_main_lists_usernames() {
    let (mediator, addr) = start_mediator().await;
    let connector = login(addr, "alice").await;
    let main = open_sibling(addr, &connector, "alice", "main", "main").await;

    main.send(text("get all usernames"), false).await.unwrap();
    assert_eq!(recv_text(&main).await, "alice, bob");

    main.send(text("get all connected usernames"), false)
        .await
        .unwrap();
    assert_eq!(recv_text(&main).await, "alice");
    mediator.close();
}

// -------------------------------------------------------------------------
// S3: latest-wins frame forwarding
// -------------------------------------------------------------------------

struct Pair {
    mediator: Mediator,
    addr: SocketAddr,
    alice_connector: Channel,
    bob_connector: Channel,
}

/// Log in both peers and partner alice with bob (and bob with alice).
async fn partnered_pair() -> Pair {
    let (mediator, addr) = start_mediator().await;
    let alice_connector = login(addr, "alice").await;
    let bob_connector = login(addr, "bob").await;
    wait_until("both connected", || {
        mediator.has_client("alice") && mediator.has_client("bob")
    })
    .await;

    let alice_main = open_sibling(addr, &alice_connector, "alice", "main", "main").await;
    set_partner(&alice_main, "bob").await;
    let bob_main = open_sibling(addr, &bob_connector, "bob", "main", "main").await;
    set_partner(&bob_main, "alice").await;

    Pair {
        mediator,
        addr,
        alice_connector,
        bob_connector,
    }
}

#[tokio::test]
async fn test_frame_forwarding_coalesces_under_congestion() {
    let pair = partnered_pair().await;
    let alice_screen = open_sibling(
        pair.addr,
        &pair.alice_connector,
        "alice",
        "frame - sender",
        "screen recorder",
    )
    .await;
    let bob_screen = open_sibling(
        pair.addr,
        &pair.bob_connector,
        "bob",
        "frame - receiver",
        "screen recorder",
    )
    .await;

    let frame = |name: &str| Message::text(MessageType::ControllerFrame, name);
    let ack = Message::text(MessageType::ControllerFrame, "Message received");

    // F1 goes straight through; the helper then blocks on bob's ACK.
    alice_screen.send(frame("F1"), false).await.unwrap();
    // The mediator echoes its flow-control ACK to the sender per frame.
    assert_eq!(recv_text(&alice_screen).await, "Message received");
    let first = bob_screen.recv(true).await.unwrap().unwrap();
    assert_eq!(first.content_text().unwrap(), "F1");

    // Two more frames while the ACK is outstanding: F2 is superseded.
    alice_screen.send(frame("F2"), false).await.unwrap();
    assert_eq!(recv_text(&alice_screen).await, "Message received");
    alice_screen.send(frame("F3"), false).await.unwrap();
    assert_eq!(recv_text(&alice_screen).await, "Message received");

    bob_screen.send(ack.clone(), false).await.unwrap();
    let second = bob_screen.recv(true).await.unwrap().unwrap();
    assert_eq!(second.content_text().unwrap(), "F3");
    bob_screen.send(ack, false).await.unwrap();

    pair.mediator.close();
}

// -------------------------------------------------------------------------
// S4: ordered event forwarding
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_ordered_forwarding_preserves_order() {
    let pair = partnered_pair().await;
    let alice_keys = open_sibling(
        pair.addr,
        &pair.alice_connector,
        "alice",
        "keyboard - sender",
        "keyboard tracker",
    )
    .await;
    let bob_keys = open_sibling(
        pair.addr,
        &pair.bob_connector,
        "bob",
        "keyboard - receiver",
        "keyboard tracker",
    )
    .await;

    for key in ["K1", "K2", "K3"] {
        alice_keys
            .send(Message::text(MessageType::ControlledFrame, key), false)
            .await
            .unwrap();
    }
    for expected in ["K1", "K2", "K3"] {
        let received = bob_keys.recv(true).await.unwrap().unwrap();
        assert_eq!(received.content_text().unwrap(), expected);
    }

    pair.mediator.close();
}

#[tokio::test]
async fn test_settings_forwarded_both_ways() {
    let pair = partnered_pair().await;
    let alice_settings = open_sibling(
        pair.addr,
        &pair.alice_connector,
        "alice",
        "settings",
        "settings",
    )
    .await;
    let bob_settings = open_sibling(
        pair.addr,
        &pair.bob_connector,
        "bob",
        "settings",
        "settings",
    )
    .await;

    alice_settings
        .send(
            Message::text(MessageType::ControlledFrame, "other screen size:800, 600"),
            false,
        )
        .await
        .unwrap();
    let at_bob = bob_settings.recv(true).await.unwrap().unwrap();
    assert_eq!(at_bob.content_text().unwrap(), "other screen size:800, 600");

    bob_settings
        .send(
            Message::text(MessageType::ControllerFrame, "image format:jpg"),
            false,
        )
        .await
        .unwrap();
    let at_alice = alice_settings.recv(true).await.unwrap().unwrap();
    assert_eq!(at_alice.content_text().unwrap(), "image format:jpg");

    pair.mediator.close();
}

// -------------------------------------------------------------------------
// S5: graceful single-connection close
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_graceful_close_removes_pair_from_both_maps() {
    let pair = partnered_pair().await;
    let _alice_mouse = open_sibling(
        pair.addr,
        &pair.alice_connector,
        "alice",
        "mouse - sender",
        "mouse tracker",
    )
    .await;
    let _bob_mouse = open_sibling(
        pair.addr,
        &pair.bob_connector,
        "bob",
        "mouse - receiver",
        "mouse tracker",
    )
    .await;

    let alice = pair.mediator.resolve_client("alice").unwrap();
    let bob = pair.mediator.resolve_client("bob").unwrap();
    let alice_conn = alice.get_connection("mouse tracker").unwrap();
    let bob_conn = bob.get_connection("mouse tracker").unwrap();

    // Alice asks her connector to close the pair and plays her side of the
    // dance: announce, disconnect locally, report finished, await ours.
    pair.alice_connector
        .send(text("close:mouse tracker"), false)
        .await
        .unwrap();
    pair.alice_connector.send(text("finished"), false).await.unwrap();
    assert_eq!(recv_text(&pair.alice_connector).await, "finished");

    wait_until("alice's map drops the name", || {
        !alice.has_connection("mouse tracker")
    })
    .await;
    assert_eq!(alice_conn.status(), ConnectionStatus::Closed);

    // The pair teardown reaches bob through his connector.
    assert_eq!(recv_text(&pair.bob_connector).await, "close:mouse tracker");
    assert_eq!(recv_text(&pair.bob_connector).await, "finished");
    pair.bob_connector.send(text("finished"), false).await.unwrap();

    wait_until("bob's map drops the name", || {
        !bob.has_connection("mouse tracker")
    })
    .await;
    assert_eq!(bob_conn.status(), ConnectionStatus::Closed);

    pair.mediator.close();
}

// -------------------------------------------------------------------------
// S6: connector crash forces client-wide crash-close
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_connector_crash_forces_client_crash_close() {
    let pair = partnered_pair().await;
    let alice_mouse = open_sibling(
        pair.addr,
        &pair.alice_connector,
        "alice",
        "mouse - sender",
        "mouse tracker",
    )
    .await;
    let _bob_mouse = open_sibling(
        pair.addr,
        &pair.bob_connector,
        "bob",
        "mouse - receiver",
        "mouse tracker",
    )
    .await;

    let alice = pair.mediator.resolve_client("alice").unwrap();
    let bob = pair.mediator.resolve_client("bob").unwrap();
    let alice_conn = alice.get_connection("mouse tracker").unwrap();

    // Kill alice's connector socket outright.
    pair.alice_connector.abort();

    wait_until("alice leaves the client map", || {
        !pair.mediator.has_client("alice")
    })
    .await;
    assert_eq!(alice_conn.status(), ConnectionStatus::Error);
    assert_eq!(alice.connection_count(), 0);

    // Bob's half of the pair is torn down through his connector.
    assert_eq!(recv_text(&pair.bob_connector).await, "close:mouse tracker");
    assert_eq!(recv_text(&pair.bob_connector).await, "finished");
    pair.bob_connector.send(text("finished"), false).await.unwrap();
    wait_until("bob's map drops the name", || {
        !bob.has_connection("mouse tracker")
    })
    .await;

    // Alice's surviving sibling socket observes the crash.
    let mut saw_closed = false;
    for _ in 0..100 {
        match alice_mouse.recv(false).await {
            Err(_) => {
                saw_closed = true;
                break;
            }
            Ok(_) => sleep(Duration::from_millis(20)).await,
        }
    }
    assert!(saw_closed);

    pair.mediator.close();
}

// -------------------------------------------------------------------------
// Shutdown behavior
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_graceful_shutdown_disconnects_clients() {
    let (mediator, addr) = start_mediator().await;
    let connector = login(addr, "alice").await;
    wait_until("alice connected", || mediator.has_client("alice")).await;

    let shutdown = {
        let mediator = mediator.clone();
        tokio::spawn(async move { mediator.shutdown().await })
    };
    assert_eq!(recv_text(&connector).await, "disconnect:");
    shutdown.await.unwrap();

    assert!(!mediator.is_running());
    assert!(!mediator.has_client("alice"));
    mediator.close();
}

#[tokio::test]
async fn test_no_admission_after_shutdown() {
    let (mediator, addr) = start_mediator().await;
    mediator.shutdown().await;

    // The accept worker is gone; a late dialer either fails to connect or
    // gets dropped before admission. Either way no client registers.
    if let Ok(stream) = TcpStream::connect(addr).await {
        let channel = Channel::new(REFRESH, MAX_FRAME);
        channel.start(
            stream,
            BufferMode::Buffered { capacity: 0 },
            BufferMode::Buffered { capacity: 0 },
        );
        let _ = channel.send(text("login"), false).await;
        let _ = channel
            .send(text("alice\npw\nconnector\nconnector"), false)
            .await;
    }
    sleep(REFRESH * 4).await;
    assert!(!mediator.has_client("alice"));
}
