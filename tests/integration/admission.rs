use std::net::SocketAddr;
use std::time::Duration;

use ember_core::cipher::CipherContext;
use ember_core::codec::{decode_exact, encode, split_chunk};
use ember_core::message::{Info, Message, NodeKind};
use ember_services::protocol::{ask_challenge, ask_network, CHALLENGE_FAILED};
use ember_services::session::PROTOCOL_VIOLATION;
use ember_services::{Session, SessionError, SessionOptions, SessionState};
use rsa::RsaPublicKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::*;

const WAIT: Duration = Duration::from_secs(10);

async fn accept_one(listener: &tokio::net::TcpListener) -> (Session, SocketAddr) {
    let (stream, addr) = listener.accept().await.unwrap();
    let session = Session::accept(stream, server_node(), SessionOptions::new(addr.to_string()))
        .await
        .unwrap();
    (session, addr)
}

/// Full admission over loopback: key, challenge, identity, network, welcome.
#[tokio::test]
async fn test_full_admission() {
    let (listener, addr) = loopback().await;
    let client = spawn_client(addr, client_node(), CipherContext::Plain);

    let (server, peer_addr) = accept_one(&listener).await;
    assert_eq!(server.peer_mac(), Some(CLIENT_MAC));
    assert_eq!(server.state(), SessionState::Handshaking);

    let admitted = admit(&server, peer_addr).await.expect("client should be admitted");
    assert_eq!(admitted.identity.unwrap().hostname, "laptop");
    assert_eq!(admitted.network_size, 1);
    assert_eq!(server.state(), SessionState::Ready);
    assert!(server.local().peers.contains_key(CLIENT_MAC));

    let client = client.await.unwrap().unwrap();
    assert_eq!(client.state(), SessionState::Ready);
}

/// A peer that cannot decrypt the challenge is rejected on both ends.
#[tokio::test]
async fn test_impostor_fails_challenge() {
    let (listener, addr) = loopback().await;
    let client = spawn_client(addr, client_node(), CipherContext::Plain);
    let (server, _) = accept_one(&listener).await;

    // Challenge sealed for a key the client does not hold.
    let foreign = RsaPublicKey::from(&private_key(1));
    assert!(!ask_challenge(&server, &foreign).await);
    assert_eq!(server.state(), SessionState::Closed);

    match client.await.unwrap() {
        Err(SessionError::Rejected(reason)) => assert_eq!(reason, CHALLENGE_FAILED),
        other => panic!("expected rejection, got {:?}", other.map(|s| s.state())),
    }
}

/// A connection whose first message is not info{mac} gets a protocol
/// violation error and is dropped.
#[tokio::test]
async fn test_mac_must_come_first() {
    let (listener, addr) = loopback().await;

    let raw = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let hello = Message::Info(Info::Welcome("hi".into()));
        stream.write_all(&encode(&hello.to_value())).await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        reply
    });

    let (stream, peer_addr) = listener.accept().await.unwrap();
    let err = Session::accept(stream, server_node(), SessionOptions::new(peer_addr.to_string()))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SessionError::NotCompliant(_)));

    let reply = tokio::time::timeout(WAIT, raw).await.unwrap().unwrap();
    let len = split_chunk(&reply).unwrap().unwrap();
    let message = Message::from_value(&decode_exact(&reply[..len]).unwrap()).unwrap();
    assert_eq!(message, Message::error(PROTOCOL_VIOLATION));
}

/// Goodbye from either side closes both without a failure.
#[tokio::test]
async fn test_goodbye_closes_both_ends() {
    let (listener, addr) = loopback().await;
    let client = spawn_client(addr, client_node(), CipherContext::Plain);
    let (server, peer_addr) = accept_one(&listener).await;
    admit(&server, peer_addr).await.unwrap();
    let client = client.await.unwrap().unwrap();

    client.close().await;
    assert_eq!(client.state(), SessionState::Closed);
    tokio::time::timeout(WAIT, server.closed()).await.unwrap();
    assert_eq!(server.failure().await, None);
}

/// A vanished peer closes the session with a recorded failure.
#[tokio::test]
async fn test_disconnect_is_a_failure() {
    let (listener, addr) = loopback().await;
    let client = spawn_client(addr, client_node(), CipherContext::Plain);
    let (server, peer_addr) = accept_one(&listener).await;
    admit(&server, peer_addr).await.unwrap();

    drop(client.await.unwrap().unwrap());
    tokio::time::timeout(WAIT, server.closed()).await.unwrap();
    assert!(server.failure().await.is_some());
}

/// After admission the client sees the server and its admitted peers.
#[tokio::test]
async fn test_network_includes_admitted_peers() {
    let (listener, addr) = loopback().await;
    let client = spawn_client(addr, client_node(), CipherContext::Plain);
    let (server, peer_addr) = accept_one(&listener).await;
    admit(&server, peer_addr).await.unwrap();
    let client = client.await.unwrap().unwrap();

    let network = ask_network(&client).await;
    assert_eq!(network.len(), 2);
    assert_eq!(network[0].kind, NodeKind::Server);
    assert_eq!(network[1].kind, NodeKind::Client);
}

/// Two clients admitted concurrently by the same server node.
#[tokio::test]
async fn test_concurrent_admissions() {
    let (listener, addr) = loopback().await;
    let server_local = server_node();

    let first = spawn_client(addr, node("c1:c1:c1:c1:c1:c1", "one", NodeKind::Client, 0), CipherContext::Plain);
    let second = spawn_client(addr, node("c2:c2:c2:c2:c2:c2", "two", NodeKind::Worker, 0), CipherContext::Plain);

    let mut servers = Vec::new();
    for _ in 0..2 {
        let (stream, peer_addr) = listener.accept().await.unwrap();
        let local = server_local.clone();
        servers.push(tokio::spawn(async move {
            let session = Session::accept(stream, local, SessionOptions::new(peer_addr.to_string()))
                .await
                .unwrap();
            assert!(admit(&session, peer_addr).await.is_some());
            session
        }));
    }

    let _clients = (first.await.unwrap().unwrap(), second.await.unwrap().unwrap());
    let mut _sessions = Vec::new();
    for server in servers {
        _sessions.push(server.await.unwrap());
    }

    assert_eq!(server_local.peers.len(), 2);
    assert_eq!(server_local.peers.get("c2:c2:c2:c2:c2:c2").unwrap().kind, NodeKind::Worker);
}
