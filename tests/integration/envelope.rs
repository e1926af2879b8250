use std::time::Duration;

use ember_core::cipher::{CipherContext, CipherError, Passphrase};
use ember_core::message::{Answer, Message, QuestionKind};
use ember_services::{Session, SessionError, SessionOptions, SessionState};

use crate::*;

const WAIT: Duration = Duration::from_secs(10);

/// Run admission with the given envelopes on each end.
async fn handshake(
    server_envelope: CipherContext,
    client_envelope: CipherContext,
) -> (Result<Session, SessionError>, Result<Session, SessionError>) {
    let (listener, addr) = loopback().await;
    let client = spawn_client(addr, client_node(), client_envelope);

    let (stream, peer_addr) = listener.accept().await.unwrap();
    let server = Session::accept(
        stream,
        server_node(),
        SessionOptions::new(peer_addr.to_string()).with_envelope(server_envelope),
    )
    .await;
    if let Ok(session) = &server {
        admit(session, peer_addr).await;
    }
    let client = tokio::time::timeout(WAIT, client).await.unwrap().unwrap();
    (server, client)
}

/// Every frame sealed with a shared password still admits the peer.
#[tokio::test]
async fn test_salted_admission() {
    let (server, client) = handshake(CipherContext::salted("correct horse"), CipherContext::salted("correct horse")).await;
    let (server, client) = (server.unwrap(), client.unwrap());
    assert_eq!(server.state(), SessionState::Ready);
    assert_eq!(client.state(), SessionState::Ready);

    match client.send(Message::question(QuestionKind::Identity, "")).await.unwrap() {
        Message::Answer(Answer::Identity(id)) => assert_eq!(id.mac, SERVER_MAC),
        other => panic!("unexpected {other:?}"),
    }
}

/// A shared passphrase works the same way.
#[tokio::test]
async fn test_symmetric_admission() {
    let key = Passphrase::generate();
    let (server, client) = handshake(CipherContext::Symmetric(key.clone()), CipherContext::Symmetric(key)).await;
    assert_eq!(server.unwrap().state(), SessionState::Ready);
    assert_eq!(client.unwrap().state(), SessionState::Ready);
}

/// Different passwords fail on the first frame.
#[tokio::test]
async fn test_password_mismatch() {
    let (server, client) = handshake(CipherContext::salted("alpha"), CipherContext::salted("beta")).await;
    assert!(matches!(
        server,
        Err(SessionError::Envelope(CipherError::WrongPassphrase))
    ));
    assert!(matches!(
        client,
        Err(SessionError::Envelope(_)) | Err(SessionError::Disconnected)
    ));
}

/// A plain server cannot open a sealed client's frames.
#[tokio::test]
async fn test_sealed_client_plain_server() {
    let (server, client) = handshake(CipherContext::Plain, CipherContext::salted("alpha")).await;
    assert!(matches!(
        server,
        Err(SessionError::Envelope(CipherError::ContextMismatch(_)))
    ));
    assert!(client.is_err());
}
