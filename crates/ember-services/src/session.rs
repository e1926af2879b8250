//! Session management — one peer connection over a reliable byte stream.
//!
//! State machine:
//!
//!   Connecting ──mac sent / mac read──▶ Handshaking ──welcome──▶ Ready
//!        │                                   │                     │
//!        └────────────── error, EOF, violation, goodbye ───────────┴──▶ Closed
//!
//! The client drives its handshake inline: it announces its MAC, answers
//! whatever the server asks, and becomes Ready on `info{welcome}`. The
//! server reads the MAC, then starts the receive task right away so it can
//! question the client before deciding to `welcome` or `reject`.
//!
//! Once the receive task runs it is the only reader of the stream. Answers
//! land in a single reply slot that `send` polls; questions are answered on
//! the spot. At most one `send` may be outstanding per session. An `error`
//! closes the session, except on the accepting side before `welcome`: there
//! an `error` reply to a pending `send` is left for the caller, which then
//! decides whether to `reject`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ember_core::cipher::{CipherContext, CipherError};
use ember_core::message::{Info, Message};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::frame::{ChunkFrameCodec, FrameError};
use crate::identity::LocalNode;
use crate::protocol::answering;

/// Text of the `error` sent to a peer that breaks the protocol.
pub const PROTOCOL_VIOLATION: &str = "protocol violation";

const MIN_POLL: Duration = Duration::from_millis(1);
const MAX_POLL: Duration = Duration::from_millis(100);

type FrameReader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, ChunkFrameCodec>;
type FrameWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, ChunkFrameCodec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Ready,
    Closed,
}

/// Per-session settings.
#[derive(Debug)]
pub struct SessionOptions {
    /// Applied to every frame in both directions.
    pub envelope: CipherContext,
    /// Label for logs, usually the peer's socket address.
    pub peer: String,
}

impl SessionOptions {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            envelope: CipherContext::Plain,
            peer: peer.into(),
        }
    }

    pub fn with_envelope(mut self, envelope: CipherContext) -> Self {
        self.envelope = envelope;
        self
    }
}

/// Delay between reply-slot polls: 1 ms at first, growing with the time
/// already waited, capped at 100 ms once a minute has passed.
pub fn poll_delay(elapsed: Duration) -> Duration {
    (elapsed / 600).clamp(MIN_POLL, MAX_POLL)
}

// ── Shared state ──────────────────────────────────────────────────────────────

struct Shared {
    writer: Mutex<FrameWriter>,
    slot: Mutex<Option<Message>>,
    /// Set while a `send` waits on the slot.
    awaiting: AtomicBool,
    state: watch::Sender<SessionState>,
    failure: Mutex<Option<String>>,
    envelope: CipherContext,
    local: Arc<LocalNode>,
    peer: String,
}

impl Shared {
    fn new<W>(write_half: W, local: Arc<LocalNode>, options: SessionOptions) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (state, _) = watch::channel(SessionState::Connecting);
        let boxed: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
        Arc::new(Self {
            writer: Mutex::new(FramedWrite::new(boxed, ChunkFrameCodec::default())),
            slot: Mutex::new(None),
            awaiting: AtomicBool::new(false),
            state,
            failure: Mutex::new(None),
            envelope: options.envelope,
            local,
            peer: options.peer,
        })
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    async fn transmit(&self, message: &Message) -> Result<(), SessionError> {
        let frame = self.envelope.seal(&message.to_value())?;
        self.writer.lock().await.send(Bytes::from(frame)).await?;
        Ok(())
    }

    /// Tell a misbehaving peer why it is being dropped. Best-effort.
    async fn expel(&self, error: &SessionError) {
        if !matches!(error, SessionError::NotCompliant(_) | SessionError::Envelope(_)) {
            return;
        }
        if let Err(e) = self.transmit(&Message::error(PROTOCOL_VIOLATION)).await {
            tracing::debug!(peer = %self.peer, error = %e, "could not send protocol violation");
        }
    }

    /// Move to Closed and shut the write side. Idempotent.
    async fn shutdown(&self, reason: Option<String>) {
        let previous = self.state.send_replace(SessionState::Closed);
        if previous == SessionState::Closed {
            return;
        }
        if let Some(reason) = reason {
            *self.failure.lock().await = Some(reason);
        }
        if let Err(e) = self.writer.lock().await.get_mut().shutdown().await {
            tracing::debug!(peer = %self.peer, error = %e, "transport shutdown failed");
        }
    }
}

/// Read, open, and validate one inbound message. `None` is a clean EOF.
async fn receive(reader: &mut FrameReader, envelope: &CipherContext) -> Result<Option<Message>, SessionError> {
    let Some(frame) = reader.next().await else {
        return Ok(None);
    };
    let value = envelope.open(&frame?)?;
    let message = Message::from_value(&value).map_err(|e| SessionError::NotCompliant(e.to_string()))?;
    Ok(Some(message))
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct Session {
    shared: Arc<Shared>,
    receiver: Option<JoinHandle<()>>,
    peer_mac: Option<String>,
}

impl Session {
    /// Client side: announce our MAC, answer questions until welcomed.
    pub async fn connect<T>(stream: T, local: Arc<LocalNode>, options: SessionOptions) -> Result<Session, SessionError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
        let mut reader = FramedRead::new(boxed, ChunkFrameCodec::default());
        let shared = Shared::new(write_half, local, options);

        let outcome = async {
            let mac = shared.local.mac().to_string();
            shared.transmit(&Message::Info(Info::Mac(mac))).await?;
            shared.set_state(SessionState::Handshaking);
            client_handshake(&shared, &mut reader).await
        }
        .await;

        if let Err(e) = outcome {
            tracing::warn!(peer = %shared.peer, error = %e, "handshake failed");
            shared.shutdown(Some(e.to_string())).await;
            return Err(e);
        }

        shared.set_state(SessionState::Ready);
        tracing::info!(peer = %shared.peer, "session ready");
        let receiver = tokio::spawn(receive_loop(shared.clone(), reader));
        Ok(Session {
            shared,
            receiver: Some(receiver),
            peer_mac: None,
        })
    }

    /// Server side: read the client's `info{mac}` and start receiving.
    ///
    /// The session is left in Handshaking; the caller questions the peer
    /// and then calls [`Session::welcome`] or [`Session::reject`].
    pub async fn accept<T>(stream: T, local: Arc<LocalNode>, options: SessionOptions) -> Result<Session, SessionError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
        let mut reader = FramedRead::new(boxed, ChunkFrameCodec::default());
        let shared = Shared::new(write_half, local, options);

        let first = match receive(&mut reader, &shared.envelope).await {
            Ok(Some(Message::Info(Info::Mac(mac)))) => Ok(mac),
            Ok(Some(other)) => Err(SessionError::NotCompliant(format!(
                "expected info{{mac}}, got {}",
                other.type_name()
            ))),
            Ok(None) => Err(SessionError::Disconnected),
            Err(e) => Err(e),
        };

        let mac = match first {
            Ok(mac) => mac,
            Err(e) => {
                shared.expel(&e).await;
                tracing::warn!(peer = %shared.peer, error = %e, "rejected connection");
                shared.shutdown(Some(e.to_string())).await;
                return Err(e);
            }
        };

        tracing::debug!(peer = %shared.peer, mac = %mac, "peer announced");
        shared.set_state(SessionState::Handshaking);
        let receiver = tokio::spawn(receive_loop(shared.clone(), reader));
        Ok(Session {
            shared,
            receiver: Some(receiver),
            peer_mac: Some(mac),
        })
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// MAC the peer announced. Only known on the accepting side.
    pub fn peer_mac(&self) -> Option<&str> {
        self.peer_mac.as_deref()
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn local(&self) -> &Arc<LocalNode> {
        &self.shared.local
    }

    /// Why the session closed, if it closed on an error.
    pub async fn failure(&self) -> Option<String> {
        self.shared.failure.lock().await.clone()
    }

    /// Resolve once the session reaches Closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        // The sender lives as long as `self`, so this only ends on Closed.
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Transmit `message` and wait for the peer's reply.
    ///
    /// An `error` reply fails the call, as does the session closing while
    /// waiting.
    pub async fn send(&self, message: Message) -> Result<Message, SessionError> {
        self.exchange(message, None).await
    }

    /// [`Session::send`] with an upper bound on the wait.
    pub async fn send_timeout(&self, message: Message, timeout: Duration) -> Result<Message, SessionError> {
        self.exchange(message, Some(timeout)).await
    }

    async fn exchange(&self, message: Message, timeout: Option<Duration>) -> Result<Message, SessionError> {
        if !matches!(self.state(), SessionState::Handshaking | SessionState::Ready) {
            return Err(SessionError::Closed);
        }
        self.shared.slot.lock().await.take();
        self.shared.awaiting.store(true, Ordering::SeqCst);
        let outcome = match self.shared.transmit(&message).await {
            Ok(()) => self.await_reply(timeout).await,
            Err(e) => Err(e),
        };
        self.shared.awaiting.store(false, Ordering::SeqCst);
        outcome
    }

    async fn await_reply(&self, timeout: Option<Duration>) -> Result<Message, SessionError> {
        let started = Instant::now();
        loop {
            // The receive task fills the slot before it marks the session
            // Closed, so read the state first.
            let closed = self.state() == SessionState::Closed;
            if let Some(reply) = self.shared.slot.lock().await.take() {
                return match reply {
                    Message::Error { message } => Err(SessionError::Rejected(message)),
                    other => Ok(other),
                };
            }
            if closed {
                return Err(SessionError::Closed);
            }
            let elapsed = started.elapsed();
            if let Some(limit) = timeout {
                if elapsed >= limit {
                    return Err(SessionError::Timeout(limit));
                }
            }
            tokio::time::sleep(poll_delay(elapsed)).await;
        }
    }

    /// Server side: admit the peer.
    pub async fn welcome(&self, text: impl Into<String>) -> Result<(), SessionError> {
        if self.state() != SessionState::Handshaking {
            return Err(SessionError::Closed);
        }
        self.shared.transmit(&Message::Info(Info::Welcome(text.into()))).await?;
        self.shared.set_state(SessionState::Ready);
        tracing::info!(peer = %self.shared.peer, "peer welcomed");
        Ok(())
    }

    /// Send `error` and close without a goodbye.
    pub async fn reject(&self, reason: &str) {
        if self.state() == SessionState::Closed {
            return;
        }
        if let Err(e) = self.shared.transmit(&Message::error(reason)).await {
            tracing::debug!(peer = %self.shared.peer, error = %e, "could not send rejection");
        }
        self.stop_receiver();
        self.shared.shutdown(Some(reason.to_string())).await;
    }

    /// Send `info{goodbye}` and close the transport. Idempotent.
    pub async fn close(&self) {
        if self.state() == SessionState::Closed {
            return;
        }
        if let Err(e) = self.shared.transmit(&Message::Info(Info::Goodbye("bye".into()))).await {
            tracing::debug!(peer = %self.shared.peer, error = %e, "could not send goodbye");
        }
        self.stop_receiver();
        self.shared.shutdown(None).await;
        tracing::info!(peer = %self.shared.peer, "session closed");
    }

    fn stop_receiver(&self) {
        if let Some(handle) = &self.receiver {
            handle.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_receiver();
    }
}

async fn client_handshake(shared: &Shared, reader: &mut FrameReader) -> Result<(), SessionError> {
    loop {
        let message = match receive(reader, &shared.envelope).await {
            Ok(Some(message)) => message,
            Ok(None) => return Err(SessionError::Disconnected),
            Err(e) => {
                shared.expel(&e).await;
                return Err(e);
            }
        };
        match message {
            Message::Info(Info::Welcome(text)) => {
                tracing::debug!(peer = %shared.peer, welcome = %text, "welcomed");
                return Ok(());
            }
            Message::Error { message } => return Err(SessionError::Rejected(message)),
            question @ Message::Question { .. } => {
                let reply = answering(&question, &shared.local);
                shared.transmit(&reply).await?;
            }
            other => {
                let e = SessionError::NotCompliant(format!("unexpected {} during handshake", describe(&other)));
                shared.expel(&e).await;
                return Err(e);
            }
        }
    }
}

async fn receive_loop(shared: Arc<Shared>, mut reader: FrameReader) {
    let outcome = dispatch_inbound(&shared, &mut reader).await;
    match &outcome {
        Ok(()) => tracing::info!(peer = %shared.peer, "peer said goodbye"),
        Err(e) => tracing::warn!(peer = %shared.peer, error = %e, "session failed"),
    }
    shared.shutdown(outcome.err().map(|e| e.to_string())).await;
}

/// Classify inbound messages until goodbye or failure.
async fn dispatch_inbound(shared: &Shared, reader: &mut FrameReader) -> Result<(), SessionError> {
    loop {
        let message = match receive(reader, &shared.envelope).await {
            Ok(Some(message)) => message,
            Ok(None) => return Err(SessionError::Disconnected),
            Err(e) => {
                shared.expel(&e).await;
                return Err(e);
            }
        };
        match message {
            Message::Error { message }
                if shared.state() == SessionState::Handshaking && shared.awaiting.load(Ordering::SeqCst) =>
            {
                *shared.slot.lock().await = Some(Message::error(message));
            }
            Message::Error { message } => {
                *shared.slot.lock().await = Some(Message::error(message.clone()));
                return Err(SessionError::Rejected(message));
            }
            Message::Answer(answer) => {
                *shared.slot.lock().await = Some(Message::Answer(answer));
            }
            question @ Message::Question { .. } => {
                let reply = answering(&question, &shared.local);
                shared.transmit(&reply).await?;
                if let Message::Error { message } = reply {
                    return Err(SessionError::Unanswerable(message));
                }
            }
            Message::Info(Info::Goodbye(_)) => return Ok(()),
            other => {
                let e = SessionError::NotCompliant(format!("unexpected {}", describe(&other)));
                shared.expel(&e).await;
                return Err(e);
            }
        }
    }
}

fn describe(message: &Message) -> String {
    match message {
        Message::Info(Info::Mac(_)) => "info{mac}".into(),
        Message::Info(Info::Welcome(_)) => "info{welcome}".into(),
        Message::Info(Info::Goodbye(_)) => "info{goodbye}".into(),
        other => other.type_name().into(),
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("envelope error: {0}")]
    Envelope(#[from] CipherError),

    #[error("peer is not compliant: {0}")]
    NotCompliant(String),

    #[error("peer reported an error: {0}")]
    Rejected(String),

    #[error("could not answer peer: {0}")]
    Unanswerable(String),

    #[error("peer disconnected")]
    Disconnected,

    #[error("session is closed")]
    Closed,

    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use ember_core::codec::{decode_exact, encode};
    use ember_core::message::{Answer, QuestionKind};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    use super::*;
    use crate::identity::tests::test_node;

    pub(crate) const CLIENT_MAC: &str = "cc:cc:cc:cc:cc:cc";
    pub(crate) const SERVER_MAC: &str = "5e:5e:5e:5e:5e:5e";

    /// Hand-driven peer speaking raw frames.
    struct MockPeer {
        reader: FramedRead<ReadHalf<DuplexStream>, ChunkFrameCodec>,
        writer: FramedWrite<WriteHalf<DuplexStream>, ChunkFrameCodec>,
    }

    impl MockPeer {
        fn new(stream: DuplexStream) -> Self {
            let (r, w) = tokio::io::split(stream);
            Self {
                reader: FramedRead::new(r, ChunkFrameCodec::default()),
                writer: FramedWrite::new(w, ChunkFrameCodec::default()),
            }
        }

        async fn send(&mut self, message: Message) {
            self.writer
                .send(Bytes::from(encode(&message.to_value())))
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Option<Message> {
            let frame = self.reader.next().await?.unwrap();
            Some(Message::from_value(&decode_exact(&frame).unwrap()).unwrap())
        }
    }

    fn client_node() -> Arc<LocalNode> {
        Arc::new(test_node(CLIENT_MAC, 0))
    }

    fn server_node() -> Arc<LocalNode> {
        Arc::new(test_node(SERVER_MAC, 1))
    }

    /// Start a client against a mock server; the mock has already read the MAC.
    async fn client_with_mock() -> (tokio::task::JoinHandle<Result<Session, SessionError>>, MockPeer) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = tokio::spawn(Session::connect(a, client_node(), SessionOptions::new("mock")));
        let mut mock = MockPeer::new(b);
        assert_eq!(mock.recv().await, Some(Message::Info(Info::Mac(CLIENT_MAC.into()))));
        (client, mock)
    }

    /// A real server/client pair, welcomed and Ready on both ends.
    pub(crate) async fn ready_pair(
        server: Arc<LocalNode>,
        client: Arc<LocalNode>,
        server_envelope: CipherContext,
        client_envelope: CipherContext,
    ) -> Result<(Session, Session), SessionError> {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client_task = tokio::spawn(Session::connect(
            a,
            client,
            SessionOptions::new("server").with_envelope(client_envelope),
        ));
        let server = Session::accept(b, server, SessionOptions::new("client").with_envelope(server_envelope)).await?;
        server.welcome("hello").await?;
        let client = client_task.await.unwrap()?;
        Ok((server, client))
    }

    #[tokio::test]
    async fn client_rejects_mac_from_server() {
        let (client, mut mock) = client_with_mock().await;
        mock.send(Message::Info(Info::Mac(SERVER_MAC.into()))).await;

        let err = client.await.unwrap().err().unwrap();
        assert!(matches!(err, SessionError::NotCompliant(_)));
        assert_eq!(mock.recv().await, Some(Message::error(PROTOCOL_VIOLATION)));
    }

    #[tokio::test]
    async fn client_answers_questions_before_welcome() {
        let (client, mut mock) = client_with_mock().await;

        mock.send(Message::question(QuestionKind::Identity, "")).await;
        match mock.recv().await {
            Some(Message::Answer(Answer::Identity(id))) => assert_eq!(id.mac, CLIENT_MAC),
            other => panic!("expected identity answer, got {other:?}"),
        }

        mock.send(Message::Info(Info::Welcome("hi".into()))).await;
        let session = client.await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn client_fails_on_error_during_handshake() {
        let (client, mut mock) = client_with_mock().await;
        mock.send(Message::error("go away")).await;
        assert!(matches!(
            client.await.unwrap(),
            Err(SessionError::Rejected(reason)) if reason == "go away"
        ));
    }

    #[tokio::test]
    async fn client_fails_on_eof_during_handshake() {
        let (client, mock) = client_with_mock().await;
        drop(mock);
        assert!(matches!(client.await.unwrap(), Err(SessionError::Disconnected)));
    }

    #[tokio::test]
    async fn accept_requires_mac_first() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut mock = MockPeer::new(a);
        mock.send(Message::Info(Info::Welcome("hi".into()))).await;

        let err = Session::accept(b, server_node(), SessionOptions::new("mock"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::NotCompliant(_)));
        assert_eq!(mock.recv().await, Some(Message::error(PROTOCOL_VIOLATION)));
    }

    #[tokio::test]
    async fn send_returns_the_answer() {
        let (server, client) = ready_pair(server_node(), client_node(), CipherContext::Plain, CipherContext::Plain)
            .await
            .unwrap();

        let reply = client.send(Message::question(QuestionKind::Identity, "")).await.unwrap();
        match reply {
            Message::Answer(Answer::Identity(id)) => assert_eq!(id.mac, SERVER_MAC),
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(server.peer_mac(), Some(CLIENT_MAC));
    }

    #[tokio::test]
    async fn unanswerable_question_fails_both_ends() {
        let (server, client) = ready_pair(server_node(), client_node(), CipherContext::Plain, CipherContext::Plain)
            .await
            .unwrap();

        let question = Message::Question {
            question: ember_core::message::QuestionId::Named("weather".into()),
            description: String::new(),
        };
        assert!(matches!(
            client.send(question).await,
            Err(SessionError::Rejected(_))
        ));
        tokio::time::timeout(Duration::from_secs(5), server.closed()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), client.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn send_timeout_expires() {
        let (client, mut mock) = client_with_mock().await;
        mock.send(Message::Info(Info::Welcome("hi".into()))).await;
        let session = client.await.unwrap().unwrap();

        let started = Instant::now();
        let err = session
            .send_timeout(Message::question(QuestionKind::Network, ""), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(matches!(mock.recv().await, Some(Message::Question { .. })));
    }

    #[tokio::test]
    async fn refused_question_before_welcome_leaves_the_verdict_to_the_server() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut mock = MockPeer::new(a);
        mock.send(Message::Info(Info::Mac(CLIENT_MAC.into()))).await;
        let server = Session::accept(b, server_node(), SessionOptions::new("mock")).await.unwrap();

        let ask = server.send(Message::question(QuestionKind::Network, ""));
        let refuse = async {
            assert!(matches!(mock.recv().await, Some(Message::Question { .. })));
            mock.send(Message::error("not telling")).await;
        };
        let (reply, ()) = tokio::join!(ask, refuse);
        assert!(matches!(reply, Err(SessionError::Rejected(reason)) if reason == "not telling"));
        assert_eq!(server.state(), SessionState::Handshaking);

        server.reject("go away").await;
        assert_eq!(mock.recv().await, Some(Message::error("go away")));
        assert_eq!(server.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn error_in_ready_closes_the_session() {
        let (client, mut mock) = client_with_mock().await;
        mock.send(Message::Info(Info::Welcome("hi".into()))).await;
        let session = client.await.unwrap().unwrap();

        let ask = session.send(Message::question(QuestionKind::Network, ""));
        let refuse = async {
            assert!(matches!(mock.recv().await, Some(Message::Question { .. })));
            mock.send(Message::error("not telling")).await;
        };
        let (reply, ()) = tokio::join!(ask, refuse);
        assert!(matches!(reply, Err(SessionError::Rejected(reason)) if reason == "not telling"));
        tokio::time::timeout(Duration::from_secs(5), session.closed()).await.unwrap();
        assert!(session.failure().await.unwrap().contains("not telling"));
    }

    #[tokio::test]
    async fn goodbye_closes_the_peer() {
        let (server, client) = ready_pair(server_node(), client_node(), CipherContext::Plain, CipherContext::Plain)
            .await
            .unwrap();

        client.close().await;
        assert_eq!(client.state(), SessionState::Closed);
        tokio::time::timeout(Duration::from_secs(5), server.closed()).await.unwrap();
        assert!(server.failure().await.is_none());

        client.close().await;
        assert!(matches!(
            client.send(Message::question(QuestionKind::Identity, "")).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn unexpected_info_in_ready_is_a_violation() {
        let (client, mut mock) = client_with_mock().await;
        mock.send(Message::Info(Info::Welcome("hi".into()))).await;
        let session = client.await.unwrap().unwrap();

        mock.send(Message::Info(Info::Mac(SERVER_MAC.into()))).await;
        assert_eq!(mock.recv().await, Some(Message::error(PROTOCOL_VIOLATION)));
        tokio::time::timeout(Duration::from_secs(5), session.closed()).await.unwrap();
        assert!(session.failure().await.unwrap().contains("info{mac}"));
    }

    #[tokio::test]
    async fn salted_envelopes_interoperate() {
        let (server, client) = ready_pair(
            server_node(),
            client_node(),
            CipherContext::salted("shared"),
            CipherContext::salted("shared"),
        )
        .await
        .unwrap();
        assert_eq!(server.state(), SessionState::Ready);
        assert!(client.send(Message::question(QuestionKind::Network, "")).await.is_ok());
    }

    #[tokio::test]
    async fn mismatched_passwords_never_handshake() {
        let result = ready_pair(
            server_node(),
            client_node(),
            CipherContext::salted("one"),
            CipherContext::salted("two"),
        )
        .await;
        assert!(matches!(
            result,
            Err(SessionError::Envelope(CipherError::WrongPassphrase))
        ));
    }

    #[tokio::test]
    async fn salted_client_refuses_plaintext_welcome() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let options = SessionOptions::new("mock").with_envelope(CipherContext::salted("secret"));
        let client = tokio::spawn(Session::connect(a, client_node(), options));
        let mut mock = MockPeer::new(b);

        // The sealed info{mac}; the mock cannot open it.
        let first = mock.reader.next().await.unwrap().unwrap();
        assert_eq!(first[0], b'S');

        mock.send(Message::Info(Info::Welcome("hi".into()))).await;
        let err = client.await.unwrap().err().unwrap();
        assert!(matches!(
            err,
            SessionError::Envelope(CipherError::ContextMismatch(_))
        ));
    }

    #[test]
    fn poll_delay_grows_then_caps() {
        assert_eq!(poll_delay(Duration::ZERO), MIN_POLL);
        assert_eq!(poll_delay(Duration::from_secs(30)), Duration::from_millis(50));
        assert_eq!(poll_delay(Duration::from_secs(60)), MAX_POLL);
        assert_eq!(poll_delay(Duration::from_secs(600)), MAX_POLL);
    }
}
