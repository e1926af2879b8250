//! Question/answer exchanges over a live session.
//!
//! Asking side:
//!   ask_challenge    proves the peer holds the private key for a public key
//!   ask_identity     identity record
//!   ask_public_key   PEM public key
//!   ask_network      topology as seen by the peer
//!
//! Only the challenge is authoritative; the other asks return `None`/empty on
//! any failure and never raise. Answering side: `answering`.

use std::time::Duration;

use ember_core::cipher::{decrypt_asymmetric, encrypt_asymmetric, public_key_from_pem};
use ember_core::message::{check_coherence, Answer, Identity, Message, NetworkNode, QuestionKind};
use rand::RngCore;
use rsa::RsaPublicKey;

use crate::identity::LocalNode;
use crate::session::Session;

pub const CHALLENGE_LEN: usize = 16;
pub const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(30);
pub const IDENTITY_TIMEOUT: Duration = Duration::from_secs(60);
pub const PUBLIC_KEY_TIMEOUT: Duration = Duration::from_secs(30);

/// Text of the `error` sent when a challenge fails.
pub const CHALLENGE_FAILED: &str = "challenge failed";

// ── Asking ────────────────────────────────────────────────────────────────────

/// Ask a question and return the coherent answer, or why there is none.
async fn ask(session: &Session, kind: QuestionKind, description: String, timeout: Option<Duration>) -> Result<Answer, String> {
    let question = Message::question(kind, description);
    let reply = match timeout {
        Some(limit) => session.send_timeout(question, limit).await,
        None => session.send(question).await,
    }
    .map_err(|e| e.to_string())?;

    let answer = match reply {
        Message::Answer(answer) => answer,
        other => return Err(format!("expected an answer, got {}", other.type_name())),
    };
    check_coherence(&answer, kind).map_err(|e| e.to_string())?;
    Ok(answer)
}

/// Challenge the peer to decrypt 16 random bytes sealed for `peer_key`.
///
/// True only if the peer echoes the exact plaintext. On any failure the peer
/// is sent an `error`, the session is closed, and the result is false.
pub async fn ask_challenge(session: &Session, peer_key: &RsaPublicKey) -> bool {
    let mut secret = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut secret);

    let sealed = match encrypt_asymmetric(&secret, peer_key) {
        Ok(sealed) => sealed,
        Err(e) => {
            tracing::warn!(peer = %session.peer(), error = %e, "could not seal challenge");
            session.reject(CHALLENGE_FAILED).await;
            return false;
        }
    };

    let outcome = match ask(session, QuestionKind::Challenge, hex::encode(sealed), Some(CHALLENGE_TIMEOUT)).await {
        Ok(Answer::Challenge(echo)) if hex::decode(&echo).is_ok_and(|b| b == secret) => Ok(()),
        Ok(_) => Err("challenge answer does not match".to_string()),
        Err(reason) => Err(reason),
    };

    match outcome {
        Ok(()) => {
            tracing::debug!(peer = %session.peer(), "challenge passed");
            true
        }
        Err(reason) => {
            tracing::warn!(peer = %session.peer(), reason = %reason, "challenge failed");
            session.reject(CHALLENGE_FAILED).await;
            false
        }
    }
}

pub async fn ask_identity(session: &Session) -> Option<Identity> {
    match ask(session, QuestionKind::Identity, String::new(), Some(IDENTITY_TIMEOUT)).await {
        Ok(Answer::Identity(identity)) => Some(identity),
        Ok(_) => None,
        Err(reason) => {
            tracing::warn!(peer = %session.peer(), reason = %reason, "no identity");
            None
        }
    }
}

/// The peer's public key, parsed from its PEM answer.
pub async fn ask_public_key(session: &Session) -> Option<RsaPublicKey> {
    let pem = match ask(session, QuestionKind::PublicKey, String::new(), Some(PUBLIC_KEY_TIMEOUT)).await {
        Ok(Answer::PublicKey(pem)) => pem,
        Ok(_) => return None,
        Err(reason) => {
            tracing::warn!(peer = %session.peer(), reason = %reason, "no public key");
            return None;
        }
    };
    let parsed = std::str::from_utf8(&pem)
        .map_err(|e| e.to_string())
        .and_then(|text| public_key_from_pem(text).map_err(|e| e.to_string()));
    match parsed {
        Ok(key) => Some(key),
        Err(reason) => {
            tracing::warn!(peer = %session.peer(), reason = %reason, "unusable public key");
            None
        }
    }
}

/// Waits as long as the session stays open.
pub async fn ask_network(session: &Session) -> Vec<NetworkNode> {
    match ask(session, QuestionKind::Network, String::new(), None).await {
        Ok(Answer::Network(nodes)) => nodes,
        Ok(_) => Vec::new(),
        Err(reason) => {
            tracing::warn!(peer = %session.peer(), reason = %reason, "no network");
            Vec::new()
        }
    }
}

// ── Answering ─────────────────────────────────────────────────────────────────

/// The reply `local` gives to `message`.
///
/// Unknown questions, undecryptable challenges, and non-questions all yield
/// an `error` message.
pub fn answering(message: &Message, local: &LocalNode) -> Message {
    let Message::Question { question, description } = message else {
        return Message::error(format!("cannot answer a {} message", message.type_name()));
    };
    let Some(kind) = question.kind() else {
        return Message::error(format!("unknown question {question}"));
    };

    let answer = match kind {
        QuestionKind::Challenge => {
            let opened = hex::decode(description)
                .map_err(|e| e.to_string())
                .and_then(|sealed| decrypt_asymmetric(&sealed, local.keys().private()).map_err(|e| e.to_string()));
            match opened {
                Ok(plain) => Answer::Challenge(hex::encode(plain)),
                Err(e) => {
                    tracing::warn!(error = %e, "cannot open challenge");
                    return Message::error(CHALLENGE_FAILED);
                }
            }
        }
        QuestionKind::Identity => Answer::Identity(local.identity.clone()),
        QuestionKind::PublicKey => match local.keys().public_key_pem() {
            Ok(pem) => Answer::PublicKey(pem.into_bytes()),
            Err(e) => return Message::error(format!("no public key: {e}")),
        },
        QuestionKind::Network => Answer::Network(local.topology()),
    };
    Message::Answer(answer)
}
