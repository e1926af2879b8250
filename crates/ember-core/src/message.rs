//! Ember message envelope.
//!
//! Every message on a session is one mapping with a `type` key:
//!
//!   error     message: str
//!   question  question: str | int, description: str
//!   answer    question: str, <question>: <per question>
//!   info      exactly one of mac | welcome | goodbye: str
//!
//! Inbound values are untrusted. `Message::from_value` is the only way in,
//! and it rejects anything outside the whitelisted shapes: opaque values
//! anywhere, unknown keys, missing keys, wrong types.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::Value;

pub const TYPE_ERROR: &str = "error";
pub const TYPE_QUESTION: &str = "question";
pub const TYPE_ANSWER: &str = "answer";
pub const TYPE_INFO: &str = "info";

/// Identity record keys, in wire order.
pub const IDENTITY_KEYS: [&str; 6] = ["username", "os_version", "hostname", "country", "city", "mac"];

// ── Questions ─────────────────────────────────────────────────────────────────

/// The questions a node knows how to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuestionKind {
    Challenge,
    Identity,
    PublicKey,
    Network,
}

impl QuestionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionKind::Challenge => "challenge",
            QuestionKind::Identity => "identity",
            QuestionKind::PublicKey => "public_key",
            QuestionKind::Network => "network",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "challenge" => Some(QuestionKind::Challenge),
            "identity" => Some(QuestionKind::Identity),
            "public_key" => Some(QuestionKind::PublicKey),
            "network" => Some(QuestionKind::Network),
            _ => None,
        }
    }
}

impl fmt::Display for QuestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A question identifier as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestionId {
    Named(String),
    Number(i64),
}

impl QuestionId {
    pub fn kind(&self) -> Option<QuestionKind> {
        match self {
            QuestionId::Named(name) => QuestionKind::parse(name),
            QuestionId::Number(_) => None,
        }
    }
}

impl From<QuestionKind> for QuestionId {
    fn from(kind: QuestionKind) -> Self {
        QuestionId::Named(kind.as_str().to_string())
    }
}

impl fmt::Display for QuestionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuestionId::Named(name) => f.write_str(name),
            QuestionId::Number(n) => write!(f, "{n}"),
        }
    }
}

// ── Payloads ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub os_version: String,
    pub hostname: String,
    pub country: String,
    pub city: String,
    pub mac: String,
}

/// Role of a node in a topology listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Server,
    Client,
    Worker,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Server => "server",
            NodeKind::Client => "client",
            NodeKind::Worker => "worker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "server" => Some(NodeKind::Server),
            "client" => Some(NodeKind::Client),
            "worker" => Some(NodeKind::Worker),
            _ => None,
        }
    }
}

/// One entry of a network answer: a node kind and its attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkNode {
    pub kind: NodeKind,
    pub attributes: Vec<(String, Value)>,
}

impl NetworkNode {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            attributes: Vec::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    /// Hex encoding of the decrypted challenge.
    Challenge(String),
    Identity(Identity),
    /// Public key as PEM bytes.
    PublicKey(Vec<u8>),
    Network(Vec<NetworkNode>),
}

impl Answer {
    pub fn question(&self) -> QuestionKind {
        match self {
            Answer::Challenge(_) => QuestionKind::Challenge,
            Answer::Identity(_) => QuestionKind::Identity,
            Answer::PublicKey(_) => QuestionKind::PublicKey,
            Answer::Network(_) => QuestionKind::Network,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Info {
    Mac(String),
    Welcome(String),
    Goodbye(String),
}

// ── Message ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Error { message: String },
    Question { question: QuestionId, description: String },
    Answer(Answer),
    Info(Info),
}

impl Message {
    pub fn error(message: impl Into<String>) -> Self {
        Message::Error {
            message: message.into(),
        }
    }

    pub fn question(kind: QuestionKind, description: impl Into<String>) -> Self {
        Message::Question {
            question: kind.into(),
            description: description.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Message::Error { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Error { .. } => TYPE_ERROR,
            Message::Question { .. } => TYPE_QUESTION,
            Message::Answer(_) => TYPE_ANSWER,
            Message::Info(_) => TYPE_INFO,
        }
    }

    pub fn to_value(&self) -> Value {
        let ty = ("type", Value::from(self.type_name()));
        match self {
            Message::Error { message } => Value::map([ty, ("message", message.as_str().into())]),
            Message::Question {
                question,
                description,
            } => {
                let question = match question {
                    QuestionId::Named(name) => Value::from(name.as_str()),
                    QuestionId::Number(n) => Value::Int(*n),
                };
                Value::map([ty, ("question", question), ("description", description.as_str().into())])
            }
            Message::Answer(answer) => Value::map([
                ty,
                ("question", answer.question().as_str().into()),
                (answer.question().as_str(), answer_value(answer)),
            ]),
            Message::Info(info) => {
                let entry: (&str, Value) = match info {
                    Info::Mac(mac) => ("mac", mac.as_str().into()),
                    Info::Welcome(text) => ("welcome", text.as_str().into()),
                    Info::Goodbye(text) => ("goodbye", text.as_str().into()),
                };
                Value::map([ty, entry])
            }
        }
    }

    /// Validate an untrusted value and lift it into a typed message.
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        if !check_type(value) {
            return Err(ValidationError::ForbiddenType);
        }
        let fields = Fields::of(value, "message")?;
        let ty = fields.string("type")?;
        match ty {
            TYPE_ERROR => {
                fields.only(&["type", "message"])?;
                Ok(Message::error(fields.string("message")?))
            }
            TYPE_QUESTION => {
                fields.only(&["type", "question", "description"])?;
                let question = match fields.require("question")? {
                    Value::Str(name) => QuestionId::Named(name.clone()),
                    Value::Int(n) => QuestionId::Number(*n),
                    _ => return Err(wrong_type("question", "string or integer")),
                };
                let description = fields.string("description")?;
                if question.kind() == Some(QuestionKind::Challenge) && !is_hex(description) {
                    return Err(ValidationError::NotHex("description".into()));
                }
                Ok(Message::Question {
                    question,
                    description: description.to_string(),
                })
            }
            TYPE_ANSWER => {
                let name = fields.string("question")?;
                let kind = QuestionKind::parse(name)
                    .ok_or_else(|| ValidationError::UnknownQuestion(name.to_string()))?;
                // The payload field is named after the question it answers.
                fields.only(&["type", "question", kind.as_str()])?;
                Ok(Message::Answer(parse_answer(kind, fields.require(kind.as_str())?)?))
            }
            TYPE_INFO => parse_info(&fields),
            other => Err(ValidationError::UnknownType(other.to_string())),
        }
    }
}

/// Validate an untrusted value without keeping the typed form.
pub fn validate(value: &Value) -> Result<(), ValidationError> {
    Message::from_value(value).map(|_| ())
}

/// True when `value` contains only whitelisted kinds. Opaque values are
/// refused at any depth.
pub fn check_type(value: &Value) -> bool {
    match value {
        Value::Opaque { .. } => false,
        Value::List(items) | Value::Tuple(items) | Value::Set(items) => items.iter().all(check_type),
        Value::Map(entries) => entries.iter().all(|(k, v)| check_type(k) && check_type(v)),
        _ => true,
    }
}

/// Confirm that an answer matches the question it was asked for.
pub fn check_coherence(answer: &Answer, asked: QuestionKind) -> Result<(), ValidationError> {
    if answer.question() != asked {
        return Err(ValidationError::Incoherent {
            asked,
            answered: answer.question(),
        });
    }
    Ok(())
}

// ── Answer shapes ─────────────────────────────────────────────────────────────

fn answer_value(answer: &Answer) -> Value {
    match answer {
        Answer::Challenge(hex) => hex.as_str().into(),
        Answer::Identity(id) => Value::map([
            ("username", id.username.as_str().into()),
            ("os_version", id.os_version.as_str().into()),
            ("hostname", id.hostname.as_str().into()),
            ("country", id.country.as_str().into()),
            ("city", id.city.as_str().into()),
            ("mac", id.mac.as_str().into()),
        ]),
        Answer::PublicKey(pem) => Value::Bytes(pem.clone()),
        Answer::Network(nodes) => Value::List(
            nodes
                .iter()
                .map(|node| {
                    Value::Tuple(vec![
                        node.kind.as_str().into(),
                        Value::Map(
                            node.attributes
                                .iter()
                                .map(|(k, v)| (Value::from(k.as_str()), v.clone()))
                                .collect(),
                        ),
                    ])
                })
                .collect(),
        ),
    }
}

fn parse_answer(kind: QuestionKind, value: &Value) -> Result<Answer, ValidationError> {
    match kind {
        QuestionKind::Challenge => {
            let hex = value.as_str().ok_or_else(|| wrong_type("challenge", "string"))?;
            if !is_hex(hex) {
                return Err(ValidationError::NotHex("challenge".into()));
            }
            Ok(Answer::Challenge(hex.to_string()))
        }
        QuestionKind::Identity => {
            let fields = Fields::of(value, "identity")?;
            fields.only(&IDENTITY_KEYS)?;
            let mac = fields.string("mac")?;
            if !is_mac(mac) {
                return Err(ValidationError::BadMac(mac.to_string()));
            }
            Ok(Answer::Identity(Identity {
                username: fields.string("username")?.to_string(),
                os_version: fields.string("os_version")?.to_string(),
                hostname: fields.string("hostname")?.to_string(),
                country: fields.string("country")?.to_string(),
                city: fields.string("city")?.to_string(),
                mac: mac.to_string(),
            }))
        }
        QuestionKind::PublicKey => match value {
            Value::Bytes(pem) if is_public_key_pem(pem) => Ok(Answer::PublicKey(pem.clone())),
            Value::Bytes(_) => Err(ValidationError::BadPublicKey),
            _ => Err(wrong_type("public_key", "bytes")),
        },
        QuestionKind::Network => {
            let Value::List(items) = value else {
                return Err(wrong_type("network", "list"));
            };
            let nodes = items.iter().map(parse_node).collect::<Result<Vec<_>, _>>()?;
            Ok(Answer::Network(nodes))
        }
    }
}

fn parse_node(item: &Value) -> Result<NetworkNode, ValidationError> {
    let (kind, attributes) = match item {
        Value::Tuple(pair) | Value::List(pair) if pair.len() == 2 => (&pair[0], &pair[1]),
        _ => return Err(wrong_type("network", "list of (kind, mapping) pairs")),
    };
    let kind_name = kind.as_str().ok_or_else(|| wrong_type("network", "string node kind"))?;
    let kind = NodeKind::parse(kind_name).ok_or_else(|| ValidationError::UnknownNodeKind(kind_name.to_string()))?;

    let fields = Fields::of(attributes, "network")?;
    Ok(NetworkNode {
        kind,
        attributes: fields
            .entries
            .iter()
            .map(|(k, v)| (k.to_string(), (*v).clone()))
            .collect(),
    })
}

fn parse_info(fields: &Fields<'_>) -> Result<Message, ValidationError> {
    let present: Vec<&str> = ["mac", "welcome", "goodbye"]
        .into_iter()
        .filter(|k| fields.get(k).is_some())
        .collect();
    let [key] = present.as_slice() else {
        return Err(ValidationError::AmbiguousInfo);
    };
    fields.only(&["type", *key])?;
    let text = fields.string(key)?.to_string();
    let info = match *key {
        "mac" if !is_mac(&text) => return Err(ValidationError::BadMac(text)),
        "mac" => Info::Mac(text),
        "welcome" => Info::Welcome(text),
        _ => Info::Goodbye(text),
    };
    Ok(Message::Info(info))
}

// ── Field access ──────────────────────────────────────────────────────────────

/// String-keyed view of a mapping. Keys are unique and all strings.
struct Fields<'a> {
    entries: Vec<(&'a str, &'a Value)>,
}

impl<'a> Fields<'a> {
    fn of(value: &'a Value, what: &str) -> Result<Self, ValidationError> {
        let Value::Map(raw) = value else {
            return Err(wrong_type(what, "mapping"));
        };
        let mut entries: Vec<(&str, &Value)> = Vec::with_capacity(raw.len());
        for (k, v) in raw {
            let key = k.as_str().ok_or_else(|| wrong_type(what, "mapping with string keys"))?;
            if entries.iter().any(|(seen, _)| *seen == key) {
                return Err(ValidationError::DuplicateField(key.to_string()));
            }
            entries.push((key, v));
        }
        Ok(Self { entries })
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    fn require(&self, key: &str) -> Result<&'a Value, ValidationError> {
        self.get(key).ok_or_else(|| ValidationError::MissingField(key.to_string()))
    }

    fn string(&self, key: &str) -> Result<&'a str, ValidationError> {
        self.require(key)?.as_str().ok_or_else(|| wrong_type(key, "string"))
    }

    /// Every key in `allowed` must be present and no other key may be.
    fn only(&self, allowed: &[&str]) -> Result<(), ValidationError> {
        if let Some((extra, _)) = self.entries.iter().find(|(k, _)| !allowed.contains(k)) {
            return Err(ValidationError::UnexpectedField(extra.to_string()));
        }
        for key in allowed {
            self.require(key)?;
        }
        Ok(())
    }
}

fn wrong_type(field: &str, expected: &'static str) -> ValidationError {
    ValidationError::WrongType {
        field: field.to_string(),
        expected,
    }
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && hex::decode(s).is_ok()
}

/// Six colon-separated pairs of hex digits.
pub fn is_mac(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6 && parts.iter().all(|p| p.len() == 2 && p.bytes().all(|b| b.is_ascii_hexdigit()))
}

fn is_public_key_pem(pem: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(pem) else {
        return false;
    };
    let text = text.trim();
    ["PUBLIC KEY", "RSA PUBLIC KEY"].iter().any(|label| {
        text.starts_with(&format!("-----BEGIN {label}-----")) && text.ends_with(&format!("-----END {label}-----"))
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message contains a value kind outside the whitelist")]
    ForbiddenType,

    #[error("missing field `{0}`")]
    MissingField(String),

    #[error("unexpected field `{0}`")]
    UnexpectedField(String),

    #[error("duplicate field `{0}`")]
    DuplicateField(String),

    #[error("field `{field}` must be a {expected}")]
    WrongType { field: String, expected: &'static str },

    #[error("unknown message type `{0}`")]
    UnknownType(String),

    #[error("unknown question `{0}`")]
    UnknownQuestion(String),

    #[error("field `{0}` is not valid hex")]
    NotHex(String),

    #[error("malformed MAC address `{0}`")]
    BadMac(String),

    #[error("public key is not a PEM envelope")]
    BadPublicKey,

    #[error("unknown node kind `{0}`")]
    UnknownNodeKind(String),

    #[error("answer to `{answered}` given for question `{asked}`")]
    Incoherent {
        asked: QuestionKind,
        answered: QuestionKind,
    },

    #[error("info must carry exactly one of mac, welcome, goodbye")]
    AmbiguousInfo,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
