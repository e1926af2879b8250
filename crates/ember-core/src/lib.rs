//! ember-core — chunk codec, cipher layers, and the message envelope.
//! All other Ember crates depend on this one.

pub mod authenticity;
pub mod cipher;
pub mod codec;
pub mod config;
pub mod message;
pub mod stream;

pub use codec::{Tag, Value};
pub use message::{Answer, Identity, Info, Message, NetworkNode, NodeKind, QuestionKind};
