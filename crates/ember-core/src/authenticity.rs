//! Chain-hash authenticity over chunk sequences.
//!
//!   hash_0 = [0; 32]
//!   hash_i = BLAKE3(hash_{i-1} || chunk_i)
//!
//! The sender appends one `V` chunk carrying hash_n. The receiver forwards
//! every chunk as it arrives and only learns about tampering when it reads
//! the terminal, so consumers must not act irrevocably on chunks before the
//! stream completes. Memory stays constant regardless of stream length.

use thiserror::Error;

use crate::codec::{CodecError, Tag, CHAIN_HASH_LEN};

/// Running chain hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainHash([u8; CHAIN_HASH_LEN]);

impl ChainHash {
    pub fn new() -> Self {
        Self([0u8; CHAIN_HASH_LEN])
    }

    pub fn update(&mut self, chunk: &[u8]) {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.0);
        hasher.update(chunk);
        self.0 = *hasher.finalize().as_bytes();
    }

    pub fn as_bytes(&self) -> &[u8; CHAIN_HASH_LEN] {
        &self.0
    }

    /// The `V` chunk carrying this hash.
    pub fn terminal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + CHAIN_HASH_LEN);
        out.push(Tag::Authenticity.into());
        out.extend_from_slice(&self.0);
        out
    }
}

impl Default for ChainHash {
    fn default() -> Self {
        Self::new()
    }
}

// ── Wrap ──────────────────────────────────────────────────────────────────────

/// Forward `chunks` and append the authenticity terminal.
///
/// An upstream error is forwarded and ends the sequence without a terminal.
pub fn wrap_authenticity<I, E>(chunks: I) -> WrapAuthenticity<I::IntoIter>
where
    I: IntoIterator<Item = Result<Vec<u8>, E>>,
{
    WrapAuthenticity {
        inner: chunks.into_iter(),
        hash: ChainHash::new(),
        done: false,
    }
}

pub struct WrapAuthenticity<I> {
    inner: I,
    hash: ChainHash,
    done: bool,
}

impl<I, E> Iterator for WrapAuthenticity<I>
where
    I: Iterator<Item = Result<Vec<u8>, E>>,
{
    type Item = Result<Vec<u8>, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.inner.next() {
            Some(Ok(chunk)) => {
                self.hash.update(&chunk);
                Some(Ok(chunk))
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                Some(Ok(self.hash.terminal()))
            }
        }
    }
}

// ── Verify ────────────────────────────────────────────────────────────────────

/// Forward every chunk of an authenticated sequence, checking the terminal.
pub fn verify_authenticity<I, E>(chunks: I) -> VerifyAuthenticity<I::IntoIter>
where
    I: IntoIterator<Item = Result<Vec<u8>, E>>,
    AuthenticityError: From<E>,
{
    VerifyAuthenticity {
        inner: chunks.into_iter(),
        hash: ChainHash::new(),
        done: false,
    }
}

pub struct VerifyAuthenticity<I> {
    inner: I,
    hash: ChainHash,
    done: bool,
}

impl<I, E> VerifyAuthenticity<I>
where
    I: Iterator<Item = Result<Vec<u8>, E>>,
    AuthenticityError: From<E>,
{
    fn step(&mut self) -> Result<Option<Vec<u8>>, AuthenticityError> {
        let chunk = self.inner.next().ok_or(AuthenticityError::MissingTerminal)??;
        if chunk.first() == Some(&u8::from(Tag::Authenticity)) {
            if chunk.len() != 1 + CHAIN_HASH_LEN || chunk[1..] != self.hash.as_bytes()[..] {
                return Err(AuthenticityError::Mismatch);
            }
            if self.inner.next().is_some() {
                return Err(AuthenticityError::AfterTerminal);
            }
            return Ok(None);
        }
        self.hash.update(&chunk);
        Ok(Some(chunk))
    }
}

impl<I, E> Iterator for VerifyAuthenticity<I>
where
    I: Iterator<Item = Result<Vec<u8>, E>>,
    AuthenticityError: From<E>,
{
    type Item = Result<Vec<u8>, AuthenticityError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthenticityError {
    #[error("authenticity check failed: chain hash mismatch")]
    Mismatch,

    #[error("stream ended without an authenticity terminal")]
    MissingTerminal,

    #[error("chunks follow the authenticity terminal")]
    AfterTerminal,

    #[error(transparent)]
    Codec(#[from] CodecError),
}
