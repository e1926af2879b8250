//! Streaming encryption over chunk sequences.
//!
//! A sealed stream is a header chunk, one `A` chunk per plaintext chunk, and
//! a closing `Z` chunk. Chunk `i` is sealed under passphrase `i mod N`, where
//! the `N` passphrases come from the header:
//!
//!   G: salt + N            keys = derive_passphrases(salt, password, N)
//!   H: N + R(p_0 ‖ … ‖ p_N-1)  keys wrapped for the recipient's RSA key
//!
//! Both adaptors are lazy iterators. Receivers never need more than one
//! chunk in memory; a missing `Z` is reported as truncation.

use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::authenticity::AuthenticityError;
use crate::cipher::{
    self, derive_passphrases, generate_salt, CipherError, Passphrase, PASSPHRASE_LEN,
};
use crate::codec::{CodecError, Cursor, Tag, SALT_LEN};

/// Upper bound on the passphrase rotation length.
pub const MAX_ROTATION: u32 = 1024;

// ── Key schedules ─────────────────────────────────────────────────────────────

/// The ordered passphrases of one stream.
#[derive(Debug)]
pub struct KeySchedule {
    keys: Vec<Passphrase>,
}

impl KeySchedule {
    pub fn new(keys: Vec<Passphrase>) -> Result<Self, StreamError> {
        if keys.is_empty() || keys.len() > MAX_ROTATION as usize {
            return Err(StreamError::InvalidRotation(keys.len() as u32));
        }
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key_for(&self, index: u64) -> &Passphrase {
        &self.keys[(index % self.keys.len() as u64) as usize]
    }
}

/// How a sender seals a stream.
pub enum Sealing<'a> {
    /// Keys derived from a shared password and a fresh salt.
    Password { password: &'a [u8], rotation: u32 },
    /// Fresh random keys, wrapped for the recipient's public key.
    Recipient { key: &'a RsaPublicKey, rotation: u32 },
}

/// How a receiver opens a stream.
#[derive(Clone, Copy)]
pub enum Unsealing<'a> {
    Password(&'a [u8]),
    Recipient(&'a RsaPrivateKey),
}

fn check_rotation(rotation: u32) -> Result<usize, StreamError> {
    if rotation == 0 || rotation > MAX_ROTATION {
        return Err(StreamError::InvalidRotation(rotation));
    }
    Ok(rotation as usize)
}

/// Build the header chunk and the schedule it announces.
fn seal_header(sealing: &Sealing<'_>) -> Result<(Vec<u8>, KeySchedule), StreamError> {
    match *sealing {
        Sealing::Password { password, rotation } => {
            let n = check_rotation(rotation)?;
            let salt = generate_salt();
            let schedule = KeySchedule::new(derive_passphrases(&salt, password, n))?;

            let mut header = Vec::with_capacity(1 + SALT_LEN + 4);
            header.push(Tag::StreamSymmetric.into());
            header.extend_from_slice(&salt);
            header.extend_from_slice(&rotation.to_be_bytes());
            Ok((header, schedule))
        }
        Sealing::Recipient { key, rotation } => {
            let n = check_rotation(rotation)?;
            let keys: Vec<Passphrase> = (0..n).map(|_| Passphrase::generate()).collect();

            let mut bundle = Zeroizing::new(Vec::with_capacity(n * PASSPHRASE_LEN));
            for k in &keys {
                bundle.extend_from_slice(k.as_bytes());
            }
            let wrapped = cipher::encrypt_asymmetric(&bundle, key)?;

            let mut header = Vec::with_capacity(1 + 4 + wrapped.len());
            header.push(Tag::StreamAsymmetric.into());
            header.extend_from_slice(&rotation.to_be_bytes());
            header.extend_from_slice(&wrapped);
            Ok((header, KeySchedule::new(keys)?))
        }
    }
}

/// Parse a header chunk and recover its schedule.
fn open_header(chunk: &[u8], unsealing: Unsealing<'_>) -> Result<KeySchedule, StreamError> {
    let mut cur = Cursor::new(chunk);
    let tag = cur.tag()?;
    let schedule = match (tag, unsealing) {
        (Tag::StreamSymmetric, Unsealing::Password(password)) => {
            let salt = cur.take(SALT_LEN)?;
            let n = check_rotation(cur.u32()?)?;
            KeySchedule::new(derive_passphrases(salt, password, n))?
        }
        (Tag::StreamAsymmetric, Unsealing::Recipient(key)) => {
            let n = check_rotation(cur.u32()?)?;
            let bundle = Zeroizing::new(cipher::open_asymmetric(&mut cur, key)?);
            if bundle.len() != n * PASSPHRASE_LEN {
                return Err(CodecError::Malformed("passphrase bundle length").into());
            }
            let keys = bundle
                .chunks_exact(PASSPHRASE_LEN)
                .map(|raw| {
                    let mut k = [0u8; PASSPHRASE_LEN];
                    k.copy_from_slice(raw);
                    Passphrase::from_bytes(k)
                })
                .collect();
            KeySchedule::new(keys)?
        }
        (Tag::StreamSymmetric | Tag::StreamAsymmetric, _) => {
            return Err(CipherError::ContextMismatch(tag).into())
        }
        (other, _) => return Err(StreamError::MissingHeader(other)),
    };
    cur.finish()?;
    Ok(schedule)
}

// ── Sealing ───────────────────────────────────────────────────────────────────

/// Seal a sequence of plaintext chunks.
///
/// The header is built eagerly so key errors surface here; the data chunks
/// are sealed lazily as the returned iterator is driven.
pub fn cipher_stream<I>(plain: I, sealing: &Sealing<'_>) -> Result<CipherStream<I::IntoIter>, StreamError>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let (header, schedule) = seal_header(sealing)?;
    Ok(CipherStream {
        inner: plain.into_iter(),
        schedule,
        header: Some(header),
        index: 0,
        finished: false,
    })
}

pub struct CipherStream<I> {
    inner: I,
    schedule: KeySchedule,
    header: Option<Vec<u8>>,
    index: u64,
    finished: bool,
}

impl<I> Iterator for CipherStream<I>
where
    I: Iterator,
    I::Item: AsRef<[u8]>,
{
    type Item = Result<Vec<u8>, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(header) = self.header.take() {
            return Some(Ok(header));
        }
        if self.finished {
            return None;
        }
        match self.inner.next() {
            Some(chunk) => {
                let key = self.schedule.key_for(self.index);
                self.index += 1;
                let sealed = cipher::encrypt_symmetric(chunk.as_ref(), key).map_err(StreamError::from);
                if sealed.is_err() {
                    self.finished = true;
                }
                Some(sealed)
            }
            None => {
                self.finished = true;
                Some(Ok(vec![Tag::EndOfStream.into()]))
            }
        }
    }
}

// ── Opening ───────────────────────────────────────────────────────────────────

/// Open a sealed stream chunk by chunk.
///
/// Input items may carry upstream errors (a chunk reader, an authenticity
/// verifier); they are forwarded and end the stream.
pub fn decipher_stream<'a, I, E>(chunks: I, unsealing: Unsealing<'a>) -> DecipherStream<'a, I::IntoIter>
where
    I: IntoIterator<Item = Result<Vec<u8>, E>>,
    StreamError: From<E>,
{
    DecipherStream {
        inner: chunks.into_iter(),
        unsealing,
        schedule: None,
        index: 0,
        done: false,
    }
}

pub struct DecipherStream<'a, I> {
    inner: I,
    unsealing: Unsealing<'a>,
    schedule: Option<KeySchedule>,
    index: u64,
    done: bool,
}

impl<I, E> DecipherStream<'_, I>
where
    I: Iterator<Item = Result<Vec<u8>, E>>,
    StreamError: From<E>,
{
    fn step(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        if self.schedule.is_none() {
            let header = self.inner.next().ok_or(StreamError::Truncated)??;
            self.schedule = Some(open_header(&header, self.unsealing)?);
        }

        let chunk = self.inner.next().ok_or(StreamError::Truncated)??;
        match Tag::peek(&chunk)? {
            Tag::EndOfStream if chunk.len() == 1 => Ok(None),
            Tag::EndOfStream => Err(CodecError::TrailingBytes(chunk.len() - 1).into()),
            Tag::SymmetricBlock => {
                let schedule = self.schedule.as_ref().ok_or(StreamError::Truncated)?;
                let key = schedule.key_for(self.index);
                self.index += 1;
                Ok(Some(cipher::decrypt_symmetric(&chunk, key)?))
            }
            other => Err(StreamError::UnexpectedChunk(other)),
        }
    }
}

impl<I, E> Iterator for DecipherStream<'_, I>
where
    I: Iterator<Item = Result<Vec<u8>, E>>,
    StreamError: From<E>,
{
    type Item = Result<Vec<u8>, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(plain)) => Some(Ok(plain)),
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

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream ended before its end-of-stream chunk")]
    Truncated,

    #[error("stream starts with {0:?} instead of a header")]
    MissingHeader(Tag),

    #[error("unexpected {0:?} chunk inside a sealed stream")]
    UnexpectedChunk(Tag),

    #[error("invalid passphrase rotation: {0}")]
    InvalidRotation(u32),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Authenticity(#[from] AuthenticityError),
}

impl StreamError {
    /// True when the key material did not match the stream.
    pub fn is_wrong_passphrase(&self) -> bool {
        matches!(
            self,
            StreamError::Cipher(CipherError::WrongPassphrase | CipherError::ContextMismatch(_))
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
