//! Cryptographic chunk kinds for Ember.
//!
//! Provides three block ciphers over encoded values:
//!   1. Symmetric: AES-256-GCM under a 32-byte passphrase (`A` chunks)
//!   2. Asymmetric: RSA-OAEP(SHA-256), split into key-sized blocks (`R` chunks)
//!   3. Salted: a passphrase derived from a password and a fresh salt (`S` chunks)
//!
//! Passphrase derivation uses the BLAKE3 extendable output over salt and
//! secret, so one derivation can produce any number of independent keys.
//!
//! All passphrase material derives ZeroizeOnDrop.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::codec::{self, put_len, CodecError, Cursor, Tag, Value, SALT_LEN};

pub const PASSPHRASE_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;

/// OAEP overhead with SHA-256: two digests plus two bytes.
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

// ── Passphrases ───────────────────────────────────────────────────────────────

/// A 32-byte symmetric key. Wiped from memory when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Passphrase([u8; PASSPHRASE_LEN]);

impl Passphrase {
    /// Draw a fresh random passphrase.
    pub fn generate() -> Self {
        let mut key = [0u8; PASSPHRASE_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; PASSPHRASE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PASSPHRASE_LEN] {
        &self.0
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(..)")
    }
}

/// Draw a fresh salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive `n` passphrases from a salt and a secret.
///
/// Deterministic: the same salt and secret always produce the same
/// sequence, and the first `k` keys do not depend on `n`.
pub fn derive_passphrases(salt: &[u8], secret: &[u8], n: usize) -> Vec<Passphrase> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt);
    hasher.update(secret);
    let mut reader = hasher.finalize_xof();
    (0..n)
        .map(|_| {
            let mut key = [0u8; PASSPHRASE_LEN];
            reader.fill(&mut key);
            Passphrase(key)
        })
        .collect()
}

fn derive_passphrase(salt: &[u8], secret: &[u8]) -> Passphrase {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt);
    hasher.update(secret);
    let mut key = [0u8; PASSPHRASE_LEN];
    hasher.finalize_xof().fill(&mut key);
    Passphrase(key)
}

// ── Symmetric ─────────────────────────────────────────────────────────────────

/// Seal `plaintext` into one `A` chunk: `u32 len` + nonce ‖ tag ‖ ciphertext.
pub fn encrypt_symmetric(plaintext: &[u8], key: &Passphrase) -> Result<Vec<u8>, CipherError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CipherError::Encrypt)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    // aes-gcm appends the tag; the wire carries it in front of the ciphertext.
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CipherError::Encrypt)?;
    let (ciphertext, tag) = sealed.split_at(sealed.len() - GCM_TAG_LEN);

    let mut out = Vec::with_capacity(1 + 4 + NONCE_LEN + sealed.len());
    out.push(Tag::SymmetricBlock.into());
    put_len(&mut out, NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(tag);
    out.extend_from_slice(ciphertext);
    Ok(out)
}

/// Open one `A` chunk. Any authentication failure is `WrongPassphrase`.
pub fn decrypt_symmetric(chunk: &[u8], key: &Passphrase) -> Result<Vec<u8>, CipherError> {
    let mut cur = Cursor::new(chunk);
    let plain = open_symmetric(&mut cur, key)?;
    cur.finish()?;
    Ok(plain)
}

fn open_symmetric(cur: &mut Cursor<'_>, key: &Passphrase) -> Result<Vec<u8>, CipherError> {
    cur.expect(Tag::SymmetricBlock)?;
    let len = cur.len()?;
    if len < NONCE_LEN + GCM_TAG_LEN {
        return Err(CodecError::Malformed("symmetric block shorter than nonce and tag").into());
    }
    let body = cur.take(len)?;
    let (nonce, rest) = body.split_at(NONCE_LEN);
    let (tag, ciphertext) = rest.split_at(GCM_TAG_LEN);

    let mut sealed = Vec::with_capacity(ciphertext.len() + GCM_TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CipherError::WrongPassphrase)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed.as_slice())
        .map_err(|_| CipherError::WrongPassphrase)
}

// ── Asymmetric ────────────────────────────────────────────────────────────────

/// Largest plaintext one OAEP block can carry under `key`.
pub fn max_block_plaintext(key: &RsaPublicKey) -> usize {
    key.size().saturating_sub(OAEP_OVERHEAD)
}

/// Seal `plaintext` into one `R` chunk, splitting it across as many
/// key-sized blocks as needed. An empty plaintext still yields one block.
pub fn encrypt_asymmetric(plaintext: &[u8], key: &RsaPublicKey) -> Result<Vec<u8>, CipherError> {
    let block_size = key.size();
    let max = max_block_plaintext(key);
    if max == 0 || block_size > u16::MAX as usize {
        return Err(CipherError::InvalidKey(format!(
            "unsupported RSA modulus of {block_size} bytes"
        )));
    }

    let pieces: Vec<&[u8]> = if plaintext.is_empty() {
        vec![plaintext]
    } else {
        plaintext.chunks(max).collect()
    };

    let mut rng = rand::thread_rng();
    let mut out = Vec::with_capacity(1 + 2 + 4 + block_size * pieces.len());
    out.push(Tag::AsymmetricBlock.into());
    out.extend_from_slice(&(block_size as u16).to_be_bytes());
    put_len(&mut out, pieces.len());
    for piece in pieces {
        let block = key.encrypt(&mut rng, Oaep::new::<Sha256>(), piece)?;
        out.extend_from_slice(&block);
    }
    Ok(out)
}

/// Open one `R` chunk. A key of the wrong size or any failed block is
/// `WrongPassphrase`.
pub fn decrypt_asymmetric(chunk: &[u8], key: &RsaPrivateKey) -> Result<Vec<u8>, CipherError> {
    let mut cur = Cursor::new(chunk);
    let plain = open_asymmetric(&mut cur, key)?;
    cur.finish()?;
    Ok(plain)
}

pub(crate) fn open_asymmetric(cur: &mut Cursor<'_>, key: &RsaPrivateKey) -> Result<Vec<u8>, CipherError> {
    cur.expect(Tag::AsymmetricBlock)?;
    let (block_size, count) = cur.block_layout()?;
    let blocks = cur.take(block_size * count)?;
    if block_size != key.size() {
        return Err(CipherError::WrongPassphrase);
    }

    let mut plain = Zeroizing::new(Vec::new());
    for block in blocks.chunks(block_size) {
        let piece = key
            .decrypt(Oaep::new::<Sha256>(), block)
            .map_err(|_| CipherError::WrongPassphrase)?;
        plain.extend_from_slice(&piece);
    }
    Ok(std::mem::take(&mut *plain))
}

// ── Salted ────────────────────────────────────────────────────────────────────

/// Seal `plaintext` under a password: salt + nested `A` chunk whose key is
/// derived from the salt and the password.
pub fn encrypt_salted(plaintext: &[u8], password: &[u8]) -> Result<Vec<u8>, CipherError> {
    let salt = generate_salt();
    let key = derive_passphrase(&salt, password);
    let inner = encrypt_symmetric(plaintext, &key)?;

    let mut out = Vec::with_capacity(1 + SALT_LEN + inner.len());
    out.push(Tag::SaltedBlock.into());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&inner);
    Ok(out)
}

pub fn decrypt_salted(chunk: &[u8], password: &[u8]) -> Result<Vec<u8>, CipherError> {
    let mut cur = Cursor::new(chunk);
    cur.expect(Tag::SaltedBlock)?;
    let salt = cur.take(SALT_LEN)?;
    let key = derive_passphrase(salt, password);
    let plain = open_symmetric(&mut cur, &key)?;
    cur.finish()?;
    Ok(plain)
}

// ── Keys ──────────────────────────────────────────────────────────────────────

/// An RSA key pair loaded from configuration.
pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl KeyPair {
    pub fn from_private(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        Self { private, public }
    }

    /// Parse a private key in PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1
    /// (`BEGIN RSA PRIVATE KEY`) PEM.
    pub fn from_pem(pem: &str) -> Result<Self, CipherError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        Ok(Self::from_private(private))
    }

    pub fn private(&self) -> &RsaPrivateKey {
        &self.private
    }

    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    /// The public half as SubjectPublicKeyInfo PEM.
    pub fn public_key_pem(&self) -> Result<String, CipherError> {
        public_key_to_pem(&self.public)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("bits", &(self.public.size() * 8))
            .finish_non_exhaustive()
    }
}

pub fn public_key_to_pem(key: &RsaPublicKey) -> Result<String, CipherError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| CipherError::InvalidKey(e.to_string()))
}

/// Parse a public key in SubjectPublicKeyInfo or PKCS#1 PEM.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, CipherError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| CipherError::InvalidKey(e.to_string()))
}

// ── Context ───────────────────────────────────────────────────────────────────

/// Key material for opening and sealing single chunks.
///
/// `Plain` passes value chunks through untouched. The other variants seal
/// every value into their own chunk kind and open only that kind; a plain
/// value chunk under a keyed context is a `ContextMismatch`.
pub enum CipherContext {
    Plain,
    Symmetric(Passphrase),
    Asymmetric {
        recipient: RsaPublicKey,
        own: Option<RsaPrivateKey>,
    },
    Salted(Zeroizing<Vec<u8>>),
}

impl CipherContext {
    pub fn salted(password: impl Into<Vec<u8>>) -> Self {
        CipherContext::Salted(Zeroizing::new(password.into()))
    }

    /// Encode and seal one value.
    pub fn seal(&self, value: &Value) -> Result<Vec<u8>, CipherError> {
        let plain = Zeroizing::new(codec::encode(value));
        match self {
            CipherContext::Plain => Ok(plain.to_vec()),
            CipherContext::Symmetric(key) => encrypt_symmetric(&plain, key),
            CipherContext::Asymmetric { recipient, .. } => encrypt_asymmetric(&plain, recipient),
            CipherContext::Salted(password) => encrypt_salted(&plain, password),
        }
    }

    /// Open one chunk and decode the value inside it.
    pub fn open(&self, chunk: &[u8]) -> Result<Value, CipherError> {
        let tag = Tag::peek(chunk)?;
        if let CipherContext::Plain = self {
            if tag.is_value() {
                return Ok(codec::decode_exact(chunk)?);
            }
            return Err(CipherError::ContextMismatch(tag));
        }
        let plain = Zeroizing::new(match (tag, self) {
            (Tag::SymmetricBlock, CipherContext::Symmetric(key)) => decrypt_symmetric(chunk, key)?,
            (Tag::AsymmetricBlock, CipherContext::Asymmetric { own: Some(key), .. }) => {
                decrypt_asymmetric(chunk, key)?
            }
            (Tag::SaltedBlock, CipherContext::Salted(password)) => decrypt_salted(chunk, password)?,
            (other, _) => return Err(CipherError::ContextMismatch(other)),
        });
        Ok(codec::decode_exact(&plain)?)
    }
}

impl fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherContext::Plain => "Plain",
            CipherContext::Symmetric(_) => "Symmetric",
            CipherContext::Asymmetric { .. } => "Asymmetric",
            CipherContext::Salted(_) => "Salted",
        };
        write!(f, "CipherContext::{name}")
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CipherError {
    /// Authentication failed: wrong key, or the ciphertext was altered.
    #[error("wrong passphrase or corrupted ciphertext")]
    WrongPassphrase,

    #[error("encryption failed")]
    Encrypt,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("{0:?} chunk cannot be opened with this context")]
    ContextMismatch(Tag),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
