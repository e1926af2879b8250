//! Ember chunk codec — tag-first framing for every value on the wire.
//!
//! A chunk is one tag byte followed by a payload whose shape the tag fixes.
//! The receiver always knows the kind of a chunk before it interprets a
//! single payload byte, and never needs more than the current chunk's
//! declared payload in memory.
//!
//! The tag registry below IS the protocol. Tags are append-only: never reuse
//! or renumber one. All multi-byte integers are big-endian.

use std::io::{ErrorKind, Read};

use thiserror::Error;

/// Upper bound on any declared length (string, bytes, block, element count).
pub const MAX_CHUNK_LEN: usize = 64 * 1024 * 1024;

/// Maximum container nesting accepted by the decoder.
pub const MAX_DEPTH: usize = 64;

/// Salt length carried in the clear by salted and streaming chunks.
pub const SALT_LEN: usize = 16;

/// Length of the chain hash carried by the authenticity terminal.
pub const CHAIN_HASH_LEN: usize = 32;

// ── Tag registry ──────────────────────────────────────────────────────────────

/// One-byte chunk kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Null = b'N',
    False = b'F',
    True = b'T',
    Int = b'i',
    Float = b'f',
    Complex = b'c',
    Str = b's',
    Bytes = b'y',
    List = b'l',
    Tuple = b'u',
    Set = b'e',
    Map = b'm',
    /// A value reconstructed from a foreign type registry (type name + state).
    /// Carried by the codec, refused by the message validator.
    Opaque = b'o',

    /// `u32 len` + nonce ‖ tag ‖ ciphertext under one passphrase.
    SymmetricBlock = b'A',
    /// `u16 block size` + `u32 block count` + RSA-OAEP blocks.
    AsymmetricBlock = b'R',
    /// Streaming header: salt + `u32 rotation`.
    StreamSymmetric = b'G',
    /// Streaming header: `u32 rotation` + nested asymmetric block of passphrases.
    StreamAsymmetric = b'H',
    /// Salt + nested symmetric block.
    SaltedBlock = b'S',
    /// Authenticity terminal: chain hash over every preceding chunk.
    Authenticity = b'V',
    /// End of a streaming cipher run.
    EndOfStream = b'Z',
}

impl TryFrom<u8> for Tag {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let tag = match value {
            b'N' => Tag::Null,
            b'F' => Tag::False,
            b'T' => Tag::True,
            b'i' => Tag::Int,
            b'f' => Tag::Float,
            b'c' => Tag::Complex,
            b's' => Tag::Str,
            b'y' => Tag::Bytes,
            b'l' => Tag::List,
            b'u' => Tag::Tuple,
            b'e' => Tag::Set,
            b'm' => Tag::Map,
            b'o' => Tag::Opaque,
            b'A' => Tag::SymmetricBlock,
            b'R' => Tag::AsymmetricBlock,
            b'G' => Tag::StreamSymmetric,
            b'H' => Tag::StreamAsymmetric,
            b'S' => Tag::SaltedBlock,
            b'V' => Tag::Authenticity,
            b'Z' => Tag::EndOfStream,
            other => return Err(CodecError::UnknownTag(other)),
        };
        Ok(tag)
    }
}

impl From<Tag> for u8 {
    fn from(t: Tag) -> u8 {
        t as u8
    }
}

impl Tag {
    /// True for the kinds that carry a plain value.
    pub fn is_value(self) -> bool {
        matches!(
            self,
            Tag::Null
                | Tag::False
                | Tag::True
                | Tag::Int
                | Tag::Float
                | Tag::Complex
                | Tag::Str
                | Tag::Bytes
                | Tag::List
                | Tag::Tuple
                | Tag::Set
                | Tag::Map
                | Tag::Opaque
        )
    }

    /// Read the tag of the first chunk in `input`.
    pub fn peek(input: &[u8]) -> Result<Tag, CodecError> {
        match input.first() {
            Some(b) => Tag::try_from(*b),
            None => Err(CodecError::Truncated),
        }
    }
}

// ── Values ────────────────────────────────────────────────────────────────────

/// A decoded value. Mappings keep their insertion order.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex(f64, f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Opaque { type_name: String, state: Vec<u8> },
}

impl Value {
    /// Build a mapping with string keys.
    pub fn map<K, I>(entries: I) -> Value
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::Str(k.into()), v))
                .collect(),
        )
    }

    pub fn tag(&self) -> Tag {
        match self {
            Value::Null => Tag::Null,
            Value::Bool(false) => Tag::False,
            Value::Bool(true) => Tag::True,
            Value::Int(_) => Tag::Int,
            Value::Float(_) => Tag::Float,
            Value::Complex(..) => Tag::Complex,
            Value::Str(_) => Tag::Str,
            Value::Bytes(_) => Tag::Bytes,
            Value::List(_) => Tag::List,
            Value::Tuple(_) => Tag::Tuple,
            Value::Set(_) => Tag::Set,
            Value::Map(_) => Tag::Map,
            Value::Opaque { .. } => Tag::Opaque,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a string key in a mapping.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encode a value as one chunk.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

/// Append the chunk for `value` to `out`.
pub fn encode_into(value: &Value, out: &mut Vec<u8>) {
    out.push(value.tag().into());
    match value {
        Value::Null | Value::Bool(_) => {}
        Value::Int(i) => out.extend_from_slice(&i.to_be_bytes()),
        Value::Float(f) => out.extend_from_slice(&f.to_bits().to_be_bytes()),
        Value::Complex(re, im) => {
            out.extend_from_slice(&re.to_bits().to_be_bytes());
            out.extend_from_slice(&im.to_bits().to_be_bytes());
        }
        Value::Str(s) => put_bytes(out, s.as_bytes()),
        Value::Bytes(b) => put_bytes(out, b),
        Value::List(items) | Value::Tuple(items) | Value::Set(items) => {
            put_len(out, items.len());
            for item in items {
                encode_into(item, out);
            }
        }
        Value::Map(entries) => {
            put_len(out, entries.len());
            for (k, v) in entries {
                encode_into(k, out);
                encode_into(v, out);
            }
        }
        Value::Opaque { type_name, state } => {
            encode_into(&Value::Str(type_name.clone()), out);
            encode_into(&Value::Bytes(state.clone()), out);
        }
    }
}

pub(crate) fn put_len(out: &mut Vec<u8>, len: usize) {
    debug_assert!(len <= MAX_CHUNK_LEN, "declared length exceeds MAX_CHUNK_LEN");
    out.extend_from_slice(&(len as u32).to_be_bytes());
}

pub(crate) fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_len(out, bytes.len());
    out.extend_from_slice(bytes);
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Decode the first chunk of `input`.
///
/// Returns the chunk's kind, its value, and the bytes that follow it.
/// Cipher kinds cannot be decoded without key material; use
/// [`crate::cipher::CipherContext::open`] for those.
pub fn decode(input: &[u8]) -> Result<(Tag, Value, &[u8]), CodecError> {
    let mut cur = Cursor::new(input);
    let tag = cur.tag()?;
    if !tag.is_value() {
        return Err(CodecError::Sealed(tag));
    }
    let value = read_value(&mut cur, tag, 0)?;
    Ok((tag, value, cur.rest()))
}

/// Decode a buffer that must hold exactly one value chunk.
pub fn decode_exact(input: &[u8]) -> Result<Value, CodecError> {
    let (_, value, rest) = decode(input)?;
    if !rest.is_empty() {
        return Err(CodecError::TrailingBytes(rest.len()));
    }
    Ok(value)
}

/// Measure the first complete chunk of any kind without interpreting it.
///
/// Returns `Ok(None)` while `input` holds only part of a chunk. Unknown tags
/// and oversized declared lengths fail immediately, so a hostile sender
/// cannot make the caller buffer without bound.
pub fn split_chunk(input: &[u8]) -> Result<Option<usize>, CodecError> {
    let mut cur = Cursor::new(input);
    match skip_chunk(&mut cur, 0) {
        Ok(_) => Ok(Some(cur.pos)),
        Err(CodecError::Truncated) => Ok(None),
        Err(e) => Err(e),
    }
}

fn read_value(cur: &mut Cursor<'_>, tag: Tag, depth: usize) -> Result<Value, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    let value = match tag {
        Tag::Null => Value::Null,
        Tag::False => Value::Bool(false),
        Tag::True => Value::Bool(true),
        Tag::Int => Value::Int(i64::from_be_bytes(cur.array()?)),
        Tag::Float => Value::Float(f64::from_bits(u64::from_be_bytes(cur.array()?))),
        Tag::Complex => {
            let re = f64::from_bits(u64::from_be_bytes(cur.array()?));
            let im = f64::from_bits(u64::from_be_bytes(cur.array()?));
            Value::Complex(re, im)
        }
        Tag::Str => {
            let len = cur.len()?;
            let raw = cur.take(len)?;
            let s = std::str::from_utf8(raw).map_err(|_| CodecError::Malformed("string is not UTF-8"))?;
            Value::Str(s.to_string())
        }
        Tag::Bytes => {
            let len = cur.len()?;
            Value::Bytes(cur.take(len)?.to_vec())
        }
        Tag::List | Tag::Tuple | Tag::Set => {
            let count = cur.len()?;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let item_tag = cur.value_tag()?;
                items.push(read_value(cur, item_tag, depth + 1)?);
            }
            match tag {
                Tag::List => Value::List(items),
                Tag::Tuple => Value::Tuple(items),
                _ => Value::Set(items),
            }
        }
        Tag::Map => {
            let count = cur.len()?;
            let mut entries = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let key_tag = cur.value_tag()?;
                let key = read_value(cur, key_tag, depth + 1)?;
                let value_tag = cur.value_tag()?;
                let value = read_value(cur, value_tag, depth + 1)?;
                entries.push((key, value));
            }
            Value::Map(entries)
        }
        Tag::Opaque => {
            let name_tag = cur_expect(cur, Tag::Str)?;
            let name = match read_value(cur, name_tag, depth + 1)? {
                Value::Str(s) => s,
                _ => return Err(CodecError::Malformed("opaque type name")),
            };
            let state_tag = cur_expect(cur, Tag::Bytes)?;
            let state = match read_value(cur, state_tag, depth + 1)? {
                Value::Bytes(b) => b,
                _ => return Err(CodecError::Malformed("opaque state")),
            };
            Value::Opaque {
                type_name: name,
                state,
            }
        }
        sealed => return Err(CodecError::Sealed(sealed)),
    };
    Ok(value)
}

fn cur_expect(cur: &mut Cursor<'_>, expected: Tag) -> Result<Tag, CodecError> {
    let tag = cur.tag()?;
    if tag != expected {
        return Err(CodecError::UnexpectedTag { expected, found: tag });
    }
    Ok(tag)
}

/// Walk over one chunk of any kind, returning its tag.
fn skip_chunk(cur: &mut Cursor<'_>, depth: usize) -> Result<Tag, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    let tag = cur.tag()?;
    match tag {
        Tag::Null | Tag::False | Tag::True | Tag::EndOfStream => {}
        Tag::Int | Tag::Float => {
            cur.take(8)?;
        }
        Tag::Complex => {
            cur.take(16)?;
        }
        Tag::Str | Tag::Bytes | Tag::SymmetricBlock => {
            let len = cur.len()?;
            cur.take(len)?;
        }
        Tag::List | Tag::Tuple | Tag::Set => {
            let count = cur.len()?;
            for _ in 0..count {
                skip_chunk(cur, depth + 1)?;
            }
        }
        Tag::Map => {
            let count = cur.len()?;
            for _ in 0..count * 2 {
                skip_chunk(cur, depth + 1)?;
            }
        }
        Tag::Opaque => {
            skip_chunk(cur, depth + 1)?;
            skip_chunk(cur, depth + 1)?;
        }
        Tag::AsymmetricBlock => {
            let (block_size, count) = cur.block_layout()?;
            cur.take(block_size * count)?;
        }
        Tag::StreamSymmetric => {
            cur.take(SALT_LEN + 4)?;
        }
        Tag::StreamAsymmetric => {
            cur.take(4)?;
            skip_chunk(cur, depth + 1)?;
        }
        Tag::SaltedBlock => {
            cur.take(SALT_LEN)?;
            skip_chunk(cur, depth + 1)?;
        }
        Tag::Authenticity => {
            cur.take(CHAIN_HASH_LEN)?;
        }
    }
    Ok(tag)
}

// ── Cursor ────────────────────────────────────────────────────────────────────

/// Bounds-checked reader over a byte slice. Shared with the cipher layers.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() - self.pos < n {
            return Err(CodecError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn tag(&mut self) -> Result<Tag, CodecError> {
        let [b] = self.array::<1>()?;
        Tag::try_from(b)
    }

    /// Read a tag that must start a value chunk.
    fn value_tag(&mut self) -> Result<Tag, CodecError> {
        let tag = self.tag()?;
        if !tag.is_value() {
            return Err(CodecError::Sealed(tag));
        }
        Ok(tag)
    }

    pub(crate) fn expect(&mut self, expected: Tag) -> Result<(), CodecError> {
        cur_expect(self, expected).map(|_| ())
    }

    pub(crate) fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    /// Read a declared length and enforce MAX_CHUNK_LEN.
    pub(crate) fn len(&mut self) -> Result<usize, CodecError> {
        let len = self.u32()? as usize;
        if len > MAX_CHUNK_LEN {
            return Err(CodecError::TooLarge(len));
        }
        Ok(len)
    }

    /// Read the `u16 size` + `u32 count` prefix of an asymmetric block.
    pub(crate) fn block_layout(&mut self) -> Result<(usize, usize), CodecError> {
        let size = self.u16()? as usize;
        let count = self.u32()? as usize;
        if size == 0 || count == 0 {
            return Err(CodecError::Malformed("empty asymmetric block"));
        }
        match size.checked_mul(count) {
            Some(total) if total <= MAX_CHUNK_LEN => Ok((size, count)),
            _ => Err(CodecError::TooLarge(size.saturating_mul(count))),
        }
    }

    pub(crate) fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Fail unless every byte has been consumed.
    pub(crate) fn finish(&self) -> Result<(), CodecError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

// ── Stream reader ─────────────────────────────────────────────────────────────

/// Cuts a byte stream into raw chunks.
///
/// Reads exactly the bytes of one chunk at a time: the tag, then whatever
/// fixed header the tag implies, then the declared payload. Yields `None`
/// on a clean end of input between chunks.
pub struct ChunkReader<R> {
    inner: R,
    done: bool,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, done: false }
    }

    /// Read the next raw chunk, or `None` at end of input.
    pub fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        let mut first = [0u8; 1];
        loop {
            match self.inner.read(&mut first) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(CodecError::Io(e)),
            }
        }
        let mut out = vec![first[0]];
        copy_chunk_body(&mut self.inner, &mut out, 0)?;
        Ok(Some(out))
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = Result<Vec<u8>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_chunk() {
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

fn read_into<R: Read>(r: &mut R, out: &mut Vec<u8>, n: usize) -> Result<(), CodecError> {
    let start = out.len();
    out.resize(start + n, 0);
    r.read_exact(&mut out[start..]).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => CodecError::Truncated,
        _ => CodecError::Io(e),
    })
}

fn read_len<R: Read>(r: &mut R, out: &mut Vec<u8>) -> Result<usize, CodecError> {
    read_into(r, out, 4)?;
    let n = out.len();
    let len = u32::from_be_bytes([out[n - 4], out[n - 3], out[n - 2], out[n - 1]]) as usize;
    if len > MAX_CHUNK_LEN {
        return Err(CodecError::TooLarge(len));
    }
    Ok(len)
}

/// Copy the body of a chunk whose tag byte is already the last byte of `out`.
fn copy_chunk_body<R: Read>(r: &mut R, out: &mut Vec<u8>, depth: usize) -> Result<(), CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    let tag_byte = *out.last().ok_or(CodecError::Truncated)?;
    let copy_nested = |r: &mut R, out: &mut Vec<u8>| -> Result<(), CodecError> {
        read_into(r, out, 1)?;
        Tag::try_from(*out.last().ok_or(CodecError::Truncated)?)?;
        copy_chunk_body(r, out, depth + 1)
    };
    match Tag::try_from(tag_byte)? {
        Tag::Null | Tag::False | Tag::True | Tag::EndOfStream => Ok(()),
        Tag::Int | Tag::Float => read_into(r, out, 8),
        Tag::Complex => read_into(r, out, 16),
        Tag::Str | Tag::Bytes | Tag::SymmetricBlock => {
            let len = read_len(r, out)?;
            read_into(r, out, len)
        }
        Tag::List | Tag::Tuple | Tag::Set => {
            let count = read_len(r, out)?;
            for _ in 0..count {
                copy_nested(r, out)?;
            }
            Ok(())
        }
        Tag::Map => {
            let count = read_len(r, out)?;
            for _ in 0..count * 2 {
                copy_nested(r, out)?;
            }
            Ok(())
        }
        Tag::Opaque => {
            copy_nested(r, out)?;
            copy_nested(r, out)
        }
        Tag::AsymmetricBlock => {
            let start = out.len();
            read_into(r, out, 6)?;
            let (size, count) = Cursor::new(&out[start..]).block_layout()?;
            read_into(r, out, size * count)
        }
        Tag::StreamSymmetric => read_into(r, out, SALT_LEN + 4),
        Tag::StreamAsymmetric => {
            read_into(r, out, 4)?;
            copy_nested(r, out)
        }
        Tag::SaltedBlock => {
            read_into(r, out, SALT_LEN)?;
            copy_nested(r, out)
        }
        Tag::Authenticity => read_into(r, out, CHAIN_HASH_LEN),
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors raised while framing or interpreting chunks. All are fatal to the
/// stream they occur in.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown chunk tag: 0x{0:02x}")]
    UnknownTag(u8),

    #[error("chunk is truncated")]
    Truncated,

    #[error("malformed chunk: {0}")]
    Malformed(&'static str),

    #[error("declared length {0} exceeds maximum {}", MAX_CHUNK_LEN)]
    TooLarge(usize),

    #[error("nesting deeper than {}", MAX_DEPTH)]
    TooDeep,

    #[error("expected {expected:?} chunk, found {found:?}")]
    UnexpectedTag { expected: Tag, found: Tag },

    #[error("{0:?} chunk needs key material to decode")]
    Sealed(Tag),

    #[error("{0} trailing bytes after chunk")]
    TrailingBytes(usize),

    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
