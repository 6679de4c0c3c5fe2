//! Opaque command documents.
//!
//! A document is carried as the raw bytes the remote side understands. The
//! only structure this crate relies on is the framing: a little-endian `i32`
//! total length up front and a trailing `0x00`. That is enough to delimit
//! documents inside a frame body. A top-level element scan is provided for
//! the few fields the connection handshake needs to read.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;

const TYPE_DOUBLE: u8 = 0x01;
const TYPE_STRING: u8 = 0x02;
const TYPE_DOCUMENT: u8 = 0x03;
const TYPE_BOOL: u8 = 0x08;
const TYPE_INT32: u8 = 0x10;
const TYPE_INT64: u8 = 0x12;

/// A length-delimited document.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Document(Bytes);

impl Document {
    /// Smallest valid document: the length prefix plus the terminator.
    pub const MIN_SIZE: usize = 5;

    /// The empty document `{}`.
    pub fn empty() -> Self {
        Document(Bytes::from_static(&[5, 0, 0, 0, 0]))
    }

    /// Wraps `bytes`, checking that they are exactly one framed document.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, FrameError> {
        let bytes = bytes.into();
        let declared = declared_len(&bytes)?;
        if declared != bytes.len() {
            return Err(FrameError::malformed(format!(
                "document declares {} bytes but {} were supplied",
                declared,
                bytes.len()
            )));
        }
        check_terminator(&bytes)?;
        Ok(Document(bytes))
    }

    /// Splits the leading document off `buf`, returning it and the number of
    /// bytes consumed.
    pub fn read_prefix(buf: &Bytes) -> Result<(Self, usize), FrameError> {
        let declared = declared_len(buf)?;
        if declared > buf.len() {
            return Err(FrameError::malformed(format!(
                "document declares {} bytes but only {} remain",
                declared,
                buf.len()
            )));
        }
        let doc = buf.slice(..declared);
        check_terminator(&doc)?;
        Ok((Document(doc), declared))
    }

    /// Raw bytes, including the length prefix.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encoded size in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` for `{}`.
    pub fn is_empty(&self) -> bool {
        self.0.len() == Self::MIN_SIZE
    }

    /// Name of the first element, which for a command is the command name.
    pub fn first_key(&self) -> Option<&str> {
        self.elements().next().map(|e| e.key)
    }

    /// Reads a numeric top-level field (int32, int64 or double).
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        let element = self.elements().find(|e| e.key == key)?;
        match element.kind {
            TYPE_INT32 => Some(i64::from(i32::from_le_bytes(element.value.try_into().ok()?))),
            TYPE_INT64 => Some(i64::from_le_bytes(element.value.try_into().ok()?)),
            TYPE_DOUBLE => Some(f64::from_le_bytes(element.value.try_into().ok()?) as i64),
            TYPE_BOOL => element.value.first().map(|b| i64::from(*b)),
            _ => None,
        }
    }

    /// Reads a top-level string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        let element = self.elements().find(|e| e.key == key)?;
        if element.kind != TYPE_STRING || element.value.len() < 5 {
            return None;
        }
        // value: i32 length (including NUL), bytes, NUL
        let text = &element.value[4..element.value.len() - 1];
        std::str::from_utf8(text).ok()
    }

    fn elements(&self) -> Elements<'_> {
        Elements {
            rest: &self.0[4..self.0.len() - 1],
        }
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("len", &self.len())
            .field("first_key", &self.first_key())
            .finish()
    }
}

fn declared_len(buf: &[u8]) -> Result<usize, FrameError> {
    let prefix: [u8; 4] = buf
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| FrameError::malformed("document shorter than its length prefix"))?;
    let declared = i32::from_le_bytes(prefix);
    if declared < Document::MIN_SIZE as i32 {
        return Err(FrameError::malformed(format!(
            "document length {} below minimum",
            declared
        )));
    }
    Ok(declared as usize)
}

fn check_terminator(doc: &[u8]) -> Result<(), FrameError> {
    match doc.last() {
        Some(0) => Ok(()),
        _ => Err(FrameError::malformed("document is not NUL terminated")),
    }
}

struct Element<'a> {
    kind: u8,
    key: &'a str,
    value: &'a [u8],
}

/// Top-level element scanner. Stops at the first element it cannot size.
struct Elements<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Elements<'a> {
    type Item = Element<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&kind, after_kind) = self.rest.split_first()?;
        let nul = after_kind.iter().position(|b| *b == 0)?;
        let key = std::str::from_utf8(&after_kind[..nul]).ok()?;
        let after_key = &after_kind[nul + 1..];
        let size = value_size(kind, after_key)?;
        if size > after_key.len() {
            self.rest = &[];
            return None;
        }
        let (value, rest) = after_key.split_at(size);
        self.rest = rest;
        Some(Element { kind, key, value })
    }
}

fn value_size(kind: u8, value: &[u8]) -> Option<usize> {
    let prefixed = || -> Option<usize> {
        let len = i32::from_le_bytes(value.get(..4)?.try_into().ok()?);
        usize::try_from(len).ok()
    };
    let cstring = |from: usize| -> Option<usize> {
        value.get(from..)?.iter().position(|b| *b == 0).map(|p| from + p + 1)
    };
    match kind {
        0x01 | 0x09 | 0x11 | 0x12 => Some(8),
        0x02 | 0x0D | 0x0E => Some(4 + prefixed()?),
        0x03 | 0x04 | 0x0F => prefixed(),
        0x05 => Some(4 + 1 + prefixed()?),
        0x06 | 0x0A | 0x7F | 0xFF => Some(0),
        0x07 => Some(12),
        0x08 => Some(1),
        0x0B => cstring(0).and_then(cstring),
        0x0C => Some(4 + prefixed()? + 12),
        0x10 => Some(4),
        0x13 => Some(16),
        _ => None,
    }
}

/// Appends top-level elements and produces a framed [`Document`].
#[derive(Debug)]
pub struct DocumentBuilder {
    buf: BytesMut,
}

impl DocumentBuilder {
    /// Starts an empty document.
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_i32_le(0);
        Self { buf }
    }

    fn key(&mut self, kind: u8, key: &str) {
        debug_assert!(!key.as_bytes().contains(&0), "document keys cannot contain NUL");
        self.buf.put_u8(kind);
        self.buf.put_slice(key.as_bytes());
        self.buf.put_u8(0);
    }

    /// Appends an int32 element.
    pub fn append_i32(mut self, key: &str, value: i32) -> Self {
        self.key(TYPE_INT32, key);
        self.buf.put_i32_le(value);
        self
    }

    /// Appends an int64 element.
    pub fn append_i64(mut self, key: &str, value: i64) -> Self {
        self.key(TYPE_INT64, key);
        self.buf.put_i64_le(value);
        self
    }

    /// Appends a boolean element.
    pub fn append_bool(mut self, key: &str, value: bool) -> Self {
        self.key(TYPE_BOOL, key);
        self.buf.put_u8(u8::from(value));
        self
    }

    /// Appends a UTF-8 string element.
    pub fn append_str(mut self, key: &str, value: &str) -> Self {
        self.key(TYPE_STRING, key);
        self.buf.put_i32_le(value.len() as i32 + 1);
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
        self
    }

    /// Appends an embedded document.
    pub fn append_document(mut self, key: &str, value: &Document) -> Self {
        self.key(TYPE_DOCUMENT, key);
        self.buf.put_slice(value.as_bytes());
        self
    }

    /// Terminates the document and patches its length prefix.
    pub fn build(mut self) -> Document {
        self.buf.put_u8(0);
        let len = self.buf.len() as i32;
        self.buf[..4].copy_from_slice(&len.to_le_bytes());
        Document(self.buf.freeze())
    }
}

impl Default for DocumentBuilder {
    fn default() -> Self {
        Self::new()
    }
}
