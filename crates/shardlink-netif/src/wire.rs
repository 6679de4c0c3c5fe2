//! Wire message codec.
//!
//! Every message is a frame with a fixed 16-byte header followed by an
//! opcode-specific body. All integers are little-endian.
//!
//! ```text
//! ┌──────────────┬────────────┬────────────┬──────────┬──────────────┐
//! │ totalLength  │ requestId  │ responseTo │ opCode   │ body ...     │
//! │ i32 LE       │ i32 LE     │ i32 LE     │ i32 LE   │              │
//! └──────────────┴────────────┴────────────┴──────────┴──────────────┘
//! ```
//!
//! `totalLength` includes the header itself.

use std::sync::atomic::{AtomicI32, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::document::Document;
use crate::error::FrameError;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Default upper bound on a frame's total length.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48 * 1000 * 1000;

/// `totalLength` observed when an HTTP client talks to the native port
/// (the bytes `"GET "` read as a little-endian integer).
pub const HTTP_PROBE_LENGTH: i32 = 542_393_671;

/// `totalLength` sent by legacy clients as an endianness probe.
pub const ENDIAN_PROBE_LENGTH: i32 = -1;

const ALLOCATION_GRANULE: usize = 1024;

/// Suffix appended to the database name to address its command namespace.
const COMMAND_NAMESPACE_SUFFIX: &str = ".$cmd";

/// Size of a receive buffer for a frame of `len` bytes: rounded up to the
/// next 1 KiB.
pub fn padded_allocation(len: usize) -> usize {
    (len + ALLOCATION_GRANULE - 1) & !(ALLOCATION_GRANULE - 1)
}

/// Message opcodes understood by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    /// Legacy reply.
    Reply = 1,
    /// Legacy query; commands are queries against `<db>.$cmd`.
    Query = 2004,
    /// Command request.
    Command = 2010,
    /// Command reply.
    CommandReply = 2011,
}

impl TryFrom<i32> for OpCode {
    type Error = FrameError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(OpCode::Reply),
            2004 => Ok(OpCode::Query),
            2010 => Ok(OpCode::Command),
            2011 => Ok(OpCode::CommandReply),
            other => Err(FrameError::UnsupportedOpCode(other)),
        }
    }
}

/// Request/reply opcode pair used to run commands on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Commands as legacy queries, answered by [`OpCode::Reply`].
    OpQuery,
    /// Dedicated command messages, answered by [`OpCode::CommandReply`].
    OpCommand,
}

impl Protocol {
    /// Opcode of outgoing requests.
    pub fn request_opcode(self) -> OpCode {
        match self {
            Protocol::OpQuery => OpCode::Query,
            Protocol::OpCommand => OpCode::Command,
        }
    }

    /// Opcode the server answers with.
    pub fn reply_opcode(self) -> OpCode {
        match self {
            Protocol::OpQuery => OpCode::Reply,
            Protocol::OpCommand => OpCode::CommandReply,
        }
    }
}

/// Set of [`Protocol`]s an endpoint supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProtocolSet(u8);

impl ProtocolSet {
    /// Supports nothing.
    pub const NONE: ProtocolSet = ProtocolSet(0);
    /// Only legacy query commands.
    pub const OP_QUERY_ONLY: ProtocolSet = ProtocolSet(0b01);
    /// Only command messages.
    pub const OP_COMMAND_ONLY: ProtocolSet = ProtocolSet(0b10);
    /// Everything this codec speaks.
    pub const ALL: ProtocolSet = ProtocolSet(0b11);

    /// Wire version from which servers accept command messages.
    pub const COMMAND_WIRE_VERSION: i64 = 4;

    fn bit(protocol: Protocol) -> u8 {
        match protocol {
            Protocol::OpQuery => 0b01,
            Protocol::OpCommand => 0b10,
        }
    }

    /// Whether `protocol` is in the set.
    pub fn supports(self, protocol: Protocol) -> bool {
        self.0 & Self::bit(protocol) != 0
    }

    /// Derives the server's protocol set from its handshake reply.
    ///
    /// Routers (`msg: "isdbgrid"`) and servers older than
    /// [`Self::COMMAND_WIRE_VERSION`] only take legacy queries.
    pub fn from_handshake_reply(reply: &Document) -> ProtocolSet {
        let is_router = reply.get_str("msg") == Some("isdbgrid");
        let max_wire_version = reply.get_i64("maxWireVersion").unwrap_or(0);
        if !is_router && max_wire_version >= Self::COMMAND_WIRE_VERSION {
            ProtocolSet::ALL
        } else {
            ProtocolSet::OP_QUERY_ONLY
        }
    }

    /// Picks the protocol to use between a client and a server: command
    /// messages when both sides support them, else legacy queries.
    pub fn negotiate(client: ProtocolSet, server: ProtocolSet) -> Result<Protocol, FrameError> {
        let common = ProtocolSet(client.0 & server.0);
        if common.supports(Protocol::OpCommand) {
            Ok(Protocol::OpCommand)
        } else if common.supports(Protocol::OpQuery) {
            Ok(Protocol::OpQuery)
        } else {
            Err(FrameError::malformed(format!(
                "no common protocol between client {:?} and server {:?}",
                client, server
            )))
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Total frame length including the header.
    pub message_length: i32,
    /// Id of this message.
    pub request_id: i32,
    /// Id of the message this one answers, 0 for requests.
    pub response_to: i32,
    /// Raw opcode.
    pub op_code: i32,
}

impl MsgHeader {
    /// Reads the four header fields without validating them.
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut buf = &bytes[..];
        Self {
            message_length: buf.get_i32_le(),
            request_id: buf.get_i32_le(),
            response_to: buf.get_i32_le(),
            op_code: buf.get_i32_le(),
        }
    }

    /// Appends the encoded header to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.message_length);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(self.op_code);
    }

    /// Encoded header bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        self.encode(&mut &mut out[..]);
        out
    }

    /// Number of body bytes that follow the header.
    pub fn body_len(&self) -> usize {
        (self.message_length as usize).saturating_sub(HEADER_SIZE)
    }
}

/// One encoded message.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header.
    pub header: MsgHeader,
    /// Body bytes following the header.
    pub body: Bytes,
}

impl Frame {
    /// Id assigned to this frame.
    pub fn request_id(&self) -> i32 {
        self.header.request_id
    }

    /// Total encoded length.
    pub fn len(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    /// A frame always carries a header.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Header and body as one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

/// Decoded body of a frame, by opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Legacy query request.
    Query {
        /// Query flags.
        flags: i32,
        /// Full namespace, `<db>.$cmd` for commands.
        namespace: String,
        /// Documents to skip.
        skip: i32,
        /// Documents to return.
        limit: i32,
        /// The command (or query) document.
        query: Document,
    },
    /// Command request.
    Command {
        /// Target database.
        database: String,
        /// Command name, equal to the first key of `command`.
        command_name: String,
        /// Command arguments.
        command: Document,
        /// Request metadata.
        metadata: Document,
    },
    /// Legacy reply.
    Reply {
        /// Response flags.
        flags: i32,
        /// Cursor id, 0 when exhausted.
        cursor_id: i64,
        /// Offset of the first returned document.
        starting_from: i32,
        /// Returned documents.
        documents: Vec<Document>,
    },
    /// Command reply.
    CommandReply {
        /// Command result document.
        reply: Document,
        /// Reply metadata.
        metadata: Document,
    },
}

impl MessageBody {
    /// Database a request addresses; `None` for replies.
    pub fn database(&self) -> Option<&str> {
        match self {
            MessageBody::Query { namespace, .. } => Some(
                namespace
                    .strip_suffix(COMMAND_NAMESPACE_SUFFIX)
                    .unwrap_or(namespace),
            ),
            MessageBody::Command { database, .. } => Some(database),
            _ => None,
        }
    }

    /// Command document of a request; `None` for replies.
    pub fn command(&self) -> Option<&Document> {
        match self {
            MessageBody::Query { query, .. } => Some(query),
            MessageBody::Command { command, .. } => Some(command),
            _ => None,
        }
    }

    /// Converts a reply body into the reply document and its metadata.
    pub fn into_reply(self) -> Result<ReplyDocuments, FrameError> {
        match self {
            MessageBody::Reply { documents, .. } => Ok(ReplyDocuments {
                data: documents.into_iter().next().unwrap_or_default(),
                metadata: Document::empty(),
            }),
            MessageBody::CommandReply { reply, metadata } => Ok(ReplyDocuments {
                data: reply,
                metadata,
            }),
            _ => Err(FrameError::malformed("expected a reply, got a request")),
        }
    }
}

/// Reply document and metadata extracted from a reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyDocuments {
    /// Command result.
    pub data: Document,
    /// Reply metadata, empty for legacy replies.
    pub metadata: Document,
}

/// Allocates request ids: monotonically increasing, wrapping, never 0.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicI32,
}

impl RequestIdGenerator {
    /// Starts at a random point in the low 24-bit range.
    pub fn new() -> Self {
        let mut seed = [0u8; 4];
        let start = match getrandom::getrandom(&mut seed) {
            Ok(()) => (i32::from_le_bytes(seed) & 0x00FF_FFFF).max(1),
            Err(_) => 1,
        };
        Self::starting_at(start)
    }

    /// Starts at a fixed id.
    pub fn starting_at(id: i32) -> Self {
        Self {
            next: AtomicI32::new(id),
        }
    }

    /// Returns the next id.
    pub fn next_id(&self) -> i32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes requests and validates/decodes incoming frames.
#[derive(Debug)]
pub struct WireCodec {
    max_message_size: usize,
    ids: RequestIdGenerator,
}

impl WireCodec {
    /// Creates a codec enforcing `max_message_size`.
    pub fn new(max_message_size: usize) -> Self {
        Self::with_ids(max_message_size, RequestIdGenerator::new())
    }

    /// Creates a codec drawing ids from `ids`.
    pub fn with_ids(max_message_size: usize, ids: RequestIdGenerator) -> Self {
        Self {
            max_message_size,
            ids,
        }
    }

    /// Largest accepted frame.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Encodes a command against `dbname` as a frame with a fresh request id.
    pub fn encode(
        &self,
        protocol: Protocol,
        dbname: &str,
        command: &Document,
        metadata: &Document,
    ) -> Result<Frame, FrameError> {
        let mut body = BytesMut::with_capacity(dbname.len() + command.len() + metadata.len() + 32);
        match protocol {
            Protocol::OpQuery => {
                body.put_i32_le(0);
                put_cstring(&mut body, &format!("{}{}", dbname, COMMAND_NAMESPACE_SUFFIX))?;
                body.put_i32_le(0);
                body.put_i32_le(1);
                body.put_slice(command.as_bytes());
            }
            Protocol::OpCommand => {
                let command_name = command
                    .first_key()
                    .ok_or_else(|| FrameError::malformed("command document is empty"))?;
                put_cstring(&mut body, dbname)?;
                put_cstring(&mut body, command_name)?;
                body.put_slice(command.as_bytes());
                body.put_slice(metadata.as_bytes());
            }
        }

        let total = HEADER_SIZE + body.len();
        if total > self.max_message_size {
            return Err(FrameError::InvalidLength {
                len: i32::try_from(total).unwrap_or(i32::MAX),
                reason: "exceeds maximum message size",
            });
        }

        let header = MsgHeader {
            message_length: total as i32,
            request_id: self.ids.next_id(),
            response_to: 0,
            op_code: protocol.request_opcode() as i32,
        };
        Ok(Frame {
            header,
            body: body.freeze(),
        })
    }

    /// Parses and validates a received header.
    pub fn decode_header(&self, bytes: &[u8; HEADER_SIZE]) -> Result<MsgHeader, FrameError> {
        let header = MsgHeader::parse(bytes);
        let len = header.message_length;
        let reason = if len == HTTP_PROBE_LENGTH {
            Some("HTTP request on the native protocol port")
        } else if len == ENDIAN_PROBE_LENGTH {
            Some("endianness probe")
        } else if len == 0 {
            Some("zero length")
        } else if len < HEADER_SIZE as i32 {
            Some("shorter than the message header")
        } else if len as usize > self.max_message_size {
            Some("exceeds maximum message size")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(FrameError::InvalidLength { len, reason }),
            None => Ok(header),
        }
    }

    /// Copies `bytes` into an owned buffer and decodes the body declared by
    /// `header`.
    pub fn decode_body(&self, header: &MsgHeader, bytes: &[u8]) -> Result<MessageBody, FrameError> {
        let expected = header.body_len();
        if bytes.len() < expected {
            return Err(FrameError::Truncated {
                expected,
                received: bytes.len(),
            });
        }
        let mut owned = BytesMut::with_capacity(padded_allocation(header.message_length as usize));
        owned.put_slice(&bytes[..expected]);
        let body = owned.freeze();

        match OpCode::try_from(header.op_code)? {
            OpCode::Query => decode_query(body),
            OpCode::Command => decode_command(body),
            OpCode::Reply => decode_reply(body),
            OpCode::CommandReply => decode_command_reply(body),
        }
    }
}

/// Checks that a reply answers the frame that was sent with `expected_id`.
pub fn validate_response_id(header: &MsgHeader, expected_id: i32) -> Result<(), FrameError> {
    if header.response_to != expected_id {
        return Err(FrameError::MismatchedResponseId {
            expected: expected_id,
            got: header.response_to,
        });
    }
    Ok(())
}

fn put_cstring(buf: &mut BytesMut, s: &str) -> Result<(), FrameError> {
    if s.as_bytes().contains(&0) {
        return Err(FrameError::malformed(format!("embedded NUL in {:?}", s)));
    }
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

fn take_i32(body: &mut Bytes, field: &str) -> Result<i32, FrameError> {
    if body.remaining() < 4 {
        return Err(FrameError::malformed(format!("missing {}", field)));
    }
    Ok(body.get_i32_le())
}

fn take_cstring(body: &mut Bytes, field: &str) -> Result<String, FrameError> {
    let nul = body
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| FrameError::malformed(format!("unterminated {}", field)))?;
    let raw = body.split_to(nul);
    body.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::malformed(format!("{} is not UTF-8", field)))
}

fn take_document(body: &mut Bytes) -> Result<Document, FrameError> {
    let (doc, used) = Document::read_prefix(body)?;
    body.advance(used);
    Ok(doc)
}

fn decode_query(mut body: Bytes) -> Result<MessageBody, FrameError> {
    let flags = take_i32(&mut body, "query flags")?;
    let namespace = take_cstring(&mut body, "namespace")?;
    let skip = take_i32(&mut body, "skip")?;
    let limit = take_i32(&mut body, "limit")?;
    let query = take_document(&mut body)?;
    Ok(MessageBody::Query {
        flags,
        namespace,
        skip,
        limit,
        query,
    })
}

fn decode_command(mut body: Bytes) -> Result<MessageBody, FrameError> {
    let database = take_cstring(&mut body, "database")?;
    let command_name = take_cstring(&mut body, "command name")?;
    let command = take_document(&mut body)?;
    let metadata = take_document(&mut body)?;
    Ok(MessageBody::Command {
        database,
        command_name,
        command,
        metadata,
    })
}

fn decode_reply(mut body: Bytes) -> Result<MessageBody, FrameError> {
    let flags = take_i32(&mut body, "response flags")?;
    if body.remaining() < 8 {
        return Err(FrameError::malformed("missing cursor id"));
    }
    let cursor_id = body.get_i64_le();
    let starting_from = take_i32(&mut body, "starting offset")?;
    let returned = take_i32(&mut body, "document count")?;
    let mut documents = Vec::with_capacity(returned.clamp(0, 16) as usize);
    for _ in 0..returned.max(0) {
        documents.push(take_document(&mut body)?);
    }
    Ok(MessageBody::Reply {
        flags,
        cursor_id,
        starting_from,
        documents,
    })
}

fn decode_command_reply(mut body: Bytes) -> Result<MessageBody, FrameError> {
    let reply = take_document(&mut body)?;
    let metadata = if body.has_remaining() {
        take_document(&mut body)?
    } else {
        Document::empty()
    };
    Ok(MessageBody::CommandReply { reply, metadata })
}

/// Encodes a reply frame answering `response_to`. Used by servers and test
/// peers.
pub fn encode_reply(
    protocol: Protocol,
    request_id: i32,
    response_to: i32,
    reply: &Document,
    metadata: &Document,
) -> Frame {
    let mut body = BytesMut::with_capacity(reply.len() + metadata.len() + 20);
    match protocol {
        Protocol::OpQuery => {
            body.put_i32_le(0);
            body.put_i64_le(0);
            body.put_i32_le(0);
            body.put_i32_le(1);
            body.put_slice(reply.as_bytes());
        }
        Protocol::OpCommand => {
            body.put_slice(reply.as_bytes());
            body.put_slice(metadata.as_bytes());
        }
    }
    let header = MsgHeader {
        message_length: (HEADER_SIZE + body.len()) as i32,
        request_id,
        response_to,
        op_code: protocol.reply_opcode() as i32,
    };
    Frame {
        header,
        body: body.freeze(),
    }
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_header_length_range(len in any::<i32>(), max in (HEADER_SIZE as i32)..100_000) {
            let codec = WireCodec::new(max as usize);
            let header = MsgHeader { message_length: len, request_id: 1, response_to: 0, op_code: 1 };
            let accepted = codec.decode_header(&header.to_bytes()).is_ok();
            prop_assert_eq!(accepted, len >= HEADER_SIZE as i32 && len <= max);
        }

        #[test]
        fn test_command_roundtrip_any_db(db in "[a-z][a-z0-9_]{0,20}", value in any::<i32>()) {
            let codec = WireCodec::new(DEFAULT_MAX_MESSAGE_SIZE);
            let command = crate::document::DocumentBuilder::new().append_i32("count", value).build();
            let frame = codec.encode(Protocol::OpCommand, &db, &command, &Document::empty()).unwrap();
            let bytes = frame.to_bytes();
            let mut raw = [0u8; HEADER_SIZE];
            raw.copy_from_slice(&bytes[..HEADER_SIZE]);
            let header = codec.decode_header(&raw).unwrap();
            let body = codec.decode_body(&header, &bytes[HEADER_SIZE..]).unwrap();
            prop_assert_eq!(body.database(), Some(db.as_str()));
            prop_assert_eq!(body.command(), Some(&command));
        }
    }
}
