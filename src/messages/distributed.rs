//! Distributed network messages sent over D connections.
//!
//! Parent-to-child traffic is small and frame-oriented, so this scope gets a
//! direct `encode`/`decode` pair over whole frames rather than the streaming
//! trait family the server scope uses. An embedded envelope parses straight
//! through to the message it wraps.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::{ProtocolRead, ProtocolWrite, open_frame};
use crate::{Error, Result};

/// Distributed message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributedCode {
    Ping,
    SearchRequest,
    BranchLevel,
    BranchRoot,
    ChildDepth,
    EmbeddedMessage,
}

impl DistributedCode {
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(DistributedCode::Ping),
            3 => Some(DistributedCode::SearchRequest),
            4 => Some(DistributedCode::BranchLevel),
            5 => Some(DistributedCode::BranchRoot),
            7 => Some(DistributedCode::ChildDepth),
            93 => Some(DistributedCode::EmbeddedMessage),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            DistributedCode::Ping => 0,
            DistributedCode::SearchRequest => 3,
            DistributedCode::BranchLevel => 4,
            DistributedCode::BranchRoot => 5,
            DistributedCode::ChildDepth => 7,
            DistributedCode::EmbeddedMessage => 93,
        }
    }
}

/// A search flooding down the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// The user who started the search and expects responses.
    pub origin: String,
    pub token: u32,
    pub query: String,
}

impl SearchRequest {
    fn read_from<B: Buf>(buf: &mut B) -> Result<Self> {
        // The leading word is unused on the modern network; nothing we
        // resolve or forward depends on it.
        let _ = u32::read_from(buf)?;
        Ok(SearchRequest {
            origin: String::read_from(buf)?,
            token: u32::read_from(buf)?,
            query: String::read_from(buf)?,
        })
    }

    fn write_to<B: BufMut>(&self, buf: &mut B) {
        0u32.write_to(buf);
        self.origin.write_to(buf);
        self.token.write_to(buf);
        self.query.write_to(buf);
    }
}

/// Distributed network messages.
#[derive(Debug, Clone)]
pub enum DistributedMessage {
    /// Keepalive toward children (deprecated).
    Ping,
    SearchRequest(SearchRequest),
    /// The sender's distance in edges from its branch root.
    BranchLevel(i32),
    /// The sender's branch root username.
    BranchRoot(String),
    /// Depth of the subtree below the sender (deprecated).
    ChildDepth(u32),
    /// A message the branch root asked the server to pass down, delivered
    /// wrapped; decoding parses straight through to the inner message.
    Embedded(Box<DistributedMessage>),
}

impl DistributedMessage {
    pub fn code(&self) -> DistributedCode {
        match self {
            DistributedMessage::Ping => DistributedCode::Ping,
            DistributedMessage::SearchRequest(_) => DistributedCode::SearchRequest,
            DistributedMessage::BranchLevel(_) => DistributedCode::BranchLevel,
            DistributedMessage::BranchRoot(_) => DistributedCode::BranchRoot,
            DistributedMessage::ChildDepth(_) => DistributedCode::ChildDepth,
            DistributedMessage::Embedded(_) => DistributedCode::EmbeddedMessage,
        }
    }

    /// Serialize as one complete frame.
    pub fn encode(&self) -> Bytes {
        let mut frame = BytesMut::new();
        frame.put_u32_le(0); // length, patched once the body is written
        self.write_wire(&mut frame);
        let body_len = (frame.len() - 4) as u32;
        frame[..4].copy_from_slice(&body_len.to_le_bytes());
        frame.freeze()
    }

    fn write_wire(&self, frame: &mut BytesMut) {
        frame.put_u8(self.code().to_wire());
        match self {
            DistributedMessage::Ping => {}
            DistributedMessage::SearchRequest(search) => search.write_to(frame),
            DistributedMessage::BranchLevel(level) => level.write_to(frame),
            DistributedMessage::BranchRoot(root) => root.write_to(frame),
            DistributedMessage::ChildDepth(depth) => depth.write_to(frame),
            DistributedMessage::Embedded(inner) => inner.write_wire(frame),
        }
    }

    /// Parse one complete frame, length prefix included.
    pub fn decode(frame: Bytes) -> Result<Self> {
        let mut body = open_frame(frame)?;
        Self::read_wire(&mut body)
    }

    /// Parse the payload of a server-scope embedded envelope, which carries
    /// `code || body` with no length prefix of its own.
    pub fn decode_embedded(code: u8, body: &[u8]) -> Result<Self> {
        let mut wire = BytesMut::with_capacity(1 + body.len());
        wire.put_u8(code);
        wire.put_slice(body);
        Self::read_wire(&mut wire.freeze())
    }

    fn read_wire<B: Buf>(buf: &mut B) -> Result<Self> {
        let byte = u8::read_from(buf)?;
        let code = DistributedCode::from_wire(byte).ok_or(Error::InvalidDistributedCode(byte))?;
        Ok(match code {
            DistributedCode::Ping => DistributedMessage::Ping,
            DistributedCode::SearchRequest => {
                DistributedMessage::SearchRequest(SearchRequest::read_from(buf)?)
            }
            DistributedCode::BranchLevel => DistributedMessage::BranchLevel(i32::read_from(buf)?),
            DistributedCode::BranchRoot => DistributedMessage::BranchRoot(String::read_from(buf)?),
            DistributedCode::ChildDepth => DistributedMessage::ChildDepth(u32::read_from(buf)?),
            DistributedCode::EmbeddedMessage => {
                DistributedMessage::Embedded(Box::new(Self::read_wire(buf)?))
            }
        })
    }
}
