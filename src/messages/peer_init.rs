//! Peer initialization messages.
//!
//! The first frame on any inbound or outbound peer socket is one of these;
//! the acceptor uses it to classify the connection.

use bytes::{Buf, BufMut, Bytes};

use crate::constants::ConnectionType;
use crate::protocol::{MessageRead, MessageWrite, ProtocolRead, ProtocolWrite, open_frame};
use crate::{Error, Result};

/// Peer init message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerInitCode {
    PierceFirewall = 0,
    PeerInit = 1,
}

impl TryFrom<u8> for PeerInitCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PeerInitCode::PierceFirewall),
            1 => Ok(PeerInitCode::PeerInit),
            _ => Err(Error::InvalidPeerInitCode(value)),
        }
    }
}

impl From<PeerInitCode> for u8 {
    fn from(code: PeerInitCode) -> Self {
        code as u8
    }
}

/// Peer initialization messages.
#[derive(Debug, Clone)]
pub enum PeerInitMessage {
    /// Response to an indirect connection request.
    /// Token is from the ConnectToPeer server message.
    PierceFirewall { token: u32 },

    /// Initiate a direct connection to another peer.
    PeerInit {
        username: String,
        connection_type: ConnectionType,
        token: u32,
    },
}

impl MessageWrite for PeerInitMessage {
    type Code = PeerInitCode;

    fn code(&self) -> PeerInitCode {
        match self {
            PeerInitMessage::PierceFirewall { .. } => PeerInitCode::PierceFirewall,
            PeerInitMessage::PeerInit { .. } => PeerInitCode::PeerInit,
        }
    }

    fn write_payload<B: BufMut>(&self, buf: &mut B) {
        match self {
            PeerInitMessage::PierceFirewall { token } => {
                token.write_to(buf);
            }
            PeerInitMessage::PeerInit {
                username,
                connection_type,
                token,
            } => {
                username.write_to(buf);
                connection_type.as_str().write_to(buf);
                token.write_to(buf);
            }
        }
    }
}

impl MessageRead for PeerInitMessage {
    type Code = PeerInitCode;

    fn read_with_code<B: Buf>(code: PeerInitCode, buf: &mut B) -> Result<Self> {
        match code {
            PeerInitCode::PierceFirewall => {
                let token = u32::read_from(buf)?;
                Ok(PeerInitMessage::PierceFirewall { token })
            }
            PeerInitCode::PeerInit => {
                let username = String::read_from(buf)?;
                let conn_type_str = String::read_from(buf)?;
                let connection_type = ConnectionType::parse(&conn_type_str)?;
                let token = u32::read_from(buf)?;
                Ok(PeerInitMessage::PeerInit {
                    username,
                    connection_type,
                    token,
                })
            }
        }
    }
}

/// Read a peer init message from a buffer (including length prefix).
pub fn read_peer_init_message<B: Buf>(buf: &mut B) -> Result<PeerInitMessage> {
    let _len = u32::read_from(buf)?;
    let code = PeerInitCode::try_from(u8::read_from(buf)?)?;
    PeerInitMessage::read_with_code(code, buf)
}

/// Read a peer init message from a frozen frame, validating the length prefix.
pub fn decode_peer_init_message(frame: Bytes) -> Result<PeerInitMessage> {
    let mut body = open_frame(frame)?;
    let code = PeerInitCode::try_from(u8::read_from(&mut body)?)?;
    PeerInitMessage::read_with_code(code, &mut body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_pierce_firewall_roundtrip() {
        let msg = PeerInitMessage::PierceFirewall { token: 12345 };
        let parsed = decode_peer_init_message(msg.to_frame_u8()).unwrap();
        match parsed {
            PeerInitMessage::PierceFirewall { token } => assert_eq!(token, 12345),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_peer_init_roundtrip() {
        let msg = PeerInitMessage::PeerInit {
            username: "testuser".to_string(),
            connection_type: ConnectionType::Peer,
            token: 0,
        };
        let parsed = decode_peer_init_message(msg.to_frame_u8()).unwrap();
        match parsed {
            PeerInitMessage::PeerInit {
                username,
                connection_type,
                token,
            } => {
                assert_eq!(username, "testuser");
                assert_eq!(connection_type, ConnectionType::Peer);
                assert_eq!(token, 0);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_read_peer_init_incomplete_payload() {
        let msg = PeerInitMessage::PeerInit {
            username: "testuser".to_string(),
            connection_type: ConnectionType::Peer,
            token: 12345,
        };
        let mut buf = BytesMut::new();
        msg.write_message_u8(&mut buf);

        // Truncate to only have length + partial payload
        buf.truncate(6);
        assert!(read_peer_init_message(&mut buf).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_code() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[1, 0, 0, 0, 9]); // length 1, code 9
        assert!(decode_peer_init_message(buf.freeze()).is_err());
    }
}
