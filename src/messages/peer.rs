//! Peer messages sent over P connections.
//!
//! These cover browsing, search responses, and transfer negotiation. Like
//! the distributed scope, this is a whole-frame `encode`/`decode` codec; the
//! shares, search-response, and folder-contents bodies travel zlib-deflated
//! inside the frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{TransferDirection, TransferRejectionReason};
use crate::protocol::{
    ProtocolRead, ProtocolWrite, open_frame, read_bytes, read_list, write_bytes, write_list,
    zlib_compress, zlib_decompress,
};
use crate::{Error, Result};

/// Marker byte opening every file record; the protocol reserves other
/// values but never uses them.
const FILE_RECORD_MARKER: u8 = 1;

/// Peer message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerCode {
    SharesRequest,
    SharesResponse,
    SearchResponse,
    UserInfoRequest,
    UserInfoResponse,
    FolderContentsRequest,
    FolderContentsResponse,
    TransferRequest,
    TransferResponse,
    QueueDownload,
    PlaceInQueueResponse,
    UploadFailed,
    QueueFailed,
    PlaceInQueueRequest,
    UploadQueueNotification,
}

impl PeerCode {
    pub fn from_wire(word: u32) -> Option<Self> {
        match word {
            4 => Some(PeerCode::SharesRequest),
            5 => Some(PeerCode::SharesResponse),
            9 => Some(PeerCode::SearchResponse),
            15 => Some(PeerCode::UserInfoRequest),
            16 => Some(PeerCode::UserInfoResponse),
            36 => Some(PeerCode::FolderContentsRequest),
            37 => Some(PeerCode::FolderContentsResponse),
            40 => Some(PeerCode::TransferRequest),
            41 => Some(PeerCode::TransferResponse),
            43 => Some(PeerCode::QueueDownload),
            44 => Some(PeerCode::PlaceInQueueResponse),
            46 => Some(PeerCode::UploadFailed),
            50 => Some(PeerCode::QueueFailed),
            51 => Some(PeerCode::PlaceInQueueRequest),
            52 => Some(PeerCode::UploadQueueNotification),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            PeerCode::SharesRequest => 4,
            PeerCode::SharesResponse => 5,
            PeerCode::SearchResponse => 9,
            PeerCode::UserInfoRequest => 15,
            PeerCode::UserInfoResponse => 16,
            PeerCode::FolderContentsRequest => 36,
            PeerCode::FolderContentsResponse => 37,
            PeerCode::TransferRequest => 40,
            PeerCode::TransferResponse => 41,
            PeerCode::QueueDownload => 43,
            PeerCode::PlaceInQueueResponse => 44,
            PeerCode::UploadFailed => 46,
            PeerCode::QueueFailed => 50,
            PeerCode::PlaceInQueueRequest => 51,
            PeerCode::UploadQueueNotification => 52,
        }
    }
}

/// File attribute (e.g., bitrate, duration).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttribute {
    pub code: u32,
    pub value: u32,
}

impl FileAttribute {
    pub fn read_from<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(FileAttribute {
            code: u32::read_from(buf)?,
            value: u32::read_from(buf)?,
        })
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        self.code.write_to(buf);
        self.value.write_to(buf);
    }
}

/// A shared or found file record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub filename: String,
    pub size: u64,
    pub extension: String,
    pub attributes: Vec<FileAttribute>,
}

impl FileEntry {
    pub fn read_from<B: Buf>(buf: &mut B) -> Result<Self> {
        let _marker = u8::read_from(buf)?;
        Ok(FileEntry {
            filename: String::read_from(buf)?,
            size: u64::read_from(buf)?,
            extension: String::read_from(buf)?,
            attributes: read_list(buf, FileAttribute::read_from)?,
        })
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        FILE_RECORD_MARKER.write_to(buf);
        self.filename.write_to(buf);
        self.size.write_to(buf);
        self.extension.write_to(buf);
        write_list(buf, &self.attributes, |b, a| a.write_to(b));
    }
}

/// Directory with files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    pub path: String,
    pub files: Vec<FileEntry>,
}

impl Directory {
    pub fn read_from<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(Directory {
            path: String::read_from(buf)?,
            files: read_list(buf, FileEntry::read_from)?,
        })
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        self.path.write_to(buf);
        write_list(buf, &self.files, |b, f| f.write_to(b));
    }
}

/// Peer messages.
#[derive(Debug, Clone)]
pub enum PeerMessage {
    /// Request the full shared file list.
    SharesRequest,

    /// Response with the shared file list.
    SharesResponse {
        directories: Vec<Directory>,
        private_directories: Vec<Directory>,
    },

    /// File search response.
    SearchResponse {
        username: String,
        token: u32,
        results: Vec<FileEntry>,
        slot_free: bool,
        avg_speed: u32,
        queue_length: u32,
        private_results: Vec<FileEntry>,
    },

    /// Request user info.
    UserInfoRequest,

    /// Response with user info.
    UserInfoResponse {
        description: String,
        picture: Option<Vec<u8>>,
        total_uploads: u32,
        queue_size: u32,
        slots_free: bool,
    },

    /// Request folder contents.
    FolderContentsRequest { token: u32, folder: String },

    /// Response with folder contents.
    FolderContentsResponse {
        token: u32,
        folder: String,
        directories: Vec<Directory>,
    },

    /// Transfer negotiation request.
    TransferRequest {
        direction: TransferDirection,
        token: u32,
        filename: String,
        file_size: Option<u64>,
    },

    /// Transfer negotiation response (accept/reject).
    TransferResponse {
        token: u32,
        allowed: bool,
        file_size: Option<u64>,
        reason: Option<TransferRejectionReason>,
    },

    /// Ask the remote to queue a file for upload to us.
    QueueDownload { filename: String },

    /// Place in queue response.
    PlaceInQueueResponse { filename: String, place: u32 },

    /// Upload failed notification.
    UploadFailed { filename: String },

    /// The remote refused to queue a file.
    QueueFailed { filename: String, reason: String },

    /// Request our place in the remote's queue.
    PlaceInQueueRequest { filename: String },

    /// Upload queue notification (deprecated).
    UploadQueueNotification,
}

impl PeerMessage {
    pub fn code(&self) -> PeerCode {
        match self {
            PeerMessage::SharesRequest => PeerCode::SharesRequest,
            PeerMessage::SharesResponse { .. } => PeerCode::SharesResponse,
            PeerMessage::SearchResponse { .. } => PeerCode::SearchResponse,
            PeerMessage::UserInfoRequest => PeerCode::UserInfoRequest,
            PeerMessage::UserInfoResponse { .. } => PeerCode::UserInfoResponse,
            PeerMessage::FolderContentsRequest { .. } => PeerCode::FolderContentsRequest,
            PeerMessage::FolderContentsResponse { .. } => PeerCode::FolderContentsResponse,
            PeerMessage::TransferRequest { .. } => PeerCode::TransferRequest,
            PeerMessage::TransferResponse { .. } => PeerCode::TransferResponse,
            PeerMessage::QueueDownload { .. } => PeerCode::QueueDownload,
            PeerMessage::PlaceInQueueResponse { .. } => PeerCode::PlaceInQueueResponse,
            PeerMessage::UploadFailed { .. } => PeerCode::UploadFailed,
            PeerMessage::QueueFailed { .. } => PeerCode::QueueFailed,
            PeerMessage::PlaceInQueueRequest { .. } => PeerCode::PlaceInQueueRequest,
            PeerMessage::UploadQueueNotification => PeerCode::UploadQueueNotification,
        }
    }

    /// Serialize as one complete frame.
    pub fn encode(&self) -> Bytes {
        let mut frame = BytesMut::new();
        frame.put_u32_le(0); // length, patched once the body is written
        frame.put_u32_le(self.code().to_wire());
        self.write_body(&mut frame);
        let body_len = (frame.len() - 4) as u32;
        frame[..4].copy_from_slice(&body_len.to_le_bytes());
        frame.freeze()
    }

    fn write_body(&self, frame: &mut BytesMut) {
        match self {
            PeerMessage::SharesRequest
            | PeerMessage::UserInfoRequest
            | PeerMessage::UploadQueueNotification => {}

            PeerMessage::SharesResponse {
                directories,
                private_directories,
            } => deflate_into(frame, |plain| {
                write_list(plain, directories, |b, d| d.write_to(b));
                0u32.write_to(plain); // reserved word between the lists
                write_list(plain, private_directories, |b, d| d.write_to(b));
            }),

            PeerMessage::SearchResponse {
                username,
                token,
                results,
                slot_free,
                avg_speed,
                queue_length,
                private_results,
            } => deflate_into(frame, |plain| {
                username.write_to(plain);
                token.write_to(plain);
                write_list(plain, results, |b, f| f.write_to(b));
                slot_free.write_to(plain);
                avg_speed.write_to(plain);
                queue_length.write_to(plain);
                0u32.write_to(plain); // reserved word before private results
                write_list(plain, private_results, |b, f| f.write_to(b));
            }),

            PeerMessage::UserInfoResponse {
                description,
                picture,
                total_uploads,
                queue_size,
                slots_free,
            } => {
                description.write_to(frame);
                picture.is_some().write_to(frame);
                if let Some(pic) = picture {
                    write_bytes(frame, pic);
                }
                total_uploads.write_to(frame);
                queue_size.write_to(frame);
                slots_free.write_to(frame);
            }

            PeerMessage::FolderContentsRequest { token, folder } => {
                token.write_to(frame);
                folder.write_to(frame);
            }

            PeerMessage::FolderContentsResponse {
                token,
                folder,
                directories,
            } => deflate_into(frame, |plain| {
                token.write_to(plain);
                folder.write_to(plain);
                write_list(plain, directories, |b, d| d.write_to(b));
            }),

            PeerMessage::TransferRequest {
                direction,
                token,
                filename,
                file_size,
            } => {
                u32::from(*direction).write_to(frame);
                token.write_to(frame);
                filename.write_to(frame);
                // Only upload offers carry the size.
                if let Some(size) = file_size {
                    size.write_to(frame);
                }
            }

            PeerMessage::TransferResponse {
                token,
                allowed,
                file_size,
                reason,
            } => {
                token.write_to(frame);
                allowed.write_to(frame);
                match (allowed, file_size, reason) {
                    (true, Some(size), _) => size.write_to(frame),
                    (false, _, Some(reason)) => reason.as_str().write_to(frame),
                    _ => {}
                }
            }

            PeerMessage::QueueDownload { filename }
            | PeerMessage::UploadFailed { filename }
            | PeerMessage::PlaceInQueueRequest { filename } => filename.write_to(frame),

            PeerMessage::PlaceInQueueResponse { filename, place } => {
                filename.write_to(frame);
                place.write_to(frame);
            }

            PeerMessage::QueueFailed { filename, reason } => {
                filename.write_to(frame);
                reason.write_to(frame);
            }
        }
    }

    /// Parse one complete frame, length prefix included.
    pub fn decode(frame: Bytes) -> Result<Self> {
        let mut body = open_frame(frame)?;
        let word = u32::read_from(&mut body)?;
        let code = PeerCode::from_wire(word).ok_or(Error::InvalidPeerCode(word))?;
        Self::read_body(code, &mut body)
    }

    fn read_body(code: PeerCode, buf: &mut Bytes) -> Result<Self> {
        Ok(match code {
            PeerCode::SharesRequest => PeerMessage::SharesRequest,
            PeerCode::UserInfoRequest => PeerMessage::UserInfoRequest,
            PeerCode::UploadQueueNotification => PeerMessage::UploadQueueNotification,

            PeerCode::SharesResponse => {
                let mut plain = inflate_rest(buf)?;
                let directories = read_list(&mut plain, Directory::read_from)?;
                let _reserved = u32::read_from(&mut plain)?;
                let private_directories =
                    tail(&mut plain, |b| read_list(b, Directory::read_from))?.unwrap_or_default();
                PeerMessage::SharesResponse {
                    directories,
                    private_directories,
                }
            }

            PeerCode::SearchResponse => {
                let mut plain = inflate_rest(buf)?;
                let username = String::read_from(&mut plain)?;
                let token = u32::read_from(&mut plain)?;
                let results = read_list(&mut plain, FileEntry::read_from)?;
                let slot_free = bool::read_from(&mut plain)?;
                let avg_speed = u32::read_from(&mut plain)?;
                let queue_length = u32::read_from(&mut plain)?;
                let _reserved = u32::read_from(&mut plain)?;
                let private_results =
                    tail(&mut plain, |b| read_list(b, FileEntry::read_from))?.unwrap_or_default();
                PeerMessage::SearchResponse {
                    username,
                    token,
                    results,
                    slot_free,
                    avg_speed,
                    queue_length,
                    private_results,
                }
            }

            PeerCode::UserInfoResponse => {
                let description = String::read_from(buf)?;
                let picture = match bool::read_from(buf)? {
                    true => Some(read_bytes(buf)?),
                    false => None,
                };
                PeerMessage::UserInfoResponse {
                    description,
                    picture,
                    total_uploads: u32::read_from(buf)?,
                    queue_size: u32::read_from(buf)?,
                    slots_free: bool::read_from(buf)?,
                }
            }

            PeerCode::FolderContentsRequest => PeerMessage::FolderContentsRequest {
                token: u32::read_from(buf)?,
                folder: String::read_from(buf)?,
            },

            PeerCode::FolderContentsResponse => {
                let mut plain = inflate_rest(buf)?;
                PeerMessage::FolderContentsResponse {
                    token: u32::read_from(&mut plain)?,
                    folder: String::read_from(&mut plain)?,
                    directories: read_list(&mut plain, Directory::read_from)?,
                }
            }

            PeerCode::TransferRequest => {
                let direction = TransferDirection::try_from(u32::read_from(buf)?)?;
                let token = u32::read_from(buf)?;
                let filename = String::read_from(buf)?;
                let file_size = match direction {
                    TransferDirection::Upload => tail(buf, u64::read_from)?,
                    TransferDirection::Download => None,
                };
                PeerMessage::TransferRequest {
                    direction,
                    token,
                    filename,
                    file_size,
                }
            }

            PeerCode::TransferResponse => {
                let token = u32::read_from(buf)?;
                let allowed = bool::read_from(buf)?;
                let mut file_size = None;
                let mut reason = None;
                if allowed {
                    file_size = tail(buf, u64::read_from)?;
                } else {
                    reason =
                        tail(buf, String::read_from)?.map(TransferRejectionReason::from_string);
                }
                PeerMessage::TransferResponse {
                    token,
                    allowed,
                    file_size,
                    reason,
                }
            }

            PeerCode::QueueDownload => PeerMessage::QueueDownload {
                filename: String::read_from(buf)?,
            },

            PeerCode::PlaceInQueueResponse => PeerMessage::PlaceInQueueResponse {
                filename: String::read_from(buf)?,
                place: u32::read_from(buf)?,
            },

            PeerCode::UploadFailed => PeerMessage::UploadFailed {
                filename: String::read_from(buf)?,
            },

            PeerCode::QueueFailed => PeerMessage::QueueFailed {
                filename: String::read_from(buf)?,
                reason: String::read_from(buf)?,
            },

            PeerCode::PlaceInQueueRequest => PeerMessage::PlaceInQueueRequest {
                filename: String::read_from(buf)?,
            },
        })
    }
}

/// Deflate whatever `fill` writes and append it to the frame. Compression of
/// an in-memory buffer does not fail in practice; an empty body is the safe
/// fallback if it ever does.
fn deflate_into(frame: &mut BytesMut, fill: impl FnOnce(&mut BytesMut)) {
    let mut plain = BytesMut::new();
    fill(&mut plain);
    frame.put_slice(&zlib_compress(&plain).unwrap_or_default());
}

/// Inflate the remainder of the frame body.
fn inflate_rest(buf: &mut Bytes) -> Result<Bytes> {
    let compressed = buf.split_to(buf.len());
    Ok(Bytes::from(zlib_decompress(&compressed)?))
}

/// Read an optional trailing field: older clients simply end the message
/// where newer ones append more.
fn tail<B: Buf, T>(buf: &mut B, read: impl FnOnce(&mut B) -> Result<T>) -> Result<Option<T>> {
    if buf.has_remaining() {
        read(buf).map(Some)
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_failed_wire_layout() {
        let frame = PeerMessage::QueueFailed {
            filename: "x".to_string(),
            reason: "no such file".to_string(),
        }
        .encode();

        let declared = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared + 4, frame.len());
        assert_eq!(&frame[4..8], &50u32.to_le_bytes());
        assert_eq!(&frame[8..12], &1u32.to_le_bytes());
        assert_eq!(&frame[12..13], b"x");
        assert_eq!(&frame[13..17], &12u32.to_le_bytes());
        assert_eq!(&frame[17..], b"no such file");
    }

    #[test]
    fn test_transfer_request_size_only_for_uploads() {
        let offer = PeerMessage::TransferRequest {
            direction: TransferDirection::Upload,
            token: 12345,
            filename: "test.mp3".to_string(),
            file_size: Some(1024),
        };
        match PeerMessage::decode(offer.encode()).unwrap() {
            PeerMessage::TransferRequest {
                direction,
                token,
                file_size,
                ..
            } => {
                assert_eq!(direction, TransferDirection::Upload);
                assert_eq!(token, 12345);
                assert_eq!(file_size, Some(1024));
            }
            other => panic!("wrong message: {:?}", other),
        }

        let pull = PeerMessage::TransferRequest {
            direction: TransferDirection::Download,
            token: 9,
            filename: "test.mp3".to_string(),
            file_size: None,
        };
        match PeerMessage::decode(pull.encode()).unwrap() {
            PeerMessage::TransferRequest { file_size, .. } => assert_eq!(file_size, None),
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_transfer_response_reason_roundtrip() {
        let frame = PeerMessage::TransferResponse {
            token: 7,
            allowed: false,
            file_size: None,
            reason: Some(TransferRejectionReason::Queued),
        }
        .encode();
        match PeerMessage::decode(frame).unwrap() {
            PeerMessage::TransferResponse {
                token,
                allowed,
                reason,
                ..
            } => {
                assert_eq!(token, 7);
                assert!(!allowed);
                assert_eq!(reason, Some(TransferRejectionReason::Queued));
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_search_response_deflated_roundtrip() {
        let frame = PeerMessage::SearchResponse {
            username: "bob".to_string(),
            token: 42,
            results: vec![FileEntry {
                filename: "a.flac".to_string(),
                size: 9000,
                extension: "flac".to_string(),
                attributes: vec![FileAttribute { code: 0, value: 981 }],
            }],
            slot_free: true,
            avg_speed: 50_000,
            queue_length: 0,
            private_results: vec![],
        }
        .encode();

        match PeerMessage::decode(frame).unwrap() {
            PeerMessage::SearchResponse {
                username,
                token,
                results,
                slot_free,
                ..
            } => {
                assert_eq!(username, "bob");
                assert_eq!(token, 42);
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].attributes[0].value, 981);
                assert!(slot_free);
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_shares_response_tolerates_missing_private_list() {
        // An older client's shares body ends after the reserved word.
        let mut plain = BytesMut::new();
        write_list(&mut plain, &[] as &[Directory], |b, d: &Directory| {
            d.write_to(b)
        });
        0u32.write_to(&mut plain);
        let compressed = zlib_compress(&plain).unwrap();

        let mut frame = BytesMut::new();
        frame.put_u32_le(4 + compressed.len() as u32);
        frame.put_u32_le(PeerCode::SharesResponse.to_wire());
        frame.put_slice(&compressed);

        match PeerMessage::decode(frame.freeze()).unwrap() {
            PeerMessage::SharesResponse {
                directories,
                private_directories,
            } => {
                assert!(directories.is_empty());
                assert!(private_directories.is_empty());
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_user_info_picture_roundtrip() {
        let frame = PeerMessage::UserInfoResponse {
            description: "hi".to_string(),
            picture: Some(vec![0xAB; 16]),
            total_uploads: 3,
            queue_size: 0,
            slots_free: true,
        }
        .encode();
        match PeerMessage::decode(frame).unwrap() {
            PeerMessage::UserInfoResponse { picture, .. } => {
                assert_eq!(picture, Some(vec![0xAB; 16]));
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_code_rejected() {
        let mut frame = BytesMut::new();
        frame.put_u32_le(4);
        frame.put_u32_le(999);
        assert!(matches!(
            PeerMessage::decode(frame.freeze()),
            Err(Error::InvalidPeerCode(999))
        ));
    }
}
