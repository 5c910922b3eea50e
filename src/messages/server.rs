//! Server message types.
//!
//! Server messages travel over the single long-lived server connection.

use bytes::{Buf, BufMut};
use std::net::Ipv4Addr;

use crate::constants::{ConnectionType, LoginRejectionReason, UserStatus};
use crate::protocol::{
    MessageRead, MessageWrite, ProtocolRead, ProtocolWrite, login_hash, open_frame, read_list,
    write_list,
};
use crate::{Error, Result};

/// Server message codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ServerCode {
    Login = 1,
    SetListenPort = 2,
    GetPeerAddress = 3,
    AddUser = 5,
    RemoveUser = 6,
    GetUserStatus = 7,
    SayInChatRoom = 13,
    JoinRoom = 14,
    LeaveRoom = 15,
    UserJoinedRoom = 16,
    UserLeftRoom = 17,
    ConnectToPeer = 18,
    MessageUser = 22,
    MessageAcked = 23,
    FileSearch = 26,
    SetOnlineStatus = 28,
    Ping = 32,
    SharedFoldersAndFiles = 35,
    GetUserStats = 36,
    Relogged = 41,
    RoomList = 64,
    GlobalAdminMessage = 66,
    PrivilegedUsers = 69,
    HaveNoParent = 71,
    ParentIP = 73,
    ParentMinSpeed = 83,
    ParentSpeedRatio = 84,
    CheckPrivileges = 92,
    EmbeddedMessage = 93,
    AcceptChildren = 100,
    NetInfo = 102,
    WishlistInterval = 104,
    SendUploadSpeed = 121,
    NotifyPrivileges = 124,
    AckNotifyPrivileges = 125,
    BranchLevel = 126,
    BranchRoot = 127,
    ChildDepth = 129,
    ResetDistributed = 130,
    PrivateRoomMembershipGranted = 139,
    PrivateRoomToggle = 141,
    GlobalRoomMessage = 152,
    CantConnectToPeer = 1001,
}

impl TryFrom<u32> for ServerCode {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(ServerCode::Login),
            2 => Ok(ServerCode::SetListenPort),
            3 => Ok(ServerCode::GetPeerAddress),
            5 => Ok(ServerCode::AddUser),
            6 => Ok(ServerCode::RemoveUser),
            7 => Ok(ServerCode::GetUserStatus),
            13 => Ok(ServerCode::SayInChatRoom),
            14 => Ok(ServerCode::JoinRoom),
            15 => Ok(ServerCode::LeaveRoom),
            16 => Ok(ServerCode::UserJoinedRoom),
            17 => Ok(ServerCode::UserLeftRoom),
            18 => Ok(ServerCode::ConnectToPeer),
            22 => Ok(ServerCode::MessageUser),
            23 => Ok(ServerCode::MessageAcked),
            26 => Ok(ServerCode::FileSearch),
            28 => Ok(ServerCode::SetOnlineStatus),
            32 => Ok(ServerCode::Ping),
            35 => Ok(ServerCode::SharedFoldersAndFiles),
            36 => Ok(ServerCode::GetUserStats),
            41 => Ok(ServerCode::Relogged),
            64 => Ok(ServerCode::RoomList),
            66 => Ok(ServerCode::GlobalAdminMessage),
            69 => Ok(ServerCode::PrivilegedUsers),
            71 => Ok(ServerCode::HaveNoParent),
            73 => Ok(ServerCode::ParentIP),
            83 => Ok(ServerCode::ParentMinSpeed),
            84 => Ok(ServerCode::ParentSpeedRatio),
            92 => Ok(ServerCode::CheckPrivileges),
            93 => Ok(ServerCode::EmbeddedMessage),
            100 => Ok(ServerCode::AcceptChildren),
            102 => Ok(ServerCode::NetInfo),
            104 => Ok(ServerCode::WishlistInterval),
            121 => Ok(ServerCode::SendUploadSpeed),
            124 => Ok(ServerCode::NotifyPrivileges),
            125 => Ok(ServerCode::AckNotifyPrivileges),
            126 => Ok(ServerCode::BranchLevel),
            127 => Ok(ServerCode::BranchRoot),
            129 => Ok(ServerCode::ChildDepth),
            130 => Ok(ServerCode::ResetDistributed),
            139 => Ok(ServerCode::PrivateRoomMembershipGranted),
            141 => Ok(ServerCode::PrivateRoomToggle),
            152 => Ok(ServerCode::GlobalRoomMessage),
            1001 => Ok(ServerCode::CantConnectToPeer),
            _ => Err(Error::InvalidServerCode(value)),
        }
    }
}

impl From<ServerCode> for u32 {
    fn from(code: ServerCode) -> Self {
        code as u32
    }
}

/// User statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserStats {
    pub avg_speed: u32,
    pub upload_num: u32,
    pub unknown: u32,
    pub files: u32,
    pub dirs: u32,
}

impl UserStats {
    pub fn read_from<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(UserStats {
            avg_speed: u32::read_from(buf)?,
            upload_num: u32::read_from(buf)?,
            unknown: u32::read_from(buf)?,
            files: u32::read_from(buf)?,
            dirs: u32::read_from(buf)?,
        })
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        self.avg_speed.write_to(buf);
        self.upload_num.write_to(buf);
        self.unknown.write_to(buf);
        self.files.write_to(buf);
        self.dirs.write_to(buf);
    }
}

/// A candidate parent for the distributed network, as advertised by NetInfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentCandidate {
    pub username: String,
    pub ip: Ipv4Addr,
    pub port: u32,
}

/// Messages sent to the server.
#[derive(Debug, Clone)]
pub enum ServerRequest {
    /// Log into the server.
    Login {
        username: String,
        password: String,
        version: u32,
        minor_version: u32,
    },
    /// Advertise the port our acceptor listens on.
    SetListenPort { port: u32 },
    /// Resolve a peer's address.
    GetPeerAddress { username: String },
    /// Watch a user for status updates.
    AddUser { username: String },
    /// Stop watching a user.
    RemoveUser { username: String },
    /// Query a user's status.
    GetUserStatus { username: String },
    /// Say something in a chat room.
    SayInChatRoom { room: String, message: String },
    /// Join a room.
    JoinRoom { room: String, private: bool },
    /// Leave a room.
    LeaveRoom { room: String },
    /// Ask the server to have a peer connect back to us.
    ConnectToPeer {
        token: u32,
        username: String,
        connection_type: ConnectionType,
    },
    /// Send a private message.
    MessageUser { username: String, message: String },
    /// Acknowledge receipt of a private message.
    MessageAcked { message_id: u32 },
    /// Start a network-wide file search.
    FileSearch { token: u32, query: String },
    /// Set our online status.
    SetOnlineStatus { status: UserStatus },
    /// Keepalive ping.
    Ping,
    /// Report shared folder and file counts.
    SharedFoldersAndFiles { dirs: u32, files: u32 },
    /// Query a user's stats.
    GetUserStats { username: String },
    /// Check our privileges.
    CheckPrivileges,
    /// Report whether we currently lack a distributed parent.
    HaveNoParent { have_no_parent: bool },
    /// Report our parent's address.
    ParentIP { ip: Ipv4Addr },
    /// Report whether we accept distributed children.
    AcceptChildren { accept: bool },
    /// Report average upload speed after a completed upload.
    SendUploadSpeed { speed: u32 },
    /// Acknowledge a privilege notification.
    AckNotifyPrivileges { token: u32 },
    /// Report our branch level.
    BranchLevel { level: u32 },
    /// Report our branch root.
    BranchRoot { root: String },
    /// Report our child depth.
    ChildDepth { depth: u32 },
    /// Accept or decline membership of a private room.
    PrivateRoomToggle { enable: bool },
    /// Report a failed attempt to satisfy a ConnectToPeer solicitation.
    CantConnectToPeer { token: u32, username: String },
    /// Request the public room list.
    RoomList,
}

impl MessageWrite for ServerRequest {
    type Code = ServerCode;

    fn code(&self) -> ServerCode {
        match self {
            ServerRequest::Login { .. } => ServerCode::Login,
            ServerRequest::SetListenPort { .. } => ServerCode::SetListenPort,
            ServerRequest::GetPeerAddress { .. } => ServerCode::GetPeerAddress,
            ServerRequest::AddUser { .. } => ServerCode::AddUser,
            ServerRequest::RemoveUser { .. } => ServerCode::RemoveUser,
            ServerRequest::GetUserStatus { .. } => ServerCode::GetUserStatus,
            ServerRequest::SayInChatRoom { .. } => ServerCode::SayInChatRoom,
            ServerRequest::JoinRoom { .. } => ServerCode::JoinRoom,
            ServerRequest::LeaveRoom { .. } => ServerCode::LeaveRoom,
            ServerRequest::ConnectToPeer { .. } => ServerCode::ConnectToPeer,
            ServerRequest::MessageUser { .. } => ServerCode::MessageUser,
            ServerRequest::MessageAcked { .. } => ServerCode::MessageAcked,
            ServerRequest::FileSearch { .. } => ServerCode::FileSearch,
            ServerRequest::SetOnlineStatus { .. } => ServerCode::SetOnlineStatus,
            ServerRequest::Ping => ServerCode::Ping,
            ServerRequest::SharedFoldersAndFiles { .. } => ServerCode::SharedFoldersAndFiles,
            ServerRequest::GetUserStats { .. } => ServerCode::GetUserStats,
            ServerRequest::CheckPrivileges => ServerCode::CheckPrivileges,
            ServerRequest::HaveNoParent { .. } => ServerCode::HaveNoParent,
            ServerRequest::ParentIP { .. } => ServerCode::ParentIP,
            ServerRequest::AcceptChildren { .. } => ServerCode::AcceptChildren,
            ServerRequest::SendUploadSpeed { .. } => ServerCode::SendUploadSpeed,
            ServerRequest::AckNotifyPrivileges { .. } => ServerCode::AckNotifyPrivileges,
            ServerRequest::BranchLevel { .. } => ServerCode::BranchLevel,
            ServerRequest::BranchRoot { .. } => ServerCode::BranchRoot,
            ServerRequest::ChildDepth { .. } => ServerCode::ChildDepth,
            ServerRequest::PrivateRoomToggle { .. } => ServerCode::PrivateRoomToggle,
            ServerRequest::CantConnectToPeer { .. } => ServerCode::CantConnectToPeer,
            ServerRequest::RoomList => ServerCode::RoomList,
        }
    }

    fn write_payload<B: BufMut>(&self, buf: &mut B) {
        match self {
            ServerRequest::Login {
                username,
                password,
                version,
                minor_version,
            } => {
                username.write_to(buf);
                password.write_to(buf);
                version.write_to(buf);
                login_hash(username, password).write_to(buf);
                minor_version.write_to(buf);
            }
            ServerRequest::SetListenPort { port } => port.write_to(buf),
            ServerRequest::GetPeerAddress { username } => username.write_to(buf),
            ServerRequest::AddUser { username } => username.write_to(buf),
            ServerRequest::RemoveUser { username } => username.write_to(buf),
            ServerRequest::GetUserStatus { username } => username.write_to(buf),
            ServerRequest::SayInChatRoom { room, message } => {
                room.write_to(buf);
                message.write_to(buf);
            }
            ServerRequest::JoinRoom { room, private } => {
                room.write_to(buf);
                (*private as u32).write_to(buf);
            }
            ServerRequest::LeaveRoom { room } => room.write_to(buf),
            ServerRequest::ConnectToPeer {
                token,
                username,
                connection_type,
            } => {
                token.write_to(buf);
                username.write_to(buf);
                connection_type.as_str().write_to(buf);
            }
            ServerRequest::MessageUser { username, message } => {
                username.write_to(buf);
                message.write_to(buf);
            }
            ServerRequest::MessageAcked { message_id } => message_id.write_to(buf),
            ServerRequest::FileSearch { token, query } => {
                token.write_to(buf);
                query.write_to(buf);
            }
            ServerRequest::SetOnlineStatus { status } => {
                (*status as u32 as i32).write_to(buf);
            }
            ServerRequest::Ping => {}
            ServerRequest::SharedFoldersAndFiles { dirs, files } => {
                dirs.write_to(buf);
                files.write_to(buf);
            }
            ServerRequest::GetUserStats { username } => username.write_to(buf),
            ServerRequest::CheckPrivileges => {}
            ServerRequest::HaveNoParent { have_no_parent } => have_no_parent.write_to(buf),
            ServerRequest::ParentIP { ip } => ip.write_to(buf),
            ServerRequest::AcceptChildren { accept } => accept.write_to(buf),
            ServerRequest::SendUploadSpeed { speed } => speed.write_to(buf),
            ServerRequest::AckNotifyPrivileges { token } => token.write_to(buf),
            ServerRequest::BranchLevel { level } => level.write_to(buf),
            ServerRequest::BranchRoot { root } => root.write_to(buf),
            ServerRequest::ChildDepth { depth } => depth.write_to(buf),
            ServerRequest::PrivateRoomToggle { enable } => enable.write_to(buf),
            ServerRequest::CantConnectToPeer { token, username } => {
                token.write_to(buf);
                username.write_to(buf);
            }
            ServerRequest::RoomList => {}
        }
    }
}

/// Messages received from the server.
#[derive(Debug, Clone)]
pub enum ServerResponse {
    /// Successful login.
    LoginSuccess {
        greet: String,
        own_ip: Ipv4Addr,
        password_hash: String,
        is_supporter: bool,
    },
    /// Rejected login.
    LoginFailure {
        reason: LoginRejectionReason,
        detail: Option<String>,
    },
    /// Peer address response.
    GetPeerAddress {
        username: String,
        ip: Ipv4Addr,
        port: u32,
    },
    /// Watch-user response.
    AddUser {
        username: String,
        exists: bool,
        status: Option<UserStatus>,
        stats: Option<UserStats>,
        country_code: Option<String>,
    },
    /// User status update.
    GetUserStatus {
        username: String,
        status: UserStatus,
        privileged: bool,
    },
    /// Chat room message.
    SayInChatRoom {
        room: String,
        username: String,
        message: String,
    },
    /// Join room response.
    JoinRoom {
        room: String,
        users: Vec<String>,
        owner: Option<String>,
        operators: Vec<String>,
    },
    /// Leave room response.
    LeaveRoom { room: String },
    /// User joined a room we're in.
    UserJoinedRoom {
        room: String,
        username: String,
        status: UserStatus,
        stats: UserStats,
        slots_full: bool,
        country_code: String,
    },
    /// User left a room we're in.
    UserLeftRoom { room: String, username: String },
    /// A peer solicited a connection through the server.
    ConnectToPeer {
        username: String,
        connection_type: ConnectionType,
        ip: Ipv4Addr,
        port: u32,
        token: u32,
        privileged: bool,
    },
    /// Private message received.
    MessageUser {
        id: u32,
        timestamp: u32,
        username: String,
        message: String,
        new_message: bool,
    },
    /// File search relayed by the server for us to answer.
    FileSearch {
        username: String,
        token: u32,
        query: String,
    },
    /// User stats update.
    GetUserStats { username: String, stats: UserStats },
    /// We were logged in from elsewhere; this session is dead.
    Relogged,
    /// Room list response.
    RoomList {
        rooms: Vec<(String, u32)>,
        owned_private_rooms: Vec<(String, u32)>,
        private_rooms: Vec<(String, u32)>,
        operated_private_rooms: Vec<String>,
    },
    /// Server-wide administrative message.
    GlobalAdminMessage { message: String },
    /// List of privileged users.
    PrivilegedUsers { users: Vec<String> },
    /// Minimum upload speed to be a parent.
    ParentMinSpeed { speed: u32 },
    /// Speed ratio governing child count.
    ParentSpeedRatio { ratio: u32 },
    /// Privileges check response.
    CheckPrivileges { time_left: u32 },
    /// Distributed sub-message delivered by the server when we act as root.
    EmbeddedMessage { code: u8, data: Vec<u8> },
    /// Candidate parents for the distributed network.
    NetInfo { parents: Vec<ParentCandidate> },
    /// Wishlist search interval.
    WishlistInterval { interval: u32 },
    /// Privilege gift notification.
    NotifyPrivileges { token: u32, username: String },
    /// We were granted membership of a private room.
    PrivateRoomMembershipGranted { room: String },
    /// Server ordered a distributed-state reset.
    ResetDistributed,
    /// Global room feed message.
    GlobalRoomMessage {
        room: String,
        username: String,
        message: String,
    },
    /// The server could not have a peer connect back to us.
    CantConnectToPeer { token: u32, username: String },
}

impl MessageRead for ServerResponse {
    type Code = ServerCode;

    fn read_with_code<B: Buf>(code: ServerCode, buf: &mut B) -> Result<Self> {
        match code {
            ServerCode::Login => {
                let success = bool::read_from(buf)?;
                if success {
                    let greet = String::read_from(buf)?;
                    let own_ip = Ipv4Addr::read_from(buf)?;
                    let password_hash = String::read_from(buf)?;
                    let is_supporter = bool::read_from(buf)?;
                    Ok(ServerResponse::LoginSuccess {
                        greet,
                        own_ip,
                        password_hash,
                        is_supporter,
                    })
                } else {
                    let reason_str = String::read_from(buf)?;
                    let reason = LoginRejectionReason::from_string(reason_str);
                    let detail = if matches!(reason, LoginRejectionReason::InvalidUsername)
                        && buf.has_remaining()
                    {
                        Some(String::read_from(buf)?)
                    } else {
                        None
                    };
                    Ok(ServerResponse::LoginFailure { reason, detail })
                }
            }
            ServerCode::GetPeerAddress => {
                let username = String::read_from(buf)?;
                let ip = Ipv4Addr::read_from(buf)?;
                let port = u32::read_from(buf)?;
                Ok(ServerResponse::GetPeerAddress { username, ip, port })
            }
            ServerCode::AddUser => {
                let username = String::read_from(buf)?;
                let exists = bool::read_from(buf)?;
                if exists {
                    let status = UserStatus::try_from(u32::read_from(buf)?)?;
                    let stats = UserStats::read_from(buf)?;
                    let country_code = if status != UserStatus::Offline && buf.has_remaining() {
                        Some(String::read_from(buf)?)
                    } else {
                        None
                    };
                    Ok(ServerResponse::AddUser {
                        username,
                        exists: true,
                        status: Some(status),
                        stats: Some(stats),
                        country_code,
                    })
                } else {
                    Ok(ServerResponse::AddUser {
                        username,
                        exists: false,
                        status: None,
                        stats: None,
                        country_code: None,
                    })
                }
            }
            ServerCode::GetUserStatus => {
                let username = String::read_from(buf)?;
                let status = UserStatus::try_from(u32::read_from(buf)?)?;
                let privileged = bool::read_from(buf)?;
                Ok(ServerResponse::GetUserStatus {
                    username,
                    status,
                    privileged,
                })
            }
            ServerCode::SayInChatRoom => {
                let room = String::read_from(buf)?;
                let username = String::read_from(buf)?;
                let message = String::read_from(buf)?;
                Ok(ServerResponse::SayInChatRoom {
                    room,
                    username,
                    message,
                })
            }
            ServerCode::JoinRoom => {
                let room = String::read_from(buf)?;
                let users: Vec<String> = read_list(buf, String::read_from)?;
                let _statuses: Vec<u32> = read_list(buf, u32::read_from)?;
                let _stats: Vec<UserStats> = read_list(buf, UserStats::read_from)?;
                let _slots_full: Vec<u32> = read_list(buf, u32::read_from)?;
                let _countries: Vec<String> = read_list(buf, String::read_from)?;

                // Private rooms append owner and operator info
                let (owner, operators) = if buf.has_remaining() {
                    let owner = String::read_from(buf)?;
                    let operators = read_list(buf, String::read_from)?;
                    (Some(owner), operators)
                } else {
                    (None, vec![])
                };

                Ok(ServerResponse::JoinRoom {
                    room,
                    users,
                    owner,
                    operators,
                })
            }
            ServerCode::LeaveRoom => {
                let room = String::read_from(buf)?;
                Ok(ServerResponse::LeaveRoom { room })
            }
            ServerCode::UserJoinedRoom => {
                let room = String::read_from(buf)?;
                let username = String::read_from(buf)?;
                let status = UserStatus::try_from(u32::read_from(buf)?)?;
                let stats = UserStats::read_from(buf)?;
                let slots_full = u32::read_from(buf)? != 0;
                let country_code = String::read_from(buf)?;
                Ok(ServerResponse::UserJoinedRoom {
                    room,
                    username,
                    status,
                    stats,
                    slots_full,
                    country_code,
                })
            }
            ServerCode::UserLeftRoom => {
                let room = String::read_from(buf)?;
                let username = String::read_from(buf)?;
                Ok(ServerResponse::UserLeftRoom { room, username })
            }
            ServerCode::ConnectToPeer => {
                let username = String::read_from(buf)?;
                let conn_type_str = String::read_from(buf)?;
                let connection_type = ConnectionType::parse(&conn_type_str)?;
                let ip = Ipv4Addr::read_from(buf)?;
                let port = u32::read_from(buf)?;
                let token = u32::read_from(buf)?;
                let privileged = bool::read_from(buf)?;
                Ok(ServerResponse::ConnectToPeer {
                    username,
                    connection_type,
                    ip,
                    port,
                    token,
                    privileged,
                })
            }
            ServerCode::MessageUser => {
                let id = u32::read_from(buf)?;
                let timestamp = u32::read_from(buf)?;
                let username = String::read_from(buf)?;
                let message = String::read_from(buf)?;
                let new_message = if buf.has_remaining() {
                    bool::read_from(buf)?
                } else {
                    true
                };
                Ok(ServerResponse::MessageUser {
                    id,
                    timestamp,
                    username,
                    message,
                    new_message,
                })
            }
            ServerCode::FileSearch => {
                let username = String::read_from(buf)?;
                let token = u32::read_from(buf)?;
                let query = String::read_from(buf)?;
                Ok(ServerResponse::FileSearch {
                    username,
                    token,
                    query,
                })
            }
            ServerCode::GetUserStats => {
                let username = String::read_from(buf)?;
                let stats = UserStats::read_from(buf)?;
                Ok(ServerResponse::GetUserStats { username, stats })
            }
            ServerCode::Relogged => Ok(ServerResponse::Relogged),
            ServerCode::RoomList => {
                let room_names: Vec<String> = read_list(buf, String::read_from)?;
                let room_counts: Vec<u32> = read_list(buf, u32::read_from)?;
                let rooms: Vec<_> = room_names.into_iter().zip(room_counts).collect();

                let owned_names: Vec<String> = read_list(buf, String::read_from)?;
                let owned_counts: Vec<u32> = read_list(buf, u32::read_from)?;
                let owned_private_rooms: Vec<_> =
                    owned_names.into_iter().zip(owned_counts).collect();

                let private_names: Vec<String> = read_list(buf, String::read_from)?;
                let private_counts: Vec<u32> = read_list(buf, u32::read_from)?;
                let private_rooms: Vec<_> = private_names.into_iter().zip(private_counts).collect();

                let operated_private_rooms = read_list(buf, String::read_from)?;

                Ok(ServerResponse::RoomList {
                    rooms,
                    owned_private_rooms,
                    private_rooms,
                    operated_private_rooms,
                })
            }
            ServerCode::GlobalAdminMessage => {
                let message = String::read_from(buf)?;
                Ok(ServerResponse::GlobalAdminMessage { message })
            }
            ServerCode::PrivilegedUsers => {
                let users = read_list(buf, String::read_from)?;
                Ok(ServerResponse::PrivilegedUsers { users })
            }
            ServerCode::ParentMinSpeed => {
                let speed = u32::read_from(buf)?;
                Ok(ServerResponse::ParentMinSpeed { speed })
            }
            ServerCode::ParentSpeedRatio => {
                let ratio = u32::read_from(buf)?;
                Ok(ServerResponse::ParentSpeedRatio { ratio })
            }
            ServerCode::CheckPrivileges => {
                let time_left = u32::read_from(buf)?;
                Ok(ServerResponse::CheckPrivileges { time_left })
            }
            ServerCode::EmbeddedMessage => {
                let code = u8::read_from(buf)?;
                let mut data = vec![0u8; buf.remaining()];
                buf.copy_to_slice(&mut data);
                Ok(ServerResponse::EmbeddedMessage { code, data })
            }
            ServerCode::NetInfo => {
                let parents = read_list(buf, |b| {
                    let username = String::read_from(b)?;
                    let ip = Ipv4Addr::read_from(b)?;
                    let port = u32::read_from(b)?;
                    Ok(ParentCandidate { username, ip, port })
                })?;
                Ok(ServerResponse::NetInfo { parents })
            }
            ServerCode::WishlistInterval => {
                let interval = u32::read_from(buf)?;
                Ok(ServerResponse::WishlistInterval { interval })
            }
            ServerCode::NotifyPrivileges => {
                let token = u32::read_from(buf)?;
                let username = String::read_from(buf)?;
                Ok(ServerResponse::NotifyPrivileges { token, username })
            }
            ServerCode::PrivateRoomMembershipGranted => {
                let room = String::read_from(buf)?;
                Ok(ServerResponse::PrivateRoomMembershipGranted { room })
            }
            ServerCode::ResetDistributed => Ok(ServerResponse::ResetDistributed),
            ServerCode::GlobalRoomMessage => {
                let room = String::read_from(buf)?;
                let username = String::read_from(buf)?;
                let message = String::read_from(buf)?;
                Ok(ServerResponse::GlobalRoomMessage {
                    room,
                    username,
                    message,
                })
            }
            ServerCode::CantConnectToPeer => {
                let token = u32::read_from(buf)?;
                let username = String::read_from(buf)?;
                Ok(ServerResponse::CantConnectToPeer { token, username })
            }
            // Codes that are only for sending, not receiving
            ServerCode::SetListenPort
            | ServerCode::RemoveUser
            | ServerCode::MessageAcked
            | ServerCode::SetOnlineStatus
            | ServerCode::Ping
            | ServerCode::SharedFoldersAndFiles
            | ServerCode::HaveNoParent
            | ServerCode::ParentIP
            | ServerCode::AcceptChildren
            | ServerCode::SendUploadSpeed
            | ServerCode::AckNotifyPrivileges
            | ServerCode::BranchLevel
            | ServerCode::BranchRoot
            | ServerCode::ChildDepth
            | ServerCode::PrivateRoomToggle => Err(Error::Protocol(format!(
                "Server code {:?} is send-only, not expected in response",
                code
            ))),
        }
    }
}

/// Read a server message from a complete frame (including length prefix).
pub fn read_server_message<B: Buf>(buf: &mut B) -> Result<ServerResponse> {
    let _len = u32::read_from(buf)?;
    let code = ServerCode::try_from(u32::read_from(buf)?)?;
    ServerResponse::read_with_code(code, buf)
}

/// Read a server message from a frozen frame, validating the length prefix.
pub fn decode_server_message(frame: bytes::Bytes) -> Result<ServerResponse> {
    let mut body = open_frame(frame)?;
    let code = ServerCode::try_from(u32::read_from(&mut body)?)?;
    ServerResponse::read_with_code(code, &mut body)
}
