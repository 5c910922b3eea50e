//! Events surfaced to the host application.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::constants::{TransferDirection, UserStatus};
use crate::messages::peer::FileEntry;
use crate::messages::server::UserStats;

/// Severity filter for [`ClientEvent::Diagnostic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticLevel {
    Debug,
    Info,
    Warning,
    /// Suppress all diagnostic events.
    None,
}

/// Transfer lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    Initializing,
    Transferring,
    Completed,
    Errored,
    Cancelled,
}

/// Events emitted on the client's event channel.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The server session ended; the client is inert until the next login.
    Disconnected { reason: String },
    /// We were logged in from elsewhere and kicked.
    KickedFromServer,
    /// The server's privileged user list.
    PrivilegedUsers { users: Vec<String> },
    /// Someone gifted us privileges.
    PrivilegeNotification { token: u32, username: String },
    /// We joined a room.
    RoomJoined {
        room: String,
        users: Vec<String>,
        owner: Option<String>,
        operators: Vec<String>,
    },
    /// We left a room.
    RoomLeft { room: String },
    /// The room list.
    RoomList { rooms: Vec<(String, u32)> },
    /// A message was said in a room we're in.
    RoomMessage {
        room: String,
        username: String,
        message: String,
    },
    /// Another user joined a room we're in.
    UserJoinedRoom {
        room: String,
        username: String,
        stats: UserStats,
    },
    /// Another user left a room we're in.
    UserLeftRoom { room: String, username: String },
    /// A watched user's status changed.
    UserStatusChanged {
        username: String,
        status: UserStatus,
        privileged: bool,
    },
    /// A private message arrived.
    PrivateMessage {
        id: u32,
        timestamp: u32,
        username: String,
        message: String,
        acknowledged: bool,
    },
    /// A server-wide message arrived.
    GlobalMessage { message: String },
    /// Search results arrived for one of our active search tokens.
    SearchResults {
        token: u32,
        username: String,
        slot_free: bool,
        avg_speed: u32,
        queue_length: u32,
        files: Vec<FileEntry>,
    },
    /// A transfer changed state.
    TransferStateChanged {
        username: String,
        filename: String,
        direction: TransferDirection,
        state: TransferState,
    },
    /// Periodic transfer progress, at most every 100 ms per transfer.
    TransferProgress {
        username: String,
        filename: String,
        direction: TransferDirection,
        bytes_transferred: u64,
        elapsed: Duration,
    },
    /// A peer connection was established or torn down.
    ConnectionStateChanged {
        username: String,
        remote: Option<SocketAddr>,
        connected: bool,
    },
    /// Filtered diagnostic message.
    Diagnostic {
        level: DiagnosticLevel,
        message: String,
    },
}

/// Fans events out to the host channel, filtering diagnostics by level.
pub struct EventBus {
    tx: mpsc::UnboundedSender<ClientEvent>,
    minimum_diagnostic_level: DiagnosticLevel,
}

impl EventBus {
    pub fn new(minimum_diagnostic_level: DiagnosticLevel) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EventBus {
                tx,
                minimum_diagnostic_level,
            },
            rx,
        )
    }

    /// Emit an event. A gone receiver is not an error; the host may simply
    /// not care about events.
    pub fn emit(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }

    pub fn diagnostic(&self, level: DiagnosticLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            DiagnosticLevel::Debug => debug!("{message}"),
            DiagnosticLevel::Info => info!("{message}"),
            DiagnosticLevel::Warning => warn!("{message}"),
            DiagnosticLevel::None => {}
        }
        if level >= self.minimum_diagnostic_level && level != DiagnosticLevel::None {
            self.emit(ClientEvent::Diagnostic { level, message });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_diagnostic_level_filter() {
        let (bus, mut rx) = EventBus::new(DiagnosticLevel::Warning);
        bus.diagnostic(DiagnosticLevel::Debug, "hidden");
        bus.diagnostic(DiagnosticLevel::Warning, "visible");

        match rx.try_recv().unwrap() {
            ClientEvent::Diagnostic { level, message } => {
                assert_eq!(level, DiagnosticLevel::Warning);
                assert_eq!(message, "visible");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_emit_without_receiver_is_harmless() {
        let (bus, rx) = EventBus::new(DiagnosticLevel::None);
        drop(rx);
        bus.emit(ClientEvent::GlobalMessage {
            message: "hello".to_string(),
        });
    }
}
