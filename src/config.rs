//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::connection::ConnectionOptions;
use crate::constants::{
    CLIENT_MINOR_VERSION, CLIENT_VERSION, DEFAULT_LISTEN_PORT, DEFAULT_SERVER_HOST,
    DEFAULT_SERVER_PORT,
};
use crate::events::DiagnosticLevel;
use crate::resolvers::Resolvers;
use crate::{Error, Result};

/// Options controlling client behavior. Construct with
/// `ClientOptions::default()` and override fields as needed.
#[derive(Clone)]
pub struct ClientOptions {
    /// Server address.
    pub server_host: String,
    pub server_port: u16,

    /// Client version advertised at login.
    pub client_version: u32,
    pub client_minor_version: u32,

    /// Start the acceptor at construction.
    pub enable_listener: bool,
    /// TCP bind port for the acceptor (1024..=65535, or 0 to bind an
    /// ephemeral port).
    pub listen_port: u16,

    /// Participate in the distributed search mesh.
    pub enable_distributed_network: bool,
    /// Allow inbound child adoption.
    pub accept_distributed_children: bool,
    /// Maximum number of distributed children.
    pub distributed_child_limit: usize,

    /// Global cap on concurrent uploads.
    pub maximum_concurrent_uploads: usize,
    /// Per-user cap on concurrent uploads. Raising this past 1 trips a
    /// protocol quirk in deployed clients, so it is not publicly settable.
    pub(crate) maximum_concurrent_uploads_per_user: usize,

    /// Upload/download throughput caps in bytes per second; `None` means
    /// unthrottled.
    pub upload_speed_limit: Option<usize>,
    pub download_speed_limit: Option<usize>,

    /// Drop a distributed search frame identical to the previous one seen on
    /// the same connection.
    pub deduplicate_search_requests: bool,

    /// Default timeout for waits that expect a reply.
    pub message_timeout: Duration,

    /// Acknowledge private messages as they arrive.
    pub auto_acknowledge_private_messages: bool,
    /// Acknowledge privilege notifications as they arrive.
    pub auto_acknowledge_privilege_notifications: bool,
    /// Accept private room invitations as they arrive.
    pub accept_private_room_invitations: bool,

    /// Filter for the diagnostic event stream.
    pub minimum_diagnostic_level: DiagnosticLevel,

    /// Initial value of the shared token counter.
    pub starting_token: u32,

    /// Per-class connection tuning. Inactivity timeouts on the server and
    /// transfer classes are forced off at validation.
    pub server_connection_options: ConnectionOptions,
    pub peer_connection_options: ConnectionOptions,
    pub transfer_connection_options: ConnectionOptions,
    pub incoming_connection_options: ConnectionOptions,
    pub distributed_connection_options: ConnectionOptions,

    /// Injected extension points.
    pub resolvers: Arc<Resolvers>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            server_host: DEFAULT_SERVER_HOST.to_string(),
            server_port: DEFAULT_SERVER_PORT,
            client_version: CLIENT_VERSION,
            client_minor_version: CLIENT_MINOR_VERSION,
            enable_listener: true,
            listen_port: DEFAULT_LISTEN_PORT,
            enable_distributed_network: true,
            accept_distributed_children: true,
            distributed_child_limit: 25,
            maximum_concurrent_uploads: 10,
            maximum_concurrent_uploads_per_user: 1,
            upload_speed_limit: None,
            download_speed_limit: None,
            deduplicate_search_requests: true,
            message_timeout: Duration::from_millis(5000),
            auto_acknowledge_private_messages: true,
            auto_acknowledge_privilege_notifications: true,
            accept_private_room_invitations: false,
            minimum_diagnostic_level: DiagnosticLevel::Info,
            starting_token: 0,
            server_connection_options: ConnectionOptions::default(),
            peer_connection_options: ConnectionOptions::default(),
            transfer_connection_options: ConnectionOptions::default(),
            incoming_connection_options: ConnectionOptions::default(),
            distributed_connection_options: ConnectionOptions::default(),
            resolvers: Arc::new(Resolvers::default()),
        }
    }
}

impl ClientOptions {
    /// Validate and normalize. Server and transfer connections never carry
    /// an inactivity timer.
    pub fn validated(mut self) -> Result<Self> {
        if self.listen_port != 0 && self.listen_port < 1024 {
            return Err(Error::InvalidArgument {
                name: "listen_port",
                constraint: "must be within 1024..=65535",
            });
        }
        if self.distributed_child_limit == 0 {
            return Err(Error::InvalidArgument {
                name: "distributed_child_limit",
                constraint: "must be greater than zero",
            });
        }
        if self.maximum_concurrent_uploads == 0 {
            return Err(Error::InvalidArgument {
                name: "maximum_concurrent_uploads",
                constraint: "must be greater than zero",
            });
        }
        if self.message_timeout.is_zero() {
            return Err(Error::InvalidArgument {
                name: "message_timeout",
                constraint: "must be greater than zero",
            });
        }
        self.server_connection_options = self.server_connection_options.without_inactivity_timeout();
        self.transfer_connection_options =
            self.transfer_connection_options.without_inactivity_timeout();
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let options = ClientOptions::default().validated().unwrap();
        assert!(options.server_connection_options.inactivity_timeout.is_none());
        assert!(options.transfer_connection_options.inactivity_timeout.is_none());
        assert!(options.peer_connection_options.inactivity_timeout.is_some());
        assert_eq!(options.maximum_concurrent_uploads_per_user, 1);
    }

    #[test]
    fn test_rejects_privileged_listen_port() {
        let options = ClientOptions {
            listen_port: 80,
            ..ClientOptions::default()
        };
        assert!(options.validated().is_err());
    }

    #[test]
    fn test_rejects_zero_child_limit() {
        let options = ClientOptions {
            distributed_child_limit: 0,
            ..ClientOptions::default()
        };
        assert!(options.validated().is_err());
    }
}
