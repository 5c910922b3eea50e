//! Peer connection manager.
//!
//! Owns the message-connection cache (one per username), the transfer
//! connection table, and the direct/indirect establishment race. Also hosts
//! the per-code dispatch for frames arriving on peer message connections.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::client::Context;
use crate::connection::{Connection, ConnectionKind, ConnectionOptions, DisconnectReason};
use crate::constants::ConnectionType;
use crate::events::{ClientEvent, DiagnosticLevel};
use crate::listener::Handoff;
use crate::messages::peer::{PeerCode, PeerMessage};
use crate::messages::peer_init::PeerInitMessage;
use crate::messages::server::ServerRequest;
use crate::protocol::MessageWrite;
use crate::resolvers::SearchReply;
use crate::waiter::WaitKey;
use crate::{Error, Result};

/// How long resolved endpoints stay in the injected endpoint cache.
const ENDPOINT_CACHE_TTL: Duration = Duration::from_secs(300);

pub(crate) struct PeerManager {
    ctx: Weak<Context>,
    /// Exactly one message connection per username.
    connections: DashMap<String, Arc<Connection>>,
    /// Transfer connections keyed by `(username, token)`.
    transfer_connections: DashMap<(String, u32), Arc<Connection>>,
    /// Per-username establishment locks, so concurrent callers coalesce.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PeerManager {
    pub fn new(ctx: Weak<Context>) -> Self {
        PeerManager {
            ctx,
            connections: DashMap::new(),
            transfer_connections: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Return the healthy cached message connection for `username`, or
    /// establish a new one (direct and indirect attempts racing).
    pub async fn get_or_add_message_connection(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        endpoint: Option<SocketAddr>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Connection>> {
        let lock = self
            .locks
            .entry(username.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(existing) = self.connections.get(username) {
            if existing.is_connected() {
                trace!(username, "reusing cached message connection");
                return Ok(Arc::clone(&existing));
            }
        }
        // A dead entry cannot be resurrected; drop it before re-establishing.
        self.connections
            .remove_if(username, |_, conn| !conn.is_connected());

        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => resolve_endpoint(ctx, username, cancel).await?,
        };

        let conn = race_connect(ctx, username, endpoint, ConnectionType::Peer, cancel).await?;
        self.install_message_connection(ctx, username, Arc::clone(&conn));
        Ok(conn)
    }

    /// Adopt an inbound socket as the message connection for `username`,
    /// replacing any existing entry.
    pub fn adopt_message_connection(&self, ctx: &Arc<Context>, username: &str, handoff: Handoff) {
        let conn = Arc::new(Connection::adopt(
            handoff.stream,
            handoff.leftover,
            ConnectionKind::PeerMessage,
            Some(username.to_string()),
            ctx.options.peer_connection_options.clone(),
        ));
        self.install_message_connection(ctx, username, conn);
    }

    /// Adopt an inbound socket as a transfer connection. The transfer token
    /// is read from the stream and used to complete the matching
    /// `IncomingTransfer` wait.
    pub fn adopt_transfer_connection(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        _init_token: u32,
        handoff: Handoff,
    ) {
        let conn = Arc::new(Connection::adopt(
            handoff.stream,
            handoff.leftover,
            ConnectionKind::PeerTransfer,
            Some(username.to_string()),
            ctx.options.transfer_connection_options.clone(),
        ));
        let ctx = Arc::clone(ctx);
        let username = username.to_string();
        tokio::spawn(async move {
            match register_incoming_transfer(&ctx, &username, conn).await {
                Ok(()) => {}
                Err(e) => {
                    debug!(username, "incoming transfer connection dropped: {e}");
                }
            }
        });
    }

    /// Wait for the remote to establish the transfer connection for
    /// `(username, token)`.
    pub async fn await_transfer_connection(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        token: u32,
        cancel: &CancellationToken,
    ) -> Result<Arc<Connection>> {
        // Register first, then consult the table: a connection adopted
        // between the two is observed either way.
        let pending = ctx.waiter.register(WaitKey::IncomingTransfer {
            username: username.to_string(),
            token,
        })?;
        if let Some(existing) = self.transfer_connections.get(&(username.to_string(), token)) {
            return Ok(Arc::clone(&existing));
        }
        pending.wait(cancel).await
    }

    /// Establish an outbound transfer connection for an upload we are about
    /// to start.
    pub async fn connect_transfer(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        token: u32,
        cancel: &CancellationToken,
    ) -> Result<Arc<Connection>> {
        let endpoint = resolve_endpoint(ctx, username, cancel).await?;
        let conn = race_connect(ctx, username, endpoint, ConnectionType::File, cancel).await?;
        self.track_transfer_connection(username, token, Arc::clone(&conn));
        Ok(conn)
    }

    /// Disconnect and purge all state for `username`.
    pub fn remove(&self, username: &str) {
        if let Some((_, conn)) = self.connections.remove(username) {
            conn.disconnect(DisconnectReason::Requested);
        }
        self.transfer_connections.retain(|(user, _), conn| {
            if user == username {
                conn.disconnect(DisconnectReason::Requested);
                false
            } else {
                true
            }
        });
        self.locks.remove(username);
    }

    pub fn disconnect_all(&self) {
        for entry in self.connections.iter() {
            entry.value().disconnect(DisconnectReason::Requested);
        }
        self.connections.clear();
        for entry in self.transfer_connections.iter() {
            entry.value().disconnect(DisconnectReason::Requested);
        }
        self.transfer_connections.clear();
        self.locks.clear();
    }

    /// Handle a `ConnectToPeer` solicitation relayed by the server: a remote
    /// peer wants us to connect back to them.
    pub async fn handle_connect_to_peer(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        connection_type: ConnectionType,
        endpoint: SocketAddr,
        token: u32,
    ) -> Result<()> {
        let outcome = self
            .connect_back(ctx, username, connection_type, endpoint, token)
            .await;
        if let Err(e) = &outcome {
            ctx.events.diagnostic(
                DiagnosticLevel::Debug,
                format!("could not satisfy ConnectToPeer from {username}: {e}"),
            );
            let _ = ctx
                .session
                .send(&ServerRequest::CantConnectToPeer {
                    token,
                    username: username.to_string(),
                })
                .await;
        }
        outcome
    }

    async fn connect_back(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        connection_type: ConnectionType,
        endpoint: SocketAddr,
        token: u32,
    ) -> Result<()> {
        let cancel = CancellationToken::new();
        let (kind, options) = class_of(ctx, connection_type);
        let conn = Arc::new(
            Connection::connect_to(endpoint, kind, Some(username.to_string()), options, &cancel)
                .await?,
        );
        let pierce = PeerInitMessage::PierceFirewall { token };
        conn.write(pierce.to_frame_u8()).await?;

        match connection_type {
            ConnectionType::Peer => {
                self.install_message_connection(ctx, username, conn);
            }
            ConnectionType::File => {
                register_incoming_transfer(ctx, username, conn).await?;
            }
            ConnectionType::Distributed => {
                ctx.mesh.add_child_connection(ctx, username, conn).await?;
            }
        }
        Ok(())
    }

    /// Install a message connection, replacing any previous entry, and start
    /// serving its frames.
    pub(crate) fn install_message_connection(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        conn: Arc<Connection>,
    ) {
        if let Some(previous) = self.connections.insert(username.to_string(), Arc::clone(&conn)) {
            previous.disconnect(DisconnectReason::Requested);
        }
        ctx.events.emit(ClientEvent::ConnectionStateChanged {
            username: username.to_string(),
            remote: Some(conn.remote()),
            connected: true,
        });

        spawn_peer_loop(Arc::downgrade(ctx), username.to_string(), conn);
        drain_search_response_cache(ctx, username);
    }

    fn track_transfer_connection(&self, username: &str, token: u32, conn: Arc<Connection>) {
        let key = (username.to_string(), token);
        if let Some(previous) = self.transfer_connections.insert(key.clone(), Arc::clone(&conn)) {
            previous.disconnect(DisconnectReason::Requested);
        }
        // Transfer connections live exactly as long as their transfer.
        let ctx = self.ctx.clone();
        let closed = conn.closed();
        tokio::spawn(async move {
            closed.cancelled().await;
            if let Some(ctx) = ctx.upgrade() {
                ctx.peers.transfer_connections.remove(&key);
            }
        });
    }

    fn purge_if_current(&self, username: &str, conn_id: u64) {
        self.connections
            .remove_if(username, |_, current| current.id() == conn_id);
    }

    /// Send a locally resolved search response to the requester, parking it
    /// in the search-response cache when the connection is failing.
    pub async fn send_search_reply(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        token: u32,
        reply: SearchReply,
    ) {
        let Ok(own_username) = ctx.own_username() else {
            return;
        };
        let frame = PeerMessage::SearchResponse {
            username: own_username,
            token,
            results: reply.files.clone(),
            slot_free: reply.slot_free,
            avg_speed: reply.avg_speed,
            queue_length: reply.queue_length,
            private_results: vec![],
        }
        .encode();

        let cancel = CancellationToken::new();
        let delivery = async {
            let conn = self
                .get_or_add_message_connection(ctx, username, None, &cancel)
                .await?;
            conn.write(frame).await
        };
        if let Err(e) = delivery.await {
            debug!(username, token, "parking undeliverable search response: {e}");
            ctx.options
                .resolvers
                .search_response_cache
                .add(username, token, reply)
                .await;
        }
    }
}

/// Adopt a transfer connection, read its 4-byte transfer token, and hand it
/// to the waiting transfer.
async fn register_incoming_transfer(
    ctx: &Arc<Context>,
    username: &str,
    conn: Arc<Connection>,
) -> Result<()> {
    let token = crate::transfer::read_ticket(&conn, ctx.options.message_timeout).await?;

    ctx.peers
        .track_transfer_connection(username, token, Arc::clone(&conn));
    let key = WaitKey::IncomingTransfer {
        username: username.to_string(),
        token,
    };
    if !ctx.waiter.complete(&key, conn) {
        // The transfer may not have reached its wait yet; the tracked entry
        // satisfies a late `await_transfer_connection`.
        debug!(username, token, "transfer connection tracked ahead of its waiter");
    }
    Ok(())
}

fn class_of(ctx: &Arc<Context>, connection_type: ConnectionType) -> (ConnectionKind, ConnectionOptions) {
    match connection_type {
        ConnectionType::Peer => (
            ConnectionKind::PeerMessage,
            ctx.options.peer_connection_options.clone(),
        ),
        ConnectionType::File => (
            ConnectionKind::PeerTransfer,
            ctx.options.transfer_connection_options.clone(),
        ),
        ConnectionType::Distributed => (
            ConnectionKind::DistributedMessage,
            ctx.options.distributed_connection_options.clone(),
        ),
    }
}

/// Resolve a username to an endpoint, consulting the injected cache first
/// and falling back to a `GetPeerAddress` round trip.
pub(crate) async fn resolve_endpoint(
    ctx: &Arc<Context>,
    username: &str,
    cancel: &CancellationToken,
) -> Result<SocketAddr> {
    if let Some(endpoint) = ctx.options.resolvers.endpoint_cache.get(username).await {
        return Ok(endpoint);
    }

    let pending = ctx.waiter.register(WaitKey::ServerUser(
        crate::messages::server::ServerCode::GetPeerAddress,
        username.to_string(),
    ))?;
    ctx.session
        .send(&ServerRequest::GetPeerAddress {
            username: username.to_string(),
        })
        .await?;
    let (ip, port): (std::net::Ipv4Addr, u32) = pending.wait(cancel).await?;

    if ip.is_unspecified() || port == 0 {
        return Err(Error::ConnectionFailed {
            username: username.to_string(),
            reason: "user is offline".to_string(),
        });
    }
    let endpoint = SocketAddr::from((ip, port as u16));
    ctx.options
        .resolvers
        .endpoint_cache
        .set(username, endpoint, ENDPOINT_CACHE_TTL)
        .await;
    Ok(endpoint)
}

/// Race a direct connection against a server-mediated indirect one; the
/// loser's socket is closed, never leaked.
pub(crate) async fn race_connect(
    ctx: &Arc<Context>,
    username: &str,
    endpoint: SocketAddr,
    connection_type: ConnectionType,
    cancel: &CancellationToken,
) -> Result<Arc<Connection>> {
    let (kind, options) = class_of(ctx, connection_type);
    let indirect_token = ctx.next_token();

    let direct = direct_connect(
        ctx,
        username,
        endpoint,
        connection_type,
        kind,
        options.clone(),
        cancel,
    );
    let indirect = indirect_connect(
        ctx,
        username,
        connection_type,
        kind,
        options,
        indirect_token,
        cancel,
    );
    tokio::pin!(direct);
    tokio::pin!(indirect);

    let outcome = tokio::select! {
        first = &mut direct => match first {
            Ok(conn) => Ok(conn),
            Err(direct_err) => indirect.await.map_err(|indirect_err| Error::ConnectionFailed {
                username: username.to_string(),
                reason: format!("direct: {direct_err}; indirect: {indirect_err}"),
            }),
        },
        first = &mut indirect => match first {
            Ok(conn) => Ok(conn),
            Err(indirect_err) => direct.await.map_err(|direct_err| Error::ConnectionFailed {
                username: username.to_string(),
                reason: format!("direct: {direct_err}; indirect: {indirect_err}"),
            }),
        },
    };

    // Whatever happened, the solicitation is settled.
    match connection_type {
        ConnectionType::Distributed => {
            ctx.distributed_solicitations.remove(&indirect_token);
        }
        _ => {
            ctx.peer_solicitations.remove(&indirect_token);
        }
    }
    outcome
}

async fn direct_connect(
    ctx: &Arc<Context>,
    username: &str,
    endpoint: SocketAddr,
    connection_type: ConnectionType,
    kind: ConnectionKind,
    options: ConnectionOptions,
    cancel: &CancellationToken,
) -> Result<Arc<Connection>> {
    let conn = Connection::connect_to(
        endpoint,
        kind,
        Some(username.to_string()),
        options,
        cancel,
    )
    .await?;
    let init = PeerInitMessage::PeerInit {
        username: ctx.own_username()?,
        connection_type,
        token: ctx.next_token(),
    };
    conn.write(init.to_frame_u8()).await?;
    trace!(username, %endpoint, "direct connection established");
    Ok(Arc::new(conn))
}

async fn indirect_connect(
    ctx: &Arc<Context>,
    username: &str,
    connection_type: ConnectionType,
    kind: ConnectionKind,
    options: ConnectionOptions,
    token: u32,
    cancel: &CancellationToken,
) -> Result<Arc<Connection>> {
    let key = match connection_type {
        ConnectionType::Distributed => {
            ctx.distributed_solicitations
                .insert(token, username.to_string());
            WaitKey::SolicitedDistributedConnection {
                username: username.to_string(),
                token,
            }
        }
        _ => {
            ctx.peer_solicitations.insert(token, username.to_string());
            WaitKey::SolicitedPeerConnection {
                username: username.to_string(),
                token,
            }
        }
    };

    // Register before asking the server, so the inbound PierceFirewall can
    // never race ahead of us.
    let pending = ctx.waiter.register(key)?;
    ctx.session
        .send(&ServerRequest::ConnectToPeer {
            token,
            username: username.to_string(),
            connection_type,
        })
        .await?;

    let handoff: Handoff = pending.wait(cancel).await?;
    trace!(username, token, remote = %handoff.remote, "indirect connection pierced");
    Ok(Arc::new(Connection::adopt(
        handoff.stream,
        handoff.leftover,
        kind,
        Some(username.to_string()),
        options,
    )))
}

fn drain_search_response_cache(ctx: &Arc<Context>, username: &str) {
    let ctx = Arc::downgrade(ctx);
    let username = username.to_string();
    tokio::spawn(async move {
        let Some(ctx) = ctx.upgrade() else { return };
        let parked = ctx
            .options
            .resolvers
            .search_response_cache
            .take(&username)
            .await;
        for (token, reply) in parked {
            ctx.peers
                .send_search_reply(&ctx, &username, token, reply)
                .await;
        }
    });
}

/// Serve frames arriving on a peer message connection until it ends, then
/// purge it from the cache.
fn spawn_peer_loop(ctx: Weak<Context>, username: String, conn: Arc<Connection>) {
    tokio::spawn(async move {
        loop {
            let frame = match conn.read_message().await {
                Ok(frame) => frame,
                Err(e) => {
                    if !matches!(e, Error::ConnectionClosed | Error::InactivityTimeout(_)) {
                        debug!(username, "peer connection failed: {e}");
                    }
                    conn.disconnect(DisconnectReason::Error(e.to_string()));
                    break;
                }
            };
            let Some(ctx) = ctx.upgrade() else {
                conn.disconnect(DisconnectReason::Requested);
                break;
            };
            match PeerMessage::decode(frame) {
                Ok(msg) => {
                    dispatch_peer_message(&ctx, &username, &conn, msg).await;
                }
                Err(e) => {
                    // Protocol errors are recoverable: close and purge, the
                    // next demand re-establishes.
                    ctx.events.diagnostic(
                        DiagnosticLevel::Warning,
                        format!("malformed peer message from {username}: {e}"),
                    );
                    conn.disconnect(DisconnectReason::Error(e.to_string()));
                    break;
                }
            }
        }

        if let Some(ctx) = ctx.upgrade() {
            ctx.peers.purge_if_current(&username, conn.id());
            ctx.events.emit(ClientEvent::ConnectionStateChanged {
                username: username.clone(),
                remote: Some(conn.remote()),
                connected: false,
            });
        }
    });
}

/// Per-code dispatch for peer message connections.
async fn dispatch_peer_message(
    ctx: &Arc<Context>,
    username: &str,
    conn: &Arc<Connection>,
    msg: PeerMessage,
) {
    match msg {
        PeerMessage::SearchResponse {
            username: result_user,
            token,
            results,
            slot_free,
            avg_speed,
            queue_length,
            ..
        } => {
            if ctx.active_searches.contains_key(&token) && !results.is_empty() {
                ctx.events.emit(ClientEvent::SearchResults {
                    token,
                    username: result_user,
                    slot_free,
                    avg_speed,
                    queue_length,
                    files: results,
                });
            }
        }
        PeerMessage::SharesResponse {
            directories,
            private_directories,
        } => {
            ctx.waiter.complete(
                &WaitKey::PeerUser(PeerCode::SharesResponse, username.to_string()),
                (directories, private_directories),
            );
        }
        PeerMessage::UserInfoResponse {
            description,
            picture,
            total_uploads,
            queue_size,
            slots_free,
        } => {
            ctx.waiter.complete(
                &WaitKey::PeerUser(PeerCode::UserInfoResponse, username.to_string()),
                crate::resolvers::UserInfoReply {
                    description,
                    picture,
                    total_uploads,
                    queue_size,
                    slots_free,
                },
            );
        }
        PeerMessage::FolderContentsResponse {
            token: _,
            folder,
            directories,
        } => {
            ctx.waiter.complete(
                &WaitKey::PeerUser(PeerCode::FolderContentsResponse, username.to_string()),
                (folder, directories),
            );
        }
        PeerMessage::PlaceInQueueResponse { filename, place } => {
            ctx.waiter.complete(
                &WaitKey::PlaceInQueue {
                    username: username.to_string(),
                    filename,
                },
                place,
            );
        }
        PeerMessage::TransferResponse {
            token,
            allowed,
            file_size,
            reason,
        } => {
            ctx.waiter.complete(
                &WaitKey::TransferResponse {
                    username: username.to_string(),
                    token,
                },
                (allowed, file_size, reason),
            );
        }
        PeerMessage::TransferRequest {
            direction,
            token,
            filename,
            file_size,
        } => {
            ctx.transfers
                .handle_transfer_request(ctx, username, conn, direction, token, filename, file_size)
                .await;
        }
        PeerMessage::QueueDownload { filename } => {
            ctx.transfers
                .handle_queue_download(ctx, username, conn, filename)
                .await;
        }
        PeerMessage::QueueFailed { filename, reason } => {
            ctx.waiter.throw(
                &WaitKey::TransferRequested {
                    username: username.to_string(),
                    filename: filename.clone(),
                },
                Error::TransferRejected(reason.clone()),
            );
            ctx.events.diagnostic(
                DiagnosticLevel::Debug,
                format!("{username} refused to queue {filename}: {reason}"),
            );
        }
        PeerMessage::UploadFailed { filename } => {
            if !ctx.waiter.throw(
                &WaitKey::TransferRequested {
                    username: username.to_string(),
                    filename: filename.clone(),
                },
                Error::TransferFailed("remote reported upload failure".to_string()),
            ) {
                ctx.events.diagnostic(
                    DiagnosticLevel::Debug,
                    format!("{username} reported a failed upload of {filename}"),
                );
            }
        }
        PeerMessage::SharesRequest => {
            let reply = ctx
                .options
                .resolvers
                .browse
                .resolve(username, Some(conn.remote()))
                .await;
            let response = PeerMessage::SharesResponse {
                directories: reply.directories,
                private_directories: reply.private_directories,
            };
            if let Err(e) = conn.write(response.encode()).await {
                debug!(username, "failed to answer browse request: {e}");
            }
        }
        PeerMessage::UserInfoRequest => {
            let info = ctx
                .options
                .resolvers
                .user_info
                .resolve(username, Some(conn.remote()))
                .await;
            let response = PeerMessage::UserInfoResponse {
                description: info.description,
                picture: info.picture,
                total_uploads: info.total_uploads,
                queue_size: info.queue_size,
                slots_free: info.slots_free,
            };
            if let Err(e) = conn.write(response.encode()).await {
                debug!(username, "failed to answer user info request: {e}");
            }
        }
        PeerMessage::FolderContentsRequest { token, folder } => {
            let resolved = ctx
                .options
                .resolvers
                .directory_contents
                .resolve(username, Some(conn.remote()), token, &folder)
                .await;
            if let Some(directory) = resolved {
                let response = PeerMessage::FolderContentsResponse {
                    token,
                    folder,
                    directories: vec![directory],
                };
                if let Err(e) = conn.write(response.encode()).await {
                    debug!(username, "failed to answer folder contents request: {e}");
                }
            }
        }
        PeerMessage::PlaceInQueueRequest { filename } => {
            let place = ctx
                .options
                .resolvers
                .place_in_queue
                .resolve(username, Some(conn.remote()), &filename)
                .await;
            if let Some(place) = place {
                let response = PeerMessage::PlaceInQueueResponse { filename, place };
                if let Err(e) = conn.write(response.encode()).await {
                    debug!(username, "failed to answer place-in-queue request: {e}");
                }
            }
        }
        PeerMessage::UploadQueueNotification => {}
    }
}
