//! The long-lived server session.
//!
//! One TCP connection to the central server, with login, a 30-second
//! keepalive, and a demux loop that completes waiters and drives the peer
//! and distributed managers.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use std::time::Duration;

use tokio::net::lookup_host;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::Context;
use crate::connection::{Connection, ConnectionKind, DisconnectReason};
use crate::constants::SERVER_PING_INTERVAL_SECS;
use crate::events::{ClientEvent, DiagnosticLevel};
use crate::messages::server::{
    ServerCode, ServerRequest, ServerResponse, decode_server_message,
};
use crate::protocol::MessageWrite;
use crate::waiter::WaitKey;
use crate::{Error, Result};

pub(crate) struct ServerSession {
    ctx: Weak<Context>,
    conn: StdRwLock<Option<Arc<Connection>>>,
}

impl ServerSession {
    pub fn new(ctx: Weak<Context>) -> Self {
        ServerSession {
            ctx,
            conn: StdRwLock::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|conn| conn.is_connected())
    }

    /// Connect and log in. On success the demux loop and keepalive are
    /// running and the post-login status messages have been sent.
    pub async fn login(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if username.is_empty() {
            return Err(Error::InvalidArgument {
                name: "username",
                constraint: "must not be empty",
            });
        }
        if password.is_empty() {
            return Err(Error::InvalidArgument {
                name: "password",
                constraint: "must not be empty",
            });
        }
        if self.is_connected() {
            return Err(Error::Protocol("already logged in".to_string()));
        }

        let endpoint = resolve_server(&ctx.options.server_host, ctx.options.server_port).await?;
        let conn = Arc::new(
            Connection::connect_to(
                endpoint,
                ConnectionKind::Server,
                None,
                ctx.options.server_connection_options.clone(),
                cancel,
            )
            .await?,
        );
        {
            let mut slot = self.conn.write().unwrap_or_else(|e| e.into_inner());
            *slot = Some(Arc::clone(&conn));
        }

        // Register before sending so the reply cannot outrun us.
        let pending = ctx.waiter.register(WaitKey::Server(ServerCode::Login))?;
        spawn_demux_loop(Arc::downgrade(ctx), Arc::clone(&conn));

        let login = ServerRequest::Login {
            username: username.to_string(),
            password: password.to_string(),
            version: ctx.options.client_version,
            minor_version: ctx.options.client_minor_version,
        };
        if let Err(e) = conn.write(login.to_frame()).await {
            self.disconnect("failed to send login".to_string());
            return Err(e);
        }

        let outcome: std::result::Result<String, String> = match pending.wait(cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.disconnect("no login response".to_string());
                return Err(e);
            }
        };
        match outcome {
            Ok(greet) => {
                info!(username, "logged in: {greet}");
            }
            Err(reason) => {
                self.disconnect("login rejected".to_string());
                return Err(Error::LoginFailed { reason });
            }
        }
        ctx.set_username(username.to_string());

        spawn_keepalive(Arc::downgrade(ctx), Arc::clone(&conn));
        self.announce_presence(ctx).await?;
        Ok(())
    }

    /// Post-login status housekeeping.
    async fn announce_presence(&self, ctx: &Arc<Context>) -> Result<()> {
        let listen_port = ctx.listen_port();
        if listen_port != 0 {
            self.send(&ServerRequest::SetListenPort {
                port: listen_port as u32,
            })
            .await?;
        }
        self.send(&ServerRequest::SetOnlineStatus {
            status: crate::constants::UserStatus::Online,
        })
        .await?;
        self.send(&ServerRequest::SharedFoldersAndFiles { dirs: 0, files: 0 })
            .await?;
        self.send(&ServerRequest::HaveNoParent {
            have_no_parent: true,
        })
        .await?;
        self.send(&ServerRequest::AcceptChildren {
            accept: ctx.options.accept_distributed_children
                && ctx.options.enable_distributed_network,
        })
        .await?;
        Ok(())
    }

    /// Frame and send a request on the server connection.
    pub async fn send(&self, request: &ServerRequest) -> Result<()> {
        let conn = {
            let slot = self.conn.read().unwrap_or_else(|e| e.into_inner());
            slot.as_ref().cloned()
        };
        match conn {
            Some(conn) if conn.is_connected() => conn.write(request.to_frame()).await,
            _ => Err(Error::NotLoggedIn),
        }
    }

    /// Tear down the session. Errors on the server connection are fatal:
    /// every outstanding wait fails and the client is inert until the next
    /// login.
    pub fn disconnect(&self, reason: String) {
        let conn = {
            let mut slot = self.conn.write().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(conn) = conn {
            conn.disconnect(DisconnectReason::Error(reason.clone()));
            if let Some(ctx) = self.ctx.upgrade() {
                ctx.waiter.cancel_all();
                ctx.events.emit(ClientEvent::Disconnected { reason });
            }
        }
    }
}

async fn resolve_server(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = lookup_host((host, port)).await?;
    addrs
        .next()
        .ok_or_else(|| Error::ConnectionFailed {
            username: host.to_string(),
            reason: "server address did not resolve".to_string(),
        })
}

fn spawn_keepalive(ctx: Weak<Context>, conn: Arc<Connection>) {
    tokio::spawn(async move {
        let closed = conn.closed();
        let mut ticker = tokio::time::interval(Duration::from_secs(SERVER_PING_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick is immediate; the login traffic just went out.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = closed.cancelled() => break,
            }
            let Some(ctx) = ctx.upgrade() else { break };
            if ctx.session.send(&ServerRequest::Ping).await.is_err() {
                break;
            }
            debug!("server keepalive sent");
        }
    });
}

fn spawn_demux_loop(ctx: Weak<Context>, conn: Arc<Connection>) {
    tokio::spawn(async move {
        let reason = loop {
            let frame = match conn.read_message().await {
                Ok(frame) => frame,
                Err(e) => break e.to_string(),
            };
            let Some(ctx) = ctx.upgrade() else {
                break "client dropped".to_string();
            };
            match decode_server_message(frame) {
                Ok(response) => handle_server_response(&ctx, response).await,
                Err(e) => {
                    // An undecodable frame on the server socket means we have
                    // lost protocol sync; only a reconnect recovers that.
                    warn!("malformed server message: {e}");
                    break e.to_string();
                }
            }
        };
        if let Some(ctx) = ctx.upgrade() {
            ctx.session.disconnect(reason);
        }
    });
}

async fn handle_server_response(ctx: &Arc<Context>, response: ServerResponse) {
    match response {
        ServerResponse::LoginSuccess { greet, .. } => {
            ctx.waiter.complete(
                &WaitKey::Server(ServerCode::Login),
                Ok::<String, String>(greet),
            );
        }
        ServerResponse::LoginFailure { reason, detail } => {
            let mut text = reason.as_str().to_string();
            if let Some(detail) = detail {
                text.push_str(": ");
                text.push_str(&detail);
            }
            ctx.waiter.complete(
                &WaitKey::Server(ServerCode::Login),
                Err::<String, String>(text),
            );
        }
        ServerResponse::GetPeerAddress { username, ip, port } => {
            ctx.waiter.complete(
                &WaitKey::ServerUser(ServerCode::GetPeerAddress, username),
                (ip, port),
            );
        }
        ServerResponse::AddUser {
            username,
            exists,
            status,
            stats,
            ..
        } => {
            ctx.waiter.complete(
                &WaitKey::ServerUser(ServerCode::AddUser, username),
                (exists, status, stats),
            );
        }
        ServerResponse::GetUserStatus {
            username,
            status,
            privileged,
        } => {
            ctx.waiter.complete(
                &WaitKey::ServerUser(ServerCode::GetUserStatus, username.clone()),
                (status, privileged),
            );
            ctx.events.emit(ClientEvent::UserStatusChanged {
                username,
                status,
                privileged,
            });
        }
        ServerResponse::GetUserStats { username, stats } => {
            ctx.waiter.complete(
                &WaitKey::ServerUser(ServerCode::GetUserStats, username),
                stats,
            );
        }
        ServerResponse::SayInChatRoom {
            room,
            username,
            message,
        } => {
            ctx.events.emit(ClientEvent::RoomMessage {
                room,
                username,
                message,
            });
        }
        ServerResponse::JoinRoom {
            room,
            users,
            owner,
            operators,
        } => {
            ctx.waiter.complete(
                &WaitKey::ServerRoom(ServerCode::JoinRoom, room.clone()),
                users.clone(),
            );
            ctx.events.emit(ClientEvent::RoomJoined {
                room,
                users,
                owner,
                operators,
            });
        }
        ServerResponse::LeaveRoom { room } => {
            ctx.waiter
                .complete(&WaitKey::ServerRoom(ServerCode::LeaveRoom, room.clone()), ());
            ctx.events.emit(ClientEvent::RoomLeft { room });
        }
        ServerResponse::UserJoinedRoom {
            room,
            username,
            stats,
            ..
        } => {
            ctx.events.emit(ClientEvent::UserJoinedRoom {
                room,
                username,
                stats,
            });
        }
        ServerResponse::UserLeftRoom { room, username } => {
            ctx.events.emit(ClientEvent::UserLeftRoom { room, username });
        }
        ServerResponse::RoomList { rooms, .. } => {
            ctx.waiter
                .complete(&WaitKey::Server(ServerCode::RoomList), rooms.clone());
            ctx.events.emit(ClientEvent::RoomList { rooms });
        }
        ServerResponse::ConnectToPeer {
            username,
            connection_type,
            ip,
            port,
            token,
            ..
        } => {
            let endpoint = SocketAddr::from((ip, port as u16));
            let ctx = Arc::clone(ctx);
            tokio::spawn(async move {
                let _ = ctx
                    .peers
                    .handle_connect_to_peer(&ctx, &username, connection_type, endpoint, token)
                    .await;
            });
        }
        ServerResponse::MessageUser {
            id,
            timestamp,
            username,
            message,
            ..
        } => {
            let acknowledged = ctx.options.auto_acknowledge_private_messages;
            if acknowledged {
                let _ = ctx
                    .session
                    .send(&ServerRequest::MessageAcked { message_id: id })
                    .await;
            }
            ctx.events.emit(ClientEvent::PrivateMessage {
                id,
                timestamp,
                username,
                message,
                acknowledged,
            });
        }
        ServerResponse::FileSearch {
            username,
            token,
            query,
        } => {
            ctx.mesh
                .handle_server_search(ctx, username, token, query)
                .await;
        }
        ServerResponse::EmbeddedMessage { code, data } => {
            ctx.mesh.handle_embedded(ctx, code, data).await;
        }
        ServerResponse::NetInfo { parents } => {
            ctx.mesh.handle_net_info(ctx, parents).await;
        }
        ServerResponse::ResetDistributed => {
            ctx.mesh.reset(ctx).await;
        }
        ServerResponse::ParentMinSpeed { .. } | ServerResponse::ParentSpeedRatio { .. } => {}
        ServerResponse::WishlistInterval { .. } => {}
        ServerResponse::PrivilegedUsers { users } => {
            ctx.events.emit(ClientEvent::PrivilegedUsers { users });
        }
        ServerResponse::NotifyPrivileges { token, username } => {
            if ctx.options.auto_acknowledge_privilege_notifications {
                let _ = ctx
                    .session
                    .send(&ServerRequest::AckNotifyPrivileges { token })
                    .await;
            }
            ctx.events
                .emit(ClientEvent::PrivilegeNotification { token, username });
        }
        ServerResponse::CheckPrivileges { time_left } => {
            ctx.waiter
                .complete(&WaitKey::Server(ServerCode::CheckPrivileges), time_left);
        }
        ServerResponse::PrivateRoomMembershipGranted { room } => {
            if ctx.options.accept_private_room_invitations {
                let _ = ctx
                    .session
                    .send(&ServerRequest::PrivateRoomToggle { enable: true })
                    .await;
            }
            ctx.events.diagnostic(
                DiagnosticLevel::Info,
                format!("granted membership of private room {room}"),
            );
        }
        ServerResponse::Relogged => {
            ctx.events.emit(ClientEvent::KickedFromServer);
            ctx.session
                .disconnect("logged in from another client".to_string());
        }
        ServerResponse::GlobalAdminMessage { message } => {
            ctx.events.emit(ClientEvent::GlobalMessage { message });
        }
        ServerResponse::GlobalRoomMessage {
            room,
            username,
            message,
        } => {
            ctx.events.emit(ClientEvent::RoomMessage {
                room,
                username,
                message,
            });
        }
        ServerResponse::CantConnectToPeer { token, username } => {
            // Our solicitation will never be answered; fail the waiters so
            // the race falls back to (or concludes with) the direct branch.
            ctx.peer_solicitations.remove(&token);
            ctx.distributed_solicitations.remove(&token);
            ctx.waiter.throw(
                &WaitKey::SolicitedPeerConnection {
                    username: username.clone(),
                    token,
                },
                Error::ConnectionFailed {
                    username: username.clone(),
                    reason: "peer could not connect back".to_string(),
                },
            );
            ctx.waiter.throw(
                &WaitKey::SolicitedDistributedConnection {
                    username: username.clone(),
                    token,
                },
                Error::ConnectionFailed {
                    username,
                    reason: "peer could not connect back".to_string(),
                },
            );
        }
    }
}
