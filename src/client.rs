//! Client composition root.
//!
//! [`SoulseekClient`] is thin glue over the session, managers, and transfer
//! engine; the interesting machinery lives in those modules. The shared
//! [`Context`] is held by `Arc` from the client and by `Weak` back-references
//! from the managers' long-running tasks.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ClientOptions;
use crate::constants::UserStatus;
use crate::events::{ClientEvent, EventBus};
use crate::listener::Listener;
use crate::mesh::DistributedManager;
use crate::messages::peer::{Directory, PeerCode, PeerMessage};
use crate::messages::server::{ServerCode, ServerRequest};
use crate::peers::PeerManager;
use crate::resolvers::UserInfoReply;
use crate::session::ServerSession;
use crate::transfer::{TransferEngine, TransferSummary};
use crate::waiter::{WaitKey, Waiter};
use crate::{Error, Result};

/// Shared state reachable from every component.
pub(crate) struct Context {
    pub options: ClientOptions,
    pub waiter: Waiter,
    pub events: EventBus,
    pub session: ServerSession,
    pub peers: PeerManager,
    pub mesh: DistributedManager,
    pub transfers: TransferEngine,
    pub listener: Listener,
    /// Outstanding `ConnectToPeer` solicitations, token → username.
    pub peer_solicitations: DashMap<u32, String>,
    pub distributed_solicitations: DashMap<u32, String>,
    /// Our active search tokens, token → query.
    pub active_searches: DashMap<u32, String>,
    token_counter: AtomicU32,
    username: StdRwLock<Option<String>>,
    bound_port: AtomicU16,
}

impl Context {
    /// Next value of the shared token counter.
    pub fn next_token(&self) -> u32 {
        self.token_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn own_username(&self) -> Result<String> {
        self.username
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(Error::NotLoggedIn)
    }

    pub fn set_username(&self, username: String) {
        let mut slot = self.username.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(username);
    }

    /// The acceptor's bound port, or 0 when it is not running.
    pub fn listen_port(&self) -> u16 {
        self.bound_port.load(Ordering::SeqCst)
    }
}

/// A Soulseek client.
///
/// Construct with [`SoulseekClient::new`], then [`login`](Self::login); the
/// returned event receiver carries everything the server and peers push at
/// us.
pub struct SoulseekClient {
    ctx: Arc<Context>,
}

impl SoulseekClient {
    pub fn new(options: ClientOptions) -> Result<(Self, UnboundedReceiver<ClientEvent>)> {
        let options = options.validated()?;
        let (events, event_rx) = EventBus::new(options.minimum_diagnostic_level);
        let transfers = TransferEngine::new(&options)?;
        let waiter = Waiter::new(options.message_timeout);
        let listener = Listener::new(options.listen_port);
        let starting_token = options.starting_token;

        let ctx = Arc::new_cyclic(|weak| Context {
            waiter,
            events,
            transfers,
            listener,
            session: ServerSession::new(weak.clone()),
            peers: PeerManager::new(weak.clone()),
            mesh: DistributedManager::new(),
            peer_solicitations: DashMap::new(),
            distributed_solicitations: DashMap::new(),
            active_searches: DashMap::new(),
            token_counter: AtomicU32::new(starting_token),
            username: StdRwLock::new(None),
            bound_port: AtomicU16::new(0),
            options,
        });

        Ok((SoulseekClient { ctx }, event_rx))
    }

    /// Bind the acceptor. Called implicitly by [`login`](Self::login) when
    /// `enable_listener` is set; public so hosts can bring the listener up
    /// without a server session.
    pub async fn start_listener(&self) -> Result<u16> {
        let port = self.ctx.listener.start(&self.ctx).await?;
        self.ctx.bound_port.store(port, Ordering::SeqCst);
        debug!(port, "listener started");
        Ok(port)
    }

    /// Connect to the server and log in.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        self.login_with(username, password, &CancellationToken::new())
            .await
    }

    pub async fn login_with(
        &self,
        username: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.ctx.options.enable_listener && self.ctx.listen_port() == 0 {
            self.start_listener().await?;
        }
        self.ctx
            .session
            .login(&self.ctx, username, password, cancel)
            .await
    }

    pub fn is_logged_in(&self) -> bool {
        self.ctx.session.is_connected()
    }

    /// The acceptor's bound port, or 0 when it is not running.
    pub fn listen_port(&self) -> u16 {
        self.ctx.listen_port()
    }

    /// Tear everything down: server session, peer connections, mesh, and
    /// acceptor.
    pub async fn disconnect(&self) {
        self.ctx.session.disconnect("client shutdown".to_string());
        self.ctx.mesh.shutdown().await;
        self.ctx.peers.disconnect_all();
        self.ctx.listener.stop();
    }

    /// Start a network-wide file search; results arrive as
    /// [`ClientEvent::SearchResults`] carrying the returned token.
    pub async fn search(&self, query: &str) -> Result<u32> {
        if query.is_empty() {
            return Err(Error::InvalidArgument {
                name: "query",
                constraint: "must not be empty",
            });
        }
        let token = self.ctx.next_token();
        self.ctx.active_searches.insert(token, query.to_string());
        self.ctx
            .session
            .send(&ServerRequest::FileSearch {
                token,
                query: query.to_string(),
            })
            .await?;
        Ok(token)
    }

    /// Stop routing results for a search token.
    pub fn end_search(&self, token: u32) {
        self.ctx.active_searches.remove(&token);
    }

    /// Fetch a user's shared file list.
    pub async fn browse(
        &self,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Directory>, Vec<Directory>)> {
        let conn = self
            .ctx
            .peers
            .get_or_add_message_connection(&self.ctx, username, None, cancel)
            .await?;
        let pending = self.ctx.waiter.register(WaitKey::PeerUser(
            PeerCode::SharesResponse,
            username.to_string(),
        ))?;
        conn.write(PeerMessage::SharesRequest.encode()).await?;
        pending.wait(cancel).await
    }

    /// Fetch a user's self-description and slot info.
    pub async fn user_info(
        &self,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<UserInfoReply> {
        let conn = self
            .ctx
            .peers
            .get_or_add_message_connection(&self.ctx, username, None, cancel)
            .await?;
        let pending = self.ctx.waiter.register(WaitKey::PeerUser(
            PeerCode::UserInfoResponse,
            username.to_string(),
        ))?;
        conn.write(PeerMessage::UserInfoRequest.encode()).await?;
        pending.wait(cancel).await
    }

    /// Fetch the contents of one of a user's shared folders.
    pub async fn folder_contents(
        &self,
        username: &str,
        folder: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<Directory>)> {
        let conn = self
            .ctx
            .peers
            .get_or_add_message_connection(&self.ctx, username, None, cancel)
            .await?;
        let pending = self.ctx.waiter.register(WaitKey::PeerUser(
            PeerCode::FolderContentsResponse,
            username.to_string(),
        ))?;
        conn.write(
            PeerMessage::FolderContentsRequest {
                token: self.ctx.next_token(),
                folder: folder.to_string(),
            }
            .encode(),
        )
        .await?;
        pending.wait(cancel).await
    }

    /// Ask where we sit in a user's upload queue.
    pub async fn place_in_queue(
        &self,
        username: &str,
        filename: &str,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let conn = self
            .ctx
            .peers
            .get_or_add_message_connection(&self.ctx, username, None, cancel)
            .await?;
        let pending = self.ctx.waiter.register(WaitKey::PlaceInQueue {
            username: username.to_string(),
            filename: filename.to_string(),
        })?;
        conn.write(
            PeerMessage::PlaceInQueueRequest {
                filename: filename.to_string(),
            }
            .encode(),
        )
        .await?;
        pending.wait(cancel).await
    }

    /// Download a file into `sink`, resuming from `start_offset`.
    pub async fn download<W>(
        &self,
        username: &str,
        filename: &str,
        start_offset: u64,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.ctx
            .transfers
            .download(&self.ctx, username, filename, start_offset, sink, cancel)
            .await
    }

    /// Upload `size` bytes of `content` to a user that queued `filename`.
    pub async fn upload<R>(
        &self,
        username: &str,
        filename: &str,
        size: u64,
        content: &mut R,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.ctx
            .transfers
            .upload(&self.ctx, username, filename, size, content, cancel)
            .await
    }

    /// Join a chat room; resolves with the room's member list.
    pub async fn join_room(
        &self,
        room: &str,
        private: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let pending = self
            .ctx
            .waiter
            .register(WaitKey::ServerRoom(ServerCode::JoinRoom, room.to_string()))?;
        self.ctx
            .session
            .send(&ServerRequest::JoinRoom {
                room: room.to_string(),
                private,
            })
            .await?;
        pending.wait(cancel).await
    }

    pub async fn leave_room(&self, room: &str, cancel: &CancellationToken) -> Result<()> {
        let pending = self
            .ctx
            .waiter
            .register(WaitKey::ServerRoom(ServerCode::LeaveRoom, room.to_string()))?;
        self.ctx
            .session
            .send(&ServerRequest::LeaveRoom {
                room: room.to_string(),
            })
            .await?;
        pending.wait(cancel).await
    }

    /// Say something in a room we're in.
    pub async fn say_in_room(&self, room: &str, message: &str) -> Result<()> {
        self.ctx
            .session
            .send(&ServerRequest::SayInChatRoom {
                room: room.to_string(),
                message: message.to_string(),
            })
            .await
    }

    pub async fn send_private_message(&self, username: &str, message: &str) -> Result<()> {
        self.ctx
            .session
            .send(&ServerRequest::MessageUser {
                username: username.to_string(),
                message: message.to_string(),
            })
            .await
    }

    pub async fn set_status(&self, status: UserStatus) -> Result<()> {
        self.ctx
            .session
            .send(&ServerRequest::SetOnlineStatus { status })
            .await
    }

    /// Report shared folder/file counts to the server.
    pub async fn set_shared_counts(&self, dirs: u32, files: u32) -> Result<()> {
        self.ctx
            .session
            .send(&ServerRequest::SharedFoldersAndFiles { dirs, files })
            .await
    }

    /// Fetch the public room list.
    pub async fn room_list(&self, cancel: &CancellationToken) -> Result<Vec<(String, u32)>> {
        let pending = self
            .ctx
            .waiter
            .register(WaitKey::Server(ServerCode::RoomList))?;
        self.ctx.session.send(&ServerRequest::RoomList).await?;
        pending.wait(cancel).await
    }

    /// Days of privilege remaining.
    pub async fn check_privileges(&self, cancel: &CancellationToken) -> Result<u32> {
        let pending = self
            .ctx
            .waiter
            .register(WaitKey::Server(ServerCode::CheckPrivileges))?;
        self.ctx
            .session
            .send(&ServerRequest::CheckPrivileges)
            .await?;
        pending.wait(cancel).await
    }

    /// Watch a user; resolves with whether the user exists.
    pub async fn add_user(&self, username: &str, cancel: &CancellationToken) -> Result<bool> {
        let pending = self.ctx.waiter.register(WaitKey::ServerUser(
            ServerCode::AddUser,
            username.to_string(),
        ))?;
        self.ctx
            .session
            .send(&ServerRequest::AddUser {
                username: username.to_string(),
            })
            .await?;
        let (exists, _status, _stats): (
            bool,
            Option<UserStatus>,
            Option<crate::messages::server::UserStats>,
        ) = pending.wait(cancel).await?;
        Ok(exists)
    }

    pub async fn remove_user(&self, username: &str) -> Result<()> {
        self.ctx
            .session
            .send(&ServerRequest::RemoveUser {
                username: username.to_string(),
            })
            .await
    }

    pub async fn get_user_stats(
        &self,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<crate::messages::server::UserStats> {
        let pending = self.ctx.waiter.register(WaitKey::ServerUser(
            ServerCode::GetUserStats,
            username.to_string(),
        ))?;
        self.ctx
            .session
            .send(&ServerRequest::GetUserStats {
                username: username.to_string(),
            })
            .await?;
        pending.wait(cancel).await
    }

    pub async fn get_user_status(
        &self,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<(UserStatus, bool)> {
        let pending = self.ctx.waiter.register(WaitKey::ServerUser(
            ServerCode::GetUserStatus,
            username.to_string(),
        ))?;
        self.ctx
            .session
            .send(&ServerRequest::GetUserStatus {
                username: username.to_string(),
            })
            .await?;
        pending.wait(cancel).await
    }

    /// Resolve a user's listening endpoint.
    pub async fn get_peer_address(
        &self,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<std::net::SocketAddr> {
        crate::peers::resolve_endpoint(&self.ctx, username, cancel).await
    }

    /// Disconnect and forget all connections for a user.
    pub fn remove_peer(&self, username: &str) {
        self.ctx.peers.remove(username);
    }

    /// Number of distributed children currently attached.
    pub async fn distributed_children(&self) -> usize {
        self.ctx.mesh.child_count().await
    }

    /// The distributed parent's username and endpoint, if one is held.
    pub async fn distributed_parent(&self) -> Option<(String, std::net::SocketAddr)> {
        self.ctx.mesh.parent_info().await
    }

    /// Our published branch level: 0 when acting as a branch root.
    pub fn branch_level(&self) -> i32 {
        self.ctx.mesh.branch_level()
    }

    /// Our published branch root username.
    pub fn branch_root(&self) -> String {
        self.ctx.mesh.branch_root(&self.ctx)
    }
}
