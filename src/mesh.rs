//! Distributed mesh manager.
//!
//! Maintains the parent link and child set used to flood search requests,
//! tracks branch level/root, and forwards searches to children with
//! per-connection deduplication.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::client::Context;
use crate::connection::{Connection, ConnectionKind, DisconnectReason};
use crate::constants::{BRANCH_ROOT_PROMOTION_GRACE_SECS, ConnectionType};
use crate::events::DiagnosticLevel;
use crate::listener::Handoff;
use crate::messages::distributed::{DistributedMessage, SearchRequest};
use crate::messages::server::{ParentCandidate, ServerRequest};
use crate::peers::race_connect;
use crate::waiter::WaitKey;
use crate::{Error, Result};

struct Parent {
    username: String,
    endpoint: SocketAddr,
    conn: Arc<Connection>,
}

pub(crate) struct DistributedManager {
    parent: Mutex<Option<Parent>>,
    children: Mutex<HashMap<String, Arc<Connection>>>,
    /// Our published branch level: 0 when root, parent's level + 1 otherwise.
    branch_level: AtomicI32,
    branch_root: StdMutex<Option<String>>,
    searching: AtomicBool,
    /// Last search frame delivered via the server's embedded envelope.
    last_embedded: StdMutex<Option<Bytes>>,
}

impl DistributedManager {
    pub fn new() -> Self {
        DistributedManager {
            parent: Mutex::new(None),
            children: Mutex::new(HashMap::new()),
            branch_level: AtomicI32::new(0),
            branch_root: StdMutex::new(None),
            searching: AtomicBool::new(false),
            last_embedded: StdMutex::new(None),
        }
    }

    pub fn branch_level(&self) -> i32 {
        self.branch_level.load(Ordering::SeqCst)
    }

    pub fn branch_root(&self, ctx: &Arc<Context>) -> String {
        self.branch_root
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .or_else(|| ctx.own_username().ok())
            .unwrap_or_default()
    }

    pub async fn child_count(&self) -> usize {
        self.children.lock().await.len()
    }

    pub async fn has_parent(&self) -> bool {
        self.parent.lock().await.is_some()
    }

    /// The parent's username and endpoint, if a parent is currently held.
    pub async fn parent_info(&self) -> Option<(String, SocketAddr)> {
        self.parent
            .lock()
            .await
            .as_ref()
            .map(|p| (p.username.clone(), p.endpoint))
    }

    /// Walk the server's candidate list until one parent sticks.
    pub async fn handle_net_info(&self, ctx: &Arc<Context>, candidates: Vec<ParentCandidate>) {
        if !ctx.options.enable_distributed_network {
            return;
        }
        if self.has_parent().await {
            return;
        }
        if self.searching.swap(true, Ordering::SeqCst) {
            return;
        }

        let ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let mut adopted = false;
            for candidate in candidates {
                let endpoint = SocketAddr::from((candidate.ip, candidate.port as u16));
                match race_connect(
                    &ctx,
                    &candidate.username,
                    endpoint,
                    ConnectionType::Distributed,
                    &cancel,
                )
                .await
                {
                    Ok(conn) => {
                        ctx.mesh
                            .promote_parent(&ctx, candidate.username.clone(), endpoint, conn)
                            .await;
                        adopted = true;
                        break;
                    }
                    Err(e) => {
                        trace!(candidate = candidate.username, "parent candidate failed: {e}");
                    }
                }
            }
            ctx.mesh.searching.store(false, Ordering::SeqCst);
            if !adopted {
                ctx.mesh.schedule_root_promotion(&ctx);
            }
        });
    }

    async fn promote_parent(
        &self,
        ctx: &Arc<Context>,
        username: String,
        endpoint: SocketAddr,
        conn: Arc<Connection>,
    ) {
        {
            let mut parent = self.parent.lock().await;
            if parent.is_some() {
                conn.disconnect(DisconnectReason::Requested);
                return;
            }
            *parent = Some(Parent {
                username: username.clone(),
                endpoint,
                conn: Arc::clone(&conn),
            });
        }
        info!(parent = username, "adopted distributed parent");
        ctx.events.diagnostic(
            DiagnosticLevel::Info,
            format!("adopted distributed parent {username}"),
        );

        let _ = ctx
            .session
            .send(&ServerRequest::HaveNoParent {
                have_no_parent: false,
            })
            .await;
        if let SocketAddr::V4(v4) = endpoint {
            let _ = ctx.session.send(&ServerRequest::ParentIP { ip: *v4.ip() }).await;
        }

        spawn_parent_loop(Arc::downgrade(ctx), username, conn);
    }

    async fn apply_branch_level(&self, ctx: &Arc<Context>, parent_level: i32) {
        let level = parent_level + 1;
        self.branch_level.store(level, Ordering::SeqCst);
        debug!(level, "branch level updated");
        let _ = ctx
            .session
            .send(&ServerRequest::BranchLevel {
                level: level.max(0) as u32,
            })
            .await;
        self.broadcast(DistributedMessage::BranchLevel(level).encode())
            .await;
    }

    async fn apply_branch_root(&self, ctx: &Arc<Context>, root: String) {
        {
            let mut slot = self.branch_root.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(root.clone());
        }
        debug!(root, "branch root updated");
        let _ = ctx
            .session
            .send(&ServerRequest::BranchRoot { root: root.clone() })
            .await;
        self.broadcast(DistributedMessage::BranchRoot(root).encode())
            .await;
    }

    async fn demote_parent(&self, ctx: &Arc<Context>, username: &str, conn_id: u64) {
        {
            let mut parent = self.parent.lock().await;
            match parent.as_ref() {
                Some(current) if current.conn.id() == conn_id => {
                    *parent = None;
                }
                _ => return,
            }
        }
        info!(parent = username, "lost distributed parent");
        let _ = ctx
            .session
            .send(&ServerRequest::HaveNoParent {
                have_no_parent: true,
            })
            .await;
        self.schedule_root_promotion(ctx);
    }

    /// After a grace period with no parent and no further candidates, we are
    /// the root of our own branch.
    fn schedule_root_promotion(&self, ctx: &Arc<Context>) {
        let ctx = Arc::downgrade(ctx);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(BRANCH_ROOT_PROMOTION_GRACE_SECS)).await;
            let Some(ctx) = ctx.upgrade() else { return };
            let mesh = &ctx.mesh;
            if mesh.has_parent().await || mesh.searching.load(Ordering::SeqCst) {
                return;
            }
            let Ok(own_username) = ctx.own_username() else {
                return;
            };

            mesh.branch_level.store(0, Ordering::SeqCst);
            {
                let mut slot = mesh.branch_root.lock().unwrap_or_else(|e| e.into_inner());
                *slot = Some(own_username.clone());
            }
            info!("promoted self to branch root");
            let _ = ctx.session.send(&ServerRequest::BranchLevel { level: 0 }).await;
            let _ = ctx
                .session
                .send(&ServerRequest::BranchRoot {
                    root: own_username.clone(),
                })
                .await;
            mesh.broadcast(DistributedMessage::BranchLevel(0).encode())
                .await;
            mesh.broadcast(DistributedMessage::BranchRoot(own_username).encode())
                .await;
        });
    }

    /// Adopt an inbound distributed child that arrived via the acceptor.
    pub async fn adopt_child(&self, ctx: &Arc<Context>, username: &str, handoff: Handoff) -> Result<()> {
        let conn = Arc::new(Connection::adopt(
            handoff.stream,
            handoff.leftover,
            ConnectionKind::DistributedMessage,
            Some(username.to_string()),
            ctx.options.distributed_connection_options.clone(),
        ));
        self.add_child_connection(ctx, username, conn).await
    }

    /// Attach a child connection, enforcing the configured limit. A rejected
    /// child's socket is closed.
    pub async fn add_child_connection(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        conn: Arc<Connection>,
    ) -> Result<()> {
        if !ctx.options.accept_distributed_children {
            conn.disconnect(DisconnectReason::Requested);
            return Err(Error::Protocol(
                "not accepting distributed children".to_string(),
            ));
        }
        {
            let mut children = self.children.lock().await;
            if children.len() >= ctx.options.distributed_child_limit {
                conn.disconnect(DisconnectReason::Requested);
                return Err(Error::Protocol(format!(
                    "distributed child limit {} reached",
                    ctx.options.distributed_child_limit
                )));
            }
            if let Some(previous) = children.insert(username.to_string(), Arc::clone(&conn)) {
                previous.disconnect(DisconnectReason::Requested);
            }
        }
        debug!(child = username, "adopted distributed child");

        // New children learn our current branch position immediately.
        let level = self.branch_level();
        let root = self.branch_root(ctx);
        let _ = conn
            .write(DistributedMessage::BranchLevel(level).encode())
            .await;
        if !root.is_empty() {
            let _ = conn
                .write(DistributedMessage::BranchRoot(root).encode())
                .await;
        }

        spawn_child_loop(Arc::downgrade(ctx), username.to_string(), conn);
        Ok(())
    }

    /// Forward a search frame verbatim to every child and resolve it against
    /// local shares.
    async fn handle_search_frame(&self, ctx: &Arc<Context>, frame: Bytes, search: SearchRequest) {
        self.broadcast(frame).await;

        let resolved = ctx
            .options
            .resolvers
            .search
            .resolve(&search.origin, search.token, &search.query)
            .await;
        if let Some(reply) = resolved {
            if !reply.files.is_empty() {
                ctx.peers
                    .send_search_reply(ctx, &search.origin, search.token, reply)
                    .await;
            }
        }
    }

    /// A server-delivered envelope (we are acting as branch root): unwrap
    /// and treat like a parent frame. Children receive exactly the bytes the
    /// server wrapped, re-framed but not re-serialized.
    pub async fn handle_embedded(&self, ctx: &Arc<Context>, code: u8, body: Vec<u8>) {
        let search = match DistributedMessage::decode_embedded(code, &body) {
            Ok(DistributedMessage::SearchRequest(search)) => search,
            Ok(other) => {
                trace!(code = ?other.code(), "ignoring embedded non-search message");
                return;
            }
            Err(e) => {
                ctx.events.diagnostic(
                    DiagnosticLevel::Warning,
                    format!("undecodable embedded message: {e}"),
                );
                return;
            }
        };

        let mut frame = BytesMut::with_capacity(5 + body.len());
        frame.put_u32_le(1 + body.len() as u32);
        frame.put_u8(code);
        frame.put_slice(&body);
        let frame = frame.freeze();

        if ctx.options.deduplicate_search_requests {
            let mut last = self.last_embedded.lock().unwrap_or_else(|e| e.into_inner());
            if last.as_ref() == Some(&frame) {
                trace!("dropping duplicate embedded search frame");
                return;
            }
            *last = Some(frame.clone());
        }

        self.handle_search_frame(ctx, frame, search).await;
    }

    /// An embedded envelope that arrived through the parent connection
    /// rather than the server. Rare, and the re-serialized inner frame is
    /// what flows on.
    async fn handle_relayed(&self, ctx: &Arc<Context>, inner: DistributedMessage) {
        let DistributedMessage::SearchRequest(search) = inner else {
            trace!(code = ?inner.code(), "ignoring relayed non-search message");
            return;
        };
        let frame = DistributedMessage::SearchRequest(search.clone()).encode();
        self.handle_search_frame(ctx, frame, search).await;
    }

    /// A search relayed directly by the server (`FileSearch`), resolved
    /// locally without forwarding.
    pub async fn handle_server_search(
        &self,
        ctx: &Arc<Context>,
        requester: String,
        token: u32,
        query: String,
    ) {
        let resolved = ctx
            .options
            .resolvers
            .search
            .resolve(&requester, token, &query)
            .await;
        if let Some(reply) = resolved {
            if !reply.files.is_empty() {
                ctx.peers
                    .send_search_reply(ctx, &requester, token, reply)
                    .await;
            }
        }
    }

    async fn broadcast(&self, frame: Bytes) {
        let children: Vec<Arc<Connection>> = {
            let children = self.children.lock().await;
            children.values().cloned().collect()
        };
        for child in children {
            if let Err(e) = child.write(frame.clone()).await {
                debug!("dropping child after failed broadcast: {e}");
                child.disconnect(DisconnectReason::Error(e.to_string()));
            }
        }
    }

    /// Server-ordered reset: drop the parent and all children, back to a
    /// clean no-parent state.
    pub async fn reset(&self, ctx: &Arc<Context>) {
        self.shutdown().await;
        self.branch_level.store(0, Ordering::SeqCst);
        {
            let mut slot = self.branch_root.lock().unwrap_or_else(|e| e.into_inner());
            *slot = None;
        }
        let _ = ctx
            .session
            .send(&ServerRequest::HaveNoParent {
                have_no_parent: true,
            })
            .await;
    }

    pub async fn shutdown(&self) {
        {
            let mut parent = self.parent.lock().await;
            if let Some(parent) = parent.take() {
                parent.conn.disconnect(DisconnectReason::Requested);
            }
        }
        let mut children = self.children.lock().await;
        for (_, conn) in children.drain() {
            conn.disconnect(DisconnectReason::Requested);
        }
    }
}

/// Serve frames from the parent; branch state and search requests flow down
/// from here.
fn spawn_parent_loop(ctx: Weak<Context>, username: String, conn: Arc<Connection>) {
    tokio::spawn(async move {
        // Dedup state is per connection: only the last search frame seen
        // here. Interleaved searches from different originators defeat it;
        // that matches the back-to-back retransmit pattern it exists for.
        let mut last_search: Option<Bytes> = None;

        loop {
            let frame = match conn.read_message().await {
                Ok(frame) => frame,
                Err(_) => break,
            };
            let Some(ctx) = ctx.upgrade() else { break };

            let msg = match DistributedMessage::decode(frame.clone()) {
                Ok(msg) => msg,
                Err(e) => {
                    ctx.events.diagnostic(
                        DiagnosticLevel::Warning,
                        format!("malformed distributed message from parent {username}: {e}"),
                    );
                    conn.disconnect(DisconnectReason::Error(e.to_string()));
                    break;
                }
            };

            match msg {
                DistributedMessage::BranchLevel(level) => {
                    ctx.mesh.apply_branch_level(&ctx, level).await;
                }
                DistributedMessage::BranchRoot(root) => {
                    ctx.mesh.apply_branch_root(&ctx, root).await;
                }
                DistributedMessage::SearchRequest(search) => {
                    if ctx.options.deduplicate_search_requests
                        && last_search.as_ref() == Some(&frame)
                    {
                        trace!("dropping duplicate search frame from parent");
                        continue;
                    }
                    last_search = Some(frame.clone());
                    ctx.mesh.handle_search_frame(&ctx, frame, search).await;
                }
                DistributedMessage::Embedded(inner) => {
                    ctx.mesh.handle_relayed(&ctx, *inner).await;
                }
                DistributedMessage::Ping | DistributedMessage::ChildDepth(_) => {}
            }
        }

        if let Some(ctx) = ctx.upgrade() {
            ctx.mesh.demote_parent(&ctx, &username, conn.id()).await;
        }
    });
}

fn spawn_child_loop(ctx: Weak<Context>, username: String, conn: Arc<Connection>) {
    tokio::spawn(async move {
        loop {
            let frame = match conn.read_message().await {
                Ok(frame) => frame,
                Err(_) => break,
            };
            let Some(ctx) = ctx.upgrade() else { break };

            match DistributedMessage::decode(frame) {
                Ok(DistributedMessage::ChildDepth(depth)) => {
                    ctx.waiter.complete(
                        &WaitKey::ChildDepthMessage {
                            username: username.clone(),
                        },
                        depth,
                    );
                    // Our own depth is one more than the deepest subtree.
                    let _ = ctx
                        .session
                        .send(&ServerRequest::ChildDepth { depth: depth + 1 })
                        .await;
                }
                Ok(DistributedMessage::Ping) => {}
                Ok(other) => {
                    trace!(child = username, "ignoring {:?} from child", other.code());
                }
                Err(e) => {
                    ctx.events.diagnostic(
                        DiagnosticLevel::Warning,
                        format!("malformed distributed message from child {username}: {e}"),
                    );
                    conn.disconnect(DisconnectReason::Error(e.to_string()));
                    break;
                }
            }
        }

        let Some(ctx) = ctx.upgrade() else { return };
        let mut children = ctx.mesh.children.lock().await;
        if let Some(current) = children.get(&username) {
            if current.id() == conn.id() {
                children.remove(&username);
                debug!(child = username, "distributed child removed");
            }
        }
    });
}
