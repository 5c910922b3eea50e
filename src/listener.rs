//! Inbound connection acceptor.
//!
//! Reads the first framed message off every accepted socket, classifies the
//! connection as peer message / transfer / distributed, and hands it off to
//! the owning manager.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bytes::BytesMut;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::Context;
use crate::connection::{Connection, ConnectionKind, DisconnectReason};
use crate::constants::ConnectionType;
use crate::events::DiagnosticLevel;
use crate::messages::peer_init::{PeerInitMessage, decode_peer_init_message};
use crate::waiter::WaitKey;
use crate::{Error, Result};

/// A classified socket ready for adoption by a manager, together with any
/// bytes read past the classifying frame.
pub(crate) struct Handoff {
    pub stream: TcpStream,
    pub leftover: BytesMut,
    pub remote: SocketAddr,
}

/// TCP acceptor bound to the configured listen port.
pub(crate) struct Listener {
    port: u16,
    shutdown: StdMutex<Option<CancellationToken>>,
}

impl Listener {
    pub fn new(port: u16) -> Self {
        Listener {
            port,
            shutdown: StdMutex::new(None),
        }
    }

    /// Bind and start accepting. Returns the bound port.
    pub async fn start(&self, ctx: &Arc<Context>) -> Result<u16> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        let port = listener.local_addr()?.port();

        let shutdown = CancellationToken::new();
        {
            let mut slot = self.shutdown.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = slot.replace(shutdown.clone()) {
                previous.cancel();
            }
        }

        let ctx = Arc::downgrade(ctx);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = shutdown.cancelled() => break,
                };
                let Some(ctx) = ctx.upgrade() else { break };
                match accepted {
                    Ok((stream, remote)) => {
                        debug!(%remote, "accepted inbound connection");
                        tokio::spawn(async move {
                            if let Err(e) = classify(stream, remote, &ctx).await {
                                ctx.events.diagnostic(
                                    DiagnosticLevel::Debug,
                                    format!("inbound connection from {remote} dropped: {e}"),
                                );
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept error: {e}");
                    }
                }
            }
        });

        Ok(port)
    }

    pub fn stop(&self) {
        if let Some(shutdown) = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            shutdown.cancel();
        }
    }
}

/// Read the first frame and route the socket to the right owner.
async fn classify(stream: TcpStream, remote: SocketAddr, ctx: &Arc<Context>) -> Result<()> {
    let conn = Connection::adopt(
        stream,
        BytesMut::new(),
        ConnectionKind::Incoming,
        None,
        ctx.options.incoming_connection_options.clone(),
    );

    let first = conn.read_message().await?;
    let init = match decode_peer_init_message(first) {
        Ok(init) => init,
        Err(e) => {
            conn.disconnect(DisconnectReason::Error(e.to_string()));
            return Err(Error::MalformedMessage(format!(
                "unrecognised initialisation frame: {e}"
            )));
        }
    };

    match init {
        PeerInitMessage::PeerInit {
            username,
            connection_type,
            token,
        } => {
            let (stream, leftover) = conn.handoff().await?;
            let handoff = Handoff {
                stream,
                leftover,
                remote,
            };
            match connection_type {
                ConnectionType::Peer => {
                    ctx.peers.adopt_message_connection(ctx, &username, handoff);
                    ctx.events.diagnostic(
                        DiagnosticLevel::Debug,
                        format!("inbound message connection from {username} handed off"),
                    );
                }
                ConnectionType::File => {
                    ctx.peers
                        .adopt_transfer_connection(ctx, &username, token, handoff);
                    ctx.events.diagnostic(
                        DiagnosticLevel::Debug,
                        format!("inbound transfer connection from {username} handed off"),
                    );
                }
                ConnectionType::Distributed => {
                    ctx.mesh.adopt_child(ctx, &username, handoff).await?;
                    ctx.events.diagnostic(
                        DiagnosticLevel::Debug,
                        format!("inbound distributed connection from {username} handed off"),
                    );
                }
            }
            Ok(())
        }
        PeerInitMessage::PierceFirewall { token } => {
            if let Some((_, username)) = ctx.peer_solicitations.remove(&token) {
                let (stream, leftover) = conn.handoff().await?;
                let key = WaitKey::SolicitedPeerConnection {
                    username,
                    token,
                };
                if !ctx.waiter.complete(
                    &key,
                    Handoff {
                        stream,
                        leftover,
                        remote,
                    },
                ) {
                    debug!(token, "solicited peer connection arrived after its waiter left");
                }
                return Ok(());
            }
            if let Some((_, username)) = ctx.distributed_solicitations.remove(&token) {
                let (stream, leftover) = conn.handoff().await?;
                let key = WaitKey::SolicitedDistributedConnection {
                    username,
                    token,
                };
                if !ctx.waiter.complete(
                    &key,
                    Handoff {
                        stream,
                        leftover,
                        remote,
                    },
                ) {
                    debug!(token, "solicited distributed connection arrived after its waiter left");
                }
                return Ok(());
            }
            conn.disconnect(DisconnectReason::Error("unknown solicitation".to_string()));
            Err(Error::UnknownSolicitation(token))
        }
    }
}
