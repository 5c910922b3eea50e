//! Promise registry correlating asynchronous responses to in-flight requests.
//!
//! Callers register a [`WaitKey`] before sending the request that will
//! eventually produce the matching message, then await the registration.
//! Handlers complete keys as messages arrive; completions with no registered
//! waiter are dropped silently.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::messages::peer::PeerCode;
use crate::messages::server::ServerCode;
use crate::{Error, Result};

/// Structural key identifying one expected response.
///
/// Equality and hashing are structural; the same value may be re-used
/// sequentially but a second concurrent registration fails with
/// [`Error::WaitKeyCollision`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WaitKey {
    /// A server reply identified by its code alone.
    Server(ServerCode),
    /// A server reply scoped to a username.
    ServerUser(ServerCode, String),
    /// A server reply scoped to a room name.
    ServerRoom(ServerCode, String),
    /// A peer reply scoped to the remote username.
    PeerUser(PeerCode, String),
    /// An inbound PierceFirewall satisfying a peer connection solicitation.
    SolicitedPeerConnection { username: String, token: u32 },
    /// An inbound PierceFirewall satisfying a distributed solicitation.
    SolicitedDistributedConnection { username: String, token: u32 },
    /// An incoming transfer connection for a negotiated transfer.
    IncomingTransfer { username: String, token: u32 },
    /// A TransferResponse answering our TransferRequest.
    TransferResponse { username: String, token: u32 },
    /// A TransferRequest initiated by the remote for a file we queued.
    TransferRequested { username: String, filename: String },
    /// A PlaceInQueueResponse for a queued filename.
    PlaceInQueue { username: String, filename: String },
    /// A child's ChildDepth report.
    ChildDepthMessage { username: String },
    /// An indirect connection attempt keyed by its solicitation token.
    IndirectConnection { username: String, token: u32 },
}

impl fmt::Display for WaitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitKey::Server(code) => write!(f, "Server:{:?}", code),
            WaitKey::ServerUser(code, username) => write!(f, "Server:{:?}:{}", code, username),
            WaitKey::ServerRoom(code, room) => write!(f, "Server:{:?}:{}", code, room),
            WaitKey::PeerUser(code, username) => write!(f, "Peer:{:?}:{}", code, username),
            WaitKey::SolicitedPeerConnection { username, token } => {
                write!(f, "SolicitedPeerConnection:{}:{}", username, token)
            }
            WaitKey::SolicitedDistributedConnection { username, token } => {
                write!(f, "SolicitedDistributedConnection:{}:{}", username, token)
            }
            WaitKey::IncomingTransfer { username, token } => {
                write!(f, "IncomingTransfer:{}:{}", username, token)
            }
            WaitKey::TransferResponse { username, token } => {
                write!(f, "TransferResponse:{}:{}", username, token)
            }
            WaitKey::TransferRequested { username, filename } => {
                write!(f, "TransferRequested:{}:{}", username, filename)
            }
            WaitKey::PlaceInQueue { username, filename } => {
                write!(f, "PlaceInQueue:{}:{}", username, filename)
            }
            WaitKey::ChildDepthMessage { username } => {
                write!(f, "ChildDepthMessage:{}", username)
            }
            WaitKey::IndirectConnection { username, token } => {
                write!(f, "IndirectConnection:{}:{}", username, token)
            }
        }
    }
}

type WaitValue = Box<dyn Any + Send>;

struct Pending {
    seq: u64,
    tx: oneshot::Sender<Result<WaitValue>>,
}

/// Registry of outstanding waits.
pub struct Waiter {
    default_timeout: Duration,
    seq: AtomicU64,
    pending: Arc<DashMap<WaitKey, Pending>>,
}

impl Waiter {
    pub fn new(default_timeout: Duration) -> Self {
        Waiter {
            default_timeout,
            seq: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a wait for `key`.
    ///
    /// Must be called before the request that triggers the response is sent,
    /// otherwise the completion can race ahead of the registration and be
    /// dropped. Fails with [`Error::WaitKeyCollision`] if a wait for the same
    /// key is already outstanding.
    pub fn register(&self, key: WaitKey) -> Result<PendingWait> {
        use dashmap::mapref::entry::Entry;

        let (tx, rx) = oneshot::channel();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        match self.pending.entry(key.clone()) {
            Entry::Occupied(_) => return Err(Error::WaitKeyCollision(key)),
            Entry::Vacant(slot) => {
                slot.insert(Pending { seq, tx });
            }
        }
        trace!(%key, "registered waiter");
        Ok(PendingWait {
            key,
            seq,
            rx,
            default_timeout: self.default_timeout,
            pending: Arc::clone(&self.pending),
        })
    }

    /// Resolve the waiter registered under `key`, if any.
    ///
    /// Returns whether a waiter consumed the value; an unclaimed value is
    /// dropped silently.
    pub fn complete<T: Any + Send>(&self, key: &WaitKey, value: T) -> bool {
        if let Some((_, entry)) = self.pending.remove(key) {
            trace!(%key, "completing waiter");
            entry.tx.send(Ok(Box::new(value))).is_ok()
        } else {
            false
        }
    }

    /// Fail the waiter registered under `key` with a specific error.
    pub fn throw(&self, key: &WaitKey, err: Error) -> bool {
        if let Some((_, entry)) = self.pending.remove(key) {
            entry.tx.send(Err(err)).is_ok()
        } else {
            false
        }
    }

    /// Cancel the waiter registered under `key`.
    pub fn cancel(&self, key: &WaitKey) -> bool {
        self.throw(key, Error::Canceled)
    }

    /// Fail every outstanding waiter. Used on disconnect and shutdown.
    pub fn cancel_all(&self) {
        let keys: Vec<WaitKey> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

/// A registered wait, resolved by the next matching completion.
pub struct PendingWait {
    key: WaitKey,
    seq: u64,
    rx: oneshot::Receiver<Result<WaitValue>>,
    default_timeout: Duration,
    pending: Arc<DashMap<WaitKey, Pending>>,
}

impl PendingWait {
    /// Await the completion with the registry's default timeout.
    pub async fn wait<T: Any + Send>(self, cancel: &CancellationToken) -> Result<T> {
        let timeout = self.default_timeout;
        self.wait_for(Some(timeout), cancel).await
    }

    /// Await the completion. `timeout: None` waits until completion or
    /// cancellation, for responses (queue positions, transfer slots) that can
    /// legitimately take arbitrarily long.
    pub async fn wait_for<T: Any + Send>(
        mut self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let deadline = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            received = &mut self.rx => match received {
                Ok(result) => result,
                Err(_) => Err(Error::Canceled),
            },
            _ = deadline => Err(Error::WaitTimeout(self.key.clone())),
            _ = cancel.cancelled() => Err(Error::Canceled),
        };

        let value = outcome?;
        value
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| Error::Protocol(format!("unexpected value type for wait {}", self.key)))
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        // Remove our registration unless a newer wait has re-used the key.
        self.pending
            .remove_if(&self.key, |_, pending| pending.seq == self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> WaitKey {
        WaitKey::SolicitedPeerConnection {
            username: "alice".to_string(),
            token: 7,
        }
    }

    #[tokio::test]
    async fn test_complete_resolves_waiter() {
        let waiter = Waiter::new(Duration::from_secs(5));
        let pending = waiter.register(key()).unwrap();
        assert!(waiter.complete(&key(), 42u32));
        let value: u32 = pending.wait(&CancellationToken::new()).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(waiter.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_complete_without_waiter_is_silent() {
        let waiter = Waiter::new(Duration::from_secs(5));
        assert!(!waiter.complete(&key(), 42u32));
    }

    #[tokio::test]
    async fn test_concurrent_registration_collides() {
        let waiter = Waiter::new(Duration::from_secs(5));
        let _first = waiter.register(key()).unwrap();
        match waiter.register(key()) {
            Err(Error::WaitKeyCollision(_)) => {}
            other => panic!("expected collision, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_sequential_reuse_allowed() {
        let waiter = Waiter::new(Duration::from_secs(5));
        {
            let pending = waiter.register(key()).unwrap();
            waiter.complete(&key(), 1u32);
            let _: u32 = pending.wait(&CancellationToken::new()).await.unwrap();
        }
        let pending = waiter.register(key()).unwrap();
        waiter.complete(&key(), 2u32);
        let value: u32 = pending.wait(&CancellationToken::new()).await.unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let waiter = Waiter::new(Duration::from_millis(50));
        let pending = waiter.register(key()).unwrap();
        let result: Result<u32> = pending.wait(&CancellationToken::new()).await;
        match result {
            Err(Error::WaitTimeout(_)) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(waiter.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_fails_outstanding_waits() {
        let waiter = Waiter::new(Duration::from_secs(5));
        let a = waiter
            .register(WaitKey::Server(ServerCode::RoomList))
            .unwrap();
        let b = waiter.register(key()).unwrap();
        waiter.cancel_all();

        let cancel = CancellationToken::new();
        assert!(matches!(a.wait::<u32>(&cancel).await, Err(Error::Canceled)));
        assert!(matches!(b.wait::<u32>(&cancel).await, Err(Error::Canceled)));
    }

    #[tokio::test]
    async fn test_cancellation_token_unblocks_wait() {
        let waiter = Waiter::new(Duration::from_secs(60));
        let pending = waiter.register(key()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            pending.wait::<u32>(&cancel).await,
            Err(Error::Canceled)
        ));
    }

    #[tokio::test]
    async fn test_dropped_wait_frees_key() {
        let waiter = Waiter::new(Duration::from_secs(5));
        drop(waiter.register(key()).unwrap());
        assert_eq!(waiter.outstanding(), 0);
        let _second = waiter.register(key()).unwrap();
    }
}
