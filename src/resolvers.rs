//! Injected extension points.
//!
//! The host application supplies these to answer peer requests against its
//! shared content. Every trait has a constant default so a client works out
//! of the box: empty browse response, zero user info, no-op enqueue, no queue
//! position.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;
use crate::messages::peer::{Directory, FileEntry};

/// A locally resolved answer to a search request.
#[derive(Debug, Clone)]
pub struct SearchReply {
    pub files: Vec<FileEntry>,
    pub slot_free: bool,
    pub avg_speed: u32,
    pub queue_length: u32,
}

/// A browse (share list) answer.
#[derive(Debug, Clone, Default)]
pub struct BrowseReply {
    pub directories: Vec<Directory>,
    pub private_directories: Vec<Directory>,
}

/// A user info answer.
#[derive(Debug, Clone, Default)]
pub struct UserInfoReply {
    pub description: String,
    pub picture: Option<Vec<u8>>,
    pub total_uploads: u32,
    pub queue_size: u32,
    pub slots_free: bool,
}

/// Resolves search requests against local shares.
#[async_trait]
pub trait SearchResponseResolver: Send + Sync {
    /// Return `None` (or zero files) to stay silent for this query.
    async fn resolve(&self, username: &str, token: u32, query: &str) -> Option<SearchReply>;
}

/// Resolves browse requests against local shares.
#[async_trait]
pub trait BrowseResponseResolver: Send + Sync {
    async fn resolve(&self, username: &str, remote: Option<SocketAddr>) -> BrowseReply;
}

/// Resolves folder contents requests.
#[async_trait]
pub trait DirectoryContentsResolver: Send + Sync {
    async fn resolve(
        &self,
        username: &str,
        remote: Option<SocketAddr>,
        token: u32,
        directory: &str,
    ) -> Option<Directory>;
}

/// Resolves user info requests.
#[async_trait]
pub trait UserInfoResponseResolver: Send + Sync {
    async fn resolve(&self, username: &str, remote: Option<SocketAddr>) -> UserInfoReply;
}

/// Decides whether a remote user may queue a download.
///
/// Fail with [`crate::Error::DownloadEnqueue`] to have the message forwarded
/// verbatim in a `QueueFailed` frame; any other error sends a generic
/// rejection.
#[async_trait]
pub trait EnqueueDownloadAction: Send + Sync {
    async fn enqueue(
        &self,
        username: &str,
        remote: Option<SocketAddr>,
        filename: &str,
    ) -> Result<()>;
}

/// Reports a user's place in the local upload queue.
#[async_trait]
pub trait PlaceInQueueResponseResolver: Send + Sync {
    async fn resolve(
        &self,
        username: &str,
        remote: Option<SocketAddr>,
        filename: &str,
    ) -> Option<u32>;
}

/// Optional cache of resolved user endpoints.
#[async_trait]
pub trait UserEndPointCache: Send + Sync {
    async fn get(&self, username: &str) -> Option<SocketAddr>;
    async fn set(&self, username: &str, endpoint: SocketAddr, ttl: Duration);
}

/// Holds search responses that could not be delivered because the requester's
/// connection was failing; drained when a connection to that user is next
/// established.
#[async_trait]
pub trait SearchResponseCache: Send + Sync {
    async fn add(&self, username: &str, token: u32, reply: SearchReply);
    async fn take(&self, username: &str) -> Vec<(u32, SearchReply)>;
}

struct NoSearchResponse;

#[async_trait]
impl SearchResponseResolver for NoSearchResponse {
    async fn resolve(&self, _username: &str, _token: u32, _query: &str) -> Option<SearchReply> {
        None
    }
}

struct EmptyBrowseResponse;

#[async_trait]
impl BrowseResponseResolver for EmptyBrowseResponse {
    async fn resolve(&self, _username: &str, _remote: Option<SocketAddr>) -> BrowseReply {
        BrowseReply::default()
    }
}

struct NoDirectoryContents;

#[async_trait]
impl DirectoryContentsResolver for NoDirectoryContents {
    async fn resolve(
        &self,
        _username: &str,
        _remote: Option<SocketAddr>,
        _token: u32,
        _directory: &str,
    ) -> Option<Directory> {
        None
    }
}

struct ZeroUserInfo;

#[async_trait]
impl UserInfoResponseResolver for ZeroUserInfo {
    async fn resolve(&self, _username: &str, _remote: Option<SocketAddr>) -> UserInfoReply {
        UserInfoReply::default()
    }
}

struct AcceptAllEnqueues;

#[async_trait]
impl EnqueueDownloadAction for AcceptAllEnqueues {
    async fn enqueue(
        &self,
        _username: &str,
        _remote: Option<SocketAddr>,
        _filename: &str,
    ) -> Result<()> {
        Ok(())
    }
}

struct NoPlaceInQueue;

#[async_trait]
impl PlaceInQueueResponseResolver for NoPlaceInQueue {
    async fn resolve(
        &self,
        _username: &str,
        _remote: Option<SocketAddr>,
        _filename: &str,
    ) -> Option<u32> {
        None
    }
}

struct NoEndPointCache;

#[async_trait]
impl UserEndPointCache for NoEndPointCache {
    async fn get(&self, _username: &str) -> Option<SocketAddr> {
        None
    }

    async fn set(&self, _username: &str, _endpoint: SocketAddr, _ttl: Duration) {}
}

struct DropSearchResponses;

#[async_trait]
impl SearchResponseCache for DropSearchResponses {
    async fn add(&self, _username: &str, _token: u32, _reply: SearchReply) {}

    async fn take(&self, _username: &str) -> Vec<(u32, SearchReply)> {
        Vec::new()
    }
}

/// The full resolver set injected at construction.
pub struct Resolvers {
    pub search: Box<dyn SearchResponseResolver>,
    pub browse: Box<dyn BrowseResponseResolver>,
    pub directory_contents: Box<dyn DirectoryContentsResolver>,
    pub user_info: Box<dyn UserInfoResponseResolver>,
    pub enqueue_download: Box<dyn EnqueueDownloadAction>,
    pub place_in_queue: Box<dyn PlaceInQueueResponseResolver>,
    pub endpoint_cache: Box<dyn UserEndPointCache>,
    pub search_response_cache: Box<dyn SearchResponseCache>,
}

impl Default for Resolvers {
    fn default() -> Self {
        Resolvers {
            search: Box::new(NoSearchResponse),
            browse: Box::new(EmptyBrowseResponse),
            directory_contents: Box::new(NoDirectoryContents),
            user_info: Box::new(ZeroUserInfo),
            enqueue_download: Box::new(AcceptAllEnqueues),
            place_in_queue: Box::new(NoPlaceInQueue),
            endpoint_cache: Box::new(NoEndPointCache),
            search_response_cache: Box::new(DropSearchResponses),
        }
    }
}
