//! Upload and download state machines.
//!
//! Transfers negotiate over the peer message connection, then stream raw
//! bytes over a dedicated transfer connection, throttled by the configured
//! token buckets and reporting progress at a bounded cadence.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::Context;
use crate::config::ClientOptions;
use crate::connection::{Connection, DisconnectReason};
use crate::constants::{TransferDirection, TransferRejectionReason};
use crate::events::{ClientEvent, DiagnosticLevel, TransferState};
use crate::limiter::TokenBucket;
use crate::messages::peer::PeerMessage;
use crate::messages::server::ServerRequest;
use crate::protocol::ProtocolWrite;
use crate::waiter::WaitKey;
use crate::{Error, Result};

/// Stream chunk size; each chunk is metered against the rate bucket.
const TRANSFER_CHUNK: usize = 16 * 1024;

/// Minimum gap between progress events per transfer.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Write side of the unframed preamble on a fresh transfer connection: the
/// establishing side identifies the transfer with its 4-byte token, the
/// other side answers with the 8-byte offset to resume from.
fn ticket_bytes(token: u32) -> Bytes {
    token.to_bytes()
}

fn resume_offset_bytes(offset: u64) -> Bytes {
    offset.to_bytes()
}

/// Read the 4-byte transfer token off a freshly adopted transfer connection.
pub(crate) async fn read_ticket(conn: &Connection, limit: Duration) -> Result<u32> {
    let raw = tokio::time::timeout(limit, conn.read_exact(4))
        .await
        .map_err(|_| Error::ConnectionTimeout)??;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Read the downloader's 8-byte resume offset.
async fn read_resume_offset(conn: &Connection, limit: Duration) -> Result<u64> {
    let raw = tokio::time::timeout(limit, conn.read_exact(8))
        .await
        .map_err(|_| Error::ConnectionTimeout)??;
    Ok(u64::from_le_bytes([
        raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
    ]))
}

/// The result of a finished transfer.
#[derive(Debug, Clone)]
pub struct TransferSummary {
    pub username: String,
    pub filename: String,
    pub direction: TransferDirection,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
}

pub(crate) struct TransferEngine {
    upload_slots: Arc<Semaphore>,
    user_upload_slots: DashMap<String, Arc<Semaphore>>,
    per_user_limit: usize,
    upload_bucket: Option<TokenBucket>,
    download_bucket: Option<TokenBucket>,
}

impl TransferEngine {
    pub fn new(options: &ClientOptions) -> Result<Self> {
        let upload_bucket = match options.upload_speed_limit {
            Some(limit) => Some(TokenBucket::new(limit, Duration::from_secs(1))?),
            None => None,
        };
        let download_bucket = match options.download_speed_limit {
            Some(limit) => Some(TokenBucket::new(limit, Duration::from_secs(1))?),
            None => None,
        };
        Ok(TransferEngine {
            upload_slots: Arc::new(Semaphore::new(options.maximum_concurrent_uploads)),
            user_upload_slots: DashMap::new(),
            per_user_limit: options.maximum_concurrent_uploads_per_user,
            upload_bucket,
            download_bucket,
        })
    }

    /// Download `filename` from `username` into `sink`, resuming from
    /// `start_offset`.
    pub async fn download<W>(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        filename: &str,
        start_offset: u64,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let outcome = self
            .run_download(ctx, username, filename, start_offset, sink, cancel)
            .await;
        self.finish(ctx, username, filename, TransferDirection::Download, &outcome);
        outcome
    }

    async fn run_download<W>(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        filename: &str,
        start_offset: u64,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.set_state(ctx, username, filename, TransferDirection::Download, TransferState::Queued);

        let conn = ctx
            .peers
            .get_or_add_message_connection(ctx, username, None, cancel)
            .await?;

        // The remote decides when our turn comes; wait without a deadline.
        let requested = ctx.waiter.register(WaitKey::TransferRequested {
            username: username.to_string(),
            filename: filename.to_string(),
        })?;
        conn.write(
            PeerMessage::QueueDownload {
                filename: filename.to_string(),
            }
            .encode(),
        )
        .await?;
        let (token, size): (u32, Option<u64>) = requested.wait_for(None, cancel).await?;

        self.set_state(ctx, username, filename, TransferDirection::Download, TransferState::Initializing);

        conn.write(
            PeerMessage::TransferResponse {
                token,
                allowed: true,
                file_size: None,
                reason: None,
            }
            .encode(),
        )
        .await?;
        let transfer_conn = ctx
            .peers
            .await_transfer_connection(ctx, username, token, cancel)
            .await?;

        // The transfer token was already consumed at adoption; announce
        // where to resume from.
        transfer_conn.write(resume_offset_bytes(start_offset)).await?;

        self.set_state(ctx, username, filename, TransferDirection::Download, TransferState::Transferring);

        let expected = size.map(|total| total.saturating_sub(start_offset));
        let started = Instant::now();
        let mut progress = Progress::new(username, filename, TransferDirection::Download, started);
        let mut received: u64 = 0;

        loop {
            if let Some(expected) = expected {
                if received >= expected {
                    break;
                }
            }
            let budget = match &self.download_bucket {
                Some(bucket) => bucket.get(TRANSFER_CHUNK, cancel).await?,
                None => TRANSFER_CHUNK,
            };
            let chunk = tokio::select! {
                chunk = transfer_conn.read_up_to(budget) => chunk?,
                _ = cancel.cancelled() => return Err(Error::Canceled),
            };
            if chunk.is_empty() {
                if expected.is_some_and(|expected| received < expected) {
                    return Err(Error::TransferFailed(format!(
                        "connection closed after {received} bytes"
                    )));
                }
                break;
            }
            sink.write_all(&chunk).await?;
            received += chunk.len() as u64;
            progress.tick(ctx, received);
        }
        sink.flush().await?;
        transfer_conn.disconnect(DisconnectReason::Requested);

        info!(username, filename, received, "download complete");
        Ok(TransferSummary {
            username: username.to_string(),
            filename: filename.to_string(),
            direction: TransferDirection::Download,
            bytes_transferred: received,
            elapsed: started.elapsed(),
        })
    }

    /// Upload `size` bytes of `content` as `filename` to `username`.
    ///
    /// The host calls this after its enqueue callback admitted the request.
    pub async fn upload<R>(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        filename: &str,
        size: u64,
        content: &mut R,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary>
    where
        R: AsyncRead + Unpin + Send,
    {
        let outcome = self
            .run_upload(ctx, username, filename, size, content, cancel)
            .await;
        self.finish(ctx, username, filename, TransferDirection::Upload, &outcome);
        outcome
    }

    async fn run_upload<R>(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        filename: &str,
        size: u64,
        content: &mut R,
        cancel: &CancellationToken,
    ) -> Result<TransferSummary>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.set_state(ctx, username, filename, TransferDirection::Upload, TransferState::Queued);

        // Global cap first, then the per-user slot.
        let _global = Arc::clone(&self.upload_slots)
            .acquire_owned()
            .await
            .map_err(|_| Error::Canceled)?;
        let user_slots = self
            .user_upload_slots
            .entry(username.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_user_limit)))
            .clone();
        let _user = user_slots
            .acquire_owned()
            .await
            .map_err(|_| Error::Canceled)?;

        let conn = ctx
            .peers
            .get_or_add_message_connection(ctx, username, None, cancel)
            .await?;
        let token = ctx.next_token();

        let response = ctx.waiter.register(WaitKey::TransferResponse {
            username: username.to_string(),
            token,
        })?;
        conn.write(
            PeerMessage::TransferRequest {
                direction: TransferDirection::Upload,
                token,
                filename: filename.to_string(),
                file_size: Some(size),
            }
            .encode(),
        )
        .await?;
        // The remote may hold us in its queue indefinitely.
        let (allowed, _remote_size, reason): (bool, Option<u64>, Option<TransferRejectionReason>) =
            response.wait_for(None, cancel).await?;
        if !allowed {
            let reason = reason
                .map(|r| r.as_str().to_string())
                .unwrap_or_else(|| "rejected".to_string());
            return Err(Error::TransferRejected(reason));
        }

        self.set_state(ctx, username, filename, TransferDirection::Upload, TransferState::Initializing);

        let transfer_conn = ctx.peers.connect_transfer(ctx, username, token, cancel).await?;
        transfer_conn.write(ticket_bytes(token)).await?;

        let offset = read_resume_offset(&transfer_conn, ctx.options.message_timeout).await?;
        if offset > size {
            return Err(Error::TransferFailed(format!(
                "requested offset {offset} beyond file size {size}"
            )));
        }
        skip_content(content, offset).await?;

        self.set_state(ctx, username, filename, TransferDirection::Upload, TransferState::Transferring);

        let started = Instant::now();
        let mut progress = Progress::new(username, filename, TransferDirection::Upload, started);
        let mut sent: u64 = 0;
        let remaining_total = size - offset;
        let mut buf = vec![0u8; TRANSFER_CHUNK];

        while sent < remaining_total {
            let budget = match &self.upload_bucket {
                Some(bucket) => bucket.get(TRANSFER_CHUNK, cancel).await?,
                None => TRANSFER_CHUNK,
            };
            let want = budget.min((remaining_total - sent) as usize);
            let n = tokio::select! {
                n = content.read(&mut buf[..want]) => n?,
                _ = cancel.cancelled() => return Err(Error::Canceled),
            };
            if n == 0 {
                return Err(Error::TransferFailed(format!(
                    "content ended after {sent} of {remaining_total} bytes"
                )));
            }
            transfer_conn
                .write(Bytes::copy_from_slice(&buf[..n]))
                .await?;
            sent += n as u64;
            progress.tick(ctx, sent);
        }
        transfer_conn.disconnect(DisconnectReason::Requested);

        let elapsed = started.elapsed();
        let avg_speed = if elapsed.as_secs_f64() > 0.0 {
            (sent as f64 / elapsed.as_secs_f64()) as u32
        } else {
            0
        };
        let _ = ctx
            .session
            .send(&ServerRequest::SendUploadSpeed { speed: avg_speed })
            .await;

        info!(username, filename, sent, "upload complete");
        Ok(TransferSummary {
            username: username.to_string(),
            filename: filename.to_string(),
            direction: TransferDirection::Upload,
            bytes_transferred: sent,
            elapsed,
        })
    }

    /// A remote user asked to queue a download from our shares.
    pub async fn handle_queue_download(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        conn: &Arc<Connection>,
        filename: String,
    ) {
        let result = ctx
            .options
            .resolvers
            .enqueue_download
            .enqueue(username, Some(conn.remote()), &filename)
            .await;
        let reason = match result {
            Ok(()) => return,
            Err(Error::DownloadEnqueue(message)) => message,
            Err(e) => {
                ctx.events.diagnostic(
                    DiagnosticLevel::Warning,
                    format!("enqueue callback failed for {username}/{filename}: {e}"),
                );
                TransferRejectionReason::FileNotShared.as_str().to_string()
            }
        };
        let refusal = PeerMessage::QueueFailed {
            filename,
            reason,
        };
        if let Err(e) = conn.write(refusal.encode()).await {
            debug!(username, "failed to send queue refusal: {e}");
        }
    }

    /// A remote peer opened transfer negotiation.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_transfer_request(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        conn: &Arc<Connection>,
        direction: TransferDirection,
        token: u32,
        filename: String,
        file_size: Option<u64>,
    ) {
        match direction {
            // The remote is ready to send us a file we queued earlier.
            TransferDirection::Upload => {
                let key = WaitKey::TransferRequested {
                    username: username.to_string(),
                    filename: filename.clone(),
                };
                if !ctx.waiter.complete(&key, (token, file_size)) {
                    let response = PeerMessage::TransferResponse {
                        token,
                        allowed: false,
                        file_size: None,
                        reason: Some(TransferRejectionReason::Cancelled),
                    };
                    let _ = conn.write(response.encode()).await;
                }
            }
            // Legacy pull: the remote wants a file without queueing first.
            // Admit it through the enqueue callback and let the normal
            // upload flow follow.
            TransferDirection::Download => {
                let result = ctx
                    .options
                    .resolvers
                    .enqueue_download
                    .enqueue(username, Some(conn.remote()), &filename)
                    .await;
                let reason = match result {
                    Ok(()) => TransferRejectionReason::Queued,
                    Err(Error::DownloadEnqueue(message)) => {
                        TransferRejectionReason::Other(message)
                    }
                    Err(_) => TransferRejectionReason::FileNotShared,
                };
                let response = PeerMessage::TransferResponse {
                    token,
                    allowed: false,
                    file_size: None,
                    reason: Some(reason),
                };
                let _ = conn.write(response.encode()).await;
            }
        }
    }

    fn set_state(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        filename: &str,
        direction: TransferDirection,
        state: TransferState,
    ) {
        ctx.events.emit(ClientEvent::TransferStateChanged {
            username: username.to_string(),
            filename: filename.to_string(),
            direction,
            state,
        });
    }

    fn finish(
        &self,
        ctx: &Arc<Context>,
        username: &str,
        filename: &str,
        direction: TransferDirection,
        outcome: &Result<TransferSummary>,
    ) {
        let state = match outcome {
            Ok(_) => TransferState::Completed,
            Err(Error::Canceled) => TransferState::Cancelled,
            Err(_) => TransferState::Errored,
        };
        self.set_state(ctx, username, filename, direction, state);
    }
}

/// Discard `offset` bytes from the content reader so a resumed upload starts
/// at the right place.
async fn skip_content<R>(content: &mut R, offset: u64) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut remaining = offset;
    let mut scratch = vec![0u8; TRANSFER_CHUNK];
    while remaining > 0 {
        let want = scratch.len().min(remaining as usize);
        let n = content.read(&mut scratch[..want]).await?;
        if n == 0 {
            return Err(Error::TransferFailed(
                "content ended before the requested offset".to_string(),
            ));
        }
        remaining -= n as u64;
    }
    Ok(())
}

struct Progress {
    username: String,
    filename: String,
    direction: TransferDirection,
    started: Instant,
    last_emit: Instant,
}

impl Progress {
    fn new(username: &str, filename: &str, direction: TransferDirection, started: Instant) -> Self {
        Progress {
            username: username.to_string(),
            filename: filename.to_string(),
            direction,
            started,
            // Backdated so the first chunk reports immediately.
            last_emit: started.checked_sub(PROGRESS_INTERVAL).unwrap_or(started),
        }
    }

    fn tick(&mut self, ctx: &Arc<Context>, bytes_transferred: u64) {
        let now = Instant::now();
        if now.duration_since(self.last_emit) < PROGRESS_INTERVAL {
            return;
        }
        self.last_emit = now;
        ctx.events.emit(ClientEvent::TransferProgress {
            username: self.username.clone(),
            filename: self.filename.clone(),
            direction: self.direction,
            bytes_transferred,
            elapsed: self.started.elapsed(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_is_four_le_bytes() {
        let wire = ticket_bytes(0x0102_0304);
        assert_eq!(&wire[..], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_resume_offset_is_eight_le_bytes() {
        let wire = resume_offset_bytes(1024 * 1024 * 500);
        assert_eq!(wire.len(), 8);
        assert_eq!(
            u64::from_le_bytes([
                wire[0], wire[1], wire[2], wire[3], wire[4], wire[5], wire[6], wire[7],
            ]),
            1024 * 1024 * 500
        );
    }
}
