//! A multiplexed connection to one tablet session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tablet_common::error::{TabletError, TabletResult};
use tablet_common::types::{SessionId, TransactionId};
use tablet_proto::frame::{write_frame, FrameReader};
use tablet_proto::rpc::fold;
use tablet_proto::stream::{channel, ChunkSender};
use tablet_proto::{
    ApiVersion, BoundQuery, CallContext, QueryResult, QuerySplit, QueryStream, Reply, Request,
    RequestEnvelope, Response,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Requests buffered before callers wait on the writer.
const OUTBOX_SIZE: usize = 64;

/// State shared by the connection handle, its I/O tasks and its calls.
struct Shared {
    outbox: mpsc::Sender<(u64, RequestEnvelope)>,
    /// Reply routes for in-flight calls.
    pending: DashMap<u64, mpsc::Sender<Response>>,
    next_call_id: AtomicU64,
    /// Cancelled once the connection is closed from either side.
    closed: CancellationToken,
}

impl Shared {
    fn send_cancel(&self, call_id: u64) {
        if self.closed.is_cancelled() {
            return;
        }
        let cancel = RequestEnvelope::new(Request::Cancel);
        if self.outbox.try_send((call_id, cancel)).is_err() {
            debug!(call_id, "could not queue cancel frame");
        }
    }
}

/// One outstanding call. Dropping it before the final reply arrives tells
/// the server to abandon the call.
struct PendingCall {
    shared: Arc<Shared>,
    call_id: u64,
    replies: mpsc::Receiver<Response>,
    finished: bool,
}

impl PendingCall {
    async fn recv(&mut self) -> Option<Response> {
        self.replies.recv().await
    }

    /// Lets the server send `credits` more stream chunks.
    async fn grant(&self, credits: u32) {
        let credit = RequestEnvelope::new(Request::Credit(credits));
        if self.shared.outbox.send((self.call_id, credit)).await.is_err() {
            debug!(call_id = self.call_id, "could not queue credit frame");
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.call_id);
        if !self.finished {
            self.shared.send_cancel(self.call_id);
        }
    }
}

/// A connection bound to one session on one keyspace/shard.
///
/// Calls may be issued concurrently from several tasks. Every call takes a
/// [`CallContext`]; its deadline travels to the server and cancelling it
/// abandons the call on both sides.
pub struct TabletConn {
    shared: Arc<Shared>,
    config: ClientConfig,
    keyspace: String,
    shard: String,
    session_id: SessionId,
}

impl std::fmt::Debug for TabletConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabletConn")
            .field("address", &self.config.address())
            .field("keyspace", &self.keyspace)
            .field("shard", &self.shard)
            .field("session_id", &self.session_id)
            .field("closed", &self.shared.closed.is_cancelled())
            .finish()
    }
}

impl TabletConn {
    /// Connects to the server named by `config` and opens a session on
    /// `keyspace`/`shard`.
    pub async fn connect(config: ClientConfig, keyspace: &str, shard: &str) -> ClientResult<Self> {
        let address = config.address();
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                ClientError::ConnectionTimeout(config.connect_timeout.as_millis() as u64)
            })?
            .map_err(|e| ClientError::ConnectionFailed(format!("{address}: {e}")))?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_SIZE);
        let shared = Arc::new(Shared {
            outbox,
            pending: DashMap::new(),
            next_call_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        });
        tokio::spawn(write_loop(write_half, outbox_rx, shared.closed.clone()));
        tokio::spawn(read_loop(read_half, Arc::clone(&shared)));

        let mut conn = Self {
            shared,
            config,
            keyspace: keyspace.to_string(),
            shard: shard.to_string(),
            session_id: SessionId::INVALID,
        };

        let ctx = CallContext::background();
        let request = Request::GetSessionId {
            keyspace: conn.keyspace.clone(),
            shard: conn.shard.clone(),
        };
        conn.session_id = match conn.unary(&ctx, request).await? {
            Reply::SessionId(id) => id,
            _ => return Err(ClientError::UnexpectedReply("GetSessionId")),
        };
        info!(%address, keyspace, shard, session_id = %conn.session_id, "tablet session opened");
        Ok(conn)
    }

    /// Returns the session this connection is bound to.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns true once the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Starts a transaction (legacy form).
    pub async fn begin(&self, ctx: &CallContext) -> ClientResult<TransactionId> {
        self.begin_version(ctx, ApiVersion::V1).await
    }

    /// Starts a transaction.
    pub async fn begin2(&self, ctx: &CallContext) -> ClientResult<TransactionId> {
        self.begin_version(ctx, ApiVersion::V2).await
    }

    /// Commits a transaction (legacy form).
    ///
    /// Once the request is sent, the call waits for the server's answer
    /// even if `ctx` ends first. An error therefore means the commit did
    /// not happen.
    pub async fn commit(&self, ctx: &CallContext, transaction_id: TransactionId) -> ClientResult<()> {
        self.commit_version(ctx, ApiVersion::V1, transaction_id).await
    }

    /// Commits a transaction.
    pub async fn commit2(&self, ctx: &CallContext, transaction_id: TransactionId) -> ClientResult<()> {
        self.commit_version(ctx, ApiVersion::V2, transaction_id).await
    }

    /// Rolls back a transaction (legacy form).
    ///
    /// Waits for the server's answer the same way [`TabletConn::commit`]
    /// does.
    pub async fn rollback(&self, ctx: &CallContext, transaction_id: TransactionId) -> ClientResult<()> {
        self.rollback_version(ctx, ApiVersion::V1, transaction_id).await
    }

    /// Rolls back a transaction.
    pub async fn rollback2(&self, ctx: &CallContext, transaction_id: TransactionId) -> ClientResult<()> {
        self.rollback_version(ctx, ApiVersion::V2, transaction_id).await
    }

    async fn begin_version(&self, ctx: &CallContext, version: ApiVersion) -> ClientResult<TransactionId> {
        let request = Request::Begin {
            version,
            session_id: self.session_id,
            transaction_id: TransactionId::NONE,
        };
        match self.unary(ctx, request).await? {
            Reply::Begin { transaction_id, .. } => Ok(transaction_id),
            _ => Err(ClientError::UnexpectedReply("Begin")),
        }
    }

    async fn commit_version(
        &self,
        ctx: &CallContext,
        version: ApiVersion,
        transaction_id: TransactionId,
    ) -> ClientResult<()> {
        let request = Request::Commit {
            version,
            session_id: self.session_id,
            transaction_id,
        };
        match self.settle(ctx, request).await? {
            Reply::Commit { .. } => Ok(()),
            _ => Err(ClientError::UnexpectedReply("Commit")),
        }
    }

    async fn rollback_version(
        &self,
        ctx: &CallContext,
        version: ApiVersion,
        transaction_id: TransactionId,
    ) -> ClientResult<()> {
        let request = Request::Rollback {
            version,
            session_id: self.session_id,
            transaction_id,
        };
        match self.settle(ctx, request).await? {
            Reply::Rollback { .. } => Ok(()),
            _ => Err(ClientError::UnexpectedReply("Rollback")),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Executes one statement. Pass [`TransactionId::NONE`] to autocommit.
    pub async fn execute(
        &self,
        ctx: &CallContext,
        query: BoundQuery,
        transaction_id: TransactionId,
    ) -> ClientResult<QueryResult> {
        let request = Request::Execute {
            session_id: self.session_id,
            transaction_id,
            query,
        };
        match self.unary(ctx, request).await? {
            Reply::Execute(result) => Ok(result),
            _ => Err(ClientError::UnexpectedReply("Execute")),
        }
    }

    /// Executes statements in order and returns one result per statement.
    pub async fn execute_batch(
        &self,
        ctx: &CallContext,
        queries: Vec<BoundQuery>,
        transaction_id: TransactionId,
    ) -> ClientResult<Vec<QueryResult>> {
        let request = Request::ExecuteBatch {
            session_id: self.session_id,
            transaction_id,
            queries,
        };
        match self.unary(ctx, request).await? {
            Reply::ExecuteBatch(results) => Ok(results),
            _ => Err(ClientError::UnexpectedReply("ExecuteBatch")),
        }
    }

    /// Streams the result of one statement (legacy form).
    pub async fn stream_execute(
        &self,
        ctx: &CallContext,
        query: BoundQuery,
        transaction_id: TransactionId,
    ) -> ClientResult<QueryStream> {
        self.stream_version(ctx, ApiVersion::V1, query, transaction_id)
            .await
    }

    /// Streams the result of one statement.
    ///
    /// A failure before the first chunk is returned here. A failure after
    /// that closes the stream and shows up in [`QueryStream::err`].
    /// Dropping the stream cancels the call on the server.
    pub async fn stream_execute2(
        &self,
        ctx: &CallContext,
        query: BoundQuery,
        transaction_id: TransactionId,
    ) -> ClientResult<QueryStream> {
        self.stream_version(ctx, ApiVersion::V2, query, transaction_id)
            .await
    }

    async fn stream_version(
        &self,
        ctx: &CallContext,
        version: ApiVersion,
        query: BoundQuery,
        transaction_id: TransactionId,
    ) -> ClientResult<QueryStream> {
        let request = Request::StreamExecute {
            version,
            session_id: self.session_id,
            transaction_id,
            query,
        };
        let buffer = self.config.stream_buffer_size;
        let window = u32::try_from(buffer).unwrap_or(u32::MAX);
        let mut call = self.start(ctx, request, Some(window)).await?;
        let (mut sender, completer, stream) = channel(ctx, buffer);
        tokio::spawn(async move {
            let result = relay(&mut call, &mut sender, window).await;
            completer.complete(result);
        });
        Ok(stream.prime().await?)
    }

    /// Splits a full-table query into `split_count` key-range partitions.
    pub async fn split_query(
        &self,
        ctx: &CallContext,
        query: BoundQuery,
        split_count: i64,
    ) -> ClientResult<Vec<QuerySplit>> {
        let request = Request::SplitQuery {
            session_id: self.session_id,
            query,
            split_count,
        };
        match self.unary(ctx, request).await? {
            Reply::SplitQuery(splits) => Ok(splits),
            _ => Err(ClientError::UnexpectedReply("SplitQuery")),
        }
    }

    /// Closes the session and the connection.
    pub async fn close(self, ctx: &CallContext) -> ClientResult<()> {
        let request = Request::CloseSession {
            session_id: self.session_id,
        };
        let reply = self.unary(ctx, request).await;
        self.shared.closed.cancel();
        match reply? {
            Reply::SessionClosed => Ok(()),
            _ => Err(ClientError::UnexpectedReply("CloseSession")),
        }
    }

    // =========================================================================
    // Call plumbing
    // =========================================================================

    async fn unary(&self, ctx: &CallContext, request: Request) -> ClientResult<Reply> {
        let mut call = self.start(ctx, request, None).await?;
        let response = tokio::select! {
            biased;
            response = call.recv() => response.ok_or(ClientError::ConnectionClosed)?,
            err = ctx.done() => return Err(err.into()),
        };
        call.finished = true;
        Ok(fold(response)?)
    }

    /// Like `unary`, but once the request is on the wire only the server's
    /// answer (or a lost connection) ends the call. The caller's deadline
    /// still travels with the request and the server refuses to start
    /// work it cannot finish in time.
    async fn settle(&self, ctx: &CallContext, request: Request) -> ClientResult<Reply> {
        let mut call = self.start(ctx, request, None).await?;
        let response = call.recv().await.ok_or(ClientError::ConnectionClosed)?;
        call.finished = true;
        Ok(fold(response)?)
    }

    async fn start(
        &self,
        ctx: &CallContext,
        request: Request,
        stream_window: Option<u32>,
    ) -> ClientResult<PendingCall> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        if self.shared.closed.is_cancelled() {
            return Err(ClientError::ConnectionClosed);
        }

        let call_id = self.shared.next_call_id.fetch_add(1, Ordering::Relaxed);
        // Room for every chunk the window allows plus the final frame.
        let capacity = stream_window.map_or(1, |window| window as usize + 1);
        let (tx, replies) = mpsc::channel(capacity);
        self.shared.pending.insert(call_id, tx);
        let mut call = PendingCall {
            shared: Arc::clone(&self.shared),
            call_id,
            replies,
            finished: false,
        };

        let envelope = RequestEnvelope::new(request)
            .with_timeout_ms(self.timeout_ms(ctx))
            .with_stream_window(stream_window);
        if self.shared.outbox.send((call_id, envelope)).await.is_err() {
            call.finished = true;
            return Err(ClientError::ConnectionClosed);
        }
        Ok(call)
    }

    /// The timeout to send with a call: the time left on the caller's
    /// deadline or the configured default, whichever is shorter.
    fn timeout_ms(&self, ctx: &CallContext) -> Option<u64> {
        let remaining = ctx
            .deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        let timeout = match (remaining, self.config.call_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        timeout.map(|t| t.as_millis() as u64)
    }
}

impl Drop for TabletConn {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

/// Forwards stream frames for one call into the local stream, handing
/// credits back to the server as chunks move on. Credits go back in
/// batches of half the window.
async fn relay(call: &mut PendingCall, sender: &mut ChunkSender, window: u32) -> TabletResult<()> {
    let ctx = sender.context().clone();
    let batch = (window / 2).max(1);
    let mut owed = 0;
    loop {
        let response = tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            response = call.recv() => response,
        };
        match response {
            Some(Ok(Reply::StreamChunk(chunk))) => {
                sender.send(chunk).await?;
                owed += 1;
                if owed >= batch {
                    call.grant(owed).await;
                    owed = 0;
                }
            }
            Some(response) => {
                call.finished = true;
                return match fold(response)? {
                    Reply::StreamEnd { .. } => Ok(()),
                    _ => Err(TabletError::internal("unexpected reply to StreamExecute")),
                };
            }
            None => {
                call.finished = true;
                return Err(TabletError::cancelled("connection closed"));
            }
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<(u64, RequestEnvelope)>,
    closed: CancellationToken,
) {
    loop {
        let (call_id, envelope) = tokio::select! {
            next = outbox.recv() => match next {
                Some(next) => next,
                None => break,
            },
            () = closed.cancelled() => break,
        };
        if let Err(e) = write_frame(&mut write_half, call_id, &envelope).await {
            warn!(call_id, error = %e, "write error");
            break;
        }
    }
    closed.cancel();
}

async fn read_loop(read_half: OwnedReadHalf, shared: Arc<Shared>) {
    let mut reader = FrameReader::new(read_half);
    loop {
        let frame = tokio::select! {
            frame = reader.next::<Response>() => frame,
            () = shared.closed.cancelled() => break,
        };
        match frame {
            Ok(Some((call_id, response))) => {
                let route = shared.pending.get(&call_id).map(|entry| entry.value().clone());
                match route.map(|route| route.try_send(response)) {
                    Some(Ok(())) => {}
                    Some(Err(TrySendError::Full(_))) => {
                        warn!(call_id, "reply overran the call's window; abandoning call");
                        shared.pending.remove(&call_id);
                        shared.send_cancel(call_id);
                    }
                    // The caller gave up in the meantime.
                    Some(Err(TrySendError::Closed(_))) | None => {
                        debug!(call_id, "reply for unknown call");
                    }
                }
            }
            Ok(None) => {
                debug!("server closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "read error");
                break;
            }
        }
    }
    shared.closed.cancel();
    shared.pending.clear();
}
